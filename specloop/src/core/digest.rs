//! SHA-256 helpers for graph versions, task fingerprints and document checksums.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Incremental hasher with length-prefixed fields so `("ab","c")` and `("a","bc")` differ.
pub struct Sha256Writer {
    hasher: Sha256,
}

impl Sha256Writer {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn field(&mut self, value: &str) {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
    }

    pub fn list(&mut self, values: &[String]) {
        self.hasher.update((values.len() as u64).to_le_bytes());
        for value in values {
            self.field(value);
        }
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for Sha256Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn field_boundaries_are_part_of_the_digest() {
        let mut left = Sha256Writer::new();
        left.field("ab");
        left.field("c");
        let mut right = Sha256Writer::new();
        right.field("a");
        right.field("bc");
        assert_ne!(left.finish(), right.finish());
    }
}
