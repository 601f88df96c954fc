//! Anchored-document model for the specification.
//!
//! An anchor is declared by an ATX heading ending in `{#ID}`:
//!
//! ```text
//! ### Login succeeds with valid credentials {#R2}
//! ```
//!
//! The anchor's region is the body after its heading line, up to the next
//! heading of any level (or EOF). Headings inside fenced code blocks are
//! ignored; an unterminated fence makes the document malformed.

use std::collections::BTreeSet;
use std::ops::Range;

use thiserror::Error;

use crate::core::digest::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("unterminated code fence opened at line {line}")]
    UnterminatedFence { line: usize },
}

/// Byte ranges of one anchored section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorSpan {
    pub id: String,
    /// 1-based line number of the heading.
    pub line: usize,
    pub heading: Range<usize>,
    pub body: Range<usize>,
}

/// Result of looking an anchor up by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<'a> {
    Found(&'a AnchorSpan),
    Missing,
    Ambiguous(usize),
}

/// Immutable parsed snapshot of a document. Edits produce a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchoredDocument {
    text: String,
    anchors: Vec<AnchorSpan>,
}

impl AnchoredDocument {
    pub fn parse(text: impl Into<String>) -> Result<Self, DocumentError> {
        let text = text.into();
        let anchors = parse_anchors(&text)?;
        Ok(Self { text, anchors })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn anchors(&self) -> &[AnchorSpan] {
        &self.anchors
    }

    pub fn anchor_ids(&self) -> BTreeSet<&str> {
        self.anchors.iter().map(|span| span.id.as_str()).collect()
    }

    pub fn count(&self, id: &str) -> usize {
        self.anchors.iter().filter(|span| span.id == id).count()
    }

    pub fn lookup(&self, id: &str) -> Lookup<'_> {
        let mut matches = self.anchors.iter().filter(|span| span.id == id);
        match (matches.next(), matches.next()) {
            (None, _) => Lookup::Missing,
            (Some(span), None) => Lookup::Found(span),
            (Some(_), Some(_)) => Lookup::Ambiguous(self.count(id)),
        }
    }

    pub fn body(&self, span: &AnchorSpan) -> &str {
        &self.text[span.body.clone()]
    }

    pub fn checksum(&self) -> String {
        sha256_hex(self.text.as_bytes())
    }

    /// New document text with only `span`'s body replaced.
    ///
    /// Everything before the body and after it is copied byte-for-byte. A
    /// newline is inserted where needed so the replacement cannot merge into
    /// the heading line or the following heading.
    pub fn replace_body(&self, span: &AnchorSpan, replacement: &str) -> String {
        let prefix = &self.text[..span.body.start];
        let suffix = &self.text[span.body.end..];
        let mut out = String::with_capacity(prefix.len() + replacement.len() + suffix.len() + 2);
        out.push_str(prefix);
        if !prefix.is_empty() && !prefix.ends_with('\n') && !replacement.is_empty() {
            out.push('\n');
        }
        out.push_str(replacement);
        if !suffix.is_empty() && !replacement.is_empty() && !replacement.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(suffix);
        out
    }
}

struct Fence {
    marker: char,
    len: usize,
    line: usize,
}

fn parse_anchors(text: &str) -> Result<Vec<AnchorSpan>, DocumentError> {
    // (id, line, heading range) for anchored headings, plus every heading start.
    let mut anchored: Vec<(String, usize, Range<usize>)> = Vec::new();
    let mut heading_starts: Vec<usize> = Vec::new();
    let mut fence: Option<Fence> = None;
    let mut offset = 0usize;

    for (index, line) in text.split_inclusive('\n').enumerate() {
        let line_no = index + 1;
        let start = offset;
        offset += line.len();
        let content = line.trim_end_matches(['\n', '\r']);

        if let Some((marker, len)) = fence_marker(content) {
            match &fence {
                None => {
                    fence = Some(Fence {
                        marker,
                        len,
                        line: line_no,
                    });
                    continue;
                }
                Some(open) if open.marker == marker && len >= open.len => {
                    fence = None;
                    continue;
                }
                Some(_) => continue,
            }
        }
        if fence.is_some() {
            continue;
        }

        let Some(title) = heading_text(content) else {
            continue;
        };
        heading_starts.push(start);
        if let Some(id) = anchor_attribute(title) {
            anchored.push((id.to_string(), line_no, start..offset));
        }
    }

    if let Some(open) = fence {
        return Err(DocumentError::UnterminatedFence { line: open.line });
    }

    let spans = anchored
        .into_iter()
        .map(|(id, line, heading)| {
            let body_end = heading_starts
                .iter()
                .copied()
                .find(|next| *next > heading.start)
                .unwrap_or(text.len());
            AnchorSpan {
                id,
                line,
                body: heading.end..body_end,
                heading,
            }
        })
        .collect();
    Ok(spans)
}

/// ```` ``` ```` / `~~~` fence opener or closer, with up to three spaces of indent.
fn fence_marker(line: &str) -> Option<(char, usize)> {
    let trimmed = strip_indent(line)?;
    let marker = trimmed.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }
    let len = trimmed.chars().take_while(|c| *c == marker).count();
    (len >= 3).then_some((marker, len))
}

/// Heading title for an ATX heading line (`#` to `######` followed by space or EOL).
fn heading_text(line: &str) -> Option<&str> {
    let trimmed = strip_indent(line)?;
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some(rest.trim())
}

/// Trailing `{#ID}` attribute of a heading title.
fn anchor_attribute(title: &str) -> Option<&str> {
    let title = title.trim_end();
    let inner = title.strip_suffix('}')?;
    let open = inner.rfind("{#")?;
    let id = &inner[open + 2..];
    is_anchor_id(id).then_some(id)
}

/// Anchor ids: `[A-Za-z0-9_.:-]+`.
pub fn is_anchor_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(is_anchor_char)
}

pub fn is_anchor_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

/// True if `text` mentions `id` as a whole token (not inside a longer id).
pub fn mentions(text: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    text.match_indices(id).any(|(at, _)| {
        let before = text[..at].chars().next_back();
        let after = text[at + id.len()..].chars().next();
        !before.is_some_and(is_anchor_char) && !after.is_some_and(is_anchor_char)
    })
}

/// True if any line of `text` would parse as a markdown heading.
pub fn contains_heading(text: &str) -> bool {
    text.lines().any(|line| heading_text(line).is_some())
}

fn strip_indent(line: &str) -> Option<&str> {
    let indent = line.chars().take_while(|c| *c == ' ').count();
    (indent <= 3).then(|| &line[indent..])
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Spec {#spec}\n\nIntro.\n\n## Task one {#T1}\nDo the thing.\n\n### Login works {#R2}\nUsers log in.\n\n```md\n## Not a heading {#FAKE}\n```\n\n## Plain heading\ntrailing\n";

    fn doc() -> AnchoredDocument {
        AnchoredDocument::parse(DOC).expect("parse")
    }

    #[test]
    fn parses_anchors_and_ignores_fenced_headings() {
        let doc = doc();
        let ids: Vec<&str> = doc.anchors().iter().map(|span| span.id.as_str()).collect();
        assert_eq!(ids, vec!["spec", "T1", "R2"]);
        assert_eq!(doc.anchors()[1].line, 5);
    }

    #[test]
    fn region_ends_at_next_heading_of_any_level() {
        let doc = doc();
        let Lookup::Found(t1) = doc.lookup("T1") else {
            panic!("T1 missing");
        };
        assert_eq!(doc.body(t1), "Do the thing.\n\n");

        let Lookup::Found(r2) = doc.lookup("R2") else {
            panic!("R2 missing");
        };
        assert_eq!(
            doc.body(r2),
            "Users log in.\n\n```md\n## Not a heading {#FAKE}\n```\n\n"
        );
    }

    #[test]
    fn replace_body_leaves_everything_else_byte_identical() {
        let doc = doc();
        let Lookup::Found(span) = doc.lookup("T1") else {
            panic!("T1 missing");
        };
        let edited = doc.replace_body(span, "Do the thing correctly.\n\n");

        assert_eq!(&edited[..span.body.start], &DOC[..span.body.start]);
        assert!(edited.ends_with(&DOC[span.body.end..]));

        let after = AnchoredDocument::parse(edited).expect("parse edited");
        let Lookup::Found(new_span) = after.lookup("T1") else {
            panic!("T1 missing after edit");
        };
        assert_eq!(after.body(new_span), "Do the thing correctly.\n\n");
        for id in ["spec", "R2"] {
            let (Lookup::Found(before), Lookup::Found(after_span)) = (doc.lookup(id), after.lookup(id))
            else {
                panic!("{id} missing");
            };
            assert_eq!(doc.body(before), after.body(after_span));
        }
    }

    #[test]
    fn replacement_without_newline_does_not_merge_into_next_heading() {
        let doc = AnchoredDocument::parse("## A {#A}\nold\n## B {#B}\nkeep\n").expect("parse");
        let Lookup::Found(span) = doc.lookup("A") else {
            panic!("A missing");
        };
        let edited = doc.replace_body(span, "new");
        assert_eq!(edited, "## A {#A}\nnew\n## B {#B}\nkeep\n");
    }

    #[test]
    fn heading_at_eof_without_newline_gets_separated() {
        let doc = AnchoredDocument::parse("## A {#A}").expect("parse");
        let Lookup::Found(span) = doc.lookup("A") else {
            panic!("A missing");
        };
        assert_eq!(doc.replace_body(span, "body\n"), "## A {#A}\nbody\n");
    }

    #[test]
    fn duplicate_anchor_is_ambiguous() {
        let doc = AnchoredDocument::parse("## A {#X}\none\n## B {#X}\ntwo\n").expect("parse");
        assert_eq!(doc.lookup("X"), Lookup::Ambiguous(2));
        assert_eq!(doc.lookup("nope"), Lookup::Missing);
    }

    #[test]
    fn unterminated_fence_is_malformed() {
        let err = AnchoredDocument::parse("## A {#A}\n```\ncode\n").unwrap_err();
        assert_eq!(err, DocumentError::UnterminatedFence { line: 2 });
    }

    #[test]
    fn mentions_requires_token_boundaries() {
        assert!(mentions("requirement R2 failed", "R2"));
        assert!(mentions("(R2)", "R2"));
        assert!(!mentions("R21 failed", "R2"));
        assert!(!mentions("XR2 failed", "R2"));
    }

    #[test]
    fn detects_heading_lines() {
        assert!(contains_heading("text\n## Heading\n"));
        assert!(contains_heading("#"));
        assert!(!contains_heading("#hashtag and > quote"));
        assert!(!contains_heading("    ## indented code"));
    }
}
