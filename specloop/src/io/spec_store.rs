//! Single writer of the specification document.
//!
//! Every edit goes through [`SpecStore::apply`], which works on an immutable
//! snapshot, validates the edited text, and only then commits it with an
//! atomic replace. A rejected edit never touches the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::anchors::{AnchoredDocument, Lookup};
use crate::core::types::{CorrectionError, CorrectionPlan};
use crate::io::fsutil::write_atomic;

/// Result of a committed correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCorrection {
    pub anchor: String,
    pub before_checksum: String,
    pub after_checksum: String,
    pub backup_path: PathBuf,
}

#[derive(Debug)]
pub struct SpecStore {
    path: PathBuf,
    backups_dir: PathBuf,
    document_id: String,
    write_lock: Mutex<()>,
}

impl SpecStore {
    pub fn new(path: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let document_id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path,
            backups_dir: backups_dir.into(),
            document_id,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifier written into correction plans targeting this document.
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("read specification {}", self.path.display()))
    }

    /// Parsed snapshot of the current document.
    pub fn snapshot(&self) -> Result<AnchoredDocument, CorrectionError> {
        let text = self.read().map_err(storage)?;
        AnchoredDocument::parse(text).map_err(|err| {
            CorrectionError::CorrectionRejected(format!("specification is malformed: {err}"))
        })
    }

    /// Replace the body of `plan.anchor` with `plan.replacement`.
    ///
    /// Fails without modifying the document when the anchor is missing or
    /// ambiguous, or when the edited document would lose an anchor.
    #[instrument(skip_all, fields(document = %self.document_id, anchor = %plan.anchor))]
    pub fn apply(&self, plan: &CorrectionPlan) -> Result<AppliedCorrection, CorrectionError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CorrectionError::Storage("specification write lock poisoned".to_string()))?;

        if plan.document != self.document_id {
            return Err(CorrectionError::CorrectionRejected(format!(
                "plan targets document '{}', store holds '{}'",
                plan.document, self.document_id
            )));
        }

        // (a) snapshot; the original bytes double as the in-memory backup
        let original = self.read().map_err(storage)?;
        let before = AnchoredDocument::parse(original.as_str()).map_err(|err| {
            CorrectionError::CorrectionRejected(format!("specification is malformed: {err}"))
        })?;

        // (b) target must still exist exactly once
        let span = match before.lookup(&plan.anchor) {
            Lookup::Found(span) => span,
            Lookup::Missing => return Err(CorrectionError::AnchorNotFound(plan.anchor.clone())),
            Lookup::Ambiguous(count) => {
                return Err(CorrectionError::AnchorAmbiguous {
                    anchor: plan.anchor.clone(),
                    count,
                });
            }
        };

        // (c) edit the snapshot only
        let edited = before.replace_body(span, &plan.replacement);
        if edited == original {
            return Err(CorrectionError::CorrectionRejected(
                "replacement leaves the document unchanged".to_string(),
            ));
        }

        // (d) validate before anything is written
        let after = validate_edit(&before, edited, &plan.anchor)?;

        // (e) commit
        let backup_path = self.write_backup(&original).map_err(storage)?;
        if let Err(err) = write_atomic(&self.path, after.text().as_bytes()) {
            warn!(err = %format!("{err:#}"), "commit failed, restoring backup");
            self.restore(&original);
            return Err(storage(err));
        }

        let applied = AppliedCorrection {
            anchor: plan.anchor.clone(),
            before_checksum: before.checksum(),
            after_checksum: after.checksum(),
            backup_path,
        };
        info!(
            before = %applied.before_checksum,
            after = %applied.after_checksum,
            "correction applied"
        );
        Ok(applied)
    }

    fn write_backup(&self, original: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.backups_dir)
            .with_context(|| format!("create backups dir {}", self.backups_dir.display()))?;
        let mut millis = Utc::now().timestamp_millis();
        let mut path;
        loop {
            path = self
                .backups_dir
                .join(format!("{}.{millis}.bak", self.document_id));
            if !path.exists() {
                break;
            }
            millis += 1;
        }
        fs::write(&path, original).with_context(|| format!("write backup {}", path.display()))?;
        debug!(path = %path.display(), "backup written");
        Ok(path)
    }

    fn restore(&self, original: &str) {
        let current = fs::read_to_string(&self.path).ok();
        if current.as_deref() == Some(original) {
            return;
        }
        if let Err(err) = fs::write(&self.path, original) {
            warn!(err = %err, path = %self.path.display(), "failed to restore specification");
        }
    }
}

fn validate_edit(
    before: &AnchoredDocument,
    edited: String,
    anchor: &str,
) -> Result<AnchoredDocument, CorrectionError> {
    let after = AnchoredDocument::parse(edited).map_err(|err| {
        CorrectionError::CorrectionRejected(format!("edited document is malformed: {err}"))
    })?;
    let after_ids = after.anchor_ids();
    let lost: Vec<&str> = before
        .anchor_ids()
        .into_iter()
        .filter(|id| !after_ids.contains(id))
        .collect();
    if !lost.is_empty() {
        return Err(CorrectionError::CorrectionRejected(format!(
            "edit would remove anchors: {}",
            lost.join(", ")
        )));
    }
    let count = after.count(anchor);
    if count != 1 {
        return Err(CorrectionError::CorrectionRejected(format!(
            "edit leaves anchor '{anchor}' with {count} occurrences"
        )));
    }
    Ok(after)
}

fn storage(err: anyhow::Error) -> CorrectionError {
    CorrectionError::Storage(format!("{err:#}"))
}
