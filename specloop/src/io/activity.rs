//! Activity recorder: append-only audit trail of status changes and attempts.
//!
//! Recording is best-effort. A recorder failure is logged and never aborts a run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::core::types::Activity;

pub trait ActivityRecorder {
    fn record(&self, activity: &Activity) -> Result<()>;
}

/// Appends one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlRecorder {
    path: PathBuf,
}

impl JsonlRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ActivityRecorder for JsonlRecorder {
    fn record(&self, activity: &Activity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create activity dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(activity).context("serialize activity")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open activity log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append activity log {}", self.path.display()))?;
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl ActivityRecorder for NullRecorder {
    fn record(&self, _activity: &Activity) -> Result<()> {
        Ok(())
    }
}

/// Forward `activity`, logging instead of propagating any failure.
pub fn record_best_effort(recorder: &dyn ActivityRecorder, activity: &Activity) {
    if let Err(err) = recorder.record(activity) {
        warn!(err = %format!("{err:#}"), "activity recorder failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Status, StatusChange};
    use chrono::Utc;

    fn change(task_id: &str, from: Status, to: Status) -> Activity {
        Activity::StatusChange {
            at: Utc::now(),
            change: StatusChange {
                task_id: task_id.to_string(),
                from,
                to,
            },
        }
    }

    #[test]
    fn jsonl_recorder_appends_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let recorder = JsonlRecorder::new(temp.path().join(".specloop/activity.jsonl"));
        recorder
            .record(&change("a", Status::NotStarted, Status::Queued))
            .expect("record");
        recorder
            .record(&change("a", Status::Queued, Status::InProgress))
            .expect("record");

        let contents = fs::read_to_string(recorder.path()).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["to"], "in_progress");
    }

    #[test]
    fn best_effort_swallows_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A directory where the log file should be makes every append fail.
        let path = temp.path().join("activity.jsonl");
        fs::create_dir_all(&path).expect("mkdir");
        let recorder = JsonlRecorder::new(&path);
        let activity = change("a", Status::NotStarted, Status::Queued);
        assert!(recorder.record(&activity).is_err());
        record_best_effort(&recorder, &activity);
    }
}
