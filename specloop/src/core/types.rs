//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between core components and are
//! serialized verbatim into the state file and the activity log, so variant and
//! field names are part of the on-disk format.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a task within one orchestration run.
///
/// `NotStarted -> Queued -> InProgress -> {Completed | Failed}`,
/// `Failed -> NotStarted` (reset after a correction) or `Failed -> Halted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotStarted,
    Queued,
    InProgress,
    Completed,
    Failed,
    Halted,
}

impl Status {
    /// `Completed` and `Halted` never change again during a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Halted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::Queued => "queued",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Halted => "halted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure metadata attached to a verification outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureDetail {
    /// A named property/requirement check failed.
    Property {
        property_id: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    /// The gateway gave up after the caller-supplied timeout.
    TimedOut { after_secs: u64 },
    /// The safety pre-check refused to run the command.
    PolicyDenied { reason: String },
    /// The run was cancelled while the check was in flight.
    Cancelled,
}

/// Result of executing one task's verification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub success: bool,
    /// Raw stdout/stderr or assertion detail.
    pub diagnostics: String,
    pub detail: Option<FailureDetail>,
}

impl VerificationOutcome {
    pub fn passed(diagnostics: impl Into<String>) -> Self {
        Self {
            success: true,
            diagnostics: diagnostics.into(),
            detail: None,
        }
    }

    pub fn failed(diagnostics: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostics: diagnostics.into(),
            detail: None,
        }
    }

    pub fn timed_out(after_secs: u64, diagnostics: impl Into<String>) -> Self {
        Self::failed(diagnostics).with_detail(FailureDetail::TimedOut { after_secs })
    }

    pub fn policy_denied(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::failed(format!("blocked by safety policy: {reason}"))
            .with_detail(FailureDetail::PolicyDenied { reason })
    }

    pub fn cancelled() -> Self {
        Self::failed("verification cancelled").with_detail(FailureDetail::Cancelled)
    }

    pub fn property_failed(
        property_id: impl Into<String>,
        expected: Option<String>,
        actual: Option<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::failed(diagnostics).with_detail(FailureDetail::Property {
            property_id: property_id.into(),
            expected,
            actual,
        })
    }

    pub fn with_detail(mut self, detail: FailureDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.detail, Some(FailureDetail::Cancelled))
    }
}

/// Classification of a verification failure. All kinds feed the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SyntaxError,
    TypeFailure,
    AssertionFailure,
    Timeout,
    DependencyMissing,
    ResourceExhaustion,
    PolicyBlocked,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::TypeFailure => "type_failure",
            ErrorKind::AssertionFailure => "assertion_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::PolicyBlocked => "policy_blocked",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the error analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub kind: ErrorKind,
    pub root_cause: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    /// Requirement/property id named by structured failure metadata, if any.
    #[serde(default)]
    pub implicated: Option<String>,
}

/// A single, narrowly targeted edit to the specification document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionPlan {
    pub document: String,
    pub anchor: String,
    pub replacement: String,
    pub rationale: String,
    pub analysis: ErrorAnalysis,
}

/// Correction-stage failures. Each one costs the task an attempt; none aborts the run
/// except [`CorrectionError::Storage`], which means the document itself is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrectionError {
    #[error("no safe correction target: {0}")]
    NoSafeTarget(String),
    #[error("anchor '{0}' not found in specification")]
    AnchorNotFound(String),
    #[error("anchor '{anchor}' is ambiguous ({count} occurrences)")]
    AnchorAmbiguous { anchor: String, count: usize },
    #[error("correction rejected: {0}")]
    CorrectionRejected(String),
    #[error("specification storage failed: {0}")]
    Storage(String),
}

/// What happened to the correction stage of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CorrectionRecord {
    NotAttempted,
    Applied { plan: CorrectionPlan },
    Rejected {
        plan: Option<CorrectionPlan>,
        reason: String,
    },
}

/// Verdict of one attempt from the task's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Passed,
    /// Failed; the task was reset for another attempt.
    Failed,
    /// Failed; the attempt cap was reached.
    Halted,
}

/// Append-only audit entry for one verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub analysis: Option<ErrorAnalysis>,
    pub correction: CorrectionRecord,
}

/// A status transition applied by the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub task_id: String,
    pub from: Status,
    pub to: Status,
}

/// Events forwarded to the activity recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Activity {
    StatusChange {
        at: DateTime<Utc>,
        #[serde(flatten)]
        change: StatusChange,
    },
    Attempt {
        task_id: String,
        record: AttemptRecord,
    },
}
