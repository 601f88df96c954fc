//! Authoritative mutable status, attempt counters and attempt history per task.
//!
//! The store is the single writer of task progress. It validates every status
//! transition against the lifecycle and keeps attempt history append-only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::types::{AttemptRecord, ErrorAnalysis, Status, StatusChange};
use crate::graph::TaskGraph;

/// Progress of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: Status,
    pub attempts: u32,
    pub last_error: Option<ErrorAnalysis>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: Status::NotStarted,
            attempts: 0,
            last_error: None,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("illegal transition for task '{task}': {from} -> {to}")]
    Illegal {
        task: String,
        from: Status,
        to: Status,
    },
}

/// Which persisted states survived a graph (re)build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Definition unchanged; state kept.
    pub kept: Vec<String>,
    /// Definition changed or new; state reset to `NotStarted`.
    pub reset: Vec<String>,
    /// Present in the previous state but gone from the graph.
    pub dropped: Vec<String>,
}

/// Previously known state for one task, with the fingerprint it was recorded against.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorState {
    pub task_id: String,
    pub fingerprint: String,
    pub state: TaskState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStateStore {
    order: Vec<String>,
    states: HashMap<String, TaskState>,
}

impl TaskStateStore {
    /// Fresh store: every task `NotStarted` with zero attempts.
    pub fn new(graph: &TaskGraph) -> Self {
        let order: Vec<String> = graph.tasks().iter().map(|task| task.id.clone()).collect();
        let states = order
            .iter()
            .map(|id| (id.clone(), TaskState::default()))
            .collect();
        Self { order, states }
    }

    /// Rebuild a store for `graph`, keeping prior state only where the task
    /// definition (fingerprint) is unchanged.
    pub fn reconcile(
        graph: &TaskGraph,
        prior: impl IntoIterator<Item = PriorState>,
    ) -> (Self, ReconcileReport) {
        let mut store = Self::new(graph);
        let mut report = ReconcileReport::default();
        let mut seen = Vec::new();

        for entry in prior {
            let Some(task) = graph.get(&entry.task_id) else {
                report.dropped.push(entry.task_id);
                continue;
            };
            seen.push(entry.task_id.clone());
            if task.fingerprint() == entry.fingerprint {
                store.states.insert(entry.task_id.clone(), entry.state);
                report.kept.push(entry.task_id);
            } else {
                report.reset.push(entry.task_id);
            }
        }

        for task in graph.tasks() {
            if !seen.contains(&task.id) {
                report.reset.push(task.id.clone());
            }
        }

        report.kept.sort();
        report.reset.sort();
        report.dropped.sort();
        debug!(
            kept = report.kept.len(),
            reset = report.reset.len(),
            dropped = report.dropped.len(),
            "task state reconciled"
        );
        (store, report)
    }

    pub fn get(&self, id: &str) -> Option<&TaskState> {
        self.states.get(id)
    }

    pub fn status(&self, id: &str) -> Option<Status> {
        self.states.get(id).map(|state| state.status)
    }

    /// `(id, state)` pairs in declared graph order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskState)> {
        self.order
            .iter()
            .filter_map(|id| self.states.get(id).map(|state| (id.as_str(), state)))
    }

    /// Ids with the given status, in declared order.
    pub fn with_status(&self, status: Status) -> Vec<String> {
        self.iter()
            .filter(|(_, state)| state.status == status)
            .map(|(id, _)| id.to_string())
            .collect()
    }

    /// Apply a lifecycle transition.
    pub fn transition(&mut self, id: &str, to: Status) -> Result<StatusChange, TransitionError> {
        let state = self.state_mut(id)?;
        let from = state.status;
        if !transition_allowed(from, to) {
            return Err(TransitionError::Illegal {
                task: id.to_string(),
                from,
                to,
            });
        }
        state.status = to;
        debug!(task = id, %from, %to, "status transition");
        Ok(StatusChange {
            task_id: id.to_string(),
            from,
            to,
        })
    }

    /// Count one attempt against the cap.
    ///
    /// Returns the new attempt count, or `None` (unchanged) when the task has
    /// already used `max_attempts`. The counter never exceeds the cap.
    pub fn charge_attempt(
        &mut self,
        id: &str,
        max_attempts: u32,
    ) -> Result<Option<u32>, TransitionError> {
        let state = self.state_mut(id)?;
        if state.attempts >= max_attempts {
            return Ok(None);
        }
        state.attempts += 1;
        Ok(Some(state.attempts))
    }

    pub fn set_last_error(
        &mut self,
        id: &str,
        analysis: ErrorAnalysis,
    ) -> Result<(), TransitionError> {
        self.state_mut(id)?.last_error = Some(analysis);
        Ok(())
    }

    /// Append to the task's attempt history. Existing entries are never touched.
    pub fn record_attempt(
        &mut self,
        id: &str,
        record: AttemptRecord,
    ) -> Result<(), TransitionError> {
        self.state_mut(id)?.history.push(record);
        Ok(())
    }

    /// Settle tasks an interrupted run left mid-flight.
    ///
    /// `Queued`/`InProgress` revert to `NotStarted`. `Failed` (the run died
    /// during correction) reverts to `NotStarted` while attempts remain and
    /// becomes `Halted` once `max_attempts` are used; `last_error` is kept.
    pub fn recover_interrupted(&mut self, max_attempts: u32) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        for id in &self.order {
            let Some(state) = self.states.get_mut(id) else {
                continue;
            };
            let to = match state.status {
                Status::Queued | Status::InProgress => Status::NotStarted,
                Status::Failed if state.attempts < max_attempts => Status::NotStarted,
                Status::Failed => Status::Halted,
                Status::NotStarted | Status::Completed | Status::Halted => continue,
            };
            let from = state.status;
            state.status = to;
            info!(task = %id, %from, %to, "reverted interrupted task");
            changes.push(StatusChange {
                task_id: id.clone(),
                from,
                to,
            });
        }
        changes
    }

    fn state_mut(&mut self, id: &str) -> Result<&mut TaskState, TransitionError> {
        self.states
            .get_mut(id)
            .ok_or_else(|| TransitionError::UnknownTask(id.to_string()))
    }
}

fn transition_allowed(from: Status, to: Status) -> bool {
    matches!(
        (from, to),
        (Status::NotStarted, Status::Queued)
            | (Status::Queued, Status::InProgress)
            | (Status::InProgress, Status::Completed)
            | (Status::InProgress, Status::Failed)
            | (Status::Failed, Status::NotStarted)
            | (Status::Failed, Status::Halted)
            // cancellation hands the task back untouched
            | (Status::Queued, Status::NotStarted)
            | (Status::InProgress, Status::NotStarted)
    )
}
