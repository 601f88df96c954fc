//! Durable form of the task state store (`.specloop/state.json`).
//!
//! States are keyed by task id and stamped with the task fingerprint and the
//! graph checksum they were recorded against, so a rebuilt graph never reuses
//! stale state for a task whose definition changed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::state_store::{PriorState, ReconcileReport, TaskState, TaskStateStore};
use crate::graph::TaskGraph;
use crate::io::fsutil::write_json_atomic;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub graph_checksum: String,
    pub tasks: BTreeMap<String, PersistedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub fingerprint: String,
    #[serde(flatten)]
    pub state: TaskState,
}

impl PersistedState {
    pub fn capture(graph: &TaskGraph, store: &TaskStateStore) -> Self {
        let tasks = store
            .iter()
            .filter_map(|(id, state)| {
                graph.get(id).map(|task| {
                    (
                        id.to_string(),
                        PersistedTask {
                            fingerprint: task.fingerprint(),
                            state: state.clone(),
                        },
                    )
                })
            })
            .collect();
        Self {
            version: STATE_VERSION,
            graph_checksum: graph.checksum(),
            tasks,
        }
    }
}

/// Handle on the state file location.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Raw persisted contents, if the file exists.
    pub fn read(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read state {}", self.path.display()))?;
        let state: PersistedState = serde_json::from_str(&contents)
            .with_context(|| format!("parse state {}", self.path.display()))?;
        if state.version != STATE_VERSION {
            return Err(anyhow!(
                "unsupported state version {} in {}",
                state.version,
                self.path.display()
            ));
        }
        Ok(Some(state))
    }

    /// Store for `graph`, reconciled against whatever was persisted. A missing
    /// file yields a fresh store.
    pub fn load(&self, graph: &TaskGraph) -> Result<(TaskStateStore, ReconcileReport)> {
        let Some(persisted) = self.read()? else {
            debug!(path = %self.path.display(), "no persisted state, starting fresh");
            let store = TaskStateStore::new(graph);
            let report = ReconcileReport {
                reset: graph.tasks().iter().map(|task| task.id.clone()).collect(),
                ..ReconcileReport::default()
            };
            return Ok((store, report));
        };
        if persisted.graph_checksum != graph.checksum() {
            info!("task graph changed since last run, reconciling per task");
        }
        let prior = persisted
            .tasks
            .into_iter()
            .map(|(task_id, entry)| PriorState {
                task_id,
                fingerprint: entry.fingerprint,
                state: entry.state,
            });
        Ok(TaskStateStore::reconcile(graph, prior))
    }

    pub fn save(&self, graph: &TaskGraph, store: &TaskStateStore) -> Result<()> {
        debug!(path = %self.path.display(), "writing state");
        write_json_atomic(&self.path, &PersistedState::capture(graph, store))
            .with_context(|| format!("save state {}", self.path.display()))
    }
}
