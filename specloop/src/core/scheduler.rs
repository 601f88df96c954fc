//! Deterministic dependency-ordered task selection.

use crate::core::state_store::TaskStateStore;
use crate::core::types::Status;
use crate::graph::{Task, TaskGraph};

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<'a> {
    /// Next task to hand to the coordinator.
    Eligible(&'a Task),
    /// Every task is `Completed` or `Halted`.
    Finished,
    /// Nothing is eligible but some tasks are not terminal (e.g. a dependency halted).
    Blocked { waiting: Vec<String> },
}

/// `NotStarted` with every dependency `Completed`.
pub fn is_eligible(task: &Task, store: &TaskStateStore) -> bool {
    store.status(&task.id) == Some(Status::NotStarted)
        && task
            .dependencies
            .iter()
            .all(|dep| store.status(dep) == Some(Status::Completed))
}

/// First eligible task in declared order, if any.
pub fn next_eligible<'a>(graph: &'a TaskGraph, store: &TaskStateStore) -> Option<&'a Task> {
    graph.tasks().iter().find(|task| is_eligible(task, store))
}

/// Select the next task, distinguishing normal completion from a blocked graph.
pub fn select<'a>(graph: &'a TaskGraph, store: &TaskStateStore) -> Selection<'a> {
    if let Some(task) = next_eligible(graph, store) {
        return Selection::Eligible(task);
    }
    let waiting: Vec<String> = graph
        .tasks()
        .iter()
        .filter(|task| {
            store
                .status(&task.id)
                .is_some_and(|status| !status.is_terminal())
        })
        .map(|task| task.id.clone())
        .collect();
    if waiting.is_empty() {
        Selection::Finished
    } else {
        Selection::Blocked { waiting }
    }
}
