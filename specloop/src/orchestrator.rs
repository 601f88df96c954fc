//! Run-level loop: pick the next eligible task, hand it to the coordinator,
//! repeat until the graph is finished, blocked, halted or cancelled.

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::coordinator::{Coordinator, TaskResult};
use crate::core::scheduler::{Selection, select};
use crate::core::state_store::{PriorState, TaskStateStore};
use crate::core::types::{AttemptRecord, ErrorAnalysis, Status, StatusChange};
use crate::graph::TaskGraph;
use crate::io::gateway::VerificationGateway;
use crate::io::reasoner::Reasoner;
use crate::io::spec_provider::SpecProvider;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stop", rename_all = "snake_case")]
pub enum RunStop {
    /// Every task is `Completed`.
    Complete,
    /// Every task is terminal and some are `Halted` (only with `halt_on_exhaustion = false`).
    Exhausted { halted: Vec<String> },
    /// Nothing is eligible but some tasks never ran.
    Blocked { waiting: Vec<String> },
    /// A task exhausted its attempts and `halt_on_exhaustion` stopped the run.
    Halted { task_id: String, root_cause: String },
    Cancelled,
}

/// Final state of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub id: String,
    pub status: Status,
    pub attempts: u32,
    pub last_error: Option<ErrorAnalysis>,
    pub history: Vec<AttemptRecord>,
}

/// Outcome of [`Orchestrator::run`]: the stop reason plus every task in declared order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub stop: RunStop,
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestrationError {
    #[error("task '{task_id}' exhausted {attempts} attempts: {root_cause}")]
    AttemptsExhausted {
        task_id: String,
        attempts: u32,
        root_cause: String,
    },
    #[error("run blocked; waiting tasks: {}", .waiting.join(", "))]
    Blocked { waiting: Vec<String> },
    #[error("run cancelled")]
    Cancelled,
}

impl RunReport {
    pub fn task(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Fail for stops that need an operator: a fatal halt, a blocked graph or cancellation.
    pub fn into_result(self) -> Result<RunReport, OrchestrationError> {
        match &self.stop {
            RunStop::Complete | RunStop::Exhausted { .. } => Ok(self),
            RunStop::Halted {
                task_id,
                root_cause,
            } => Err(OrchestrationError::AttemptsExhausted {
                task_id: task_id.clone(),
                attempts: self.task(task_id).map_or(0, |task| task.attempts),
                root_cause: root_cause.clone(),
            }),
            RunStop::Blocked { waiting } => Err(OrchestrationError::Blocked {
                waiting: waiting.clone(),
            }),
            RunStop::Cancelled => Err(OrchestrationError::Cancelled),
        }
    }
}

pub struct Orchestrator<G, R> {
    graph: TaskGraph,
    store: TaskStateStore,
    coordinator: Coordinator<G, R>,
    halt_on_exhaustion: bool,
    provider: Option<Box<dyn SpecProvider>>,
    recovered: Vec<StatusChange>,
}

impl<G: VerificationGateway, R: Reasoner> Orchestrator<G, R> {
    /// Take ownership of a run. Tasks an interrupted run left mid-flight are
    /// settled immediately (see [`TaskStateStore::recover_interrupted`]).
    pub fn new(
        graph: TaskGraph,
        store: TaskStateStore,
        coordinator: Coordinator<G, R>,
        halt_on_exhaustion: bool,
    ) -> Result<Self> {
        let mut orchestrator = Self {
            graph,
            store,
            coordinator,
            halt_on_exhaustion,
            provider: None,
            recovered: Vec::new(),
        };
        orchestrator.recovered = orchestrator.recover()?;
        Ok(orchestrator)
    }

    /// Re-read the task graph through `provider` after every applied correction.
    pub fn with_provider(mut self, provider: Box<dyn SpecProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn store(&self) -> &TaskStateStore {
        &self.store
    }

    pub fn coordinator(&self) -> &Coordinator<G, R> {
        &self.coordinator
    }

    /// Tasks reverted by the recovery scan performed at construction.
    pub fn recovered(&self) -> &[StatusChange] {
        &self.recovered
    }

    /// Crash-recovery scan: settle tasks left `Queued`, `InProgress` or `Failed`.
    pub fn recover(&mut self) -> Result<Vec<StatusChange>> {
        let changes = self
            .store
            .recover_interrupted(self.coordinator.config().max_attempts);
        for change in &changes {
            self.coordinator.announce(change);
        }
        if !changes.is_empty() {
            self.coordinator.checkpoint(&self.graph, &self.store)?;
        }
        Ok(changes)
    }

    /// Swap in a freshly loaded graph, keeping state only for unchanged tasks.
    pub fn reload_graph(&mut self) -> Result<()> {
        let Some(provider) = self.provider.as_mut() else {
            return Ok(());
        };
        let next = provider.reload()?;
        if next.checksum() == self.graph.checksum() {
            debug!("task graph unchanged after reload");
            return Ok(());
        }
        let prior: Vec<PriorState> = self
            .store
            .iter()
            .filter_map(|(id, state)| {
                self.graph.get(id).map(|task| PriorState {
                    task_id: id.to_string(),
                    fingerprint: task.fingerprint(),
                    state: state.clone(),
                })
            })
            .collect();
        let (store, report) = TaskStateStore::reconcile(&next, prior);
        info!(
            kept = report.kept.len(),
            reset = report.reset.len(),
            dropped = report.dropped.len(),
            "task graph reloaded"
        );
        self.graph = next;
        self.store = store;
        self.coordinator.checkpoint(&self.graph, &self.store)
    }

    pub fn run(&mut self, cancel: &CancelToken) -> Result<RunReport> {
        self.run_with(cancel, |_, _| {})
    }

    /// Like [`run`](Self::run), calling `on_task` after every coordinator pass.
    #[instrument(skip_all, fields(tasks = self.graph.len()))]
    pub fn run_with<F: FnMut(&str, &TaskResult)>(
        &mut self,
        cancel: &CancelToken,
        mut on_task: F,
    ) -> Result<RunReport> {
        loop {
            if cancel.is_cancelled() {
                info!("run cancelled");
                return Ok(self.report(RunStop::Cancelled));
            }

            let task_id = match select(&self.graph, &self.store) {
                Selection::Eligible(task) => task.id.clone(),
                Selection::Finished => {
                    let halted = self.store.with_status(Status::Halted);
                    let stop = if halted.is_empty() {
                        RunStop::Complete
                    } else {
                        RunStop::Exhausted { halted }
                    };
                    info!(?stop, "run finished");
                    return Ok(self.report(stop));
                }
                Selection::Blocked { waiting } => {
                    warn!(?waiting, "run blocked");
                    return Ok(self.report(RunStop::Blocked { waiting }));
                }
            };

            debug!(task = %task_id, "task selected");
            self.coordinator
                .set_status(&self.graph, &mut self.store, &task_id, Status::Queued)?;
            let result = self
                .coordinator
                .run_task(&self.graph, &mut self.store, &task_id, cancel)?;
            on_task(&task_id, &result);

            match result {
                TaskResult::Completed { .. } => {}
                TaskResult::Retry { corrected, .. } => {
                    if corrected {
                        self.reload_graph()?;
                    }
                }
                TaskResult::AttemptsExhausted {
                    task_id,
                    root_cause,
                    ..
                } => {
                    if self.halt_on_exhaustion {
                        return Ok(self.report(RunStop::Halted {
                            task_id,
                            root_cause,
                        }));
                    }
                    info!(task = %task_id, "continuing past halted task");
                }
                TaskResult::Cancelled => return Ok(self.report(RunStop::Cancelled)),
            }
        }
    }

    pub fn report(&self, stop: RunStop) -> RunReport {
        RunReport {
            stop,
            tasks: task_reports(&self.store),
        }
    }
}

/// Every task's state in declared order.
pub fn task_reports(store: &TaskStateStore) -> Vec<TaskReport> {
    store
        .iter()
        .map(|(id, state)| TaskReport {
            id: id.to_string(),
            status: state.status,
            attempts: state.attempts,
            last_error: state.last_error.clone(),
            history: state.history.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LoopConfig;
    use crate::core::types::VerificationOutcome;
    use crate::io::reasoner::GuidanceReasoner;
    use crate::synthesize::CorrectionSynthesizer;
    use crate::test_support::{ScriptedGateway, TestWorkspace, graph};

    fn orchestrator(
        graph: TaskGraph,
        workspace: &TestWorkspace,
        gateway: ScriptedGateway,
        halt_on_exhaustion: bool,
    ) -> Orchestrator<ScriptedGateway, GuidanceReasoner> {
        let coordinator = Coordinator::new(
            gateway,
            CorrectionSynthesizer::new(GuidanceReasoner).expect("synthesizer"),
            workspace.spec_store(),
            LoopConfig {
                max_attempts: 2,
                ..LoopConfig::default()
            },
        );
        let store = TaskStateStore::new(&graph);
        Orchestrator::new(graph, store, coordinator, halt_on_exhaustion).expect("orchestrator")
    }

    #[test]
    fn completes_in_dependency_order() {
        let graph = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new();
        let mut orchestrator = orchestrator(graph, &workspace, gateway.clone(), true);

        let mut order = Vec::new();
        let report = orchestrator
            .run_with(&CancelToken::new(), |id, _| order.push(id.to_string()))
            .expect("run");
        assert_eq!(report.stop, RunStop::Complete);
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(gateway.call_order(), vec!["a", "b", "c"]);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn halted_dependency_blocks_dependents() {
        let graph = graph(&[("a", &[]), ("b", &["a"])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new().fail_always("a", "assertion failed");
        let mut orchestrator = orchestrator(graph, &workspace, gateway, false);

        let report = orchestrator.run(&CancelToken::new()).expect("run");
        assert_eq!(
            report.stop,
            RunStop::Blocked {
                waiting: vec!["b".to_string()]
            }
        );
        assert_eq!(report.task("a").expect("a").status, Status::Halted);
        assert_eq!(
            report.into_result().unwrap_err(),
            OrchestrationError::Blocked {
                waiting: vec!["b".to_string()]
            }
        );
    }

    #[test]
    fn halt_on_exhaustion_stops_the_run() {
        let graph = graph(&[("a", &[]), ("b", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new().fail_always("a", "assertion failed: x == y");
        let mut orchestrator = orchestrator(graph, &workspace, gateway.clone(), true);

        let report = orchestrator.run(&CancelToken::new()).expect("run");
        assert_eq!(
            report.stop,
            RunStop::Halted {
                task_id: "a".to_string(),
                root_cause: "assertion failed: x == y".to_string(),
            }
        );
        assert_eq!(report.task("b").expect("b").status, Status::NotStarted);
        assert_eq!(gateway.calls("b"), 0);
        let err = report.into_result().unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::AttemptsExhausted { attempts: 2, .. }
        ));
    }

    #[test]
    fn cancelled_run_stops_before_selecting() {
        let graph = graph(&[("a", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new();
        let mut orchestrator = orchestrator(graph, &workspace, gateway.clone(), true);
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = orchestrator.run(&cancel).expect("run");
        assert_eq!(report.stop, RunStop::Cancelled);
        assert_eq!(gateway.calls("a"), 0);
        assert_eq!(report.task("a").expect("a").status, Status::NotStarted);
    }

    #[test]
    fn construction_recovers_interrupted_tasks() {
        let graph = graph(&[("a", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let mut store = TaskStateStore::new(&graph);
        store.transition("a", Status::Queued).expect("queue");
        store.transition("a", Status::InProgress).expect("start");
        let coordinator = Coordinator::new(
            ScriptedGateway::new(),
            CorrectionSynthesizer::new(GuidanceReasoner).expect("synthesizer"),
            workspace.spec_store(),
            LoopConfig::default(),
        );

        let orchestrator = Orchestrator::new(graph, store, coordinator, true).expect("new");
        assert_eq!(orchestrator.store().status("a"), Some(Status::NotStarted));
        assert_eq!(orchestrator.recovered().len(), 1);
        assert_eq!(orchestrator.recovered()[0].from, Status::InProgress);
    }

    #[test]
    fn failing_then_passing_task_retries_after_correction() {
        let graph = graph(&[("a", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway =
            ScriptedGateway::new().script("a", [VerificationOutcome::failed("SyntaxError: x")]);
        let mut orchestrator = orchestrator(graph, &workspace, gateway.clone(), true);

        let report = orchestrator.run(&CancelToken::new()).expect("run");
        assert_eq!(report.stop, RunStop::Complete);
        let a = report.task("a").expect("a");
        assert_eq!(a.attempts, 2);
        assert_eq!(a.history.len(), 2);
        assert_eq!(gateway.calls("a"), 2);
    }
}
