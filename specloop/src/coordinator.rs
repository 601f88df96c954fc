//! Ralph-loop coordinator: one bounded verify → analyze → correct → reset cycle per call.
//!
//! The coordinator owns every status change of the task it is handed. Each
//! change is forwarded to the activity recorder and checkpointed to the state
//! file before the next step runs, so an interrupted run can always resume.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::ErrorAnalyzer;
use crate::core::state_store::TaskStateStore;
use crate::core::types::{
    Activity, AttemptOutcome, AttemptRecord, CorrectionError, CorrectionPlan, CorrectionRecord,
    ErrorAnalysis, Status, StatusChange,
};
use crate::graph::{Task, TaskGraph};
use crate::io::activity::{ActivityRecorder, NullRecorder, record_best_effort};
use crate::io::config::SpecloopConfig;
use crate::io::gateway::{VerificationGateway, VerifyRequest};
use crate::io::reasoner::Reasoner;
use crate::io::spec_store::SpecStore;
use crate::io::state_file::StateFile;
use crate::synthesize::CorrectionSynthesizer;

const EXHAUSTED_WITHOUT_ANALYSIS: &str = "attempt cap reached";

/// Loop parameters taken from [`SpecloopConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopConfig {
    pub max_attempts: u32,
    pub verify_timeout: Duration,
    pub min_confidence: f64,
}

impl LoopConfig {
    pub fn from_config(config: &SpecloopConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            verify_timeout: config.verify_timeout(),
            min_confidence: config.min_confidence,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_config(&SpecloopConfig::default())
    }
}

/// What one coordinator pass did to a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// Verified. Also returned, without verifying again, for an already completed task.
    Completed { attempts: u32 },
    /// Failed and was reset to `NotStarted`; `corrected` is true when the specification changed.
    Retry { attempts: u32, corrected: bool },
    /// The attempt cap was reached and the task is `Halted`.
    AttemptsExhausted {
        task_id: String,
        attempts: u32,
        root_cause: String,
    },
    /// The run was cancelled; the task is back at `NotStarted`.
    Cancelled,
}

struct CorrectionFailure {
    plan: Option<CorrectionPlan>,
    error: CorrectionError,
}

pub struct Coordinator<G, R> {
    gateway: G,
    analyzer: ErrorAnalyzer,
    synthesizer: CorrectionSynthesizer<R>,
    spec: SpecStore,
    recorder: Box<dyn ActivityRecorder>,
    state_file: Option<StateFile>,
    config: LoopConfig,
}

impl<G: VerificationGateway, R: Reasoner> Coordinator<G, R> {
    pub fn new(
        gateway: G,
        synthesizer: CorrectionSynthesizer<R>,
        spec: SpecStore,
        config: LoopConfig,
    ) -> Self {
        Self {
            gateway,
            analyzer: ErrorAnalyzer::new(),
            synthesizer,
            spec,
            recorder: Box::new(NullRecorder),
            state_file: None,
            config,
        }
    }

    pub fn with_analyzer(mut self, analyzer: ErrorAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn ActivityRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Checkpoint the store to `state_file` after every status change.
    pub fn with_state_file(mut self, state_file: StateFile) -> Self {
        self.state_file = Some(state_file);
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn synthesizer(&self) -> &CorrectionSynthesizer<R> {
        &self.synthesizer
    }

    pub fn spec(&self) -> &SpecStore {
        &self.spec
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Drive `task_id` through one verification attempt and, on failure, one
    /// correction.
    ///
    /// Completed and halted tasks are returned as they are without touching
    /// the gateway. Errors are reserved for conditions that stop the run:
    /// unknown tasks, illegal transitions, persistence failures and an
    /// unreachable specification document.
    #[instrument(skip_all, fields(task = task_id))]
    pub fn run_task(
        &self,
        graph: &TaskGraph,
        store: &mut TaskStateStore,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<TaskResult> {
        let task = graph
            .get(task_id)
            .ok_or_else(|| anyhow!("unknown task '{task_id}'"))?;
        let (status, attempts) = store
            .get(task_id)
            .map(|state| (state.status, state.attempts))
            .ok_or_else(|| anyhow!("no state for task '{task_id}'"))?;

        match status {
            Status::Completed => {
                debug!("already completed, skipping verification");
                return Ok(TaskResult::Completed { attempts });
            }
            Status::Halted => {
                let last_error = store.get(task_id).and_then(|state| state.last_error.as_ref());
                return Ok(TaskResult::AttemptsExhausted {
                    task_id: task_id.to_string(),
                    attempts,
                    root_cause: root_cause_of(last_error),
                });
            }
            Status::NotStarted => {
                self.set_status(graph, store, task_id, Status::Queued)?;
                self.set_status(graph, store, task_id, Status::InProgress)?;
            }
            Status::Queued => {
                self.set_status(graph, store, task_id, Status::InProgress)?;
            }
            Status::InProgress => {}
            Status::Failed => {
                return Err(anyhow!("task '{task_id}' was handed over in state failed"));
            }
        }

        if attempts >= self.config.max_attempts {
            warn!(attempts, "attempt cap already reached, halting without verification");
            self.set_status(graph, store, task_id, Status::Failed)?;
            return self.halt(graph, store, task, None, CorrectionRecord::NotAttempted, attempts);
        }

        if cancel.is_cancelled() {
            return self.cancel(graph, store, task_id);
        }

        let outcome = self.gateway.run(
            task,
            &VerifyRequest {
                timeout: self.config.verify_timeout,
                cancel,
            },
        );
        if outcome.is_cancelled() {
            return self.cancel(graph, store, task_id);
        }

        let attempt = store
            .charge_attempt(task_id, self.config.max_attempts)?
            .unwrap_or(attempts);

        if outcome.success {
            info!(attempt, "verification passed");
            self.record_attempt(
                store,
                task_id,
                AttemptRecord {
                    attempt,
                    recorded_at: Utc::now(),
                    outcome: AttemptOutcome::Passed,
                    analysis: None,
                    correction: CorrectionRecord::NotAttempted,
                },
            )?;
            self.set_status(graph, store, task_id, Status::Completed)?;
            return Ok(TaskResult::Completed { attempts: attempt });
        }

        self.set_status(graph, store, task_id, Status::Failed)?;
        let history = store
            .get(task_id)
            .map(|state| state.history.clone())
            .unwrap_or_default();
        let analysis = self
            .analyzer
            .analyze_with_references(&outcome, &history, &task.references);
        info!(
            attempt,
            kind = %analysis.kind,
            confidence = analysis.confidence,
            root_cause = %analysis.root_cause,
            "verification failed"
        );
        if analysis.confidence < self.config.min_confidence {
            warn!(
                confidence = analysis.confidence,
                min_confidence = self.config.min_confidence,
                "low-confidence analysis"
            );
        }
        store.set_last_error(task_id, analysis.clone())?;

        if attempt >= self.config.max_attempts {
            return self.halt(
                graph,
                store,
                task,
                Some(analysis),
                CorrectionRecord::NotAttempted,
                attempt,
            );
        }

        match self.correct(task, &analysis, attempt) {
            Ok(plan) => {
                self.record_attempt(
                    store,
                    task_id,
                    AttemptRecord {
                        attempt,
                        recorded_at: Utc::now(),
                        outcome: AttemptOutcome::Failed,
                        analysis: Some(analysis),
                        correction: CorrectionRecord::Applied { plan },
                    },
                )?;
                self.set_status(graph, store, task_id, Status::NotStarted)?;
                Ok(TaskResult::Retry {
                    attempts: attempt,
                    corrected: true,
                })
            }
            Err(CorrectionFailure {
                plan,
                error: CorrectionError::Storage(message),
            }) => {
                self.record_attempt(
                    store,
                    task_id,
                    AttemptRecord {
                        attempt,
                        recorded_at: Utc::now(),
                        outcome: AttemptOutcome::Failed,
                        analysis: Some(analysis),
                        correction: CorrectionRecord::Rejected {
                            plan,
                            reason: message.clone(),
                        },
                    },
                )?;
                self.set_status(graph, store, task_id, Status::NotStarted)?;
                Err(CorrectionError::Storage(message)).context("apply correction")
            }
            Err(CorrectionFailure { plan, error }) => {
                let correction = CorrectionRecord::Rejected {
                    plan,
                    reason: error.to_string(),
                };
                if cancel.is_cancelled() {
                    // the reasoner was interrupted; that is not the plan's fault
                    self.record_attempt(
                        store,
                        task_id,
                        AttemptRecord {
                            attempt,
                            recorded_at: Utc::now(),
                            outcome: AttemptOutcome::Failed,
                            analysis: Some(analysis),
                            correction,
                        },
                    )?;
                    return self.cancel(graph, store, task_id);
                }
                warn!(err = %error, "correction rejected, charging an extra attempt");
                let charged = store.charge_attempt(task_id, self.config.max_attempts)?;
                match charged {
                    Some(total) if total < self.config.max_attempts => {
                        self.record_attempt(
                            store,
                            task_id,
                            AttemptRecord {
                                attempt,
                                recorded_at: Utc::now(),
                                outcome: AttemptOutcome::Failed,
                                analysis: Some(analysis),
                                correction,
                            },
                        )?;
                        self.set_status(graph, store, task_id, Status::NotStarted)?;
                        Ok(TaskResult::Retry {
                            attempts: total,
                            corrected: false,
                        })
                    }
                    _ => {
                        let total = store
                            .get(task_id)
                            .map_or(self.config.max_attempts, |state| state.attempts);
                        self.halt(graph, store, task, Some(analysis), correction, total)
                    }
                }
            }
        }
    }

    /// Analysis → plan → apply against a fresh snapshot.
    fn correct(
        &self,
        task: &Task,
        analysis: &ErrorAnalysis,
        attempt: u32,
    ) -> Result<CorrectionPlan, CorrectionFailure> {
        let snapshot = self
            .spec
            .snapshot()
            .map_err(|error| CorrectionFailure { plan: None, error })?;
        let plan = self
            .synthesizer
            .synthesize(analysis, task, self.spec.document_id(), &snapshot, attempt)
            .map_err(|error| CorrectionFailure { plan: None, error })?;
        match self.spec.apply(&plan) {
            Ok(applied) => {
                debug!(anchor = %applied.anchor, backup = %applied.backup_path.display(), "correction committed");
                Ok(plan)
            }
            Err(error) => Err(CorrectionFailure {
                plan: Some(plan),
                error,
            }),
        }
    }

    fn halt(
        &self,
        graph: &TaskGraph,
        store: &mut TaskStateStore,
        task: &Task,
        analysis: Option<ErrorAnalysis>,
        correction: CorrectionRecord,
        attempts: u32,
    ) -> Result<TaskResult> {
        let root_cause = root_cause_of(
            analysis
                .as_ref()
                .or_else(|| store.get(&task.id).and_then(|state| state.last_error.as_ref())),
        );
        self.record_attempt(
            store,
            &task.id,
            AttemptRecord {
                attempt: attempts,
                recorded_at: Utc::now(),
                outcome: AttemptOutcome::Halted,
                analysis,
                correction,
            },
        )?;
        self.set_status(graph, store, &task.id, Status::Halted)?;
        warn!(attempts, root_cause = %root_cause, "attempts exhausted, task halted");
        Ok(TaskResult::AttemptsExhausted {
            task_id: task.id.clone(),
            attempts,
            root_cause,
        })
    }

    fn cancel(
        &self,
        graph: &TaskGraph,
        store: &mut TaskStateStore,
        task_id: &str,
    ) -> Result<TaskResult> {
        info!("cancelled, handing task back");
        self.set_status(graph, store, task_id, Status::NotStarted)?;
        Ok(TaskResult::Cancelled)
    }

    fn record_attempt(
        &self,
        store: &mut TaskStateStore,
        task_id: &str,
        record: AttemptRecord,
    ) -> Result<()> {
        record_best_effort(
            self.recorder.as_ref(),
            &Activity::Attempt {
                task_id: task_id.to_string(),
                record: record.clone(),
            },
        );
        store.record_attempt(task_id, record)?;
        Ok(())
    }

    /// Transition, record the change, then checkpoint.
    pub(crate) fn set_status(
        &self,
        graph: &TaskGraph,
        store: &mut TaskStateStore,
        task_id: &str,
        to: Status,
    ) -> Result<StatusChange> {
        let change = store.transition(task_id, to)?;
        self.announce(&change);
        self.checkpoint(graph, store)?;
        Ok(change)
    }

    /// Forward a status change made outside [`set_status`](Self::set_status).
    pub(crate) fn announce(&self, change: &StatusChange) {
        record_best_effort(
            self.recorder.as_ref(),
            &Activity::StatusChange {
                at: Utc::now(),
                change: change.clone(),
            },
        );
    }

    pub(crate) fn checkpoint(&self, graph: &TaskGraph, store: &TaskStateStore) -> Result<()> {
        if let Some(state_file) = &self.state_file {
            state_file.save(graph, store)?;
        }
        Ok(())
    }
}

fn root_cause_of(analysis: Option<&ErrorAnalysis>) -> String {
    analysis.map_or_else(
        || EXHAUSTED_WITHOUT_ANALYSIS.to_string(),
        |analysis| analysis.root_cause.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::VerificationOutcome;
    use crate::io::reasoner::GuidanceReasoner;
    use crate::test_support::{
        RecordingRecorder, ScriptedGateway, ScriptedReasoner, TestWorkspace, graph, task_with_refs,
    };

    fn coordinator<R: Reasoner>(
        workspace: &TestWorkspace,
        gateway: ScriptedGateway,
        reasoner: R,
        max_attempts: u32,
    ) -> Coordinator<ScriptedGateway, R> {
        Coordinator::new(
            gateway,
            CorrectionSynthesizer::new(reasoner).expect("synthesizer"),
            workspace.spec_store(),
            LoopConfig {
                max_attempts,
                ..LoopConfig::default()
            },
        )
    }

    fn start(store: &mut TaskStateStore, id: &str) {
        store.transition(id, Status::Queued).expect("queue");
    }

    #[test]
    fn passing_task_completes_on_first_attempt() {
        let graph = graph(&[("A", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new();
        let coordinator = coordinator(&workspace, gateway.clone(), GuidanceReasoner, 3);
        let mut store = TaskStateStore::new(&graph);
        start(&mut store, "A");

        let result = coordinator
            .run_task(&graph, &mut store, "A", &CancelToken::new())
            .expect("run");
        assert_eq!(result, TaskResult::Completed { attempts: 1 });
        assert_eq!(store.status("A"), Some(Status::Completed));
        let history = &store.get("A").expect("state").history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Passed);
        assert_eq!(gateway.calls("A"), 1);
    }

    #[test]
    fn failure_applies_a_correction_and_resets() {
        let graph = graph(&[("A", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new().script("A", [VerificationOutcome::failed("SyntaxError: bad")]);
        let coordinator = coordinator(&workspace, gateway, GuidanceReasoner, 3);
        let mut store = TaskStateStore::new(&graph);
        let before = workspace.spec_text();

        let result = coordinator
            .run_task(&graph, &mut store, "A", &CancelToken::new())
            .expect("run");
        assert_eq!(
            result,
            TaskResult::Retry {
                attempts: 1,
                corrected: true
            }
        );
        let state = store.get("A").expect("state");
        assert_eq!(state.status, Status::NotStarted);
        assert_eq!(state.attempts, 1);
        assert!(matches!(
            state.history[0].correction,
            CorrectionRecord::Applied { .. }
        ));
        assert_ne!(workspace.spec_text(), before);
        assert!(workspace.spec_text().contains("SyntaxError: bad"));
    }

    #[test]
    fn rejected_correction_costs_an_extra_attempt() {
        let graph = graph(&[("A", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new().script("A", [VerificationOutcome::failed("boom")]);
        let coordinator = coordinator(&workspace, gateway, ScriptedReasoner::failing(), 5);
        let mut store = TaskStateStore::new(&graph);
        let before = workspace.spec_text();

        let result = coordinator
            .run_task(&graph, &mut store, "A", &CancelToken::new())
            .expect("run");
        assert_eq!(
            result,
            TaskResult::Retry {
                attempts: 2,
                corrected: false
            }
        );
        let state = store.get("A").expect("state");
        assert!(matches!(
            state.history[0].correction,
            CorrectionRecord::Rejected { plan: None, .. }
        ));
        assert_eq!(workspace.spec_text(), before);
    }

    #[test]
    fn rejected_correction_at_the_cap_halts() {
        let graph = graph(&[("A", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new().script("A", [VerificationOutcome::failed("boom")]);
        let coordinator = coordinator(&workspace, gateway, ScriptedReasoner::failing(), 2);
        let mut store = TaskStateStore::new(&graph);

        let result = coordinator
            .run_task(&graph, &mut store, "A", &CancelToken::new())
            .expect("run");
        assert_eq!(
            result,
            TaskResult::AttemptsExhausted {
                task_id: "A".to_string(),
                attempts: 2,
                root_cause: "boom".to_string(),
            }
        );
        assert_eq!(store.status("A"), Some(Status::Halted));
    }

    #[test]
    fn cancellation_during_correction_neither_charges_nor_halts() {
        let graph = graph(&[("A", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new().script("A", [VerificationOutcome::failed("boom")]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let reasoner = ScriptedReasoner::failing().before_first_proposal(move || trigger.cancel());
        let coordinator = coordinator(&workspace, gateway, reasoner, 2);
        let mut store = TaskStateStore::new(&graph);
        let before = workspace.spec_text();

        let result = coordinator
            .run_task(&graph, &mut store, "A", &cancel)
            .expect("run");

        assert_eq!(result, TaskResult::Cancelled);
        let state = store.get("A").expect("state");
        assert_eq!(state.status, Status::NotStarted);
        assert_eq!(state.attempts, 1);
        assert_eq!(state.history.len(), 1);
        assert!(matches!(
            state.history[0].correction,
            CorrectionRecord::Rejected { .. }
        ));
        assert_eq!(workspace.spec_text(), before);
    }

    #[test]
    fn completed_task_is_not_verified_again() {
        let graph = graph(&[("A", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new();
        let coordinator = coordinator(&workspace, gateway.clone(), GuidanceReasoner, 3);
        let mut store = TaskStateStore::new(&graph);
        coordinator
            .run_task(&graph, &mut store, "A", &CancelToken::new())
            .expect("first run");

        let again = coordinator
            .run_task(&graph, &mut store, "A", &CancelToken::new())
            .expect("second run");
        assert_eq!(again, TaskResult::Completed { attempts: 1 });
        assert_eq!(gateway.calls("A"), 1);
        assert_eq!(store.get("A").expect("state").history.len(), 1);
    }

    #[test]
    fn cancellation_hands_the_task_back() {
        let graph = graph(&[("A", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new();
        let coordinator = coordinator(&workspace, gateway.clone(), GuidanceReasoner, 3);
        let mut store = TaskStateStore::new(&graph);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = coordinator
            .run_task(&graph, &mut store, "A", &cancel)
            .expect("run");
        assert_eq!(result, TaskResult::Cancelled);
        assert_eq!(store.status("A"), Some(Status::NotStarted));
        assert_eq!(store.get("A").expect("state").attempts, 0);
        assert_eq!(gateway.calls("A"), 0);
    }

    #[test]
    fn every_transition_is_recorded_and_checkpointed() {
        let graph = graph(&[("A", &[])]);
        let workspace = TestWorkspace::new(&graph);
        let recorder = RecordingRecorder::new();
        let state_file = StateFile::new(workspace.paths().state_path.clone());
        let coordinator = coordinator(&workspace, ScriptedGateway::new(), GuidanceReasoner, 3)
            .with_recorder(Box::new(recorder.clone()))
            .with_state_file(state_file.clone());
        let mut store = TaskStateStore::new(&graph);

        coordinator
            .run_task(&graph, &mut store, "A", &CancelToken::new())
            .expect("run");

        let statuses: Vec<Status> = recorder
            .status_changes()
            .into_iter()
            .map(|change| change.to)
            .collect();
        assert_eq!(
            statuses,
            vec![Status::Queued, Status::InProgress, Status::Completed]
        );
        assert_eq!(recorder.attempts().len(), 1);
        let (persisted, _) = state_file.load(&graph).expect("load");
        assert_eq!(persisted.status("A"), Some(Status::Completed));
    }

    #[test]
    fn implicated_reference_is_corrected() {
        let graph = crate::graph::TaskGraph::new(vec![task_with_refs("A", &[], &["R1"])])
            .expect("graph");
        let workspace = TestWorkspace::new(&graph);
        let gateway = ScriptedGateway::new().script(
            "A",
            [VerificationOutcome::property_failed(
                "R1",
                Some("ok".to_string()),
                Some("err".to_string()),
                "R1 failed",
            )],
        );
        let coordinator = coordinator(&workspace, gateway, GuidanceReasoner, 3);
        let mut store = TaskStateStore::new(&graph);

        coordinator
            .run_task(&graph, &mut store, "A", &CancelToken::new())
            .expect("run");
        let CorrectionRecord::Applied { plan } = &store.get("A").expect("state").history[0].correction
        else {
            panic!("expected applied correction");
        };
        assert_eq!(plan.anchor, "R1");
        assert!(plan.rationale.contains("property R1 failed"));
    }
}
