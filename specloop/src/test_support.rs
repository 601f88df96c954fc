//! Test-only builders and scripted collaborators.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::rc::Rc;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{Activity, AttemptRecord, StatusChange, VerificationOutcome};
use crate::graph::{Task, TaskGraph};
use crate::io::activity::ActivityRecorder;
use crate::io::gateway::{VerificationGateway, VerifyRequest};
use crate::io::init::SpecloopPaths;
use crate::io::reasoner::{Proposal, ProposalRequest, Reasoner};
use crate::io::spec_provider::TaskGraphFile;
use crate::io::spec_store::SpecStore;

/// Task with a deterministic description and no references.
pub fn task(id: &str, dependencies: &[&str]) -> Task {
    task_with_refs(id, dependencies, &[])
}

pub fn task_with_refs(id: &str, dependencies: &[&str], references: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        description: format!("{id} description"),
        dependencies: dependencies.iter().map(|dep| dep.to_string()).collect(),
        references: references.iter().map(|reference| reference.to_string()).collect(),
    }
}

/// Graph from `(id, dependencies)` pairs in declared order.
pub fn graph(spec: &[(&str, &[&str])]) -> TaskGraph {
    let tasks = spec.iter().map(|(id, deps)| task(id, deps)).collect();
    TaskGraph::new(tasks).expect("test graph should be valid")
}

/// Anchored markdown with one section per reference and per task.
pub fn spec_document(graph: &TaskGraph) -> String {
    let mut out = String::from("# Specification {#spec}\n\n");
    let mut seen = Vec::new();
    for reference in graph.tasks().iter().flat_map(|task| task.references.iter()) {
        if seen.contains(reference) {
            continue;
        }
        seen.push(reference.clone());
        out.push_str(&format!(
            "## Requirement {reference} {{#{reference}}}\n{reference} must hold.\n\n"
        ));
    }
    for task in graph.tasks() {
        out.push_str(&format!(
            "## Task {id} {{#{id}}}\n{description}\n\n",
            id = task.id,
            description = task.description
        ));
    }
    out
}

/// Temporary project root holding `spec.md`, `tasks.json` and `.specloop/`.
pub struct TestWorkspace {
    _temp: TempDir,
    paths: SpecloopPaths,
}

impl TestWorkspace {
    pub fn new(graph: &TaskGraph) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SpecloopPaths::new(temp.path());
        fs::create_dir_all(&paths.backups_dir).expect("create backups dir");
        fs::write(&paths.spec_path, spec_document(graph)).expect("write spec");
        let file = TaskGraphFile {
            version: 1,
            tasks: graph.tasks().to_vec(),
        };
        fs::write(
            &paths.tasks_path,
            serde_json::to_string_pretty(&file).expect("serialize tasks"),
        )
        .expect("write tasks");
        Self { _temp: temp, paths }
    }

    pub fn paths(&self) -> &SpecloopPaths {
        &self.paths
    }

    pub fn spec_store(&self) -> SpecStore {
        SpecStore::new(&self.paths.spec_path, &self.paths.backups_dir)
    }

    pub fn spec_text(&self) -> String {
        fs::read_to_string(&self.paths.spec_path).expect("read spec")
    }
}

#[derive(Default)]
struct GatewayScript {
    outcomes: HashMap<String, VecDeque<VerificationOutcome>>,
    always_fail: HashMap<String, String>,
    calls: Vec<String>,
}

/// Gateway replaying scripted outcomes per task; passes once a script runs out.
///
/// Clones share the script and call log.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    inner: Rc<RefCell<GatewayScript>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(
        self,
        task_id: &str,
        outcomes: impl IntoIterator<Item = VerificationOutcome>,
    ) -> Self {
        self.inner
            .borrow_mut()
            .outcomes
            .entry(task_id.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Fail every call for `task_id` once its script is exhausted.
    pub fn fail_always(self, task_id: &str, diagnostics: &str) -> Self {
        self.inner
            .borrow_mut()
            .always_fail
            .insert(task_id.to_string(), diagnostics.to_string());
        self
    }

    pub fn calls(&self, task_id: &str) -> usize {
        self.inner
            .borrow()
            .calls
            .iter()
            .filter(|id| *id == task_id)
            .count()
    }

    pub fn call_order(&self) -> Vec<String> {
        self.inner.borrow().calls.clone()
    }
}

impl VerificationGateway for ScriptedGateway {
    fn run(&self, task: &Task, request: &VerifyRequest<'_>) -> VerificationOutcome {
        if request.cancel.is_cancelled() {
            return VerificationOutcome::cancelled();
        }
        let mut inner = self.inner.borrow_mut();
        inner.calls.push(task.id.clone());
        if let Some(outcome) = inner
            .outcomes
            .get_mut(&task.id)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        match inner.always_fail.get(&task.id) {
            Some(diagnostics) => VerificationOutcome::failed(diagnostics.clone()),
            None => VerificationOutcome::passed("ok"),
        }
    }
}

type Hook = Box<dyn FnOnce()>;

/// Reasoner returning scripted replacements in order.
pub struct ScriptedReasoner {
    replacements: RefCell<VecDeque<String>>,
    fail: bool,
    hook: RefCell<Option<Hook>>,
    requests: RefCell<Vec<String>>,
}

impl ScriptedReasoner {
    pub fn new(replacements: Vec<&str>) -> Self {
        Self {
            replacements: RefCell::new(replacements.into_iter().map(str::to_string).collect()),
            fail: false,
            hook: RefCell::new(None),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Every proposal fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    /// Run `hook` once, on the first proposal request, before answering it.
    pub fn before_first_proposal(self, hook: impl FnOnce() + 'static) -> Self {
        *self.hook.borrow_mut() = Some(Box::new(hook));
        self
    }

    /// Anchors proposals were requested for.
    pub fn requested_anchors(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl Reasoner for ScriptedReasoner {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal> {
        self.requests.borrow_mut().push(request.anchor.to_string());
        if let Some(hook) = self.hook.borrow_mut().take() {
            hook();
        }
        if self.fail {
            return Err(anyhow!("scripted reasoner failure"));
        }
        let replacement = self
            .replacements
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted proposal left"))?;
        Ok(Proposal {
            replacement,
            notes: None,
        })
    }
}

/// Recorder keeping every activity in memory. Clones share the log.
#[derive(Clone, Default)]
pub struct RecordingRecorder {
    events: Rc<RefCell<Vec<Activity>>>,
}

impl RecordingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Activity> {
        self.events.borrow().clone()
    }

    pub fn status_changes(&self) -> Vec<StatusChange> {
        self.events
            .borrow()
            .iter()
            .filter_map(|activity| match activity {
                Activity::StatusChange { change, .. } => Some(change.clone()),
                Activity::Attempt { .. } => None,
            })
            .collect()
    }

    pub fn attempts(&self) -> Vec<(String, AttemptRecord)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|activity| match activity {
                Activity::Attempt { task_id, record } => Some((task_id.clone(), record.clone())),
                Activity::StatusChange { .. } => None,
            })
            .collect()
    }
}

impl ActivityRecorder for RecordingRecorder {
    fn record(&self, activity: &Activity) -> Result<()> {
        self.events.borrow_mut().push(activity.clone());
        Ok(())
    }
}

/// Recorder that fails every call.
#[derive(Clone, Copy, Default)]
pub struct FailingRecorder;

impl ActivityRecorder for FailingRecorder {
    fn record(&self, _activity: &Activity) -> Result<()> {
        Err(anyhow!("recorder unavailable"))
    }
}
