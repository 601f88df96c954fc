//! Assembling a run from a project root.
//!
//! Everything a run needs lives under the root: `spec.md`, `tasks.json` and
//! `.specloop/` (config, persisted state, activity log, backups). Opening a
//! run loads all of it, reconciles persisted state against the current graph
//! and performs the crash-recovery scan.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::coordinator::{Coordinator, LoopConfig};
use crate::core::state_store::ReconcileReport;
use crate::io::activity::JsonlRecorder;
use crate::io::config::load_config;
use crate::io::gateway::CommandGateway;
use crate::io::init::SpecloopPaths;
use crate::io::policy::DenyListPolicy;
use crate::io::reasoner::ConfiguredReasoner;
use crate::io::spec_provider::{JsonSpecProvider, SpecProvider};
use crate::io::spec_store::SpecStore;
use crate::io::state_file::StateFile;
use crate::orchestrator::{Orchestrator, TaskReport, task_reports};
use crate::synthesize::CorrectionSynthesizer;

pub type WorkspaceOrchestrator = Orchestrator<CommandGateway<DenyListPolicy>, ConfiguredReasoner>;

pub struct OpenedRun {
    pub orchestrator: WorkspaceOrchestrator,
    pub reconcile: ReconcileReport,
}

/// Load config, graph, state and specification under `root` and wire up an orchestrator.
pub fn open_run(root: &Path, cancel: &CancelToken) -> Result<OpenedRun> {
    debug!(root = %root.display(), "opening run");
    let paths = SpecloopPaths::new(root);
    let config = load_config(&paths.config_path).context("load config.toml")?;

    let mut provider = JsonSpecProvider::new(&paths.tasks_path);
    let graph = provider.load().context("load tasks.json")?;
    debug!(order = ?graph.topological_order(), "task graph loaded");

    let state_file = StateFile::new(&paths.state_path);
    let (store, reconcile) = state_file.load(&graph).context("load state.json")?;

    let spec = SpecStore::new(&paths.spec_path, &paths.backups_dir);
    spec.snapshot().context("load spec.md")?;

    let policy = DenyListPolicy::new(&config.policy.deny_patterns)?;
    let gateway = CommandGateway::new(
        config.verify.command.clone(),
        root,
        config.output_limit_bytes,
        policy,
    );
    let reasoner = ConfiguredReasoner::from_config(
        &config.reasoner,
        root,
        config.output_limit_bytes,
        cancel.clone(),
    );
    let coordinator = Coordinator::new(
        gateway,
        CorrectionSynthesizer::new(reasoner)?,
        spec,
        LoopConfig::from_config(&config),
    )
    .with_recorder(Box::new(JsonlRecorder::new(&paths.activity_path)))
    .with_state_file(state_file);

    let orchestrator = Orchestrator::new(graph, store, coordinator, config.halt_on_exhaustion)?
        .with_provider(Box::new(provider));
    info!(
        tasks = orchestrator.graph().len(),
        kept = reconcile.kept.len(),
        recovered = orchestrator.recovered().len(),
        "run opened"
    );
    Ok(OpenedRun {
        orchestrator,
        reconcile,
    })
}

/// Persisted task states, reconciled against the current graph, without running anything.
pub fn load_status(root: &Path) -> Result<Vec<TaskReport>> {
    let paths = SpecloopPaths::new(root);
    let graph = JsonSpecProvider::new(&paths.tasks_path)
        .load()
        .context("load tasks.json")?;
    let (store, _) = StateFile::new(&paths.state_path)
        .load(&graph)
        .context("load state.json")?;
    Ok(task_reports(&store))
}
