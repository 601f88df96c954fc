//! Validation of a project root before a run.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::core::anchors::{AnchoredDocument, Lookup};
use crate::io::config::load_config;
use crate::io::init::SpecloopPaths;
use crate::io::spec_provider::{JsonSpecProvider, SpecProvider};

/// What a valid workspace contains, plus anchors corrections cannot target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub tasks: usize,
    pub anchors: usize,
    /// Task ids and references with no anchor in the specification.
    pub missing_anchors: Vec<String>,
    /// Task ids and references declared more than once.
    pub ambiguous_anchors: Vec<String>,
}

/// Check config, task graph (schema, dependencies, cycles) and the specification document.
pub fn validate_workspace(root: &Path) -> Result<ValidateOutcome> {
    let paths = SpecloopPaths::new(root);
    load_config(&paths.config_path).context("load config.toml")?;
    let graph = JsonSpecProvider::new(&paths.tasks_path)
        .load()
        .context("load tasks.json")?;
    let text = fs::read_to_string(&paths.spec_path)
        .with_context(|| format!("read {}", paths.spec_path.display()))?;
    let document = AnchoredDocument::parse(text)
        .map_err(|err| anyhow!("parse {}: {err}", paths.spec_path.display()))?;

    let mut missing = BTreeSet::new();
    let mut ambiguous = BTreeSet::new();
    for task in graph.tasks() {
        for id in std::iter::once(&task.id).chain(task.references.iter()) {
            match document.lookup(id) {
                Lookup::Found(_) => {}
                Lookup::Missing => {
                    missing.insert(id.clone());
                }
                Lookup::Ambiguous(_) => {
                    ambiguous.insert(id.clone());
                }
            }
        }
    }

    Ok(ValidateOutcome {
        tasks: graph.len(),
        anchors: document.anchors().len(),
        missing_anchors: missing.into_iter().collect(),
        ambiguous_anchors: ambiguous.into_iter().collect(),
    })
}
