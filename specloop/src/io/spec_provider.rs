//! Specification provider: loads the task graph snapshot (`tasks.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::graph::{Task, TaskGraph};

const TASK_GRAPH_SCHEMA: &str = include_str!("../../schemas/task_graph.schema.json");

/// On-disk form of the task graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskGraphFile {
    pub version: u32,
    pub tasks: Vec<Task>,
}

pub trait SpecProvider {
    fn load(&mut self) -> Result<TaskGraph>;
    /// Re-read the snapshot after the specification may have changed.
    fn reload(&mut self) -> Result<TaskGraph>;
}

/// Reads a JSON task graph validated against the embedded schema.
#[derive(Debug, Clone)]
pub struct JsonSpecProvider {
    path: PathBuf,
    last_checksum: Option<String>,
}

impl JsonSpecProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_checksum: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_graph(&mut self) -> Result<TaskGraph> {
        let graph = load_task_graph(&self.path)?;
        self.last_checksum = Some(graph.checksum());
        Ok(graph)
    }
}

impl SpecProvider for JsonSpecProvider {
    fn load(&mut self) -> Result<TaskGraph> {
        self.read_graph()
    }

    fn reload(&mut self) -> Result<TaskGraph> {
        let previous = self.last_checksum.clone();
        let graph = self.read_graph()?;
        if previous.as_deref() != Some(graph.checksum().as_str()) {
            info!(path = %self.path.display(), "task graph changed on reload");
        }
        Ok(graph)
    }
}

/// Load, schema-validate and build a task graph from `path`.
pub fn load_task_graph(path: &Path) -> Result<TaskGraph> {
    debug!(path = %path.display(), "loading task graph");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task graph {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse task graph {}", path.display()))?;
    validate_schema(&value)?;
    let file: TaskGraphFile = serde_json::from_value(value)
        .with_context(|| format!("deserialize task graph {}", path.display()))?;
    let graph = TaskGraph::new(file.tasks)?;
    Ok(graph)
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(TASK_GRAPH_SCHEMA).context("parse embedded task graph schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "task graph schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphError;

    fn write(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("tasks.json");
        fs::write(&path, contents).expect("write tasks");
        path
    }

    #[test]
    fn loads_graph_in_declared_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"version": 1, "tasks": [
                {"id": "B", "description": "b", "dependencies": ["A"]},
                {"id": "A", "description": "a", "references": ["R1"]}
            ]}"#,
        );
        let graph = JsonSpecProvider::new(&path).load().expect("load");
        let ids: Vec<&str> = graph.tasks().iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A"]);
        assert_eq!(graph.topological_order(), vec!["A", "B"]);
    }

    #[test]
    fn schema_violations_are_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"version": 1, "tasks": [{"id": "has space", "description": "x"}]}"#,
        );
        let err = JsonSpecProvider::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn cycles_surface_as_graph_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"version": 1, "tasks": [
                {"id": "a", "description": "a", "dependencies": ["b"]},
                {"id": "b", "description": "b", "dependencies": ["a"]}
            ]}"#,
        );
        let err = JsonSpecProvider::new(&path).load().unwrap_err();
        let graph_err = err.downcast_ref::<GraphError>().expect("graph error");
        assert!(matches!(graph_err, GraphError::CyclicDependency { .. }));
    }

    #[test]
    fn reload_picks_up_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"version": 1, "tasks": [{"id": "a", "description": "a"}]}"#,
        );
        let mut provider = JsonSpecProvider::new(&path);
        let first = provider.load().expect("load");
        write(
            temp.path(),
            r#"{"version": 1, "tasks": [{"id": "a", "description": "a2"}]}"#,
        );
        let second = provider.reload().expect("reload");
        assert_ne!(first.checksum(), second.checksum());
        assert_eq!(second.get("a").expect("a").description, "a2");
    }
}
