//! Task graph: the immutable-after-load set of tasks and their dependency edges.
//!
//! A [`TaskGraph`] is built once per run from a specification snapshot. Mutable
//! progress (status, attempts, history) lives in
//! [`TaskStateStore`](crate::core::state_store::TaskStateStore), never here.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::digest::Sha256Writer;

/// One unit of work drawn from the specification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    /// Unique id, stable across reloads. Also the anchor of the task's own section.
    pub id: String,
    pub description: String,
    /// Ids of tasks that must be `Completed` before this one is eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Requirement/property anchors this task is verified against.
    #[serde(default)]
    pub references: Vec<String>,
}

impl Task {
    /// SHA-256 over the task definition. Changes whenever any field changes.
    pub fn fingerprint(&self) -> String {
        let mut digest = Sha256Writer::new();
        self.write_digest(&mut digest);
        digest.finish()
    }

    fn write_digest(&self, digest: &mut Sha256Writer) {
        digest.field(&self.id);
        digest.field(&self.description);
        digest.list(&self.dependencies);
        digest.list(&self.references);
    }
}

/// Structural problems detected while building a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },
    #[error("task '{0}' depends on itself")]
    SelfDependency(String),
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
}

/// Validated, acyclic task graph preserving declared task order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    topo_order: Vec<usize>,
}

impl TaskGraph {
    /// Build a graph, rejecting duplicate ids, dangling edges and cycles.
    ///
    /// Repeated entries in a task's dependency list are collapsed (first occurrence wins).
    pub fn new(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (position, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), position).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        let mut tasks = tasks;
        for task in &mut tasks {
            dedup_preserving_order(&mut task.dependencies);
            for dependency in &task.dependencies {
                if *dependency == task.id {
                    return Err(GraphError::SelfDependency(task.id.clone()));
                }
                if !index.contains_key(dependency) {
                    return Err(GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let topo_order = topological_sort(&tasks, &index)?;
        debug!(tasks = tasks.len(), "task graph built");
        Ok(Self {
            tasks,
            index,
            topo_order,
        })
    }

    /// Tasks in declared order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|position| &self.tasks[*position])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task ids in a valid execution order (dependencies first, ties by declared order).
    pub fn topological_order(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .map(|position| self.tasks[*position].id.as_str())
            .collect()
    }

    /// Version checksum over every task definition, in declared order.
    pub fn checksum(&self) -> String {
        let mut digest = Sha256Writer::new();
        digest.field("task-graph/v1");
        for task in &self.tasks {
            task.write_digest(&mut digest);
        }
        digest.finish()
    }
}

fn dedup_preserving_order(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

/// Kahn's algorithm seeded in declared order. Leftover nodes sit on or behind a cycle.
fn topological_sort(
    tasks: &[Task],
    index: &HashMap<String, usize>,
) -> Result<Vec<usize>, GraphError> {
    let mut indegree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (position, task) in tasks.iter().enumerate() {
        for dependency in &task.dependencies {
            if let Some(&dep_position) = index.get(dependency) {
                indegree[position] += 1;
                dependents[dep_position].push(position);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..tasks.len())
        .filter(|position| indegree[*position] == 0)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());
    while let Some(position) = ready.pop_front() {
        order.push(position);
        for &next in &dependents[position] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() == tasks.len() {
        return Ok(order);
    }

    let remaining: Vec<usize> = (0..tasks.len())
        .filter(|position| indegree[*position] > 0)
        .collect();
    Err(GraphError::CyclicDependency {
        cycle: find_cycle(tasks, index, &remaining),
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

/// Name one concrete cycle among `remaining`, e.g. `["a", "b", "a"]`.
fn find_cycle(tasks: &[Task], index: &HashMap<String, usize>, remaining: &[usize]) -> Vec<String> {
    let candidates: HashSet<usize> = remaining.iter().copied().collect();
    let mut marks = vec![Mark::Unvisited; tasks.len()];
    let mut path = Vec::new();
    for &start in remaining {
        if let Some(cycle) = visit(start, tasks, index, &candidates, &mut marks, &mut path) {
            return cycle;
        }
    }
    remaining
        .iter()
        .map(|position| tasks[*position].id.clone())
        .collect()
}

fn visit(
    node: usize,
    tasks: &[Task],
    index: &HashMap<String, usize>,
    candidates: &HashSet<usize>,
    marks: &mut [Mark],
    path: &mut Vec<usize>,
) -> Option<Vec<String>> {
    match marks[node] {
        Mark::Done => return None,
        Mark::Active => {
            let start = path.iter().position(|entry| *entry == node)?;
            let mut cycle: Vec<String> = path[start..]
                .iter()
                .map(|position| tasks[*position].id.clone())
                .collect();
            cycle.push(tasks[node].id.clone());
            return Some(cycle);
        }
        Mark::Unvisited => {}
    }

    marks[node] = Mark::Active;
    path.push(node);
    for dependency in &tasks[node].dependencies {
        let Some(&next) = index.get(dependency) else {
            continue;
        };
        if !candidates.contains(&next) {
            continue;
        }
        if let Some(cycle) = visit(next, tasks, index, candidates, marks, path) {
            return Some(cycle);
        }
    }
    path.pop();
    marks[node] = Mark::Done;
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{task, task_with_refs};

    #[test]
    fn builds_graph_and_orders_dependencies_first() {
        let graph = TaskGraph::new(vec![
            task("c", &["b"]),
            task("a", &[]),
            task("b", &["a"]),
        ])
        .expect("graph");

        assert_eq!(graph.topological_order(), vec!["a", "b", "c"]);
        assert_eq!(graph.tasks()[0].id, "c");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = TaskGraph::new(vec![task("a", &[]), task("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateTask("a".to_string()));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = TaskGraph::new(vec![task("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                task: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn rejects_self_dependency() {
        let err = TaskGraph::new(vec![task("a", &["a"])]).unwrap_err();
        assert_eq!(err, GraphError::SelfDependency("a".to_string()));
    }

    #[test]
    fn cyclic_dependency_names_the_cycle() {
        let err = TaskGraph::new(vec![
            task("root", &[]),
            task("a", &["root", "c"]),
            task("b", &["a"]),
            task("c", &["b"]),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: vec![
                    "a".to_string(),
                    "c".to_string(),
                    "b".to_string(),
                    "a".to_string()
                ],
            }
        );
        assert_eq!(err.to_string(), "cyclic dependency: a -> c -> b -> a");
    }

    #[test]
    fn duplicate_dependency_entries_collapse() {
        let graph = TaskGraph::new(vec![task("a", &[]), task("b", &["a", "a"])]).expect("graph");
        assert_eq!(graph.get("b").expect("b").dependencies, vec!["a".to_string()]);
    }

    #[test]
    fn checksum_tracks_definition_changes() {
        let first = TaskGraph::new(vec![task_with_refs("a", &[], &["R1"])]).expect("graph");
        let same = TaskGraph::new(vec![task_with_refs("a", &[], &["R1"])]).expect("graph");
        let changed = TaskGraph::new(vec![task_with_refs("a", &[], &["R2"])]).expect("graph");

        assert_eq!(first.checksum(), same.checksum());
        assert_ne!(first.checksum(), changed.checksum());
        assert_ne!(
            first.get("a").expect("a").fingerprint(),
            changed.get("a").expect("a").fingerprint()
        );
    }
}
