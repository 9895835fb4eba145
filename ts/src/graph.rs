//! Dependency graph validation
//!
//! Plans must form a DAG over `depends_on` edges, and every edge must point
//! at a task in the batch or already in the store.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::task::Task;

/// Validate a batch of tasks before insertion
///
/// `known` answers whether an id already exists in the store. Returns the
/// first cycle found as `CyclicDependency`, or the first dangling edge as
/// `UnknownDependency`.
pub fn validate_dependency_graph(tasks: &[Task], known: impl Fn(&str) -> bool) -> StoreResult<()> {
    debug!(task_count = tasks.len(), "validate_dependency_graph: called");
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id.as_str()) || known(&task.id) {
            return Err(StoreError::DuplicateTask(task.id.clone()));
        }
    }

    for task in tasks {
        for dep in &task.depends_on {
            if !seen.contains(dep.as_str()) && !known(dep) {
                debug!(task = %task.id, %dep, "validate_dependency_graph: unknown dependency");
                return Err(StoreError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let edges: HashMap<&str, Vec<&str>> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends_on.iter().map(String::as_str).collect()))
        .collect();

    if let Some(cycle) = find_cycle(&edges) {
        debug!(?cycle, "validate_dependency_graph: cycle detected");
        return Err(StoreError::CyclicDependency(cycle));
    }

    debug!("validate_dependency_graph: no cycles found");
    Ok(())
}

/// Find a cycle in an adjacency map, returning the path that closes it
pub fn find_cycle(edges: &HashMap<&str, Vec<&str>>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    let mut roots: Vec<&str> = edges.keys().copied().collect();
    roots.sort_unstable();

    for node in roots {
        if !visited.contains(node) && has_cycle_dfs(node, edges, &mut visited, &mut rec_stack, &mut path) {
            return Some(path);
        }
    }
    None
}

fn has_cycle_dfs<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node.to_string());

    if let Some(deps) = edges.get(node) {
        for &dep in deps {
            if rec_stack.contains(dep) {
                path.push(dep.to_string());
                return true;
            }
            if !visited.contains(dep) && edges.contains_key(dep) && has_cycle_dfs(dep, edges, visited, rec_stack, path) {
                return true;
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chain() -> Vec<Task> {
        vec![
            Task::new("a", "A"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("a").depends_on("b"),
        ]
    }

    #[test]
    fn test_acyclic_batch_is_accepted() {
        assert!(validate_dependency_graph(&chain(), |_| false).is_ok());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let tasks = vec![
            Task::new("a", "A").depends_on("c"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("b"),
        ];
        match validate_dependency_graph(&tasks, |_| false) {
            Err(StoreError::CyclicDependency(path)) => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let tasks = vec![Task::new("a", "A").depends_on("a")];
        assert!(matches!(
            validate_dependency_graph(&tasks, |_| false),
            Err(StoreError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let tasks = vec![Task::new("a", "A").depends_on("ghost")];
        assert!(matches!(
            validate_dependency_graph(&tasks, |_| false),
            Err(StoreError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_dependency_on_existing_task_is_accepted() {
        let tasks = vec![Task::new("b", "B").depends_on("a")];
        assert!(validate_dependency_graph(&tasks, |id| id == "a").is_ok());
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let tasks = vec![Task::new("a", "A"), Task::new("a", "A again")];
        assert!(matches!(
            validate_dependency_graph(&tasks, |_| false),
            Err(StoreError::DuplicateTask(_))
        ));
    }

    proptest! {
        // Edges only point from higher to lower indices, so the graph is a DAG.
        #[test]
        fn prop_forward_only_edges_are_acyclic(edges in proptest::collection::vec((1usize..12, 0usize..12), 0..40)) {
            let mut tasks: Vec<Task> = (0..12).map(|i| Task::new(format!("t{}", i), "t")).collect();
            for (from, to) in edges {
                if to < from {
                    tasks[from].depends_on.insert(format!("t{}", to));
                }
            }
            prop_assert!(validate_dependency_graph(&tasks, |_| false).is_ok());
        }
    }
}
