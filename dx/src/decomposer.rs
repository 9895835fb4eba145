//! Request decomposition boundary
//!
//! A decomposer turns a request into a dependency-ordered task list, either
//! for a fresh plan, for a re-plan after repeated failures, or for breaking
//! one exhausted task into sub-tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use taskstore::{FailedApproach, Task};
use tracing::{debug, info};

/// What the decomposer knows when planning
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    /// 1 for the first plan, +1 per re-plan
    pub generation: u32,
    /// Learnings accumulated so far, most recent first
    pub learnings: Vec<String>,
    /// Approaches that already failed, most recent first
    pub failed_approaches: Vec<FailedApproach>,
    /// Set when asking for sub-tasks of this task
    pub parent_task: Option<Task>,
}

/// Produces task lists from requests
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, request: &str, context: &PlanContext) -> eyre::Result<Vec<Task>>;
}

/// On-disk plan format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub tasks: Vec<Task>,

    /// Sub-tasks keyed by the id of the task they break down
    #[serde(default)]
    pub subtasks: HashMap<String, Vec<Task>>,
}

/// Decomposer that reads a YAML plan file
///
/// Re-plans return the same tasks with ids prefixed `g<N>-` so they never
/// collide with the superseded generation.
pub struct PlanFileDecomposer {
    path: PathBuf,
}

impl PlanFileDecomposer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        debug!(?path, "PlanFileDecomposer::new: called");
        Self { path }
    }

    async fn load(&self) -> eyre::Result<PlanFile> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| eyre::eyre!("Failed to read plan {}: {}", self.path.display(), e))?;
        let plan: PlanFile = serde_yaml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse plan {}: {}", self.path.display(), e))?;
        Ok(plan)
    }
}

fn generation_prefix(generation: u32) -> Option<String> {
    (generation > 1).then(|| format!("g{}-", generation))
}

fn prefixed(tasks: Vec<Task>, prefix: &str) -> Vec<Task> {
    tasks
        .into_iter()
        .map(|mut t| {
            t.id = format!("{}{}", prefix, t.id);
            t.depends_on = t.depends_on.iter().map(|d| format!("{}{}", prefix, d)).collect();
            t
        })
        .collect()
}

#[async_trait]
impl Decomposer for PlanFileDecomposer {
    async fn decompose(&self, request: &str, context: &PlanContext) -> eyre::Result<Vec<Task>> {
        debug!(generation = context.generation, parent = ?context.parent_task.as_ref().map(|t| &t.id), "PlanFileDecomposer::decompose: called");
        let mut plan = self.load().await?;
        let prefix = generation_prefix(context.generation).unwrap_or_default();

        if let Some(parent) = &context.parent_task {
            let key = parent.id.strip_prefix(prefix.as_str()).unwrap_or(&parent.id);
            let subtasks = plan.subtasks.remove(key).unwrap_or_default();
            let subtasks: Vec<Task> = prefixed(subtasks, &prefix)
                .into_iter()
                .map(|t| t.with_parent(parent.id.clone()))
                .collect();
            info!(parent = %parent.id, count = subtasks.len(), "Decomposed task into sub-tasks");
            return Ok(subtasks);
        }

        let tasks = prefixed(plan.tasks, &prefix);
        info!(generation = context.generation, count = tasks.len(), request_len = request.len(), "Decomposed request");
        Ok(tasks)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Decomposer returning canned plans per generation and sub-tasks per parent
    pub struct MockDecomposer {
        plans: Vec<Vec<Task>>,
        subtasks: HashMap<String, Vec<Task>>,
        call_count: AtomicUsize,
        contexts: Mutex<Vec<PlanContext>>,
    }

    impl MockDecomposer {
        pub fn new(plans: Vec<Vec<Task>>) -> Self {
            Self {
                plans,
                subtasks: HashMap::new(),
                call_count: AtomicUsize::new(0),
                contexts: Mutex::new(Vec::new()),
            }
        }

        pub fn with_subtasks(mut self, parent: &str, tasks: Vec<Task>) -> Self {
            self.subtasks.insert(parent.to_string(), tasks);
            self
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        pub fn contexts(&self) -> Vec<PlanContext> {
            self.contexts.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Decomposer for MockDecomposer {
        async fn decompose(&self, _request: &str, context: &PlanContext) -> eyre::Result<Vec<Task>> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut contexts) = self.contexts.lock() {
                contexts.push(context.clone());
            }
            if let Some(parent) = &context.parent_task {
                return Ok(self
                    .subtasks
                    .get(&parent.id)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|t| t.with_parent(parent.id.clone()))
                    .collect());
            }
            let idx = context.generation.saturating_sub(1) as usize;
            self.plans
                .get(idx)
                .cloned()
                .ok_or_else(|| eyre::eyre!("No plan for generation {}", context.generation))
        }
    }
}
