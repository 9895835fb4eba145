//! Per-task execution context
//!
//! Bundles what an executor needs to know before working on a task: plan
//! progress, the task's criteria, upstream outputs (by reference only),
//! recent learnings, approaches that already failed, side effects already
//! performed and the remaining iteration budget.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreResult;
use crate::records::{Artifact, FailedApproach, Learning, SideEffect, StatusCounts};
use crate::store::TaskGraphStore;
use crate::task::{Task, TaskStatus};

const TRUNCATION_MARKER: &str = "\n\n[context truncated]";

/// Bounds on what goes into a task context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ContextLimits {
    pub max_learnings: usize,
    pub max_failed_approaches: usize,
    pub max_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_learnings: 10,
            max_failed_approaches: 5,
            max_chars: 16_000,
        }
    }
}

/// Context handed to the executor for one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub counts: StatusCounts,
    pub task: Task,
    /// Artifacts of completed dependencies (paths and hashes, never content)
    pub upstream: Vec<Artifact>,
    pub learnings: Vec<Learning>,
    pub failed_approaches: Vec<FailedApproach>,
    pub side_effects: Vec<SideEffect>,
    pub iterations_used: u32,
    pub iterations_remaining: u32,
    pub max_chars: usize,
}

impl TaskContext {
    /// Render as markdown, truncated to `max_chars` characters
    pub fn render(&self) -> String {
        let mut out = String::new();
        let task = &self.task;

        out.push_str(&format!("# Task: {} ({})\n", task.title, task.id));
        out.push_str(&format!(
            "\nIteration budget: {} used, {} remaining\n",
            self.iterations_used, self.iterations_remaining
        ));
        out.push_str(&format!("\n## Plan progress\n\n{}\n", self.counts));

        if !task.description.is_empty() {
            out.push_str(&format!("\n## Description\n\n{}\n", task.description));
        }

        if !task.binary_checks.is_empty() || !task.constraints.is_empty() || task.evaluation_rubric.is_some() {
            out.push_str("\n## Success criteria\n\n");
            for check in &task.binary_checks {
                out.push_str(&format!("- check: `{}`\n", check));
            }
            for c in &task.constraints {
                out.push_str(&format!("- constraint: {} = `{}`\n", c.kind, c.value));
            }
            if let Some(rubric) = &task.evaluation_rubric {
                out.push_str(&format!(
                    "- rubric (min score {:.2}): {}\n",
                    task.minimum_acceptable_score, rubric
                ));
            }
        }

        if !self.upstream.is_empty() {
            out.push_str("\n## Upstream artifacts\n\n");
            for a in &self.upstream {
                out.push_str(&format!(
                    "- [{}] {} {} (hash {})\n",
                    a.task_id,
                    a.artifact_type.as_str(),
                    a.file_path.as_deref().unwrap_or("-"),
                    a.content_hash.as_deref().unwrap_or("-")
                ));
            }
        }

        if !self.side_effects.is_empty() {
            out.push_str("\n## Side effects already performed (do not repeat)\n\n");
            for e in &self.side_effects {
                out.push_str(&format!("- {} `{}` (iteration {})\n", e.effect_type, e.idempotency_key, e.iteration));
            }
        }

        if !self.failed_approaches.is_empty() {
            out.push_str("\n## Approaches that failed\n\n");
            for fa in &self.failed_approaches {
                out.push_str(&format!("- iteration {}: {} -- {}\n", fa.iteration, fa.approach, fa.why_failed));
            }
        }

        if !self.learnings.is_empty() {
            out.push_str("\n## Learnings\n\n");
            for l in &self.learnings {
                out.push_str(&format!("- {}\n", l.text));
            }
        }

        truncate_chars(out, self.max_chars)
    }
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

impl TaskGraphStore {
    /// Assemble the context for one iteration of `task`
    pub fn generate_task_context(&self, task: &Task, limits: &ContextLimits) -> StoreResult<TaskContext> {
        debug!(task_id = %task.id, ?limits, "generate_task_context: called");

        let mut upstream = Vec::new();
        for dep in &task.depends_on {
            match self.get_task(dep)? {
                Some(dep_task) if dep_task.status == TaskStatus::Complete => {
                    upstream.extend(self.list_artifacts(Some(dep))?);
                }
                _ => {}
            }
        }

        let iterations_used = self.iteration_count(&task.id)?;
        Ok(TaskContext {
            counts: self.status_counts()?,
            task: task.clone(),
            upstream,
            learnings: self.recent_learnings(limits.max_learnings)?,
            failed_approaches: self.list_failed_approaches(Some(&task.id), limits.max_failed_approaches)?,
            side_effects: self.list_side_effects(Some(&task.id))?,
            iterations_used,
            iterations_remaining: task.max_iterations.saturating_sub(iterations_used),
            max_chars: limits.max_chars,
        })
    }
}
