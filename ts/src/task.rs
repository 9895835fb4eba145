//! Task domain type
//!
//! A task is one unit of work in a run's plan, with explicit dependencies and
//! completion criteria.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::debug;

use crate::error::StoreError;
use crate::now_ms;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or for its turn
    #[default]
    Pending,
    /// An iteration is currently working on it
    InProgress,
    /// Waiting on sub-tasks or an external blocker
    Blocked,
    /// Parked for an operator decision
    NeedsReview,
    /// Passed its completion gate
    Complete,
    /// Gave up (iterations exhausted or plan superseded)
    Failed,
}

impl TaskStatus {
    /// All statuses, in display order
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::NeedsReview,
        TaskStatus::Complete,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::NeedsReview => "needs_review",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Complete and failed tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Statuses that keep a plan open
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Forward-only transition table, with re-entry to pending after a
    /// non-fatal iteration or an operator resume.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        let allowed = match self {
            Pending => matches!(next, InProgress | Blocked | Failed),
            InProgress => matches!(next, Pending | Complete | Failed | Blocked | NeedsReview),
            Blocked => matches!(next, Pending | Complete | Failed),
            NeedsReview => matches!(next, Pending | Complete | Failed),
            Complete | Failed => false,
        };
        debug!(from = %self, to = %next, allowed, "TaskStatus::can_transition_to: called");
        allowed
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "needs_review" => Ok(Self::NeedsReview),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupt(format!("unknown task status '{}'", other))),
        }
    }
}

/// How a task's completion is verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    Binary,
    Constraints,
    Qualitative,
    /// Whatever the evaluation policy resolves to
    #[default]
    Composite,
    None,
}

/// A single deterministic constraint on a task's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// One of min_length, max_length, contains, regex
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Constraint {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Optional evaluation-policy overrides
///
/// Each unset field falls through to the next layer (task < template < global)
/// and finally to auto-detection from the task's checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EvaluationPolicy {
    pub require_binary: Option<bool>,
    pub require_constraints: Option<bool>,
    pub require_qualitative: Option<bool>,
    pub qualitative_min_score: Option<f64>,
    pub overall_min_score: Option<f64>,
}

impl EvaluationPolicy {
    /// Layer `over` on top of `self`; fields set in `over` win
    pub fn merge(&self, over: &EvaluationPolicy) -> EvaluationPolicy {
        EvaluationPolicy {
            require_binary: over.require_binary.or(self.require_binary),
            require_constraints: over.require_constraints.or(self.require_constraints),
            require_qualitative: over.require_qualitative.or(self.require_qualitative),
            qualitative_min_score: over.qualitative_min_score.or(self.qualitative_min_score),
            overall_min_score: over.overall_min_score.or(self.overall_min_score),
        }
    }
}

fn default_min_score() -> f64 {
    0.7
}

fn default_max_iterations() -> u32 {
    5
}

/// A unit of work with explicit dependencies and completion criteria
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within a run
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub status: TaskStatus,

    /// Set on sub-tasks created by decomposing a larger task
    #[serde(default)]
    pub parent_task_id: Option<String>,

    /// Task ids that must be complete before this one is ready
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    #[serde(default)]
    pub verification_type: VerificationType,

    /// Checks of the form `file_exists:<path>`, `artifact_exists:<id>`,
    /// `side_effect:<type>` or `contains:<substring>`
    #[serde(default)]
    pub binary_checks: Vec<String>,

    #[serde(default)]
    pub constraints: Vec<Constraint>,

    #[serde(default)]
    pub evaluation_rubric: Option<String>,

    #[serde(default = "default_min_score")]
    pub minimum_acceptable_score: f64,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Iteration that last moved this task to in_progress
    #[serde(default)]
    pub iteration_started: Option<u32>,

    /// Iteration that completed this task
    #[serde(default)]
    pub iteration_completed: Option<u32>,

    /// Named evaluation-policy template
    #[serde(default)]
    pub template: Option<String>,

    /// Task-level evaluation-policy overrides
    #[serde(default)]
    pub policy: Option<EvaluationPolicy>,

    /// Plan generation this task belongs to
    #[serde(default)]
    pub plan_generation: u32,

    #[serde(default)]
    pub created_at: i64,

    #[serde(default)]
    pub updated_at: i64,
}

impl Task {
    /// Create a pending task with default criteria
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let id = id.into();
        debug!(%id, "Task::new: called");
        let now = now_ms();
        Self {
            id,
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            parent_task_id: None,
            depends_on: BTreeSet::new(),
            verification_type: VerificationType::default(),
            binary_checks: Vec::new(),
            constraints: Vec::new(),
            evaluation_rubric: None,
            minimum_acceptable_score: default_min_score(),
            max_iterations: default_max_iterations(),
            iteration_started: None,
            iteration_completed: None,
            template: None,
            policy: None,
            plan_generation: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: add a dependency
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Builder: add a binary check
    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.binary_checks.push(check.into());
        self
    }

    /// Builder: add a constraint
    pub fn with_constraint(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.push(Constraint::new(kind, value));
        self
    }

    /// Builder: set the qualitative rubric
    pub fn with_rubric(mut self, rubric: impl Into<String>) -> Self {
        self.evaluation_rubric = Some(rubric.into());
        self
    }

    /// Builder: set the per-task iteration cap
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Builder: set the parent task
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent.into());
        self
    }

    /// Builder: set task-level policy overrides
    pub fn with_policy(mut self, policy: EvaluationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Builder: set the policy template name
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses_never_transition() {
        for next in TaskStatus::ALL {
            assert!(!TaskStatus::Complete.can_transition_to(next));
            assert!(!TaskStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_pending_reentry_only_from_non_terminal() {
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::NeedsReview.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Complete));
    }

    #[test]
    fn test_task_deserializes_with_defaults() {
        let yaml = r#"{"id": "a", "title": "A", "depends_on": ["b"]}"#;
        let task: Task = serde_json::from_str(yaml).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_iterations, 5);
        assert!((task.minimum_acceptable_score - 0.7).abs() < f64::EPSILON);
        assert!(task.depends_on.contains("b"));
    }

    #[test]
    fn test_policy_merge_prefers_upper_layer() {
        let global = EvaluationPolicy {
            require_binary: Some(true),
            overall_min_score: Some(0.5),
            ..Default::default()
        };
        let task = EvaluationPolicy {
            require_binary: Some(false),
            qualitative_min_score: Some(0.9),
            ..Default::default()
        };
        let merged = global.merge(&task);
        assert_eq!(merged.require_binary, Some(false));
        assert_eq!(merged.overall_min_score, Some(0.5));
        assert_eq!(merged.qualitative_min_score, Some(0.9));
        assert_eq!(merged.require_qualitative, None);
    }

    #[test]
    fn test_constraint_serializes_type_field() {
        let c = Constraint::new("min_length", "10");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "min_length");
    }
}
