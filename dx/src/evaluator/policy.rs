//! Evaluation policy resolution
//!
//! Layers, lowest first: global, named template, the task's verification
//! type, the task's own overrides. Whatever is still unset afterwards is
//! auto-detected from the checks the task carries. `require_*` decides which
//! strategies gate the verdict; binary checks and constraints the task
//! configures always run and count toward the mean score.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use taskstore::{EvaluationPolicy, Task, VerificationType};
use tracing::{debug, warn};

use super::StrategyKind;

/// Evaluator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Lowest-precedence policy layer
    #[serde(default)]
    pub global: EvaluationPolicy,

    /// Named policy layers selected by `Task::template`
    #[serde(default)]
    pub templates: HashMap<String, EvaluationPolicy>,

    /// Output characters shown to the qualitative judge
    #[serde(rename = "judge-max-output-chars", default = "default_judge_max_output_chars")]
    pub judge_max_output_chars: usize,
}

fn default_judge_max_output_chars() -> usize {
    8000
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            global: EvaluationPolicy::default(),
            templates: HashMap::new(),
            judge_max_output_chars: default_judge_max_output_chars(),
        }
    }
}

/// Fully decided policy for one task
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPolicy {
    pub require_binary: bool,
    pub require_constraints: bool,
    pub require_qualitative: bool,
    /// Binary checks run: required, or the task configures some
    pub binary_active: bool,
    /// Constraints run: required, or the task configures some
    pub constraints_active: bool,
    /// Qualitative was asked for by some layer rather than inferred from a rubric
    pub qualitative_explicit: bool,
    pub qualitative_min_score: f64,
    pub overall_min_score: Option<f64>,
}

impl ResolvedPolicy {
    /// True when no strategy gates the verdict
    pub fn is_empty(&self) -> bool {
        !self.require_binary && !self.require_constraints && !self.require_qualitative
    }

    pub fn is_required(&self, kind: StrategyKind) -> bool {
        match kind {
            StrategyKind::Binary => self.require_binary,
            StrategyKind::Constraints => self.require_constraints,
            StrategyKind::Qualitative => self.require_qualitative,
        }
    }
}

/// Policy implied by a task's verification type
fn preset(verification: VerificationType) -> EvaluationPolicy {
    let only = |binary: bool, constraints: bool, qualitative: bool| EvaluationPolicy {
        require_binary: Some(binary),
        require_constraints: Some(constraints),
        require_qualitative: Some(qualitative),
        ..Default::default()
    };
    match verification {
        VerificationType::Composite => EvaluationPolicy::default(),
        VerificationType::Binary => only(true, false, false),
        VerificationType::Constraints => only(false, true, false),
        VerificationType::Qualitative => only(false, false, true),
        VerificationType::None => only(false, false, false),
    }
}

/// Resolve the effective policy for `task`
pub fn resolve_policy(task: &Task, config: &EvaluationConfig) -> ResolvedPolicy {
    debug!(task_id = %task.id, template = ?task.template, "resolve_policy: called");
    let mut merged = config.global.clone();

    if let Some(name) = &task.template {
        match config.templates.get(name) {
            Some(template) => merged = merged.merge(template),
            None => warn!(task_id = %task.id, template = %name, "Unknown evaluation template, ignoring"),
        }
    }

    merged = merged.merge(&preset(task.verification_type));
    if let Some(policy) = &task.policy {
        merged = merged.merge(policy);
    }

    let has_rubric = task.evaluation_rubric.as_deref().is_some_and(|r| !r.trim().is_empty());
    let require_binary = merged.require_binary.unwrap_or(!task.binary_checks.is_empty());
    let require_constraints = merged.require_constraints.unwrap_or(!task.constraints.is_empty());
    let resolved = ResolvedPolicy {
        require_binary,
        require_constraints,
        binary_active: require_binary || !task.binary_checks.is_empty(),
        constraints_active: require_constraints || !task.constraints.is_empty(),
        require_qualitative: merged.require_qualitative.unwrap_or(has_rubric),
        qualitative_explicit: merged.require_qualitative == Some(true),
        qualitative_min_score: merged.qualitative_min_score.unwrap_or(task.minimum_acceptable_score),
        overall_min_score: merged.overall_min_score,
    };
    debug!(task_id = %task.id, ?resolved, "resolve_policy: resolved");
    resolved
}
