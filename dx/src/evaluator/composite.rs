//! Composite evaluation
//!
//! Runs every active strategy: the required ones plus binary checks and
//! constraints the task configures. Only required strategies gate the
//! verdict; the optional overall minimum applies to the mean of all active
//! scores.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::policy::{EvaluationConfig, ResolvedPolicy, resolve_policy};
use super::qualitative::{Judge, QualitativeEvaluator};
use super::{EvaluationInput, MissingElement, StrategyResult, evaluate_binary, evaluate_constraints};

/// Verdict for one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub passed: bool,
    /// Mean of the active strategy scores
    pub score: f64,
    pub strategies: Vec<StrategyResult>,
    pub diagnostics: Vec<String>,
}

impl Evaluation {
    /// Unsatisfied checks across all strategies
    pub fn missing(&self) -> impl Iterator<Item = &MissingElement> {
        self.strategies.iter().flat_map(|s| s.missing.iter())
    }

    /// One-line summary of why the evaluation did not pass
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .strategies
            .iter()
            .filter(|s| !s.passed)
            .map(|s| format!("{} failed ({:.2}): {}", s.strategy, s.score, s.diagnostics.join(", ")))
            .collect();
        parts.extend(self.missing().map(|m| format!("missing {}", m.check)));
        parts.extend(self.diagnostics.iter().cloned());
        if parts.is_empty() {
            format!("score {:.2}", self.score)
        } else {
            parts.join("; ")
        }
    }
}

/// Combines binary, constraint and qualitative strategies under a policy
#[derive(Clone)]
pub struct CompositeEvaluator {
    config: EvaluationConfig,
    qualitative: QualitativeEvaluator,
}

impl CompositeEvaluator {
    pub fn new(config: EvaluationConfig, judge: Option<Arc<dyn Judge>>) -> Self {
        debug!(has_judge = judge.is_some(), "CompositeEvaluator::new: called");
        let qualitative = QualitativeEvaluator::new(judge, config.judge_max_output_chars);
        Self { config, qualitative }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    pub fn resolve(&self, input: &EvaluationInput) -> ResolvedPolicy {
        resolve_policy(&input.task, &self.config)
    }

    pub async fn evaluate(&self, input: &EvaluationInput) -> Evaluation {
        debug!(task_id = %input.task.id, "CompositeEvaluator::evaluate: called");
        let policy = self.resolve(input);
        let mut strategies = Vec::new();
        let mut diagnostics = Vec::new();

        if policy.binary_active {
            strategies.push(evaluate_binary(input));
        }
        if policy.constraints_active {
            strategies.push(evaluate_constraints(input));
        }
        if policy.require_qualitative {
            if self.qualitative.has_judge() || policy.qualitative_explicit {
                strategies.push(self.qualitative.evaluate(input, policy.qualitative_min_score).await);
            } else {
                warn!(task_id = %input.task.id, "No judge configured, skipping qualitative evaluation");
                diagnostics.push("qualitative evaluation skipped: no judge configured".to_string());
            }
        }

        if strategies.is_empty() {
            let score = if input.executor_success { 1.0 } else { 0.0 };
            diagnostics.push("no active strategies; verdict follows executor".to_string());
            debug!(task_id = %input.task.id, passed = input.executor_success, "CompositeEvaluator::evaluate: no strategies");
            return Evaluation {
                passed: input.executor_success,
                score,
                strategies,
                diagnostics,
            };
        }

        let score = strategies.iter().map(|s| s.score).sum::<f64>() / strategies.len() as f64;
        let mut passed = strategies
            .iter()
            .filter(|s| policy.is_required(s.strategy))
            .all(|s| s.passed);
        for advisory in strategies.iter().filter(|s| !s.passed && !policy.is_required(s.strategy)) {
            diagnostics.push(format!("{} not required, counted in score only", advisory.strategy));
        }
        if let Some(min) = policy.overall_min_score
            && score < min
        {
            passed = false;
            diagnostics.push(format!("overall score {:.2} below minimum {:.2}", score, min));
        }

        info!(task_id = %input.task.id, passed, score, strategies = strategies.len(), "Evaluated task");
        Evaluation {
            passed,
            score,
            strategies,
            diagnostics,
        }
    }
}
