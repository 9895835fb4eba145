//! Completion evaluation
//!
//! Strategies check a task's output in different ways: binary checks on
//! artifacts and side effects, deterministic constraints on content, and a
//! qualitative judge against a rubric. The composite evaluator combines them
//! under a policy resolved per task.

mod binary;
mod composite;
mod constraints;
mod policy;
mod qualitative;

pub use binary::evaluate_binary;
pub use composite::{CompositeEvaluator, Evaluation};
pub use constraints::evaluate_constraints;
pub use policy::{EvaluationConfig, ResolvedPolicy, resolve_policy};
pub use qualitative::{Judge, JudgeVerdict, QualitativeEvaluator, build_judge_prompt, parse_judge_reply};

#[cfg(test)]
pub use qualitative::mock;

use serde::{Deserialize, Serialize};
use taskstore::{Artifact, ArtifactType, SideEffect, Task};

/// Which strategy produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Binary,
    Constraints,
    Qualitative,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Constraints => write!(f, "constraints"),
            Self::Qualitative => write!(f, "qualitative"),
        }
    }
}

/// An unsatisfied check and how to fix it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingElement {
    pub check: String,
    pub remediation: String,
}

impl MissingElement {
    pub fn new(check: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            remediation: remediation.into(),
        }
    }
}

/// Outcome of one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
    pub strategy: StrategyKind,
    pub passed: bool,
    /// Always within [0, 1]
    pub score: f64,
    pub diagnostics: Vec<String>,
    pub missing: Vec<MissingElement>,
}

impl StrategyResult {
    pub fn new(strategy: StrategyKind, passed: bool, score: f64) -> Self {
        Self {
            strategy,
            passed,
            score: clamp_score(score),
            diagnostics: Vec::new(),
            missing: Vec::new(),
        }
    }
}

/// Clamp a score into [0, 1], mapping NaN to 0
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) }
}

/// Everything the strategies look at for one iteration
#[derive(Debug, Clone)]
pub struct EvaluationInput {
    pub task: Task,
    /// Artifacts registered across the run
    pub artifacts: Vec<Artifact>,
    /// Side effects recorded for this task
    pub side_effects: Vec<SideEffect>,
    /// Content of the task's primary file artifact, if it has one
    pub primary_content: Option<String>,
    /// Raw executor output
    pub output: String,
    pub executor_success: bool,
}

impl EvaluationInput {
    /// Input for `task` with only raw executor output
    pub fn new(task: Task, output: impl Into<String>, executor_success: bool) -> Self {
        Self {
            task,
            artifacts: Vec::new(),
            side_effects: Vec::new(),
            primary_content: None,
            output: output.into(),
            executor_success,
        }
    }

    /// Text to evaluate: the primary artifact content, else the raw output
    pub fn content(&self) -> &str {
        self.primary_content.as_deref().unwrap_or(&self.output)
    }

    /// File artifacts belonging to this task, most recent last
    pub fn task_files(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .iter()
            .filter(|a| a.task_id == self.task.id && a.artifact_type == ArtifactType::File)
    }
}
