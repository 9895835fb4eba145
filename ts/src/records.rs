//! Records produced by task iterations
//!
//! Artifacts, side effects, iteration history, failed approaches, learnings
//! and plan metadata. Everything here is append-only once written.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::StoreError;

/// Kind of durable output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    #[default]
    File,
    Metadata,
    SideEffect,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Metadata => "metadata",
            Self::SideEffect => "side_effect",
        }
    }
}

impl FromStr for ArtifactType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "metadata" => Ok(Self::Metadata),
            "side_effect" => Ok(Self::SideEffect),
            other => Err(StoreError::Corrupt(format!("unknown artifact type '{}'", other))),
        }
    }
}

/// Artifact as submitted for registration (id and hash are assigned by the store)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewArtifact {
    pub task_id: String,
    pub artifact_type: ArtifactType,
    /// Logical path relative to the workspace
    pub file_path: Option<String>,
    pub metadata: Value,
    pub iteration: u32,
}

impl NewArtifact {
    /// A file artifact at the given logical path
    pub fn file(task_id: impl Into<String>, file_path: impl Into<String>, iteration: u32) -> Self {
        Self {
            task_id: task_id.into(),
            artifact_type: ArtifactType::File,
            file_path: Some(file_path.into()),
            metadata: Value::Null,
            iteration,
        }
    }

    /// A metadata-only artifact
    pub fn metadata(task_id: impl Into<String>, metadata: Value, iteration: u32) -> Self {
        Self {
            task_id: task_id.into(),
            artifact_type: ArtifactType::Metadata,
            file_path: None,
            metadata,
            iteration,
        }
    }
}

/// A durable output owned by the task that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub task_id: String,
    pub artifact_type: ArtifactType,
    pub file_path: Option<String>,
    /// Content-addressed location relative to the store directory
    pub blob_path: Option<String>,
    /// First 16 hex chars of the SHA-256 digest of the content
    pub content_hash: Option<String>,
    pub metadata: Value,
    pub iteration: u32,
    pub created_at: i64,
}

/// An idempotency-keyed record of an irreversible external action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    pub task_id: String,
    pub effect_type: String,
    pub idempotency_key: String,
    pub details: Value,
    pub iteration: u32,
    pub created_at: i64,
}

/// Classified result of one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Success,
    Partial,
    Failed,
    Incomplete,
}

impl IterationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for IterationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IterationOutcome {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "incomplete" => Ok(Self::Incomplete),
            other => Err(StoreError::Corrupt(format!("unknown iteration outcome '{}'", other))),
        }
    }
}

/// One entry of the run's iteration history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Monotonic per run, starting at 1
    pub iteration: u32,
    pub task_id: String,
    /// None while the iteration is still in progress
    pub outcome: Option<IterationOutcome>,
    pub completion_confidence: f64,
    pub tokens_used: u64,
    pub tools_used: Vec<String>,
    pub learnings: Vec<String>,
    pub artifacts_produced: Vec<String>,
    /// Checkpoint taken when this iteration completed
    pub checkpoint: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

impl IterationRecord {
    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Data written when an iteration completes
#[derive(Debug, Clone, PartialEq)]
pub struct IterationCompletion {
    pub iteration: u32,
    pub outcome: IterationOutcome,
    pub completion_confidence: f64,
    pub tokens_used: u64,
    pub tools_used: Vec<String>,
    pub learnings: Vec<String>,
    pub artifacts_produced: Vec<String>,
}

impl IterationCompletion {
    pub fn new(iteration: u32, outcome: IterationOutcome) -> Self {
        Self {
            iteration,
            outcome,
            completion_confidence: 0.0,
            tokens_used: 0,
            tools_used: Vec::new(),
            learnings: Vec::new(),
            artifacts_produced: Vec::new(),
        }
    }
}

/// Entry of the "do not repeat" ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedApproach {
    pub task_id: Option<String>,
    pub approach: String,
    pub why_failed: String,
    pub iteration: u32,
    pub created_at: i64,
}

/// Cross-task learning reported by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learning {
    pub task_id: Option<String>,
    pub iteration: u32,
    pub text: String,
    pub created_at: i64,
}

/// Plan lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Superseded,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }
}

impl FromStr for PlanStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "superseded" => Ok(Self::Superseded),
            other => Err(StoreError::Corrupt(format!("unknown plan status '{}'", other))),
        }
    }
}

/// Metadata for one plan generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMeta {
    pub generation: u32,
    pub request: String,
    pub status: PlanStatus,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub superseded_at: Option<i64>,
}

/// Task counts per status across the plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub needs_review: usize,
    pub complete: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.blocked + self.needs_review + self.complete + self.failed
    }

    pub fn open(&self) -> usize {
        self.pending + self.in_progress + self.blocked + self.needs_review
    }

    pub(crate) fn bump(&mut self, status: crate::TaskStatus, n: usize) {
        use crate::TaskStatus::*;
        match status {
            Pending => self.pending += n,
            InProgress => self.in_progress += n,
            Blocked => self.blocked += n,
            NeedsReview => self.needs_review += n,
            Complete => self.complete += n,
            Failed => self.failed += n,
        }
    }
}

impl std::fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pending: {}, in_progress: {}, blocked: {}, needs_review: {}, complete: {}, failed: {}",
            self.pending, self.in_progress, self.blocked, self.needs_review, self.complete, self.failed
        )
    }
}
