//! State manager messages
//!
//! Commands and responses for the actor pattern.

use serde_json::Value;
use taskstore::{
    Artifact, Checkpoint, ContextLimits, FailedApproach, IterationCommit, IterationRecord, Learning, NewArtifact,
    PlanMeta, RecoveryStats, SideEffect, StatusCounts, StoreError, Task, TaskContext, TaskStatus,
};
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error")]
    ChannelError,
}

impl StateError {
    /// The underlying store error, if this is one
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            Self::ChannelError => None,
        }
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

type Reply<T> = oneshot::Sender<StateResponse<T>>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Plan operations
    BeginPlan {
        request: String,
        reply: Reply<u32>,
    },
    CurrentPlan {
        reply: Reply<Option<PlanMeta>>,
    },
    MarkActivePlanFailed {
        reason: String,
        reply: Reply<usize>,
    },

    // Task operations
    CreateTasks {
        tasks: Vec<Task>,
        reply: Reply<Vec<String>>,
    },
    AddDependency {
        task_id: String,
        depends_on: String,
        reply: Reply<()>,
    },
    GetTask {
        id: String,
        reply: Reply<Option<Task>>,
    },
    ListTasks {
        status_filter: Option<TaskStatus>,
        reply: Reply<Vec<Task>>,
    },
    ListSubtasks {
        parent_id: String,
        reply: Reply<Vec<Task>>,
    },
    GetNextTask {
        reply: Reply<Option<Task>>,
    },
    UpdateTaskStatus {
        id: String,
        status: TaskStatus,
        iteration: Option<u32>,
        reply: Reply<Task>,
    },
    ResumeTask {
        id: String,
        extra_iterations: u32,
        reply: Reply<Task>,
    },
    StatusCounts {
        reply: Reply<StatusCounts>,
    },
    IsPlanComplete {
        reply: Reply<bool>,
    },

    // Artifacts and side effects
    RegisterArtifact {
        artifact: NewArtifact,
        content: Option<Vec<u8>>,
        reply: Reply<Artifact>,
    },
    ListArtifacts {
        task_id: Option<String>,
        reply: Reply<Vec<Artifact>>,
    },
    ReadArtifactContent {
        artifact: Box<Artifact>,
        reply: Reply<Option<Vec<u8>>>,
    },
    RecordSideEffect {
        task_id: String,
        effect_type: String,
        idempotency_key: String,
        details: Value,
        iteration: u32,
        reply: Reply<bool>,
    },
    ListSideEffects {
        task_id: Option<String>,
        reply: Reply<Vec<SideEffect>>,
    },

    // Iterations and history
    StartIteration {
        task_id: String,
        reply: Reply<u32>,
    },
    IterationCount {
        task_id: String,
        reply: Reply<u32>,
    },
    TotalIterations {
        reply: Reply<u32>,
    },
    ListIterations {
        task_id: Option<String>,
        reply: Reply<Vec<IterationRecord>>,
    },
    ListFailedApproaches {
        task_id: Option<String>,
        limit: usize,
        reply: Reply<Vec<FailedApproach>>,
    },
    RecentLearnings {
        limit: usize,
        reply: Reply<Vec<Learning>>,
    },
    GenerateContext {
        task: Box<Task>,
        limits: ContextLimits,
        reply: Reply<TaskContext>,
    },

    // Checkpoints
    CommitIteration {
        commit: Box<IterationCommit>,
        reply: Reply<Checkpoint>,
    },
    Checkpoint {
        message: String,
        iteration: u32,
        metadata: Value,
        reply: Reply<Checkpoint>,
    },
    RollbackTo {
        reference: String,
        reply: Reply<Checkpoint>,
    },
    ListCheckpoints {
        reply: Reply<Vec<Checkpoint>>,
    },

    // Recovery
    RecoverInterrupted {
        reply: Reply<RecoveryStats>,
    },

    // Shutdown
    Shutdown,
}
