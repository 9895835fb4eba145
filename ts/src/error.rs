//! Store errors

use thiserror::Error;

/// Errors from the task graph store and lease table
///
/// Every persistence failure is fatal to the operation that raised it and is
/// never partially applied.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for task {task}: {from} -> {to}")]
    InvalidTransition { task: String, from: String, to: String },

    #[error("Iteration {0} is already complete")]
    IterationAlreadyComplete(u32),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Run already exists: {0}")]
    DuplicateRun(String),

    #[error("Run status {0} is not terminal")]
    NotTerminal(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Corrupt store data: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
