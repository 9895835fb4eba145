//! taskstore - durable state for task runs
//!
//! SQLite-backed task graph with an idempotent side-effect ledger,
//! content-addressed blobs, an append-only checkpoint log with rollback, and
//! the shared lease table used to distribute runs across workers.

pub mod blob;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod graph;
pub mod lease;
pub mod records;
pub mod store;
pub mod task;

pub use blob::{BlobStore, content_hash, sha256_hex};
pub use checkpoint::{Checkpoint, CheckpointLog, IterationCommit};
pub use context::{ContextLimits, TaskContext};
pub use error::{StoreError, StoreResult};
pub use graph::{find_cycle, validate_dependency_graph};
pub use lease::{Lease, LeaseStore, RunRecord, RunStatus};
pub use records::{
    Artifact, ArtifactType, FailedApproach, IterationCompletion, IterationOutcome, IterationRecord, Learning,
    NewArtifact, PlanMeta, PlanStatus, SideEffect, StatusCounts,
};
pub use store::{RecoveryStats, TaskGraphStore};
pub use task::{Constraint, EvaluationPolicy, Task, TaskStatus, VerificationType};

/// Current time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
