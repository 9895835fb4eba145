//! durex - durable task-execution engine
//!
//! A run turns a request into a task graph and iterates each task with an
//! external executor until an evaluator accepts the result. All run state
//! lives in a `taskstore::TaskGraphStore`, checkpointed once per iteration,
//! so a run survives crashes and can be rolled back without repeating side
//! effects. Runs can be queued and driven by a lease-based worker pool.
//!
//! # Modules
//!
//! - [`state`] - StateManager actor over the task graph store
//! - [`executor`] - Task executor boundary and the shell-command executor
//! - [`decomposer`] - Request decomposition boundary and plan files
//! - [`evaluator`] - Binary, constraint and qualitative evaluation
//! - [`orchestrator`] - Run loop with circuit breaker and escalation
//! - [`pool`] - Lease-based, autoscaling worker pool
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod decomposer;
pub mod evaluator;
pub mod executor;
pub mod orchestrator;
pub mod pool;
pub mod state;

// Re-export commonly used types
pub use config::{Config, StorageConfig};
pub use decomposer::{Decomposer, PlanContext, PlanFile, PlanFileDecomposer};
pub use evaluator::{CompositeEvaluator, Evaluation, EvaluationConfig, EvaluationInput, Judge};
pub use executor::{CommandExecutor, CommandExecutorConfig, ExecutionOutput, ExecutionResult, TaskExecutor};
pub use orchestrator::{Orchestrator, OrchestratorConfig, ResumeHandle, RunReport, RunStatus, resume_task, state_dir};
pub use pool::{OrchestratorDriver, PoolConfig, RunDriver, RunOutcome, RunSpec, WorkerPool};
pub use state::{StateCommand, StateError, StateManager, StateResponse, recover, scan_for_recovery};
