//! Lease-based worker pool
//!
//! Workers share one run queue (`taskstore::LeaseStore`) and hold at most one
//! run each. The pool grows and shrinks by one worker per monitor tick.

mod config;
mod driver;
mod manager;
mod worker;

pub use config::PoolConfig;
pub use driver::{OrchestratorDriver, RunDriver, RunOutcome, RunSpec};
pub use manager::{ScaleDecision, WorkerPool};
pub use worker::{StopMode, Worker};

#[cfg(test)]
pub use driver::mock;
