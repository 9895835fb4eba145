//! Run orchestration
//!
//! One `Orchestrator` drives one run: a task graph in its own workspace,
//! iterated task by task under circuit breaker and escalation rules.

mod config;
mod engine;

use std::path::{Path, PathBuf};

pub use config::OrchestratorConfig;
pub use engine::{Orchestrator, ResumeHandle, RunReport, RunStatus, classify_outcome, resume_task};

/// Run state lives here, relative to the workspace
pub const STATE_DIR: &str = ".durex/state";

/// State directory of the run in `workspace`
pub fn state_dir(workspace: &Path) -> PathBuf {
    workspace.join(STATE_DIR)
}
