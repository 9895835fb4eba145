//! Task executor boundary
//!
//! The executor does the actual work of a task. The orchestrator only sees
//! its structured result: artifacts it produced, side effects it performed,
//! and errors it hit.

mod command;

pub use command::{CommandExecutor, CommandExecutorConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use taskstore::Task;

/// One structured output of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutput {
    /// A durable output; `content` is stored content-addressed when present
    Artifact {
        file_path: Option<String>,
        #[serde(default)]
        content: Option<Vec<u8>>,
        #[serde(default)]
        metadata: Value,
    },
    /// An irreversible external action, recorded under its idempotency key
    SideEffect {
        effect_type: String,
        idempotency_key: String,
        #[serde(default)]
        details: Value,
    },
    /// A failure reported by the executor; fails the iteration
    Error { message: String },
}

impl ExecutionOutput {
    pub fn artifact(file_path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::Artifact {
            file_path: Some(file_path.into()),
            content: Some(content.into()),
            metadata: Value::Null,
        }
    }

    pub fn side_effect(effect_type: impl Into<String>, idempotency_key: impl Into<String>) -> Self {
        Self::SideEffect {
            effect_type: effect_type.into(),
            idempotency_key: idempotency_key.into(),
            details: Value::Null,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// What one executor invocation produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Raw output; evaluated when no file artifact carries content
    pub output: String,
    pub error: Option<String>,
    pub outputs: Vec<ExecutionOutput>,
    pub learnings: Vec<String>,
    pub tools_invoked: Vec<String>,
    pub tokens_used: u64,
    pub execution_time_seconds: f64,
}

impl ExecutionResult {
    /// A successful result with the given raw output
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    /// A failed result with an error message
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Builder: add a structured output
    pub fn with_output(mut self, output: ExecutionOutput) -> Self {
        self.outputs.push(output);
        self
    }

    /// Builder: add a learning
    pub fn with_learning(mut self, learning: impl Into<String>) -> Self {
        self.learnings.push(learning.into());
        self
    }

    /// First error message, from `error` or an `Error` output
    pub fn first_error(&self) -> Option<&str> {
        self.error.as_deref().or_else(|| {
            self.outputs.iter().find_map(|o| match o {
                ExecutionOutput::Error { message } => Some(message.as_str()),
                _ => None,
            })
        })
    }

    pub fn has_error_output(&self) -> bool {
        self.outputs.iter().any(ExecutionOutput::is_error)
    }
}

/// Performs the work of a task inside a workspace
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute one iteration of `task` with the rendered context
    async fn execute(&self, task: &Task, context: &str, workspace: &Path) -> eyre::Result<ExecutionResult>;

    /// Stop any in-flight execution
    async fn cancel(&self);
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing::debug;

    /// Scripted executor for unit tests
    ///
    /// Returns results in order; the last one repeats once the script runs out.
    pub struct MockExecutor {
        results: Vec<ExecutionResult>,
        delay: Option<Duration>,
        call_count: AtomicUsize,
        cancel_count: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl MockExecutor {
        pub fn new(results: Vec<ExecutionResult>) -> Self {
            debug!(result_count = results.len(), "MockExecutor::new: called");
            Self {
                results,
                delay: None,
                call_count: AtomicUsize::new(0),
                cancel_count: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        /// Builder: sleep before answering
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        pub fn cancel_count(&self) -> usize {
            self.cancel_count.load(Ordering::SeqCst)
        }

        /// Task ids in call order
        pub fn seen(&self) -> Vec<String> {
            self.seen.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl TaskExecutor for MockExecutor {
        async fn execute(&self, task: &Task, _context: &str, _workspace: &Path) -> eyre::Result<ExecutionResult> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            debug!(idx, task_id = %task.id, "MockExecutor::execute: called");
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(task.id.clone());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.results
                .get(idx)
                .or_else(|| self.results.last())
                .cloned()
                .ok_or_else(|| eyre::eyre!("No more mock results"))
        }

        async fn cancel(&self) {
            self.cancel_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_serializes_as_tagged_union() {
        let out = ExecutionOutput::side_effect("email", "mail-1");
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["kind"], "side_effect");
        assert_eq!(value["idempotency_key"], "mail-1");

        let parsed: ExecutionOutput =
            serde_json::from_value(json!({"kind": "error", "message": "boom"})).unwrap();
        assert!(parsed.is_error());
    }

    #[test]
    fn test_first_error_prefers_explicit_error() {
        let result = ExecutionResult::ok("done").with_output(ExecutionOutput::error("disk full"));
        assert_eq!(result.first_error(), Some("disk full"));
        assert!(result.has_error_output());

        let failed = ExecutionResult::failed("crashed");
        assert_eq!(failed.first_error(), Some("crashed"));
    }
}
