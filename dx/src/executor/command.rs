//! Shell-command task executor
//!
//! Runs one configured command per iteration with `sh -c` in the workspace.
//! The command learns which task it is working on from the environment and
//! reports structured results through stdout directives:
//!
//! ```text
//! @artifact <path>             register <workspace>/<path> as an artifact
//! @side-effect <type> <key>    record an external action under <key>
//! @learning <text>             remember <text> for later tasks
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use taskstore::Task;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{ExecutionOutput, ExecutionResult, TaskExecutor};

/// Environment variable carrying the task id
pub const ENV_TASK_ID: &str = "DUREX_TASK_ID";
/// Environment variable carrying the task title
pub const ENV_TASK_TITLE: &str = "DUREX_TASK_TITLE";
/// Environment variable carrying the path of the rendered context file
pub const ENV_CONTEXT_FILE: &str = "DUREX_CONTEXT_FILE";

/// Command executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandExecutorConfig {
    /// Shell command run for every iteration
    #[serde(default = "default_command")]
    pub command: String,

    /// Per-invocation timeout in milliseconds
    #[serde(rename = "timeout-ms", default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_command() -> String {
    "./run-task.sh".to_string()
}

fn default_timeout_ms() -> u64 {
    600_000
}

impl Default for CommandExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl CommandExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Executes tasks by running a shell command
pub struct CommandExecutor {
    config: CommandExecutorConfig,
    cancel: Notify,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        debug!(command = %config.command, "CommandExecutor::new: called");
        Self {
            config,
            cancel: Notify::new(),
        }
    }
}

/// Split stdout into structured outputs, learnings and the remaining text
fn parse_directives(stdout: &str, workspace: &Path) -> (Vec<ExecutionOutput>, Vec<String>, String) {
    let mut outputs = Vec::new();
    let mut learnings = Vec::new();
    let mut rest = String::new();

    for line in stdout.lines() {
        let trimmed = line.trim();
        if let Some(path) = trimmed.strip_prefix("@artifact ") {
            let path = path.trim();
            match std::fs::read(workspace.join(path)) {
                Ok(content) => outputs.push(ExecutionOutput::artifact(path, content)),
                Err(e) => outputs.push(ExecutionOutput::error(format!("artifact {} not readable: {}", path, e))),
            }
        } else if let Some(spec) = trimmed.strip_prefix("@side-effect ") {
            let mut parts = spec.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(effect_type), Some(key)) => {
                    let note: Vec<&str> = parts.collect();
                    outputs.push(ExecutionOutput::SideEffect {
                        effect_type: effect_type.to_string(),
                        idempotency_key: key.to_string(),
                        details: if note.is_empty() {
                            serde_json::Value::Null
                        } else {
                            json!({ "note": note.join(" ") })
                        },
                    });
                }
                _ => outputs.push(ExecutionOutput::error(format!("malformed side-effect directive: {}", trimmed))),
            }
        } else if let Some(text) = trimmed.strip_prefix("@learning ") {
            learnings.push(text.trim().to_string());
        } else {
            rest.push_str(line);
            rest.push('\n');
        }
    }
    (outputs, learnings, rest)
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task: &Task, context: &str, workspace: &Path) -> eyre::Result<ExecutionResult> {
        debug!(task_id = %task.id, ?workspace, "CommandExecutor::execute: called");
        let start = Instant::now();

        let context_dir = workspace.join(".durex");
        tokio::fs::create_dir_all(&context_dir).await?;
        let context_file = context_dir.join(format!("context-{}.md", task.id));
        tokio::fs::write(&context_file, context).await?;

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.config.command)
            .current_dir(workspace)
            .env(ENV_TASK_ID, &task.id)
            .env(ENV_TASK_TITLE, &task.title)
            .env(ENV_CONTEXT_FILE, &context_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let timeout = self.config.timeout();
        let output = tokio::select! {
            res = tokio::time::timeout(timeout, child.wait_with_output()) => match res {
                Ok(output) => output?,
                Err(_) => {
                    warn!(task_id = %task.id, timeout_ms = self.config.timeout_ms, "Command timed out");
                    return Ok(ExecutionResult::failed(format!(
                        "command timed out after {}ms",
                        self.config.timeout_ms
                    )));
                }
            },
            _ = self.cancel.notified() => {
                info!(task_id = %task.id, "Command cancelled");
                return Ok(ExecutionResult::failed("command cancelled"));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let (mut outputs, learnings, rest) = parse_directives(&stdout, workspace);
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(task_id = %task.id, exit_code, outputs = outputs.len(), "CommandExecutor::execute: command completed");

        let error = if output.status.success() {
            None
        } else {
            let message = format!("command exited with status {}: {}", exit_code, stderr.trim());
            outputs.push(ExecutionOutput::error(message.clone()));
            Some(message)
        };

        Ok(ExecutionResult {
            success: error.is_none(),
            output: rest,
            error,
            outputs,
            learnings,
            tools_invoked: vec!["sh".to_string()],
            tokens_used: 0,
            execution_time_seconds: start.elapsed().as_secs_f64(),
        })
    }

    async fn cancel(&self) {
        debug!("CommandExecutor::cancel: called");
        self.cancel.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn executor(command: &str, timeout_ms: u64) -> CommandExecutor {
        CommandExecutor::new(CommandExecutorConfig {
            command: command.to_string(),
            timeout_ms,
        })
    }

    #[tokio::test]
    async fn test_directives_become_structured_outputs() {
        let temp = tempdir().unwrap();
        let exec = executor(
            "echo hello > out.md; echo '@artifact out.md'; echo '@side-effect email mail-1 welcome'; echo '@learning use out.md'; echo plain",
            30_000,
        );
        let task = Task::new("a", "A");
        let result = exec.execute(&task, "ctx", temp.path()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.learnings, vec!["use out.md".to_string()]);
        assert_eq!(result.output.trim(), "plain");
        assert!(matches!(
            &result.outputs[0],
            ExecutionOutput::Artifact { file_path: Some(p), content: Some(c), .. } if p == "out.md" && c == b"hello\n"
        ));
        assert!(matches!(
            &result.outputs[1],
            ExecutionOutput::SideEffect { effect_type, idempotency_key, .. } if effect_type == "email" && idempotency_key == "mail-1"
        ));
    }

    #[tokio::test]
    async fn test_environment_and_context_file() {
        let temp = tempdir().unwrap();
        let exec = executor("echo \"$DUREX_TASK_ID:$DUREX_TASK_TITLE\"; cat \"$DUREX_CONTEXT_FILE\"", 30_000);
        let task = Task::new("t-1", "Title");
        let result = exec.execute(&task, "CONTEXT BODY", temp.path()).await.unwrap();
        assert!(result.output.contains("t-1:Title"));
        assert!(result.output.contains("CONTEXT BODY"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_output() {
        let temp = tempdir().unwrap();
        let exec = executor("echo oops >&2; exit 3", 30_000);
        let result = exec.execute(&Task::new("a", "A"), "", temp.path()).await.unwrap();
        assert!(!result.success);
        assert!(result.has_error_output());
        assert!(result.first_error().unwrap().contains("status 3"));
    }

    #[tokio::test]
    async fn test_missing_artifact_file_is_error_output() {
        let temp = tempdir().unwrap();
        let exec = executor("echo '@artifact nope.md'", 30_000);
        let result = exec.execute(&Task::new("a", "A"), "", temp.path()).await.unwrap();
        assert!(result.has_error_output());
    }

    #[tokio::test]
    async fn test_timeout_fails_result() {
        let temp = tempdir().unwrap();
        let exec = executor("sleep 10", 100);
        let result = exec.execute(&Task::new("a", "A"), "", temp.path()).await.unwrap();
        assert!(!result.success);
        assert!(result.first_error().unwrap().contains("timed out"));
    }
}
