//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// durex - durable task-execution engine
#[derive(Parser)]
#[command(
    name = "dx",
    about = "Durable task-execution engine with checkpoints, evaluation and a worker pool",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/durex/logs/durex.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(short, long, global = true, help = "Log level: error, warn, info, debug, trace")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run a plan in a workspace until it completes, fails or needs an operator
    Run {
        /// YAML plan file
        #[arg(short, long)]
        plan: PathBuf,

        /// Workspace directory; run state lives under <workspace>/.durex
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Request text handed to the decomposer
        #[arg(short, long, default_value = "")]
        request: String,

        /// Executor command (overrides the config file)
        #[arg(long)]
        command: Option<String>,
    },

    /// Show task graph status for a workspace
    Status {
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List the checkpoint log of a workspace
    Checkpoints {
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
    },

    /// Restore a workspace's state to a checkpoint (side effects are kept)
    Rollback {
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Checkpoint reference or unique prefix
        reference: String,
    },

    /// Send a blocked or needs_review task back to pending
    Resume {
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Task to resume
        task_id: String,

        /// Extra iterations granted (defaults to the task's max_iterations)
        #[arg(short, long)]
        iterations: Option<u32>,
    },

    /// Add a run to the shared queue
    Enqueue {
        /// YAML plan file
        #[arg(short, long)]
        plan: PathBuf,

        /// Run id (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Request text handed to the decomposer
        #[arg(short, long, default_value = "")]
        request: String,
    },

    /// List runs in the shared queue
    Runs {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run the worker pool until Ctrl-C, draining on shutdown
    Pool,
}

/// Output format for status and listing commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Location of the log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("durex")
        .join("logs")
        .join("durex.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["dx", "run", "--plan", "plan.yml", "-w", "/tmp/ws", "-r", "build it"]);
        if let Command::Run {
            plan,
            workspace,
            request,
            command,
        } = cli.command
        {
            assert_eq!(plan, PathBuf::from("plan.yml"));
            assert_eq!(workspace, PathBuf::from("/tmp/ws"));
            assert_eq!(request, "build it");
            assert!(command.is_none());
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_resume() {
        let cli = Cli::parse_from(["dx", "resume", "task-1", "--iterations", "3"]);
        assert!(matches!(
            cli.command,
            Command::Resume { ref task_id, iterations: Some(3), .. } if task_id == "task-1"
        ));
    }

    #[test]
    fn test_cli_parse_status_json() {
        let cli = Cli::parse_from(["dx", "status", "--format", "json"]);
        assert!(matches!(cli.command, Command::Status { format: OutputFormat::Json, .. }));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::parse_from(["dx", "runs", "-c", "/path/to/config.yml", "--log-level", "debug"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::Runs { .. }));
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_log_path() {
        assert!(get_log_path().ends_with("durex/logs/durex.log"));
    }
}
