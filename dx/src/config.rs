//! durex configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use taskstore::ContextLimits;

use crate::evaluator::EvaluationConfig;
use crate::executor::CommandExecutorConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::pool::PoolConfig;

/// Main durex configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run-loop limits and escalation
    pub orchestrator: OrchestratorConfig,

    /// Size limits for the executor context
    pub context: ContextLimits,

    /// Evaluation policy layers
    pub evaluation: EvaluationConfig,

    /// Worker pool sizing and lease timing
    pub pool: PoolConfig,

    /// Where shared state lives
    pub storage: StorageConfig,

    /// Shell command executor
    pub executor: CommandExecutorConfig,

    /// Log level used when the CLI does not set one
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./.durex.yml`, then `~/.config/durex/durex.yml`,
    /// then defaults. Only an explicit path that fails to load is an error.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".durex.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("durex").join("durex.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.pool.validate().context("Invalid pool configuration")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Shared run queue database
    #[serde(rename = "runs-db")]
    pub runs_db: PathBuf,

    /// Pool runs get a workspace `<workspace-root>/<run-id>`
    #[serde(rename = "workspace-root")]
    pub workspace_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/durex on Linux)
        let base = dirs::data_dir()
            .map(|d| d.join("durex"))
            .unwrap_or_else(|| PathBuf::from(".durex"));
        Self {
            runs_db: base.join("runs.db"),
            workspace_root: base.join("runs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.orchestrator.failure_threshold, 3);
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.context.max_learnings, 10);
        assert!(config.storage.runs_db.ends_with("runs.db"));
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: debug

orchestrator:
  failure-threshold: 4
  pause-on-blockers: true

context:
  max-learnings: 3

evaluation:
  judge-max-output-chars: 2000
  global:
    require-qualitative: false
  templates:
    strict:
      overall-min-score: 0.9

pool:
  min-workers: 2
  max-workers: 6

storage:
  runs-db: /tmp/durex/runs.db
  workspace-root: /tmp/durex/runs

executor:
  command: make task
  timeout-ms: 1000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.orchestrator.failure_threshold, 4);
        assert!(config.orchestrator.pause_on_blockers);
        assert_eq!(config.context.max_learnings, 3);
        assert_eq!(config.evaluation.judge_max_output_chars, 2000);
        assert_eq!(config.evaluation.global.require_qualitative, Some(false));
        assert_eq!(config.evaluation.templates["strict"].overall_min_score, Some(0.9));
        assert_eq!(config.pool.max_workers, 6);
        assert_eq!(config.storage.workspace_root, PathBuf::from("/tmp/durex/runs"));
        assert_eq!(config.executor.command, "make task");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("pool:\n  max-workers: 8\n").unwrap();
        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.orchestrator.max_replans, 2);
        assert_eq!(config.executor.timeout_ms, 600_000);
    }

    #[test]
    fn test_explicit_path_errors_are_reported() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("durex.yml");
        assert!(Config::load(Some(&path)).is_err());

        fs::write(&path, "pool:\n  min-workers: 5\n  max-workers: 2\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());

        fs::write(&path, "orchestrator:\n  max-replans: 7\n").unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().orchestrator.max_replans, 7);
    }
}
