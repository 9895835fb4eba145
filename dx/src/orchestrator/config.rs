//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Run-loop limits and escalation behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Consecutive failed/incomplete iterations that trip the circuit breaker
    #[serde(rename = "failure-threshold")]
    pub failure_threshold: u32,

    /// Re-plan instead of failing when the circuit breaker trips
    #[serde(rename = "enable-replanning")]
    pub enable_replanning: bool,

    /// Re-plans allowed per run
    #[serde(rename = "max-replans")]
    pub max_replans: u32,

    /// Hard ceiling on iterations across the whole run
    #[serde(rename = "max-total-iterations")]
    pub max_total_iterations: u32,

    /// Break an exhausted task into sub-tasks
    #[serde(rename = "auto-decompose")]
    pub auto_decompose: bool,

    /// Park an exhausted task for review instead of failing it
    #[serde(rename = "escalate-to-review")]
    pub escalate_to_review: bool,

    /// Wait for a resume signal instead of ending the run when blocked
    #[serde(rename = "pause-on-blockers")]
    pub pause_on_blockers: bool,

    /// Timeout for one executor call in milliseconds
    #[serde(rename = "iteration-timeout-ms")]
    pub iteration_timeout_ms: u64,

    /// Liveness log interval while an executor call runs
    #[serde(rename = "heartbeat-interval-ms")]
    pub heartbeat_interval_ms: u64,

    /// How often a paused run re-reads the task graph for out-of-process resumes
    #[serde(rename = "resume-poll-interval-ms")]
    pub resume_poll_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            enable_replanning: true,
            max_replans: 2,
            max_total_iterations: 100,
            auto_decompose: false,
            escalate_to_review: false,
            pause_on_blockers: false,
            iteration_timeout_ms: 600_000,
            heartbeat_interval_ms: 30_000,
            resume_poll_interval_ms: 5_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_millis(self.iteration_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn resume_poll_interval(&self) -> Duration {
        Duration::from_millis(self.resume_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.max_replans, 2);
        assert!(config.enable_replanning);
        assert!(!config.pause_on_blockers);
        assert_eq!(config.iteration_timeout(), Duration::from_secs(600));
        assert_eq!(config.resume_poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_partial_kebab() {
        let yaml = r#"
failure-threshold: 5
auto-decompose: true
heartbeat-interval-ms: 0
"#;
        let config: OrchestratorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.failure_threshold, 5);
        assert!(config.auto_decompose);
        assert_eq!(config.max_total_iterations, 100);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(1));
    }
}
