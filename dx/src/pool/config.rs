//! Worker pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pool size bounds, scaling policy and lease timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(rename = "min-workers")]
    pub min_workers: usize,

    #[serde(rename = "max-workers")]
    pub max_workers: usize,

    /// Scale up while the queue is deeper than this
    #[serde(rename = "scale-up-threshold")]
    pub scale_up_threshold: usize,

    #[serde(rename = "monitor-interval-ms")]
    pub monitor_interval_ms: u64,

    /// Idle time before a worker may be retired
    #[serde(rename = "idle-cooldown-ms")]
    pub idle_cooldown_ms: u64,

    #[serde(rename = "lease-ttl-ms")]
    pub lease_ttl_ms: u64,

    #[serde(rename = "heartbeat-interval-ms")]
    pub heartbeat_interval_ms: u64,

    /// Base idle poll interval; jittered per poll
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            scale_up_threshold: 5,
            monitor_interval_ms: 5_000,
            idle_cooldown_ms: 60_000,
            lease_ttl_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl PoolConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn idle_cooldown(&self) -> Duration {
        Duration::from_millis(self.idle_cooldown_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Check bounds that would make the pool unusable
    pub fn validate(&self) -> eyre::Result<()> {
        if self.max_workers == 0 {
            eyre::bail!("max-workers must be at least 1");
        }
        if self.min_workers > self.max_workers {
            eyre::bail!(
                "min-workers ({}) exceeds max-workers ({})",
                self.min_workers,
                self.max_workers
            );
        }
        if self.heartbeat_interval_ms >= self.lease_ttl_ms {
            eyre::bail!(
                "heartbeat-interval-ms ({}) must be shorter than lease-ttl-ms ({})",
                self.heartbeat_interval_ms,
                self.lease_ttl_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let config = PoolConfig {
            min_workers: 3,
            max_workers: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            heartbeat_interval_ms: 30_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_kebab() {
        let config: PoolConfig = serde_yaml::from_str("max-workers: 3\nscale-up-threshold: 5\n").unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.scale_up_threshold, 5);
        assert_eq!(config.min_workers, 1);
    }
}
