use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long terminal transactions are kept before they become purge-eligible.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Maximum step handlers invoked concurrently within one wave.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
}

impl OrchestratorConfig {
    /// Retention as a duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            max_concurrent_steps: default_max_concurrent_steps(),
        }
    }
}

fn default_retention() -> u64 {
    15 * 60
}

fn default_max_concurrent_steps() -> usize {
    16
}

/// Scheduler (delayed job poller) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum jobs claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// How often expired checkpoints are purged, in seconds.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// How long a claim on a job holds before another poller may take it, in seconds.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Delay before a job whose dispatch failed is due again, in milliseconds.
    #[serde(default = "default_release_delay")]
    pub release_delay_ms: u64,
}

impl SchedulerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn release_delay(&self) -> Duration {
        Duration::from_millis(self.release_delay_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
            purge_interval_secs: default_purge_interval(),
            lease_secs: default_lease(),
            release_delay_ms: default_release_delay(),
        }
    }
}

fn default_poll_interval() -> u64 {
    500
}

fn default_batch_size() -> u32 {
    100
}

fn default_purge_interval() -> u64 {
    60
}

fn default_lease() -> u64 {
    60
}

fn default_release_delay() -> u64 {
    5_000
}

/// Cross-instance event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// PostgreSQL NOTIFY channel carrying all lifecycle broadcasts.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Prefix for per-workflow topics.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Buffer size of local broadcast channels.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl BusConfig {
    /// Topic carrying the lifecycle events of one workflow.
    pub fn topic(&self, workflow_id: &str) -> String {
        format!("{}:{}", self.topic_prefix, workflow_id)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            topic_prefix: default_topic_prefix(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_channel() -> String {
    "stride_events".to_string()
}

fn default_topic_prefix() -> String {
    "stride".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let orchestrator = OrchestratorConfig::default();
        assert_eq!(orchestrator.retention(), Duration::from_secs(900));
        assert_eq!(orchestrator.max_concurrent_steps, 16);

        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.poll_interval_ms, 500);
        assert_eq!(scheduler.batch_size, 100);
        assert_eq!(scheduler.lease(), Duration::from_secs(60));
        assert_eq!(scheduler.release_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_bus_topic() {
        let bus = BusConfig::default();
        assert_eq!(bus.topic("checkout"), "stride:checkout");
    }

    #[test]
    fn test_parse_scheduler_config() {
        let toml = r#"
            poll_interval_ms = 50
            purge_interval_secs = 10
        "#;

        let config: SchedulerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.purge_interval_secs, 10);
    }
}
