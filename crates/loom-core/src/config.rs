//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Intervals are stored in milliseconds.
//!
//! ```toml
//! domain = "default"
//!
//! [scheduler]
//! poll_interval_ms = 3000
//!
//! [runner]
//! heartbeat_interval_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub domain: String,
    pub scheduler: SchedulerConfig,
    pub runner: RunnerConfig,
    pub lease_poller: LeasePollerConfig,
    pub retention: RetentionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            scheduler: SchedulerConfig::default(),
            runner: RunnerConfig::default(),
            lease_poller: LeasePollerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("domain must not be empty".into()));
        }
        let intervals = [
            ("scheduler.poll_interval_ms", self.scheduler.poll_interval_ms),
            (
                "scheduler.heartbeat_interval_ms",
                self.scheduler.heartbeat_interval_ms,
            ),
            ("scheduler.sweep_interval_ms", self.scheduler.sweep_interval_ms),
            ("runner.heartbeat_interval_ms", self.runner.heartbeat_interval_ms),
            ("lease_poller.poll_interval_ms", self.lease_poller.poll_interval_ms),
            ("retention.poll_interval_ms", self.retention.poll_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if self.scheduler.heartbeat_interval_ms >= self.scheduler.poll_interval_ms {
            return Err(ConfigError::Invalid(
                "scheduler.heartbeat_interval_ms must be shorter than poll_interval_ms".into(),
            ));
        }
        // runner leases go stale after the scheduler poll interval too
        if self.runner.heartbeat_interval_ms >= self.scheduler.poll_interval_ms {
            return Err(ConfigError::Invalid(
                "runner.heartbeat_interval_ms must be shorter than scheduler.poll_interval_ms"
                    .into(),
            ));
        }
        let limits = &self.scheduler.concurrency;
        if [
            limits.find_ready_tasks,
            limits.schedule_tasks,
            limits.update_task_dependencies,
            limits.check_graph_finished,
            limits.sweep,
            self.runner.max_concurrent_tasks,
        ]
        .contains(&0)
        {
            return Err(ConfigError::Invalid(
                "concurrency limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Per-stage bounds of the scheduler pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub find_ready_tasks: usize,
    pub schedule_tasks: usize,
    pub update_task_dependencies: usize,
    pub check_graph_finished: usize,
    pub sweep: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            find_ready_tasks: 100,
            schedule_tasks: 100,
            update_task_dependencies: 100,
            check_graph_finished: 100,
            sweep: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Staleness window of leases (the lease poller's `adjust`).
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub sweep_limit: usize,
    /// Sweep cycles without an observed event before a graph is re-evaluated.
    pub stale_graph_cycles: u32,
    pub concurrency: ConcurrencyConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            heartbeat_interval_ms: 1000,
            sweep_interval_ms: 5000,
            sweep_limit: 100,
            stale_graph_cycles: 3,
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stale_graph_after(&self) -> Duration {
        self.sweep_interval() * self.stale_graph_cycles
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub heartbeat_interval_ms: u64,
    pub max_concurrent_tasks: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            max_concurrent_tasks: 100,
        }
    }
}

impl RunnerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeasePollerConfig {
    pub poll_interval_ms: u64,
}

impl Default for LeasePollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
        }
    }
}

impl LeasePollerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub batch_limit: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 10_000,
            batch_limit: 100,
        }
    }
}

impl RetentionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.lease_poller.poll_interval(), Duration::from_millis(3000));
        assert_eq!(config.runner.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.scheduler.concurrency.sweep, 1);
        assert_eq!(config.scheduler.concurrency.find_ready_tasks, 100);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            domain = "lab"

            [scheduler]
            sweep_interval_ms = 250

            [scheduler.concurrency]
            update_task_dependencies = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.domain, "lab");
        assert_eq!(config.scheduler.sweep_interval_ms, 250);
        assert_eq!(config.scheduler.poll_interval_ms, 3000);
        assert_eq!(config.scheduler.concurrency.update_task_dependencies, 8);
        assert_eq!(config.scheduler.concurrency.schedule_tasks, 100);
    }

    #[test]
    fn rejects_zero_intervals() {
        let err = EngineConfig::from_toml_str("[runner]\nheartbeat_interval_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("runner.heartbeat_interval_ms")));
    }

    #[rstest]
    #[case::scheduler_heartbeat("[scheduler]\nheartbeat_interval_ms = 3000", "scheduler.heartbeat_interval_ms")]
    #[case::runner_heartbeat("[runner]\nheartbeat_interval_ms = 5000", "runner.heartbeat_interval_ms")]
    #[case::runner_heartbeat_equal(
        "[scheduler]\npoll_interval_ms = 800\nheartbeat_interval_ms = 100\n[runner]\nheartbeat_interval_ms = 800",
        "runner.heartbeat_interval_ms"
    )]
    fn rejects_heartbeats_not_shorter_than_lease_window(#[case] raw: &str, #[case] field: &str) {
        let err = EngineConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.starts_with(field)));
    }

    #[test]
    fn accepts_runner_heartbeat_inside_lease_window() {
        let config = EngineConfig::from_toml_str(
            "[scheduler]\npoll_interval_ms = 800\nheartbeat_interval_ms = 100\n[runner]\nheartbeat_interval_ms = 799",
        )
        .unwrap();
        assert_eq!(config.runner.heartbeat_interval_ms, 799);
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(matches!(
            EngineConfig::from_toml_str("domain = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
