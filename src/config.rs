//! Engine configuration, loadable from TOML with serde defaults.
//!
//! Every section and field has a default, so a partial file (or none at all)
//! yields a working configuration. Durations are written as integer
//! milliseconds in TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Serialize `std::time::Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Top-level configuration: store connection, queue engine, and monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub monitor: MonitorConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file. A `DATABASE_URL` environment
    /// variable overrides the file's connection string.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: EngineConfig = toml::from_str(&raw)?;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/capstan".to_string(),
            max_connections: 5,
        }
    }
}

/// Dispatch-loop tuning and per-job defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Interval between dispatch ticks.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Concurrency ceiling for in-flight jobs.
    pub max_concurrent_jobs: usize,
    /// Pause after a connectivity/schema error before the next tick.
    #[serde(with = "duration_ms")]
    pub error_backoff: Duration,
    /// Applied when `JobOptions::max_attempts` is unset.
    pub default_max_attempts: i32,
    /// Applied when `JobOptions::retry_delay` is unset.
    #[serde(with = "duration_ms")]
    pub default_retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_concurrent_jobs: 3,
            error_backoff: Duration::from_secs(5),
            default_max_attempts: 3,
            default_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Monitor sampling cadence and detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_ms")]
    pub sample_interval: Duration,
    /// A processing job older than this is reported as stuck.
    #[serde(with = "duration_ms")]
    pub stuck_threshold: Duration,
    /// Trailing window for the health failure rate.
    #[serde(with = "duration_ms")]
    pub health_failure_window: Duration,
    /// Trailing window for the periodic metrics failure rate.
    #[serde(with = "duration_ms")]
    pub metrics_failure_window: Duration,
    /// Trailing window for the recent-activity count in health checks.
    #[serde(with = "duration_ms")]
    pub recent_activity_window: Duration,
    /// Failure percentage at or above which the system is unhealthy.
    pub unhealthy_failure_rate: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(30 * 60),
            health_failure_window: Duration::from_secs(60 * 60),
            metrics_failure_window: Duration::from_secs(24 * 60 * 60),
            recent_activity_window: Duration::from_secs(5 * 60),
            unhealthy_failure_rate: 50.0,
        }
    }
}
