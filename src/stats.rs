//! Metric and health structs derived from the job store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Snapshot of the queue engine itself plus the store-wide status counts.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// In-flight worker tasks at the time of the snapshot.
    pub active_workers: usize,
    /// Configured concurrency ceiling.
    pub max_concurrent_jobs: usize,
    /// Whether the poll loop is running.
    pub is_processing: bool,
    pub status_counts: HashMap<JobStatus, u64>,
}

/// Failed-vs-total counts over a trailing window of started jobs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FailureWindow {
    pub total: u64,
    pub failed: u64,
}

impl FailureWindow {
    /// Failure percentage in [0, 100], rounded to two decimals. An empty
    /// window counts as 0%.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let raw = self.failed as f64 / self.total as f64 * 100.0;
        (raw * 100.0).round() / 100.0
    }
}

/// Periodic metrics sample published by the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct JobMetrics {
    pub status_counts: HashMap<JobStatus, u64>,
    /// Average wall-clock duration of completed jobs, in milliseconds.
    pub avg_processing_time_ms: f64,
    /// Failure rate over the trailing metrics window (24h by default).
    pub failure_rate: FailureWindow,
    pub collected_at: DateTime<Utc>,
}

/// Per-status counts and durations over an arbitrary trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPeriodStats {
    pub status: JobStatus,
    pub count: u64,
    /// Average duration of jobs in this status that have both timestamps.
    pub avg_duration_ms: Option<f64>,
}

/// Result of `get_metrics_for_period`.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodMetrics {
    pub period_hours: u32,
    pub metrics: Vec<StatusPeriodStats>,
    pub collected_at: DateTime<Utc>,
}

/// Derived health verdict for the job system.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// True iff there are no stuck jobs and the trailing failure rate is
    /// below the configured threshold.
    pub healthy: bool,
    pub stuck_jobs: u64,
    /// Jobs started within the recent-activity window (5 minutes by default).
    pub recent_activity: u64,
    pub failure_percentage: f64,
    pub failure_window: FailureWindow,
    pub checked_at: DateTime<Utc>,
}
