//! Persistent job store abstraction.
//!
//! All lifecycle transitions are expressed as conditional updates: the
//! predicate names the id AND the expected prior status, and the operation
//! reports whether a row was actually affected. That keeps user-initiated
//! transitions (cancel, retry) and worker completions from clobbering each
//! other; a worker finishing a job that was cancelled mid-flight simply
//! observes `false` and moves on.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::stats::{FailureWindow, StatusPeriodStats};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
        }
    }

    pub fn parse(s: &str) -> Option<LogLevel> {
        match s {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "debug" => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

/// Append-only log row owned by a job; deleted with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Log row to append.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub metadata: serde_json::Value,
}

/// Filter for job listings. Jobs come back most-recently-started first, with
/// unstarted jobs ahead of started ones.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

/// Abstract store operations the engine, scheduler, and monitor consume.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job as `pending` and return the stored row with its
    /// assigned id.
    async fn insert_job(&self, job: NewJob) -> Result<Job>;

    /// Atomically claim the next ready job: among `pending` rows whose
    /// `scheduled_at` is null or has passed, the one with the highest
    /// priority, ties broken by earliest `started_at` (nulls first), then id.
    /// The claimed row is marked `processing`, stamped with `started_at` and a
    /// worker label, and its attempt counter is incremented.
    async fn claim_next_ready(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// `processing -> completed`. False if the job is no longer processing.
    async fn complete_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool>;

    /// `processing -> failed`, terminal. False if the job is no longer
    /// processing.
    async fn fail_job(&self, id: JobId, error_message: &str, now: DateTime<Utc>) -> Result<bool>;

    /// `processing -> pending` with a future eligibility time; records the
    /// error that caused the retry. False if the job is no longer processing.
    async fn reschedule_retry(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool>;

    /// Cancel a job still in a cancellable state. False (state unchanged)
    /// otherwise, including for already-terminal jobs.
    async fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool>;

    /// Bulk cancel; returns the number of rows actually transitioned.
    async fn cancel_jobs(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64>;

    /// `failed -> pending` with attempts and error reset. `None` when the job
    /// is missing or not failed.
    async fn retry_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Bulk retry; returns the number of rows actually transitioned.
    async fn retry_jobs(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>>;

    /// Counts grouped by status; statuses with no rows are absent.
    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>>;

    /// Jobs still `processing` whose `started_at` is before `stuck_since`.
    async fn find_stuck_jobs(&self, stuck_since: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Average wall-clock duration of completed jobs, in milliseconds.
    async fn avg_completed_duration_ms(&self) -> Result<Option<f64>>;

    /// Failed-vs-total counts over jobs started after `since`.
    async fn failure_window(&self, since: DateTime<Utc>) -> Result<FailureWindow>;

    /// Per-status counts and average durations over jobs started after
    /// `since`.
    async fn status_breakdown_since(&self, since: DateTime<Utc>)
    -> Result<Vec<StatusPeriodStats>>;

    /// Append a log row and return it with its assigned id and timestamp.
    async fn append_log(&self, entry: NewLogEntry) -> Result<JobLogEntry>;

    /// Log rows for a job, most recent first, capped at `limit`.
    async fn job_logs(&self, job_id: JobId, limit: u32) -> Result<Vec<JobLogEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_round_trip() {
        for level in [LogLevel::Info, LogLevel::Warn, LogLevel::Error, LogLevel::Debug] {
            assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        }
        assert!(LogLevel::parse("fatal").is_none());
    }

    #[test]
    fn test_job_filter_builder() {
        let filter = JobFilter::new()
            .with_status(JobStatus::Failed)
            .with_job_type("collect")
            .with_limit(10)
            .with_offset(20);
        assert_eq!(filter.status, Some(JobStatus::Failed));
        assert_eq!(filter.job_type.as_deref(), Some("collect"));
        assert_eq!(filter.limit, 10);
        assert_eq!(filter.offset, 20);

        let default = JobFilter::default();
        assert_eq!(default.limit, 50);
        assert!(default.status.is_none());
    }
}
