//! Job rows and the options callers supply when enqueueing them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CapstanError;

/// Store-assigned job identifier.
pub type JobId = i64;

/// Lifecycle state of a job. Exactly one holds at any time; the strings are
/// what the store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    Scheduled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Retrying,
        JobStatus::Scheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
            JobStatus::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        JobStatus::ALL.iter().copied().find(|v| v.as_str() == s)
    }

    /// Terminal states carry a completion timestamp and are never dispatched.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States from which a user-initiated cancel is accepted.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Scheduled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CapstanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::parse(s).ok_or_else(|| CapstanError::Queue {
            message: format!("unknown job status: {}", s),
        })
    }
}

/// A unit of work as stored. Timestamps under `started_at`/`completed_at` are
/// stamped by the engine, never by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    /// Execution attempts so far; incremented when a worker claims the job.
    pub current_attempts: i32,
    pub max_attempts: i32,
    /// Base backoff in milliseconds; doubles with each failed attempt.
    pub retry_delay_ms: i64,
    /// Not eligible for dispatch before this time. `None` means immediately
    /// eligible, subject to status.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Worker slot label (`worker-{id}`), informational only.
    pub worker_id: Option<String>,
    /// Lineage metadata, uninterpreted by the engine.
    pub parent_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Backoff before the job becomes eligible again after its most recent
    /// failed attempt: `retry_delay_ms * 2^(current_attempts - 1)`.
    pub fn retry_backoff(&self) -> Duration {
        // Cap the exponent so a misconfigured max_attempts cannot overflow.
        let exponent = (self.current_attempts.max(1) - 1).min(20) as u32;
        let millis = self.retry_delay_ms.saturating_mul(1i64 << exponent);
        Duration::milliseconds(millis)
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.current_attempts < self.max_attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Per-job overrides accepted by `add_job`. Unset fields fall back to the
/// queue configuration defaults.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: Option<i32>,
    /// Delay before first eligibility, encoded as `scheduled_at = now + delay`.
    pub delay: Option<StdDuration>,
    pub max_attempts: Option<i32>,
    pub retry_delay: Option<StdDuration>,
    pub parent_job_id: Option<JobId>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: StdDuration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn with_parent_job(mut self, parent_job_id: JobId) -> Self {
        self.parent_job_id = Some(parent_job_id);
        self
    }
}

/// Fully-resolved insert record handed to the store. Built by the queue
/// engine from a job type, payload, and [`JobOptions`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub retry_delay_ms: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub parent_job_id: Option<JobId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_with_attempts(current_attempts: i32, retry_delay_ms: i64) -> Job {
        Job {
            id: 1,
            job_type: "echo".to_string(),
            status: JobStatus::Processing,
            priority: 0,
            payload: json!({}),
            current_attempts,
            max_attempts: 5,
            retry_delay_ms,
            scheduled_at: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
            worker_id: Some("worker-1".to_string()),
            parent_job_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(JobStatus::parse("bogus").is_none());
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_serde_uses_lowercase_strings() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let parsed: JobStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, JobStatus::Cancelled);
    }

    #[test]
    fn test_terminal_and_cancellable_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());

        assert!(JobStatus::Pending.is_cancellable());
        assert!(JobStatus::Processing.is_cancellable());
        assert!(JobStatus::Scheduled.is_cancellable());
        assert!(!JobStatus::Completed.is_cancellable());
        assert!(!JobStatus::Failed.is_cancellable());
    }

    #[test]
    fn test_retry_backoff_doubles_per_attempt() {
        // After attempt k the backoff is retry_delay * 2^(k-1).
        assert_eq!(
            job_with_attempts(1, 5000).retry_backoff(),
            Duration::milliseconds(5000)
        );
        assert_eq!(
            job_with_attempts(2, 5000).retry_backoff(),
            Duration::milliseconds(10000)
        );
        assert_eq!(
            job_with_attempts(3, 5000).retry_backoff(),
            Duration::milliseconds(20000)
        );
        assert_eq!(
            job_with_attempts(4, 250).retry_backoff(),
            Duration::milliseconds(2000)
        );
    }

    #[test]
    fn test_retry_backoff_saturates_instead_of_overflowing() {
        let job = job_with_attempts(i32::MAX, i64::MAX);
        assert!(job.retry_backoff() > Duration::zero());
    }

    #[test]
    fn test_attempts_remaining() {
        let mut job = job_with_attempts(2, 1000);
        assert!(job.has_attempts_remaining());
        job.current_attempts = 5;
        assert!(!job.has_attempts_remaining());
    }

    #[test]
    fn test_job_options_builder() {
        let options = JobOptions::new()
            .with_priority(7)
            .with_delay(StdDuration::from_secs(30))
            .with_max_attempts(1)
            .with_retry_delay(StdDuration::from_millis(250))
            .with_parent_job(99);

        assert_eq!(options.priority, Some(7));
        assert_eq!(options.delay, Some(StdDuration::from_secs(30)));
        assert_eq!(options.max_attempts, Some(1));
        assert_eq!(options.retry_delay, Some(StdDuration::from_millis(250)));
        assert_eq!(options.parent_job_id, Some(99));
    }
}
