//! In-process job store with the same observable semantics as the SQL
//! backend. Used by the test suites and by embedders that want a
//! process-local queue without a database.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::stats::{FailureWindow, StatusPeriodStats};
use crate::store::{JobFilter, JobLogEntry, JobStore, NewLogEntry};

#[derive(Default)]
struct MemoryState {
    next_job_id: i64,
    next_log_id: i64,
    jobs: BTreeMap<JobId, Job>,
    logs: Vec<JobLogEntry>,
}

/// Mutex-guarded in-memory store. Locks are held only for synchronous map
/// work, never across an await.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn duration_ms(job: &Job) -> Option<f64> {
        match (job.started_at, job.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        let mut state = self.state.lock().unwrap();
        state.next_job_id += 1;
        let id = state.next_job_id;
        let stored = Job {
            id,
            job_type: job.job_type,
            status: JobStatus::Pending,
            priority: job.priority,
            payload: job.payload,
            current_attempts: 0,
            max_attempts: job.max_attempts,
            retry_delay_ms: job.retry_delay_ms,
            scheduled_at: job.scheduled_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            worker_id: None,
            parent_job_id: job.parent_job_id,
            created_at: Utc::now(),
        };
        state.jobs.insert(id, stored.clone());
        Ok(stored)
    }

    async fn claim_next_ready(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut state = self.state.lock().unwrap();
        let candidate = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending
                    && job.scheduled_at.map(|at| at <= now).unwrap_or(true)
            })
            .min_by_key(|job| (Reverse(job.priority), job.started_at, job.id))
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        job.current_attempts += 1;
        job.worker_id = Some(format!("worker-{}", id));
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_job(&self, id: JobId, error_message: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error_message = Some(error_message.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule_retry(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Pending;
                job.scheduled_at = Some(run_at);
                job.error_message = Some(error_message.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status.is_cancellable() => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now);
                job.error_message = Some("Job cancelled by user".to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_jobs(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut affected = 0;
        for id in ids {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.status.is_cancellable() {
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(now);
                    job.error_message = Some("Bulk cancelled by user".to_string());
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn retry_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Failed => {
                job.status = JobStatus::Pending;
                job.current_attempts = 0;
                job.error_message = None;
                job.started_at = Some(now);
                job.completed_at = None;
                job.scheduled_at = None;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn retry_jobs(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64> {
        let mut affected = 0;
        for id in ids {
            if self.retry_job(*id, now).await?.is_some() {
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| {
                filter.status.map(|s| job.status == s).unwrap_or(true)
                    && filter
                        .job_type
                        .as_deref()
                        .map(|t| job.job_type == t)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        // Most-recently-started first, unstarted jobs ahead of started ones.
        jobs.sort_by(|a, b| match (a.started_at, b.started_at) {
            (None, None) => b.id.cmp(&a.id),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => y.cmp(&x).then(b.id.cmp(&a.id)),
        });
        Ok(jobs
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let state = self.state.lock().unwrap();
        let mut counts = HashMap::new();
        for job in state.jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn find_stuck_jobs(&self, stuck_since: DateTime<Utc>) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut stuck: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.started_at.map(|at| at < stuck_since).unwrap_or(false)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|job| job.started_at);
        Ok(stuck)
    }

    async fn avg_completed_duration_ms(&self) -> Result<Option<f64>> {
        let state = self.state.lock().unwrap();
        let durations: Vec<f64> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Completed)
            .filter_map(Self::duration_ms)
            .collect();
        if durations.is_empty() {
            return Ok(None);
        }
        Ok(Some(durations.iter().sum::<f64>() / durations.len() as f64))
    }

    async fn failure_window(&self, since: DateTime<Utc>) -> Result<FailureWindow> {
        let state = self.state.lock().unwrap();
        let mut window = FailureWindow::default();
        for job in state.jobs.values() {
            if job.started_at.map(|at| at > since).unwrap_or(false) {
                window.total += 1;
                if job.status == JobStatus::Failed {
                    window.failed += 1;
                }
            }
        }
        Ok(window)
    }

    async fn status_breakdown_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusPeriodStats>> {
        let state = self.state.lock().unwrap();
        let mut grouped: HashMap<JobStatus, (u64, Vec<f64>)> = HashMap::new();
        for job in state.jobs.values() {
            if job.started_at.map(|at| at > since).unwrap_or(false) {
                let entry = grouped.entry(job.status).or_default();
                entry.0 += 1;
                if let Some(ms) = Self::duration_ms(job) {
                    entry.1.push(ms);
                }
            }
        }
        let mut breakdown: Vec<StatusPeriodStats> = grouped
            .into_iter()
            .map(|(status, (count, durations))| StatusPeriodStats {
                status,
                count,
                avg_duration_ms: if durations.is_empty() {
                    None
                } else {
                    Some(durations.iter().sum::<f64>() / durations.len() as f64)
                },
            })
            .collect();
        breakdown.sort_by_key(|entry| entry.status.as_str());
        Ok(breakdown)
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<JobLogEntry> {
        let mut state = self.state.lock().unwrap();
        state.next_log_id += 1;
        let stored = JobLogEntry {
            id: state.next_log_id,
            job_id: entry.job_id,
            level: entry.level,
            message: entry.message,
            metadata: entry.metadata,
            created_at: Utc::now(),
        };
        state.logs.push(stored.clone());
        Ok(stored)
    }

    async fn job_logs(&self, job_id: JobId, limit: u32) -> Result<Vec<JobLogEntry>> {
        let state = self.state.lock().unwrap();
        let mut logs: Vec<JobLogEntry> = state
            .logs
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        logs.truncate(limit as usize);
        Ok(logs)
    }
}
