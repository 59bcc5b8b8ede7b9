//! PostgreSQL-backed job store.
//!
//! Claims are atomic (`FOR UPDATE SKIP LOCKED`), so even a second engine
//! instance pointed at the same database cannot double-claim a row, though
//! the engine itself assumes a single instance.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::Result;
use crate::config::DatabaseConfig;
use crate::error::CapstanError;
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::stats::{FailureWindow, StatusPeriodStats};
use crate::store::{JobFilter, JobLogEntry, JobStore, LogLevel, NewLogEntry};

const JOB_COLUMNS: &str = "id, job_type, status, priority, payload, current_attempts, \
     max_attempts, retry_delay_ms, scheduled_at, started_at, completed_at, error_message, \
     worker_id, parent_job_id, created_at";

#[derive(FromRow)]
struct JobRow {
    id: i64,
    job_type: String,
    status: String,
    priority: i32,
    payload: serde_json::Value,
    current_attempts: i32,
    max_attempts: i32,
    retry_delay_ms: i64,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    worker_id: Option<String>,
    parent_job_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| CapstanError::Queue {
            message: format!("unknown job status in store: {}", self.status),
        })?;
        Ok(Job {
            id: self.id,
            job_type: self.job_type,
            status,
            priority: self.priority,
            payload: self.payload,
            current_attempts: self.current_attempts,
            max_attempts: self.max_attempts,
            retry_delay_ms: self.retry_delay_ms,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            worker_id: self.worker_id,
            parent_job_id: self.parent_job_id,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct LogRow {
    id: i64,
    job_id: i64,
    level: String,
    message: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl LogRow {
    fn into_entry(self) -> Result<JobLogEntry> {
        let level = LogLevel::parse(&self.level).ok_or_else(|| CapstanError::Monitor {
            message: format!("unknown log level in store: {}", self.level),
        })?;
        Ok(JobLogEntry {
            id: self.id,
            job_id: self.job_id,
            level,
            message: self.message,
            metadata: self.metadata,
            created_at: self.created_at,
        })
    }
}

fn cancellable_statuses() -> Vec<String> {
    vec![
        JobStatus::Pending.as_str().to_string(),
        JobStatus::Processing.as_str().to_string(),
        JobStatus::Scheduled.as_str().to_string(),
    ]
}

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a fresh pool using the database section of the engine config.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job and job-log tables and their indexes if missing.
    pub async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS capstan_jobs (
                id BIGSERIAL PRIMARY KEY,
                job_type VARCHAR NOT NULL,
                status VARCHAR NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                payload JSONB NOT NULL DEFAULT '{}',
                current_attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                retry_delay_ms BIGINT NOT NULL DEFAULT 5000,
                scheduled_at TIMESTAMPTZ,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                error_message TEXT,
                worker_id VARCHAR(64),
                parent_job_id BIGINT REFERENCES capstan_jobs(id) ON DELETE SET NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_capstan_jobs_status_priority_scheduled
            ON capstan_jobs (status, priority DESC, scheduled_at);

            CREATE INDEX IF NOT EXISTS idx_capstan_jobs_status_started
            ON capstan_jobs (status, started_at);

            CREATE INDEX IF NOT EXISTS idx_capstan_jobs_job_type
            ON capstan_jobs (job_type);

            CREATE TABLE IF NOT EXISTS capstan_job_logs (
                id BIGSERIAL PRIMARY KEY,
                job_id BIGINT NOT NULL REFERENCES capstan_jobs(id) ON DELETE CASCADE,
                level VARCHAR(8) NOT NULL,
                message TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_capstan_job_logs_job_created
            ON capstan_job_logs (job_id, created_at DESC);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        let sql = format!(
            "INSERT INTO capstan_jobs \
             (job_type, status, priority, payload, current_attempts, max_attempts, \
              retry_delay_ms, scheduled_at, parent_job_id, created_at) \
             VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8, $9) \
             RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = sqlx::query_as(&sql)
            .bind(&job.job_type)
            .bind(JobStatus::Pending.as_str())
            .bind(job.priority)
            .bind(&job.payload)
            .bind(job.max_attempts)
            .bind(job.retry_delay_ms)
            .bind(job.scheduled_at)
            .bind(job.parent_job_id)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        row.into_job()
    }

    async fn claim_next_ready(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE capstan_jobs \
             SET status = $1, started_at = $2, current_attempts = current_attempts + 1, \
                 worker_id = 'worker-' || id \
             WHERE id = ( \
                 SELECT id FROM capstan_jobs \
                 WHERE status = $3 AND (scheduled_at IS NULL OR scheduled_at <= $2) \
                 ORDER BY priority DESC, started_at ASC NULLS FIRST, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(JobStatus::Processing.as_str())
            .bind(now)
            .bind(JobStatus::Pending.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn complete_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE capstan_jobs SET status = $1, completed_at = $2 \
             WHERE id = $3 AND status = $4",
        )
        .bind(JobStatus::Completed.as_str())
        .bind(now)
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_job(&self, id: JobId, error_message: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE capstan_jobs SET status = $1, completed_at = $2, error_message = $3 \
             WHERE id = $4 AND status = $5",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(now)
        .bind(error_message)
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reschedule_retry(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE capstan_jobs SET status = $1, scheduled_at = $2, error_message = $3 \
             WHERE id = $4 AND status = $5",
        )
        .bind(JobStatus::Pending.as_str())
        .bind(run_at)
        .bind(error_message)
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE capstan_jobs SET status = $1, completed_at = $2, error_message = $3 \
             WHERE id = $4 AND status = ANY($5)",
        )
        .bind(JobStatus::Cancelled.as_str())
        .bind(now)
        .bind("Job cancelled by user")
        .bind(id)
        .bind(cancellable_statuses())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_jobs(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE capstan_jobs SET status = $1, completed_at = $2, error_message = $3 \
             WHERE id = ANY($4) AND status = ANY($5)",
        )
        .bind(JobStatus::Cancelled.as_str())
        .bind(now)
        .bind("Bulk cancelled by user")
        .bind(ids)
        .bind(cancellable_statuses())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn retry_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE capstan_jobs \
             SET status = $1, current_attempts = 0, error_message = NULL, \
                 started_at = $2, completed_at = NULL, scheduled_at = NULL \
             WHERE id = $3 AND status = $4 \
             RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(JobStatus::Pending.as_str())
            .bind(now)
            .bind(id)
            .bind(JobStatus::Failed.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn retry_jobs(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE capstan_jobs \
             SET status = $1, current_attempts = 0, error_message = NULL, \
                 started_at = $2, completed_at = NULL, scheduled_at = NULL \
             WHERE id = ANY($3) AND status = $4",
        )
        .bind(JobStatus::Pending.as_str())
        .bind(now)
        .bind(ids)
        .bind(JobStatus::Failed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM capstan_jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM capstan_jobs \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR job_type = $2) \
             ORDER BY started_at DESC NULLS FIRST, id DESC \
             LIMIT $3 OFFSET $4"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.job_type.as_deref())
            .bind(filter.limit as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        #[derive(FromRow)]
        struct StatusCountRow {
            status: String,
            count: i64,
        }

        let rows: Vec<StatusCountRow> =
            sqlx::query_as("SELECT status, COUNT(*) AS count FROM capstan_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status = JobStatus::parse(&row.status).ok_or_else(|| CapstanError::Queue {
                message: format!("unknown job status in store: {}", row.status),
            })?;
            counts.insert(status, row.count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn find_stuck_jobs(&self, stuck_since: DateTime<Utc>) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM capstan_jobs \
             WHERE status = $1 AND started_at < $2 \
             ORDER BY started_at ASC"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(JobStatus::Processing.as_str())
            .bind(stuck_since)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn avg_completed_duration_ms(&self) -> Result<Option<f64>> {
        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000.0)::double precision \
             FROM capstan_jobs \
             WHERE status = $1 AND started_at IS NOT NULL AND completed_at IS NOT NULL",
        )
        .bind(JobStatus::Completed.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(avg)
    }

    async fn failure_window(&self, since: DateTime<Utc>) -> Result<FailureWindow> {
        #[derive(FromRow)]
        struct WindowRow {
            total: i64,
            failed: i64,
        }

        let row: WindowRow = sqlx::query_as(
            "SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE status = $1) AS failed \
             FROM capstan_jobs WHERE started_at > $2",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(FailureWindow {
            total: row.total.max(0) as u64,
            failed: row.failed.max(0) as u64,
        })
    }

    async fn status_breakdown_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusPeriodStats>> {
        #[derive(FromRow)]
        struct BreakdownRow {
            status: String,
            count: i64,
            avg_duration_ms: Option<f64>,
        }

        let rows: Vec<BreakdownRow> = sqlx::query_as(
            "SELECT status, COUNT(*) AS count, \
                    AVG( \
                        CASE WHEN completed_at IS NOT NULL AND started_at IS NOT NULL \
                             THEN EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000.0 \
                        END \
                    )::double precision AS avg_duration_ms \
             FROM capstan_jobs \
             WHERE started_at > $1 \
             GROUP BY status \
             ORDER BY status",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status = JobStatus::parse(&row.status).ok_or_else(|| CapstanError::Queue {
                    message: format!("unknown job status in store: {}", row.status),
                })?;
                Ok(StatusPeriodStats {
                    status,
                    count: row.count.max(0) as u64,
                    avg_duration_ms: row.avg_duration_ms,
                })
            })
            .collect()
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<JobLogEntry> {
        let row: LogRow = sqlx::query_as(
            "INSERT INTO capstan_job_logs (job_id, level, message, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, job_id, level, message, metadata, created_at",
        )
        .bind(entry.job_id)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.metadata)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        row.into_entry()
    }

    async fn job_logs(&self, job_id: JobId, limit: u32) -> Result<Vec<JobLogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(
            "SELECT id, job_id, level, message, metadata, created_at \
             FROM capstan_job_logs \
             WHERE job_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2",
        )
        .bind(job_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LogRow::into_entry).collect()
    }
}
