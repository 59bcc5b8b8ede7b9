//! Store-backed observability: periodic metrics, stuck-job detection,
//! structured job logs, and a derived health verdict.
//!
//! The monitor runs on its own timer, decoupled from dispatch, and never
//! mutates job rows; it reads them and appends log rows. A failing sampling
//! pass is logged and the next pass proceeds as scheduled.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::MonitorConfig;
use crate::events::{EVENT_CHANNEL_CAPACITY, MonitorEvent};
use crate::job::{Job, JobId};
use crate::stats::{HealthStatus, JobMetrics, PeriodMetrics};
use crate::store::{JobLogEntry, JobStore, LogLevel, NewLogEntry};

fn chrono_window(window: std::time::Duration) -> Duration {
    Duration::milliseconds(window.as_millis().min(i64::MAX as u128) as i64)
}

/// Cheap clonable handle to one monitor instance. Clones share the sampling
/// task and event channel.
#[derive(Clone)]
pub struct JobMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    store: Arc<dyn JobStore>,
    config: MonitorConfig,
    events: broadcast::Sender<MonitorEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobMonitor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_config(store, MonitorConfig::default())
    }

    pub fn with_config(store: Arc<dyn JobStore>, config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                store,
                config,
                events,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Subscribe to periodic metrics and stuck-job notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Start periodic sampling. No-op if already running.
    pub async fn start_monitoring(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            debug!("monitoring already started");
            return;
        }

        info!(
            interval_ms = self.inner.config.sample_interval.as_millis() as u64,
            "job monitoring started"
        );
        let monitor = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = monitor.sample().await {
                    error!(error = %err, "error collecting job metrics");
                }
            }
        }));
    }

    /// Stop periodic sampling. No-op if not running.
    pub async fn stop_monitoring(&self) {
        if let Some(handle) = self.inner.task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
            info!("job monitoring stopped");
        }
    }

    /// Status distribution, average completed-job duration, and the failure
    /// rate over the trailing metrics window.
    pub async fn collect_metrics(&self) -> Result<JobMetrics> {
        self.inner.collect_metrics().await
    }

    /// Jobs that have been `processing` longer than the stuck threshold.
    /// Detection only; remediation is an operator decision.
    pub async fn find_stuck_jobs(&self) -> Result<Vec<Job>> {
        self.inner.find_stuck_jobs().await
    }

    /// Append an immutable log row owned by the job.
    pub async fn log_job_event(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.inner
            .store
            .append_log(NewLogEntry {
                job_id,
                level,
                message: message.into(),
                metadata,
            })
            .await?;
        Ok(())
    }

    /// Log rows for a job, most recent first.
    pub async fn get_job_logs(&self, job_id: JobId, limit: u32) -> Result<Vec<JobLogEntry>> {
        self.inner.store.job_logs(job_id, limit).await
    }

    /// Per-status counts and durations over a trailing window of hours.
    pub async fn get_metrics_for_period(&self, hours: u32) -> Result<PeriodMetrics> {
        let since = Utc::now() - Duration::hours(hours as i64);
        let metrics = self.inner.store.status_breakdown_since(since).await?;
        Ok(PeriodMetrics {
            period_hours: hours,
            metrics,
            collected_at: Utc::now(),
        })
    }

    /// Healthy iff there are no stuck jobs and the trailing failure rate is
    /// below the configured threshold.
    pub async fn get_health_status(&self) -> Result<HealthStatus> {
        let inner = &self.inner;
        let now = Utc::now();
        let stuck = inner.find_stuck_jobs().await?;
        let recent = inner
            .store
            .failure_window(now - chrono_window(inner.config.recent_activity_window))
            .await?;
        let failure_window = inner
            .store
            .failure_window(now - chrono_window(inner.config.health_failure_window))
            .await?;

        let failure_percentage = failure_window.percentage();
        let healthy = stuck.is_empty() && failure_percentage < inner.config.unhealthy_failure_rate;

        Ok(HealthStatus {
            healthy,
            stuck_jobs: stuck.len() as u64,
            recent_activity: recent.total,
            failure_percentage,
            failure_window,
            checked_at: now,
        })
    }
}

impl MonitorInner {
    async fn sample(&self) -> Result<()> {
        let metrics = self.collect_metrics().await?;
        let _ = self.events.send(MonitorEvent::Metrics(metrics));

        let stuck = self.find_stuck_jobs().await?;
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "detected stuck jobs");
            let _ = self.events.send(MonitorEvent::StuckJobs(stuck));
        }
        Ok(())
    }

    async fn collect_metrics(&self) -> Result<JobMetrics> {
        let status_counts = self.store.count_by_status().await?;
        let avg_processing_time_ms = self.store.avg_completed_duration_ms().await?.unwrap_or(0.0);
        let since = Utc::now() - chrono_window(self.config.metrics_failure_window);
        let failure_rate = self.store.failure_window(since).await?;

        Ok(JobMetrics {
            status_counts,
            avg_processing_time_ms,
            failure_rate,
            collected_at: Utc::now(),
        })
    }

    async fn find_stuck_jobs(&self) -> Result<Vec<Job>> {
        let stuck_since = Utc::now() - chrono_window(self.config.stuck_threshold);
        self.store.find_stuck_jobs(stuck_since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryJobStore;

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let monitor = JobMonitor::new(Arc::new(MemoryJobStore::new()));
        monitor.start_monitoring().await;
        monitor.start_monitoring().await;
        monitor.stop_monitoring().await;
        monitor.stop_monitoring().await;
    }

    #[tokio::test]
    async fn test_empty_store_is_healthy() {
        let monitor = JobMonitor::new(Arc::new(MemoryJobStore::new()));
        let health = monitor.get_health_status().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.stuck_jobs, 0);
        assert_eq!(health.recent_activity, 0);
        assert_eq!(health.failure_percentage, 0.0);
    }

    #[tokio::test]
    async fn test_metrics_on_empty_store() {
        let monitor = JobMonitor::new(Arc::new(MemoryJobStore::new()));
        let metrics = monitor.collect_metrics().await.unwrap();
        assert!(metrics.status_counts.is_empty());
        assert_eq!(metrics.avg_processing_time_ms, 0.0);
        assert_eq!(metrics.failure_rate.total, 0);
    }
}
