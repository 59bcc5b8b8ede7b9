//! The job queue engine: poll, claim, execute, retry, complete.
//!
//! One timer task drives dispatch. Each tick claims at most one ready job
//! (when a worker slot is free) and launches it as an independent task in a
//! [`JoinSet`], so the tick itself never waits on a handler. Handler errors
//! and per-tick store errors are contained; the loop only stops on an
//! explicit [`JobQueue::stop_processing`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::QueueConfig;
use crate::events::{EVENT_CHANNEL_CAPACITY, QueueEvent};
use crate::job::{Job, JobId, JobOptions, NewJob};
use crate::registry::{HandlerRegistry, JobHandler};
use crate::stats::QueueStats;
use crate::store::{JobFilter, JobStore};

/// Cheap clonable handle to one engine instance. Clones share the same
/// worker set, poll loop, and handler registry.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    store: Arc<dyn JobStore>,
    registry: RwLock<HandlerRegistry>,
    config: QueueConfig,
    events: broadcast::Sender<QueueEvent>,
    /// In-flight worker tasks. The ceiling check, the claim, and the spawn all
    /// happen while this lock is held, so the active count can never exceed
    /// the ceiling at the instant a claim is issued.
    workers: Mutex<JoinSet<()>>,
    running: AtomicBool,
    /// Wakes the poll loop out of its interval wait on shutdown. The loop is
    /// only ever interrupted between ticks, never in the middle of one, so a
    /// claim is always followed by its worker spawn.
    shutdown: Notify,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    pub fn with_config(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                store,
                registry: RwLock::new(HandlerRegistry::new()),
                config,
                events,
                workers: Mutex::new(JoinSet::new()),
                running: AtomicBool::new(false),
                shutdown: Notify::new(),
                poll_task: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle notifications. Lagging receivers miss events;
    /// dispatch never blocks on them.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub async fn register_handler(&self, job_type: impl Into<String>, handler: JobHandler) {
        self.inner.registry.write().await.register(job_type, handler);
    }

    /// Register a plain async closure as the handler for `job_type`.
    pub async fn register_handler_fn<F, Fut>(&self, job_type: impl Into<String>, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.registry.write().await.register_fn(job_type, f);
    }

    /// Register a handler that receives the payload deserialized into `T`.
    pub async fn register_payload_handler<T, F, Fut>(&self, job_type: impl Into<String>, f: F)
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.registry.write().await.register_payload(job_type, f);
    }

    pub async fn registered_types(&self) -> Vec<String> {
        self.inner.registry.read().await.registered_types()
    }

    /// Insert a job and lazily start the poll loop. The only operation whose
    /// store failure propagates to the caller.
    pub async fn add_job(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        let scheduled_at = options.delay.map(|delay| {
            Utc::now()
                + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
        });
        let config = &self.inner.config;
        let new_job = NewJob {
            job_type: job_type.to_string(),
            payload,
            priority: options.priority.unwrap_or(0),
            max_attempts: options.max_attempts.unwrap_or(config.default_max_attempts),
            retry_delay_ms: options
                .retry_delay
                .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
                .unwrap_or(config.default_retry_delay.as_millis() as i64),
            scheduled_at,
            parent_job_id: options.parent_job_id,
        };

        let job = self.inner.store.insert_job(new_job).await?;
        info!(job_id = job.id, job_type = %job.job_type, "job added to queue");
        let _ = self.inner.events.send(QueueEvent::Added {
            id: job.id,
            job_type: job.job_type.clone(),
        });

        if !self.inner.running.load(Ordering::SeqCst) {
            self.start_processing().await;
        }

        Ok(job.id)
    }

    /// Start the dispatch loop. No-op if already running.
    pub async fn start_processing(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("job processing already started");
            return;
        }

        info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            max_concurrent_jobs = self.inner.config.max_concurrent_jobs,
            "job queue processing started"
        );

        let engine = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick completes immediately; consume it so
            // the first dispatch pass happens one full interval after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = engine.shutdown.notified() => {}
                    _ = ticker.tick() => {}
                }
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = engine.tick().await {
                    error!(error = %err, "error in job processing loop");
                    if err.is_connectivity() {
                        warn!(
                            backoff_ms = engine.config.error_backoff.as_millis() as u64,
                            "store unavailable, backing off"
                        );
                        tokio::select! {
                            _ = engine.shutdown.notified() => {}
                            _ = tokio::time::sleep(engine.config.error_backoff) => {}
                        }
                        if !engine.running.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
        });
        *self.inner.poll_task.lock().await = Some(handle);
    }

    /// Stop the dispatch loop and wait for every in-flight worker task to
    /// settle before returning.
    pub async fn stop_processing(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_one();

        if let Some(handle) = self.inner.poll_task.lock().await.take() {
            let _ = handle.await;
        }

        let mut workers = self.inner.workers.lock().await;
        let active = workers.len();
        if active > 0 {
            info!(active, "waiting for active workers to finish");
        }
        while workers.join_next().await.is_some() {}
        info!("job queue processing stopped");
    }

    pub fn is_processing(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// One dispatch pass: reap settled workers, and if a slot is free, claim
    /// and launch at most one ready job. Public so tests and embedders with
    /// their own timing can drive the engine deterministically.
    pub async fn tick(&self) -> Result<()> {
        self.inner.tick().await
    }

    /// Cancel a job still in a cancellable state. Cancelling a job already
    /// running does not interrupt the handler; the worker's completion update
    /// becomes a no-op instead.
    pub async fn cancel_job(&self, id: JobId) -> Result<bool> {
        let cancelled = self.inner.store.cancel_job(id, Utc::now()).await?;
        if cancelled {
            info!(job_id = id, "job cancelled");
            let _ = self.inner.events.send(QueueEvent::Cancelled { id });
        }
        Ok(cancelled)
    }

    /// Re-queue a failed job with attempts and error reset. `None` when the
    /// job is missing or not eligible.
    pub async fn retry_job(&self, id: JobId) -> Result<Option<Job>> {
        let retried = self.inner.store.retry_job(id, Utc::now()).await?;
        if retried.is_some() {
            info!(job_id = id, "job queued for manual retry");
        }
        Ok(retried)
    }

    pub async fn cancel_jobs(&self, ids: &[JobId]) -> Result<u64> {
        let affected = self.inner.store.cancel_jobs(ids, Utc::now()).await?;
        info!(requested = ids.len(), affected, "bulk cancel");
        Ok(affected)
    }

    pub async fn retry_jobs(&self, ids: &[JobId]) -> Result<u64> {
        let affected = self.inner.store.retry_jobs(ids, Utc::now()).await?;
        info!(requested = ids.len(), affected, "bulk retry");
        Ok(affected)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.store.get_job(id).await
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        self.inner.store.list_jobs(filter).await
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        let active_workers = {
            let mut workers = self.inner.workers.lock().await;
            while workers.try_join_next().is_some() {}
            workers.len()
        };
        let status_counts = self.inner.store.count_by_status().await?;
        Ok(QueueStats {
            active_workers,
            max_concurrent_jobs: self.inner.config.max_concurrent_jobs,
            is_processing: self.is_processing(),
            status_counts,
        })
    }
}

impl QueueInner {
    async fn tick(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        while workers.try_join_next().is_some() {}

        if workers.len() >= self.config.max_concurrent_jobs {
            return Ok(());
        }

        let Some(job) = self.store.claim_next_ready(Utc::now()).await? else {
            return Ok(());
        };
        debug!(
            job_id = job.id,
            job_type = %job.job_type,
            attempt = job.current_attempts,
            worker_id = job.worker_id.as_deref().unwrap_or(""),
            "claimed job"
        );
        let _ = self.events.send(QueueEvent::Started {
            id: job.id,
            job_type: job.job_type.clone(),
        });

        let handler = self.registry.read().await.resolve(&job.job_type);
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        workers.spawn(execute_job(store, events, handler, job));

        Ok(())
    }
}

/// Runs one claimed job to its outcome. Every branch is contained: nothing
/// raised here escapes into the dispatch loop.
async fn execute_job(
    store: Arc<dyn JobStore>,
    events: broadcast::Sender<QueueEvent>,
    handler: Option<JobHandler>,
    job: Job,
) {
    let job_id = job.id;
    let job_type = job.job_type.clone();

    let Some(handler) = handler else {
        // Retrying cannot help a job nobody can execute.
        let message = format!("no handler registered for job type: {}", job_type);
        warn!(job_id, job_type = %job_type, "failing job with unknown type");
        match store.fail_job(job_id, &message, Utc::now()).await {
            Ok(_) => {
                let _ = events.send(QueueEvent::Failed {
                    id: job_id,
                    job_type,
                    error: message,
                });
            }
            Err(err) => error!(job_id, error = %err, "failed to mark job as failed"),
        }
        return;
    };

    debug!(job_id, job_type = %job_type, attempt = job.current_attempts, "processing job");
    match handler(job.clone()).await {
        Ok(()) => match store.complete_job(job_id, Utc::now()).await {
            Ok(true) => {
                info!(job_id, job_type = %job_type, "job completed");
                let _ = events.send(QueueEvent::Completed {
                    id: job_id,
                    job_type,
                });
            }
            Ok(false) => {
                debug!(job_id, "job no longer processing, completion skipped");
            }
            Err(err) => error!(job_id, error = %err, "failed to mark job as completed"),
        },
        Err(err) => {
            let message = err.to_string();
            warn!(
                job_id,
                job_type = %job_type,
                attempt = job.current_attempts,
                max_attempts = job.max_attempts,
                error = %message,
                "job attempt failed"
            );

            if job.has_attempts_remaining() {
                let run_at = Utc::now() + job.retry_backoff();
                match store.reschedule_retry(job_id, run_at, &message).await {
                    Ok(true) => {
                        info!(
                            job_id,
                            retry_at = %run_at,
                            attempt = job.current_attempts,
                            max_attempts = job.max_attempts,
                            "job scheduled for retry"
                        );
                        let _ = events.send(QueueEvent::Retried {
                            id: job_id,
                            job_type,
                            run_at,
                        });
                    }
                    Ok(false) => {
                        debug!(job_id, "job no longer processing, retry skipped");
                    }
                    Err(err) => error!(job_id, error = %err, "failed to schedule job retry"),
                }
            } else {
                match store.fail_job(job_id, &message, Utc::now()).await {
                    Ok(true) => {
                        let _ = events.send(QueueEvent::Failed {
                            id: job_id,
                            job_type,
                            error: message,
                        });
                    }
                    Ok(false) => {
                        debug!(job_id, "job no longer processing, failure skipped");
                    }
                    Err(err) => error!(job_id, error = %err, "failed to mark job as failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryJobStore;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryJobStore::new()))
    }

    #[tokio::test]
    async fn test_stats_reflect_engine_state() {
        let queue = queue();
        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.max_concurrent_jobs, 3);
        assert!(!stats.is_processing);
        assert!(stats.status_counts.is_empty());
    }

    #[tokio::test]
    async fn test_start_processing_is_idempotent() {
        let queue = queue();
        queue.start_processing().await;
        queue.start_processing().await;
        assert!(queue.is_processing());
        queue.stop_processing().await;
        assert!(!queue.is_processing());
        // Stopping again is harmless.
        queue.stop_processing().await;
    }

    #[tokio::test]
    async fn test_clones_share_engine_state() {
        let queue = queue();
        let clone = queue.clone();
        clone.start_processing().await;
        assert!(queue.is_processing());
        queue.stop_processing().await;
        assert!(!clone.is_processing());
    }

    #[tokio::test]
    async fn test_tick_on_empty_store_is_a_noop() {
        let queue = queue();
        queue.tick().await.unwrap();
        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.active_workers, 0);
    }
}
