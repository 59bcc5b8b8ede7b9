//! # Capstan
//!
//! A durable, database-driven job lifecycle engine with priority dispatch,
//! exponential-backoff retries, cron scheduling, and store-backed health
//! monitoring.
//!
//! ## Features
//!
//! - **Polling dispatch**: a single timer loop claims ready jobs and runs
//!   each as an independent task under a fixed concurrency ceiling
//! - **Retries with backoff**: failed attempts are re-queued with
//!   exponentially growing delays until attempts are exhausted
//! - **Priority + fairness**: highest priority first, ties broken by earliest
//!   start with never-started jobs ahead
//! - **Cron triggers**: named, replaceable recurring enqueues with timezone
//!   support
//! - **Monitoring**: status distributions, stuck-job detection, per-job
//!   structured logs, and a derived health verdict
//! - **Pluggable store**: PostgreSQL backend plus an in-process store with
//!   identical semantics for tests and embedders
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capstan::{JobOptions, JobQueue, MemoryJobStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> capstan::Result<()> {
//!     let queue = JobQueue::new(Arc::new(MemoryJobStore::new()));
//!
//!     queue
//!         .register_handler_fn("send_email", |job| async move {
//!             println!("sending: {}", job.payload);
//!             Ok(())
//!         })
//!         .await;
//!
//!     let job_id = queue
//!         .add_job("send_email", json!({"to": "ops@example.com"}), JobOptions::default())
//!         .await?;
//!     println!("queued job {job_id}");
//!
//!     // ... let the poll loop work, then drain gracefully.
//!     queue.stop_processing().await;
//!     Ok(())
//! }
//! ```
//!
//! Against PostgreSQL, build the store from configuration instead:
//!
//! ```rust,no_run
//! # async fn connect() -> capstan::Result<()> {
//! use capstan::{EngineConfig, PostgresJobStore};
//!
//! let config = EngineConfig::from_toml_file("capstan.toml")?;
//! let store = PostgresJobStore::connect(&config.database).await?;
//! store.create_tables().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A job is a row in the store: a job-type string selecting its handler, a
//! JSON payload passed through verbatim, a priority, retry bookkeeping, and
//! engine-stamped timestamps. Jobs move `pending -> processing` when claimed,
//! then to `completed`, back to `pending` (retry with backoff), or to
//! `failed`; users can cancel non-terminal jobs and re-queue failed ones.
//!
//! ### The engine
//!
//! [`JobQueue`] owns all transitions out of `pending` and `processing`.
//! Handler errors never escape the dispatch loop, and store errors during a
//! tick pause it briefly at most; the loop stops only on
//! [`JobQueue::stop_processing`], which drains in-flight workers before
//! returning.
//!
//! ### Scheduler and monitor
//!
//! [`JobScheduler`] turns cron expressions into periodic `add_job` calls.
//! [`JobMonitor`] samples the same store on its own timer for metrics,
//! stuck-job detection, and health, and owns the per-job structured logs.

pub mod config;
pub mod cron;
pub mod error;
pub mod events;
pub mod job;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use config::{DatabaseConfig, EngineConfig, MonitorConfig, QueueConfig};
pub use cron::{CronError, CronSchedule};
pub use error::CapstanError;
pub use events::{MonitorEvent, QueueEvent};
pub use job::{Job, JobId, JobOptions, JobStatus, NewJob};
pub use monitor::JobMonitor;
pub use queue::JobQueue;
pub use registry::{HandlerRegistry, JobHandler};
pub use scheduler::{JobScheduler, ScheduleInfo};
pub use stats::{
    FailureWindow, HealthStatus, JobMetrics, PeriodMetrics, QueueStats, StatusPeriodStats,
};
pub use store::memory::MemoryJobStore;
pub use store::{JobFilter, JobLogEntry, JobStore, LogLevel, NewLogEntry};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresJobStore;

/// Convenient type alias for Results with [`CapstanError`] as the error type.
pub type Result<T> = std::result::Result<T, CapstanError>;
