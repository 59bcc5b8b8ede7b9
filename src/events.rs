//! Lifecycle notifications, decoupled from dispatch control flow.
//!
//! The queue engine and the monitor each expose a `subscribe()` handle backed
//! by a tokio broadcast channel. Subscribers that lag simply miss events;
//! nothing in the dispatch path ever blocks on a receiver.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{Job, JobId};
use crate::stats::JobMetrics;

/// Buffer size for lifecycle broadcast channels.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Emitted by the queue engine as jobs move through their lifecycle.
#[derive(Debug, Clone, Serialize)]
pub enum QueueEvent {
    Added {
        id: JobId,
        job_type: String,
    },
    Started {
        id: JobId,
        job_type: String,
    },
    Completed {
        id: JobId,
        job_type: String,
    },
    Failed {
        id: JobId,
        job_type: String,
        error: String,
    },
    Retried {
        id: JobId,
        job_type: String,
        run_at: DateTime<Utc>,
    },
    Cancelled {
        id: JobId,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            QueueEvent::Added { id, .. }
            | QueueEvent::Started { id, .. }
            | QueueEvent::Completed { id, .. }
            | QueueEvent::Failed { id, .. }
            | QueueEvent::Retried { id, .. }
            | QueueEvent::Cancelled { id } => *id,
        }
    }
}

/// Emitted by the monitor on each sampling pass.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Metrics(JobMetrics),
    StuckJobs(Vec<Job>),
}
