//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use capstan::{JobQueue, MemoryJobStore, QueueConfig};

/// Queue over a fresh in-process store with the given poll interval.
pub fn queue_with_poll(poll_interval: Duration) -> JobQueue {
    let config = QueueConfig {
        poll_interval,
        ..QueueConfig::default()
    };
    JobQueue::with_config(Arc::new(MemoryJobStore::new()), config)
}

/// Queue whose poll loop is effectively inert, for tests that drive dispatch
/// through explicit `tick()` calls.
pub fn manual_queue() -> JobQueue {
    queue_with_poll(Duration::from_secs(3600))
}
