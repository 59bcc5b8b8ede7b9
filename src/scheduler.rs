//! Named cron triggers that enqueue jobs through the queue engine.
//!
//! The scheduler holds no execution logic of its own: each trigger is a timer
//! task that sleeps until the next fire time and calls `add_job` with the
//! trigger's payload template. Registering under an existing name destroys
//! the previous trigger before installing the new one, so two triggers never
//! run under the same name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::Result;
use crate::cron::CronSchedule;
use crate::job::JobOptions;
use crate::queue::JobQueue;

/// Snapshot of one registered trigger.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub name: String,
    pub expression: String,
    pub job_type: String,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct TriggerState {
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
}

struct ScheduleEntry {
    expression: String,
    job_type: String,
    state: Arc<Mutex<TriggerState>>,
    handle: JoinHandle<()>,
}

pub struct JobScheduler {
    queue: JobQueue,
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl JobScheduler {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace, by name) a recurring trigger. Each fire enqueues
    /// `job_type` with the payload template and default options.
    pub fn schedule_job(
        &self,
        name: &str,
        expression: &str,
        job_type: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let schedule = CronSchedule::new(expression)?;

        let mut entries = self.entries.lock().unwrap();
        if let Some(previous) = entries.remove(name) {
            previous.handle.abort();
            info!(schedule = name, "replaced existing trigger");
        }

        let state = Arc::new(Mutex::new(TriggerState::default()));
        let task_state = Arc::clone(&state);
        let queue = self.queue.clone();
        let trigger_name = name.to_string();
        let trigger_type = job_type.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.next_execution(Utc::now()) else {
                    warn!(
                        schedule = %trigger_name,
                        "cron expression yields no future fire time, stopping trigger"
                    );
                    break;
                };
                task_state.lock().unwrap().next_run_at = Some(next);

                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(wait).await;
                task_state.lock().unwrap().last_run_at = Some(Utc::now());

                info!(schedule = %trigger_name, job_type = %trigger_type, "executing scheduled trigger");
                if let Err(err) = queue
                    .add_job(&trigger_type, payload.clone(), JobOptions::default())
                    .await
                {
                    error!(schedule = %trigger_name, error = %err, "scheduled enqueue failed");
                }
            }
        });

        entries.insert(
            name.to_string(),
            ScheduleEntry {
                expression: expression.to_string(),
                job_type: job_type.to_string(),
                state,
                handle,
            },
        );
        info!(schedule = name, expression, job_type, "scheduled trigger");
        Ok(())
    }

    /// Destroy and remove the named trigger. False if no such trigger.
    pub fn unschedule_job(&self, name: &str) -> bool {
        match self.entries.lock().unwrap().remove(name) {
            Some(entry) => {
                entry.handle.abort();
                info!(schedule = name, "unscheduled trigger");
                true
            }
            None => false,
        }
    }

    pub fn get_scheduled_jobs(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_scheduled_job_details(&self) -> Vec<ScheduleInfo> {
        let entries = self.entries.lock().unwrap();
        let mut details: Vec<ScheduleInfo> = entries
            .iter()
            .map(|(name, entry)| {
                let state = entry.state.lock().unwrap();
                ScheduleInfo {
                    name: name.clone(),
                    expression: entry.expression.clone(),
                    job_type: entry.job_type.clone(),
                    running: !entry.handle.is_finished(),
                    last_run_at: state.last_run_at,
                    next_run_at: state.next_run_at,
                }
            })
            .collect();
        details.sort_by(|a, b| a.name.cmp(&b.name));
        details
    }

    /// Abort every trigger task. Used on shutdown.
    pub fn shutdown(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (name, entry) in entries.drain() {
            entry.handle.abort();
            info!(schedule = %name, "stopped trigger");
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        // Trigger tasks must not outlive the scheduler that owns them.
        if let Ok(mut entries) = self.entries.lock() {
            for (_, entry) in entries.drain() {
                entry.handle.abort();
            }
        }
    }
}
