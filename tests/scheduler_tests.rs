//! Scheduler integration tests: triggers firing into the queue, replacement,
//! and removal.

mod test_utils;

use std::time::Duration;

use capstan::{JobFilter, JobScheduler};
use serde_json::json;

use test_utils::manual_queue;

#[tokio::test]
async fn test_trigger_enqueues_jobs() {
    let queue = manual_queue();
    let scheduler = JobScheduler::new(queue.clone());

    scheduler
        .schedule_job("heartbeat", "* * * * * *", "heartbeat", json!({"beat": true}))
        .unwrap();

    // An every-second trigger fires at least once in 2.4s.
    tokio::time::sleep(Duration::from_millis(2400)).await;
    scheduler.shutdown();

    let jobs = queue
        .list_jobs(JobFilter::new().with_job_type("heartbeat"))
        .await
        .unwrap();
    assert!(!jobs.is_empty());
    assert_eq!(jobs[0].payload, json!({"beat": true}));
    // Trigger fires enqueue with default options.
    assert_eq!(jobs[0].priority, 0);
    assert_eq!(jobs[0].max_attempts, 3);

    queue.stop_processing().await;
}

#[tokio::test]
async fn test_unschedule_stops_firing() {
    let queue = manual_queue();
    let scheduler = JobScheduler::new(queue.clone());

    scheduler
        .schedule_job("heartbeat", "* * * * * *", "heartbeat", json!({}))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1300)).await;

    assert!(scheduler.unschedule_job("heartbeat"));
    // Let any in-flight enqueue settle before counting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let count_after_stop = queue.list_jobs(JobFilter::default()).await.unwrap().len();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let count_later = queue.list_jobs(JobFilter::default()).await.unwrap().len();
    assert_eq!(count_later, count_after_stop);

    queue.stop_processing().await;
}

#[tokio::test]
async fn test_replacement_installs_new_expression() {
    let queue = manual_queue();
    let scheduler = JobScheduler::new(queue.clone());

    scheduler
        .schedule_job("nightly", "0 0 2 * * *", "cleanup", json!({}))
        .unwrap();
    scheduler
        .schedule_job("nightly", "0 30 3 * * *", "cleanup", json!({}))
        .unwrap();

    let details = scheduler.get_scheduled_job_details();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].name, "nightly");
    assert_eq!(details[0].expression, "0 30 3 * * *");
    assert!(details[0].running);

    queue.stop_processing().await;
}

#[tokio::test]
async fn test_details_report_next_run() {
    let queue = manual_queue();
    let scheduler = JobScheduler::new(queue.clone());

    scheduler
        .schedule_job("daily", "0 0 2 * * *", "cleanup", json!({}))
        .unwrap();
    // The trigger task computes its next fire time asynchronously.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let details = scheduler.get_scheduled_job_details();
    assert_eq!(details.len(), 1);
    let next = details[0].next_run_at.expect("next fire time computed");
    let lead = next - chrono::Utc::now();
    assert!(lead > chrono::Duration::zero());
    assert!(lead <= chrono::Duration::hours(24));
    assert!(details[0].last_run_at.is_none());

    queue.stop_processing().await;
}
