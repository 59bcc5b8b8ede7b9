//! Monitor integration tests: metrics, stuck-job detection, health, and
//! per-job logs, all against the same store the queue writes to.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use capstan::{
    CapstanError, JobMonitor, JobOptions, JobStatus, LogLevel, MonitorConfig, MonitorEvent,
};
use serde_json::json;
use tokio::sync::Semaphore;

use test_utils::manual_queue;

fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        stuck_threshold: Duration::from_millis(50),
        ..MonitorConfig::default()
    }
}

#[tokio::test]
async fn test_metrics_reflect_outcomes() {
    let queue = manual_queue();
    let monitor = JobMonitor::new(Arc::clone(queue.store()));

    queue
        .register_handler_fn("ok", |_job| async { Ok(()) })
        .await;
    queue
        .register_handler_fn("bad", |_job| async {
            Err(CapstanError::Processing("boom".to_string()))
        })
        .await;

    queue
        .add_job("ok", json!({}), JobOptions::default())
        .await
        .unwrap();
    queue
        .add_job("bad", json!({}), JobOptions::new().with_max_attempts(1))
        .await
        .unwrap();
    queue.tick().await.unwrap();
    queue.tick().await.unwrap();
    queue.stop_processing().await;

    let metrics = monitor.collect_metrics().await.unwrap();
    assert_eq!(metrics.status_counts.get(&JobStatus::Completed), Some(&1));
    assert_eq!(metrics.status_counts.get(&JobStatus::Failed), Some(&1));
    assert_eq!(metrics.failure_rate.total, 2);
    assert_eq!(metrics.failure_rate.failed, 1);
    assert!(metrics.avg_processing_time_ms >= 0.0);

    let period = monitor.get_metrics_for_period(24).await.unwrap();
    assert_eq!(period.period_hours, 24);
    assert_eq!(period.metrics.len(), 2);
}

#[tokio::test]
async fn test_stuck_job_detection_flags_only_old_processing_jobs() {
    let queue = manual_queue();
    let monitor = JobMonitor::with_config(Arc::clone(queue.store()), monitor_config());

    let gate = Arc::new(Semaphore::new(0));
    let waiting = Arc::clone(&gate);
    queue
        .register_handler_fn("slow", move |_job| {
            let waiting = Arc::clone(&waiting);
            async move {
                let _permit = waiting
                    .acquire()
                    .await
                    .map_err(|_| CapstanError::Processing("gate closed".to_string()))?;
                Ok(())
            }
        })
        .await;
    queue
        .register_handler_fn("fast", |_job| async { Ok(()) })
        .await;

    let slow = queue
        .add_job("slow", json!({}), JobOptions::default())
        .await
        .unwrap();
    let fast = queue
        .add_job("fast", json!({}), JobOptions::default())
        .await
        .unwrap();
    queue.tick().await.unwrap();
    queue.tick().await.unwrap();

    // Freshly claimed: not yet past the stuck threshold.
    assert!(monitor.find_stuck_jobs().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let stuck = monitor.find_stuck_jobs().await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, slow);

    // A stuck job makes the system unhealthy regardless of failure rate.
    let health = monitor.get_health_status().await.unwrap();
    assert!(!health.healthy);
    assert_eq!(health.stuck_jobs, 1);

    gate.add_permits(1);
    queue.stop_processing().await;

    // Completed jobs are never flagged, however old.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(monitor.find_stuck_jobs().await.unwrap().is_empty());
    assert_eq!(
        queue.get_job(fast).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_health_tracks_failure_rate() {
    let queue = manual_queue();
    let monitor = JobMonitor::new(Arc::clone(queue.store()));

    queue
        .register_handler_fn("ok", |_job| async { Ok(()) })
        .await;
    queue
        .register_handler_fn("bad", |_job| async {
            Err(CapstanError::Processing("boom".to_string()))
        })
        .await;

    queue
        .add_job("bad", json!({}), JobOptions::new().with_max_attempts(1))
        .await
        .unwrap();
    queue.tick().await.unwrap();
    queue.stop_processing().await;

    // 1 started, 1 failed: 100% failure rate in the trailing hour.
    let health = monitor.get_health_status().await.unwrap();
    assert!(!health.healthy);
    assert_eq!(health.failure_percentage, 100.0);
    assert_eq!(health.stuck_jobs, 0);

    // Two successes dilute the rate below the 50% threshold.
    for _ in 0..2 {
        queue
            .add_job("ok", json!({}), JobOptions::default())
            .await
            .unwrap();
        queue.tick().await.unwrap();
        queue.stop_processing().await;
    }

    let health = monitor.get_health_status().await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.failure_percentage, 33.33);
    assert_eq!(health.recent_activity, 3);
}

#[tokio::test]
async fn test_job_logs_round_trip() {
    let queue = manual_queue();
    let monitor = JobMonitor::new(Arc::clone(queue.store()));

    let id = queue
        .add_job("echo", json!({}), JobOptions::default())
        .await
        .unwrap();

    monitor
        .log_job_event(id, LogLevel::Info, "collection started", json!({"page": 1}))
        .await
        .unwrap();
    monitor
        .log_job_event(id, LogLevel::Warn, "rate limited", json!({"retry_in": 30}))
        .await
        .unwrap();
    monitor
        .log_job_event(id, LogLevel::Error, "gave up", json!({}))
        .await
        .unwrap();

    let logs = monitor.get_job_logs(id, 2).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].message, "gave up");
    assert_eq!(logs[0].level, LogLevel::Error);
    assert_eq!(logs[1].message, "rate limited");
    assert_eq!(logs[1].metadata, json!({"retry_in": 30}));

    let all = monitor.get_job_logs(id, 100).await.unwrap();
    assert_eq!(all.len(), 3);

    queue.stop_processing().await;
}

#[tokio::test]
async fn test_monitoring_loop_publishes_metrics() {
    let queue = manual_queue();
    let config = MonitorConfig {
        sample_interval: Duration::from_millis(50),
        ..MonitorConfig::default()
    };
    let monitor = JobMonitor::with_config(Arc::clone(queue.store()), config);
    let mut events = monitor.subscribe();

    monitor.start_monitoring().await;
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("metrics sample within interval")
        .unwrap();
    match event {
        MonitorEvent::Metrics(metrics) => {
            assert_eq!(metrics.failure_rate.total, 0);
        }
        MonitorEvent::StuckJobs(_) => panic!("no stuck jobs expected"),
    }
    monitor.stop_monitoring().await;

    queue.stop_processing().await;
}
