//! Maps job-type strings to the async handlers that execute them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::Result;
use crate::job::Job;

/// Asynchronous unit of work invoked for each claimed job. Handlers receive
/// the claimed row (payload included) and report success or failure; the
/// engine owns all state transitions around the call.
pub type JobHandler = Arc<
    dyn Fn(Job) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// Registry of job handlers, keyed by job type. One handler per type, last
/// registration wins. Absence of a handler at dispatch time is a terminal
/// failure for the job.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: JobHandler) {
        let job_type = job_type.into();
        debug!(job_type = %job_type, "registered job handler");
        self.handlers.insert(job_type, handler);
    }

    /// Register a plain async closure without writing the boxing out by hand.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(job_type, Arc::new(move |job| Box::pin(f(job))));
    }

    /// Register a handler that takes the payload deserialized into `T`. A
    /// payload that does not match `T` fails the attempt like any other
    /// handler error.
    pub fn register_payload<T, F, Fut>(&mut self, job_type: impl Into<String>, f: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job: Job| {
            let fut: Pin<Box<dyn Future<Output = Result<()>> + Send>> =
                match serde_json::from_value::<T>(job.payload.clone()) {
                    Ok(payload) => Box::pin(f(payload)),
                    Err(err) => Box::pin(std::future::ready(Err(err.into()))),
                };
            fut
        });
        self.register(job_type, handler);
    }

    pub fn resolve(&self, job_type: &str) -> Option<JobHandler> {
        self.handlers.get(job_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapstanError;
    use crate::job::JobStatus;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn job_with_payload(payload: serde_json::Value) -> Job {
        Job {
            id: 1,
            job_type: "test".to_string(),
            status: JobStatus::Processing,
            priority: 0,
            payload,
            current_attempts: 1,
            max_attempts: 3,
            retry_delay_ms: 5000,
            scheduled_at: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
            worker_id: None,
            parent_job_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        registry.register_fn("echo", |_job| async { Ok(()) });

        assert_eq!(registry.len(), 1);
        let handler = registry.resolve("echo").expect("handler registered");
        handler(job_with_payload(json!({}))).await.unwrap();
        assert!(registry.resolve("missing").is_none());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let calls = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        registry.register_fn("echo", |_job| async {
            Err(CapstanError::Processing("first handler".to_string()))
        });
        let seen = Arc::clone(&calls);
        registry.register_fn("echo", move |_job| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert_eq!(registry.len(), 1);
        let handler = registry.resolve("echo").unwrap();
        handler(job_with_payload(json!({}))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_typed_payload_handler() {
        #[derive(Deserialize)]
        struct Collect {
            source: String,
            limit: u32,
        }

        let mut registry = HandlerRegistry::new();
        registry.register_payload("collect", |payload: Collect| async move {
            assert_eq!(payload.source, "stackoverflow");
            assert_eq!(payload.limit, 50);
            Ok(())
        });

        let handler = registry.resolve("collect").unwrap();
        handler(job_with_payload(json!({"source": "stackoverflow", "limit": 50})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_typed_payload_mismatch_is_a_handler_failure() {
        #[derive(Deserialize)]
        #[allow(dead_code)]
        struct Collect {
            source: String,
        }

        let mut registry = HandlerRegistry::new();
        registry.register_payload("collect", |_payload: Collect| async { Ok(()) });

        let handler = registry.resolve("collect").unwrap();
        let result = handler(job_with_payload(json!({"unexpected": true}))).await;
        assert!(matches!(result, Err(CapstanError::Serialization(_))));
    }

    #[test]
    fn test_registered_types_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("cleanup", |_job| async { Ok(()) });
        registry.register_fn("collect", |_job| async { Ok(()) });
        registry.register_fn("backfill", |_job| async { Ok(()) });

        assert_eq!(registry.registered_types(), vec!["backfill", "cleanup", "collect"]);
    }
}
