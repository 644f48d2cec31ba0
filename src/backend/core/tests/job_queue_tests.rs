//! Integration tests for the job queue against the in-memory store.
//!
//! Tests cover:
//! - Idempotent enqueue under concurrency
//! - Bounded retries and fatal errors
//! - Handler panics
//! - Stalled-job reclaim by a second worker
//! - Lease compare-and-set
//! - Graceful and forced shutdown
//! - Lifecycle events

use async_trait::async_trait;
use chrono::Utc;
use relay_core::error::ErrorCode;
use relay_core::jobs::{
    EventPublisher, InMemoryJobStore, JobContext, JobError, JobHandler, JobProducer, JobResult,
    JobStatus, JobStore, JobWorker, RetryPolicy, WorkerConfig, WorkerEvent, LEASE_EXPIRED_ERROR,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

/// Fails every attempt with a numbered message.
#[derive(Default)]
struct AlwaysFails {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for AlwaysFails {
    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(JobError::retryable(format!("modem busy #{}", call)))
    }
}

#[derive(Default)]
struct Succeeds {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for Succeeds {
    async fn handle(&self, ctx: &JobContext) -> JobResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.report_progress(50).await;
        Ok(())
    }
}

struct Panics;

#[async_trait]
impl JobHandler for Panics {
    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        panic!("paper jam");
    }
}

struct Sleeps(Duration);

#[async_trait]
impl JobHandler for Sleeps {
    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

fn no_backoff() -> RetryPolicy {
    RetryPolicy::new(Duration::ZERO, Duration::ZERO)
}

fn store() -> Arc<InMemoryJobStore> {
    Arc::new(InMemoryJobStore::new())
}

// ============================================================================
// Enqueue
// ============================================================================

#[tokio::test]
async fn test_concurrent_enqueue_same_key_yields_one_job() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 3);

    let calls = (0..16).map(|_| {
        let producer = producer.clone();
        tokio::spawn(async move {
            producer
                .enqueue("fax", "fax-123", &json!({ "to": "+15551234567" }))
                .await
                .unwrap()
        })
    });
    let ids: Vec<_> = futures::future::join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_terminal_job_releases_its_key() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 3);
    let worker = JobWorker::builder(store.clone())
        .handler("fax", Arc::new(Succeeds::default()))
        .build();

    let first = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();
    assert!(worker.process_next().await.unwrap());

    let second = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(store.get(first).await.unwrap().unwrap().status, JobStatus::Completed);
    assert_eq!(store.get(second).await.unwrap().unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_enqueue_surfaces_store_outage() {
    let store = store();
    store.set_available(false);
    let producer = JobProducer::new(store, 3);

    let error = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::StoreUnavailable);
    assert!(error.is_retryable());
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_always_failing_handler_stops_at_max_attempts() {
    let store = store();
    let handler = Arc::new(AlwaysFails::default());
    let producer = JobProducer::new(store.clone(), 3);
    let worker = JobWorker::builder(store.clone())
        .retry_policy(no_backoff())
        .handler("fax", handler.clone())
        .build();

    let id = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();
    for _ in 0..3 {
        assert!(worker.process_next().await.unwrap());
    }
    assert!(!worker.process_next().await.unwrap());

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("modem busy #3 (code: HANDLER_FAILURE)"));
    assert!(job.finished_at.is_some());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    let stats = worker.stats();
    assert_eq!(stats.retried(), 2);
    assert_eq!(stats.failed(), 1);
}

#[tokio::test]
async fn test_job_attempt_limit_comes_from_the_job() {
    let store = store();
    let handler = Arc::new(AlwaysFails::default());
    let producer = JobProducer::new(store.clone(), 5);
    let worker = JobWorker::builder(store.clone())
        .retry_policy(no_backoff())
        .handler("fax", handler.clone())
        .build();

    let defaulted = producer.enqueue("fax", "fax-default", &json!({})).await.unwrap();
    let explicit = producer
        .submit(relay_core::jobs::EnqueueRequest {
            job_type: "fax".to_string(),
            idempotency_key: "fax-explicit".to_string(),
            payload: json!({}),
            max_attempts: Some(2),
        })
        .await
        .unwrap();

    while worker.process_next().await.unwrap() {}

    let defaulted = store.get(defaulted).await.unwrap().unwrap();
    assert_eq!(defaulted.status, JobStatus::Failed);
    assert_eq!(defaulted.attempts, 5);
    let explicit = store.get(explicit.job_id).await.unwrap().unwrap();
    assert_eq!(explicit.status, JobStatus::Failed);
    assert_eq!(explicit.attempts, 2);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn test_retry_waits_for_backoff() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 3);
    let worker = JobWorker::builder(store.clone())
        .retry_policy(RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(60)))
        .handler("fax", Arc::new(AlwaysFails::default()))
        .build();

    let id = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();
    assert!(worker.process_next().await.unwrap());
    assert!(!worker.process_next().await.unwrap());

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.run_at > Utc::now() + chrono::Duration::seconds(50));
}

#[tokio::test]
async fn test_fatal_error_skips_remaining_attempts() {
    struct Rejects;

    #[async_trait]
    impl JobHandler for Rejects {
        async fn handle(&self, _ctx: &JobContext) -> JobResult {
            Err(JobError::fatal("invalid fax number").with_code("INVALID_NUMBER"))
        }
    }

    let store = store();
    let producer = JobProducer::new(store.clone(), 5);
    let worker = JobWorker::builder(store.clone())
        .retry_policy(no_backoff())
        .handler("fax", Arc::new(Rejects))
        .build();

    let id = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();
    assert!(worker.process_next().await.unwrap());

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("invalid fax number (code: INVALID_NUMBER)"));
}

#[tokio::test]
async fn test_handler_panic_becomes_retryable_failure() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 3);
    let worker = JobWorker::builder(store.clone())
        .retry_policy(no_backoff())
        .handler("fax", Arc::new(Panics))
        .build();

    let id = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();
    assert!(worker.process_next().await.unwrap());

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("paper jam"));
}

#[tokio::test]
async fn test_progress_never_moves_backwards() {
    struct Regresses;

    #[async_trait]
    impl JobHandler for Regresses {
        async fn handle(&self, ctx: &JobContext) -> JobResult {
            assert_eq!(ctx.report_progress(60).await, 60);
            assert_eq!(ctx.report_progress(30).await, 60);
            assert_eq!(ctx.report_progress(250).await, 100);
            Err(JobError::retryable("try again"))
        }
    }

    let store = store();
    let producer = JobProducer::new(store.clone(), 3);
    let worker = JobWorker::builder(store.clone())
        .retry_policy(no_backoff())
        .handler("fax", Arc::new(Regresses))
        .build();

    let id = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();
    worker.process_next().await.unwrap();
    assert_eq!(store.get(id).await.unwrap().unwrap().progress, 100);
}

// ============================================================================
// Stalled Jobs
// ============================================================================

#[tokio::test]
async fn test_crashed_lease_is_reclaimed_and_completed_elsewhere() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 3);
    let id = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();

    // A worker leases and dies without acking.
    let crashed = store
        .lease("fax", "crashed-worker", Duration::ZERO, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(crashed.id, id);

    let handler = Arc::new(Succeeds::default());
    let survivor = JobWorker::builder(store.clone())
        .handler("fax", handler.clone())
        .build();

    let reclaimed = survivor.reap().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].job_id, id);
    assert_eq!(reclaimed[0].attempts, 1);

    let pending = store.get(id).await.unwrap().unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert_eq!(pending.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));

    assert!(survivor.process_next().await.unwrap());
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(survivor.stats().reclaimed(), 1);
}

#[tokio::test]
async fn test_reclaim_of_last_attempt_fails_the_job() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 3);
    let outcome = producer
        .submit(relay_core::jobs::EnqueueRequest {
            job_type: "fax".to_string(),
            idempotency_key: "fax-123".to_string(),
            payload: json!({}),
            max_attempts: Some(1),
        })
        .await
        .unwrap();

    store
        .lease("fax", "crashed-worker", Duration::ZERO, Utc::now())
        .await
        .unwrap();
    let worker = JobWorker::builder(store.clone())
        .handler("fax", Arc::new(Succeeds::default()))
        .build();
    worker.reap().await.unwrap();

    let job = store.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_stale_lease_cannot_ack() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 3);
    producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();

    let job = store
        .lease("fax", "slow-worker", Duration::ZERO, Utc::now())
        .await
        .unwrap()
        .unwrap();
    let stale = job.lease().unwrap();
    store.reclaim_expired(Utc::now(), 10).await.unwrap();

    let error = store.complete(&stale, Utc::now()).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::LeaseLost);
    assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
}

// ============================================================================
// Running Worker
// ============================================================================

#[tokio::test]
async fn test_started_worker_drains_queue_and_stops_gracefully() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 3);
    let handler = Arc::new(Succeeds::default());
    let config = WorkerConfig {
        concurrency: 4,
        poll_interval: Duration::from_millis(10),
        ..WorkerConfig::default()
    };
    let worker = JobWorker::builder(store.clone())
        .config(config)
        .handler("fax", handler.clone())
        .build();

    for i in 0..20 {
        producer.enqueue("fax", &format!("fax-{}", i), &json!({ "n": i })).await.unwrap();
    }

    let handle = worker.start();
    for _ in 0..200 {
        if handle.stats().succeeded() == 20 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let report = handle.shutdown().await;

    assert!(report.graceful);
    assert_eq!(report.aborted_slots, 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 20);
    assert_eq!(store.queue_depths().await.unwrap().total_pending(), 0);
}

#[tokio::test]
async fn test_shutdown_timeout_leaves_job_processing() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 3);
    let config = WorkerConfig {
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(50),
        ..WorkerConfig::default()
    };
    let worker = JobWorker::builder(store.clone())
        .config(config)
        .handler("fax", Arc::new(Sleeps(Duration::from_secs(30))))
        .build();

    let id = producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();
    let handle = worker.start();
    for _ in 0..100 {
        if handle.stats().active() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let report = handle.shutdown().await;
    assert!(!report.graceful);
    assert_eq!(report.aborted_slots, 1);
    assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Processing);
}

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let store = store();
    let producer = JobProducer::new(store.clone(), 2);
    let (events, mut rx) = EventPublisher::channel(16);
    let worker = JobWorker::builder(store.clone())
        .retry_policy(RetryPolicy::new(Duration::ZERO, Duration::ZERO))
        .handler("fax", Arc::new(AlwaysFails::default()))
        .events(events)
        .build();

    producer.enqueue("fax", "fax-123", &json!({})).await.unwrap();
    worker.process_next().await.unwrap();
    worker.process_next().await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
        if let WorkerEvent::Failed { attempts, .. } = event {
            assert_eq!(attempts, 2);
        }
    }
    assert_eq!(kinds, vec!["leased", "retrying", "leased", "failed"]);
}
