//! Durable job queue.
//!
//! - **Producer**: idempotent enqueue keyed by `(job_type, idempotency_key)`
//! - **Store**: the source of truth, in Redis or in memory, with lease-guarded transitions
//! - **Worker**: lease slots, bounded retries with exponential backoff, graceful shutdown
//! - **Reaper**: returns jobs whose lease lapsed to `pending`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   enqueue    ┌──────────────┐    lease     ┌──────────────┐
//! │  JobProducer │─────────────▶│   JobStore   │◀────────────▶│  JobWorker   │
//! └──────────────┘              │ (Redis/mem)  │  ack / nack  │  N slots     │
//!                               └──────────────┘              └──────┬───────┘
//!                                      ▲                             │ events
//!                                      │ reclaim_expired             ▼
//!                               ┌──────┴───────┐              ┌──────────────┐
//!                               │    Reaper    │              │   Monitor    │
//!                               └──────────────┘              └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_core::jobs::{JobContext, JobHandler, JobProducer, JobResult, JobWorker};
//!
//! struct SendFax;
//!
//! #[async_trait]
//! impl JobHandler for SendFax {
//!     async fn handle(&self, ctx: &JobContext) -> JobResult {
//!         ctx.report_progress(50).await;
//!         Ok(())
//!     }
//! }
//!
//! let producer = JobProducer::new(store.clone(), 3);
//! producer.enqueue("fax", "fax-123", &json!({ "to": "+15551234567" })).await?;
//!
//! let worker = JobWorker::builder(store).handler("fax", Arc::new(SendFax)).build();
//! let handle = worker.start();
//! // ...
//! handle.shutdown().await;
//! ```

pub mod delivery;
pub mod events;
pub mod job;
pub mod producer;
pub mod redis_store;
pub mod retry;
pub mod store;
pub mod worker;

pub use delivery::HttpDeliveryHandler;
pub use events::{EventPublisher, WorkerEvent};
pub use job::{
    Job, JobContext, JobError, JobHandler, JobId, JobResult, JobStatus, LeaseToken, NewJob,
    ProgressReporter,
};
pub use producer::{EnqueueRequest, JobProducer};
pub use redis_store::RedisJobStore;
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{
    EnqueueOutcome, InMemoryJobStore, JobStore, QueueDepths, ReclaimOutcome, ReclaimedJob,
    LEASE_EXPIRED_ERROR,
};
pub use worker::{JobWorker, JobWorkerBuilder, ShutdownReport, WorkerConfig, WorkerHandle, WorkerStats};
