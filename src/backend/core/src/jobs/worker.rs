//! Job worker: lease slots, retry state machine and stalled-job reaper.
//!
//! Each lease slot loops: lease one due job of a registered type, run its
//! handler, then ack (`completed`) or nack (`pending` with backoff, or
//! `failed` once attempts are exhausted). A separate reaper returns jobs whose
//! lease lapsed to `pending`, counting the lapse as an attempt.

use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::events::{EventPublisher, WorkerEvent};
use super::job::{Job, JobContext, JobError, JobHandler, LeaseToken, ProgressReporter};
use super::retry::{RetryDecision, RetryPolicy};
use super::store::{JobStore, ReclaimOutcome, ReclaimedJob};
use crate::config::QueueConfig;
use crate::error::{ErrorCode, Result};
use crate::telemetry::metrics::JobMetrics;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix of the lease owner id
    pub name: String,
    /// Concurrent lease slots
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub reaper_interval: Duration,
    pub reap_batch_size: usize,
    /// How long in-flight jobs get to settle on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_queue_config(&QueueConfig::default())
    }
}

impl WorkerConfig {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            name: "relay-worker".to_string(),
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            lease_duration: config.lease_duration(),
            reaper_interval: config.reaper_interval(),
            reap_batch_size: config.reap_batch_size.max(1),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Handler runs finished (any outcome)
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    /// Failures sent back to pending
    pub retried: Arc<AtomicU64>,
    /// Failures that ended in `failed`
    pub failed: Arc<AtomicU64>,
    /// Jobs taken back from lapsed leases
    pub reclaimed: Arc<AtomicU64>,
    /// Currently running handlers
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

pub struct JobWorkerBuilder {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    policy: RetryPolicy,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    events: EventPublisher,
}

impl JobWorkerBuilder {
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register the handler for `job_type`, replacing any earlier one.
    pub fn handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> JobWorker {
        let mut job_types: Vec<String> = self.handlers.keys().cloned().collect();
        job_types.sort();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        JobWorker {
            inner: Arc::new(WorkerInner {
                id: format!("{}-{}", self.config.name, Uuid::new_v4().simple()),
                config: self.config,
                store: self.store,
                policy: self.policy,
                handlers: self.handlers,
                job_types,
                cursor: AtomicUsize::new(0),
                events: self.events,
                stats: WorkerStats::new(),
                shutdown_tx,
                shutdown_rx,
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

struct WorkerInner {
    id: String,
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    job_types: Vec<String>,
    cursor: AtomicUsize,
    events: EventPublisher,
    stats: WorkerStats,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Consumes jobs for the registered job types.
#[derive(Clone)]
pub struct JobWorker {
    inner: Arc<WorkerInner>,
}

impl JobWorker {
    pub fn builder(store: Arc<dyn JobStore>) -> JobWorkerBuilder {
        JobWorkerBuilder {
            store,
            config: WorkerConfig::default(),
            policy: RetryPolicy::default(),
            handlers: HashMap::new(),
            events: EventPublisher::default(),
        }
    }

    /// Lease owner id of this instance.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn stats(&self) -> WorkerStats {
        self.inner.stats.clone()
    }

    pub fn job_types(&self) -> &[String] {
        &self.inner.job_types
    }

    /// Lease and run at most one job. Returns whether a job was processed.
    pub async fn process_next(&self) -> Result<bool> {
        self.inner.process_next().await
    }

    /// Reclaim jobs whose lease expired.
    pub async fn reap(&self) -> Result<Vec<ReclaimedJob>> {
        self.inner.reap().await
    }

    /// Spawn the lease slots and the reaper.
    pub fn start(&self) -> WorkerHandle {
        let inner = &self.inner;
        info!(
            worker = %inner.id,
            concurrency = inner.config.concurrency,
            job_types = ?inner.job_types,
            "Job worker started"
        );

        let slots = (0..inner.config.concurrency)
            .map(|slot| tokio::spawn(run_slot(inner.clone(), slot, inner.shutdown_rx.clone())))
            .collect();
        let reaper = tokio::spawn(run_reaper(inner.clone(), inner.shutdown_rx.clone()));

        WorkerHandle {
            inner: inner.clone(),
            slots,
            reaper,
        }
    }
}

impl WorkerInner {
    async fn process_next(&self) -> Result<bool> {
        let count = self.job_types.len();
        if count == 0 {
            return Ok(false);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            let job_type = &self.job_types[(start + offset) % count];
            let leased = self
                .store
                .lease(job_type, &self.id, self.config.lease_duration, Utc::now())
                .await?;
            if let Some(job) = leased {
                self.execute(job).await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn execute(&self, job: Job) {
        let Some(lease) = job.lease() else {
            warn!(job_id = %job.id, "Store returned a job without a lease");
            return;
        };
        let attempt = job.current_attempt();

        self.events.publish(WorkerEvent::Leased {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt,
            at: Utc::now(),
        });

        let result = match self.handlers.get(&job.job_type) {
            Some(handler) => {
                self.stats.active.fetch_add(1, Ordering::Relaxed);
                let started = Instant::now();
                let result = self.run_handler(handler.clone(), &job).await;
                JobMetrics::record_duration(&job.job_type, started.elapsed());
                self.stats.active.fetch_sub(1, Ordering::Relaxed);
                result.map(|_| started.elapsed())
            }
            None => Err(JobError::fatal(format!(
                "no handler registered for job type '{}'",
                job.job_type
            ))
            .with_code(ErrorCode::NoHandlerRegistered.as_str())),
        };
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(elapsed) => self.settle_success(&job, &lease, elapsed).await,
            Err(error) => self.settle_failure(&job, &lease, error).await,
        }
    }

    async fn run_handler(&self, handler: Arc<dyn JobHandler>, job: &Job) -> std::result::Result<(), JobError> {
        let progress = ProgressReporter::new(job.id, job.progress, self.store.clone());
        let ctx = JobContext::new(job.clone(), progress, self.shutdown_rx.clone());
        let span = info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.current_attempt()
        );

        match AssertUnwindSafe(handler.handle(&ctx).instrument(span))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(|e| e.or_code(ErrorCode::HandlerFailure.as_str())),
            Err(panic) => Err(JobError::retryable(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))
            .with_code(ErrorCode::HandlerFailure.as_str())),
        }
    }

    async fn settle_success(&self, job: &Job, lease: &LeaseToken, elapsed: Duration) {
        match self.store.complete(lease, Utc::now()).await {
            Ok(()) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                JobMetrics::record_outcome(&job.job_type, "completed");
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.current_attempt(),
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                self.events.publish(WorkerEvent::Completed {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    attempts: job.attempts,
                    duration_ms: elapsed.as_millis() as u64,
                    at: Utc::now(),
                });
            }
            Err(e) if e.code() == ErrorCode::LeaseLost => {
                warn!(job_id = %job.id, job_type = %job.job_type, "Lease lost before ack; job was reclaimed");
            }
            Err(e) => {
                error!(job_id = %job.id, job_type = %job.job_type, error = %e, "Failed to ack job; leaving it to the reaper");
            }
        }
    }

    async fn settle_failure(&self, job: &Job, lease: &LeaseToken, failure: JobError) {
        let now = Utc::now();
        let attempts = job.attempts + 1;
        let error = failure.to_string();

        match self.policy.decide(attempts, job.max_attempts, failure.retryable) {
            RetryDecision::Retry { attempts, delay } => {
                let run_at = now + to_chrono(delay);
                match self.store.retry(lease, &error, run_at, now).await {
                    Ok(()) => {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                        JobMetrics::record_outcome(&job.job_type, "retried");
                        warn!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempts,
                            max_attempts = job.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Job failed, retry scheduled"
                        );
                        self.events.publish(WorkerEvent::Retrying {
                            job_id: job.id,
                            job_type: job.job_type.clone(),
                            attempts,
                            delay_ms: delay.as_millis() as u64,
                            error,
                            at: now,
                        });
                    }
                    Err(e) => self.nack_failed(job, e),
                }
            }
            RetryDecision::Exhausted { attempts } => {
                match self.store.fail(lease, &error, now).await {
                    Ok(()) => {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        JobMetrics::record_outcome(&job.job_type, "failed");
                        error!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempts,
                            retryable = failure.retryable,
                            error = %error,
                            "Job failed permanently"
                        );
                        self.events.publish(WorkerEvent::Failed {
                            job_id: job.id,
                            job_type: job.job_type.clone(),
                            attempts,
                            error,
                            at: now,
                        });
                    }
                    Err(e) => self.nack_failed(job, e),
                }
            }
        }
    }

    fn nack_failed(&self, job: &Job, e: crate::error::RelayError) {
        if e.code() == ErrorCode::LeaseLost {
            warn!(job_id = %job.id, job_type = %job.job_type, "Lease lost before nack; job was reclaimed");
        } else {
            error!(job_id = %job.id, job_type = %job.job_type, error = %e, "Failed to nack job; leaving it to the reaper");
        }
    }

    async fn reap(&self) -> Result<Vec<ReclaimedJob>> {
        let reclaimed = self
            .store
            .reclaim_expired(Utc::now(), self.config.reap_batch_size)
            .await?;

        for job in &reclaimed {
            let requeued = job.outcome == ReclaimOutcome::Requeued;
            self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
            JobMetrics::record_reclaimed(if requeued { "requeued" } else { "failed" });
            warn!(
                job_id = %job.job_id,
                job_type = %job.job_type,
                attempts = job.attempts,
                requeued,
                error_code = ErrorCode::LeaseExpired.as_str(),
                "Reclaimed stalled job"
            );
            self.events.publish(WorkerEvent::Stalled {
                job_id: job.job_id,
                job_type: job.job_type.clone(),
                attempts: job.attempts,
                requeued,
                at: Utc::now(),
            });
        }
        Ok(reclaimed)
    }
}

async fn run_slot(inner: Arc<WorkerInner>, slot: usize, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = %inner.id, slot, "Lease slot started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let worked = match inner.process_next().await {
            Ok(worked) => worked,
            Err(e) => {
                warn!(worker = %inner.id, slot, error = %e, "Lease attempt failed");
                false
            }
        };

        if !worked {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
            }
        }
    }
    debug!(worker = %inner.id, slot, "Lease slot stopped");
}

async fn run_reaper(inner: Arc<WorkerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.reaper_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = inner.reap().await {
                    warn!(worker = %inner.id, error = %e, "Reaper pass failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a worker shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// All slots finished within the timeout
    pub graceful: bool,
    /// Slots force-terminated with a job still in flight
    pub aborted_slots: usize,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
    slots: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn stats(&self) -> WorkerStats {
        self.inner.stats.clone()
    }

    /// Events the worker could not publish because the channel was full.
    pub fn events_dropped(&self) -> u64 {
        self.inner.events.dropped()
    }

    /// Stop leasing, give in-flight jobs the shutdown timeout to settle, then
    /// abort. Aborted jobs stay `processing` until a reaper reclaims them.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            inner,
            mut slots,
            reaper,
        } = self;

        inner.shutdown_tx.send_replace(true);
        reaper.abort();
        info!(worker = %inner.id, active = inner.stats.active(), "Worker shutting down");

        let timeout = inner.config.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, futures::future::join_all(slots.iter_mut()))
            .await
            .is_ok();

        let aborted_slots = if drained {
            0
        } else {
            let stuck = slots.iter().filter(|slot| !slot.is_finished()).count();
            for slot in &slots {
                slot.abort();
            }
            warn!(
                worker = %inner.id,
                aborted_slots = stuck,
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown timeout elapsed; in-flight jobs left for the reaper"
            );
            stuck
        };

        info!(worker = %inner.id, "Worker stopped");
        ShutdownReport {
            graceful: drained,
            aborted_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    #[test]
    fn test_worker_config_from_queue_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        stats.processed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.processed(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_worker_without_handlers_is_idle() {
        let worker = JobWorker::builder(Arc::new(InMemoryJobStore::new())).build();
        assert!(worker.id().starts_with("relay-worker-"));
        assert!(!worker.process_next().await.unwrap());
    }
}
