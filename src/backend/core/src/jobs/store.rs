//! Job store abstraction and the in-memory backend.
//!
//! Every transition is a conditional, all-or-nothing update:
//!
//! - `enqueue` inserts only when no non-terminal job holds the
//!   `(job_type, idempotency_key)` pair, otherwise returns the holder's id
//! - `lease` moves the oldest due pending job to `processing`
//! - `complete` / `retry` / `fail` apply only while the caller's
//!   [`LeaseToken`] still matches (same owner, same attempt count)
//! - `reclaim_expired` returns jobs with lapsed leases to `pending`, counting
//!   the lapse as a failed attempt

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::job::{Job, JobId, JobStatus, LeaseToken, NewJob};
use crate::error::{RelayError, Result};

/// `last_error` recorded when the reaper reclaims a job.
pub const LEASE_EXPIRED_ERROR: &str =
    "lease expired before the job was acknowledged (code: LEASE_EXPIRED)";

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job_id: JobId,
    /// False when an existing non-terminal job already held the key
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimOutcome {
    /// Back to pending for another worker
    Requeued,
    /// The lapse used up the last attempt
    Failed,
}

/// A job whose lease the reaper took back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimedJob {
    pub job_id: JobId,
    pub job_type: String,
    pub attempts: u32,
    pub outcome: ReclaimOutcome,
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    /// Pending jobs (due or delayed) per job type
    pub pending: BTreeMap<String, u64>,
    /// Jobs currently leased, all types
    pub processing: u64,
}

impl QueueDepths {
    pub fn total_pending(&self) -> u64 {
        self.pending.values().sum()
    }

    pub fn max_pending(&self) -> u64 {
        self.pending.values().copied().max().unwrap_or(0)
    }
}

/// Persistent job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert unless a non-terminal job already holds `(job_type, idempotency_key)`.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome>;

    /// Lease the oldest due pending job of `job_type`.
    async fn lease(
        &self,
        job_type: &str,
        owner: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// `processing → completed`. Fails with `LeaseLost` if the lease no longer matches.
    async fn complete(&self, lease: &LeaseToken, now: DateTime<Utc>) -> Result<()>;

    /// `processing → pending`, attempts + 1, progress back to 0, leasable from `run_at`.
    async fn retry(
        &self,
        lease: &LeaseToken,
        error: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// `processing → failed`, attempts + 1.
    async fn fail(&self, lease: &LeaseToken, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Raise stored progress; never lowers it.
    async fn record_progress(&self, job_id: JobId, percent: u8) -> Result<()>;

    /// Reclaim up to `limit` processing jobs whose lease expired at or before `now`.
    async fn reclaim_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReclaimedJob>>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    async fn queue_depths(&self) -> Result<QueueDepths>;

    async fn ping(&self) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    /// `(job_type, idempotency_key)` → holder, non-terminal jobs only
    idempotency: HashMap<(String, String), JobId>,
    /// Per type, ordered by `(run_at millis, insertion sequence)`
    pending: HashMap<String, BTreeMap<(i64, u64), JobId>>,
    sequence: u64,
}

impl Tables {
    fn push_pending(&mut self, job_type: &str, run_at: DateTime<Utc>, job_id: JobId) {
        self.sequence += 1;
        let sequence = self.sequence;
        self.pending
            .entry(job_type.to_string())
            .or_default()
            .insert((run_at.timestamp_millis(), sequence), job_id);
    }

    fn release_key(&mut self, job_type: &str, key: &str, job_id: JobId) {
        let index = (job_type.to_string(), key.to_string());
        if self.idempotency.get(&index) == Some(&job_id) {
            self.idempotency.remove(&index);
        }
    }

    fn leased_job(&mut self, lease: &LeaseToken) -> Result<&mut Job> {
        match self.jobs.get_mut(&lease.job_id) {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.lease_owner.as_deref() == Some(lease.owner.as_str())
                    && job.attempts == lease.attempts =>
            {
                Ok(job)
            }
            _ => Err(RelayError::lease_lost(lease.job_id, &lease.owner)),
        }
    }
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease_duration: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(lease_duration)
        .map(|lease| now + lease)
        .map_err(|e| RelayError::validation(format!("lease duration out of range: {}", e)))
}

/// Process-local job store.
///
/// Suitable for tests and single-process deployments; state is lost on restart.
#[derive(Default)]
pub struct InMemoryJobStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RelayError::store_unavailable("in-memory job store is offline"))
        } else {
            Ok(())
        }
    }

    pub fn len(&self) -> usize {
        self.tables.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        self.check_available()?;
        let mut tables = self.tables.lock();

        let index = (job.job_type.clone(), job.idempotency_key.clone());
        if let Some(existing) = tables.idempotency.get(&index) {
            return Ok(EnqueueOutcome {
                job_id: *existing,
                created: false,
            });
        }

        let job_id = JobId::new();
        let record = Job::pending(job_id, job, now);
        tables.push_pending(&record.job_type, now, job_id);
        tables.idempotency.insert(index, job_id);
        tables.jobs.insert(job_id, record);

        Ok(EnqueueOutcome {
            job_id,
            created: true,
        })
    }

    async fn lease(
        &self,
        job_type: &str,
        owner: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.check_available()?;
        let lease_expires_at = lease_deadline(now, lease_duration)?;
        let mut tables = self.tables.lock();

        let Some(queue) = tables.pending.get_mut(job_type) else {
            return Ok(None);
        };
        let due = queue
            .first_key_value()
            .map(|(&(run_at, _), _)| run_at <= now.timestamp_millis())
            .unwrap_or(false);
        if !due {
            return Ok(None);
        }
        let Some((_, job_id)) = queue.pop_first() else {
            return Ok(None);
        };

        match tables.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.lease_owner = Some(owner.to_string());
                job.lease_expires_at = Some(lease_expires_at);
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(&self, lease: &LeaseToken, now: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.lock();

        let job = tables.leased_job(lease)?;
        job.status = JobStatus::Completed;
        job.progress = 100;
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.finished_at = Some(now);
        job.updated_at = now;
        let (job_type, key) = (job.job_type.clone(), job.idempotency_key.clone());

        tables.release_key(&job_type, &key, lease.job_id);
        Ok(())
    }

    async fn retry(
        &self,
        lease: &LeaseToken,
        error: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.lock();

        let job = tables.leased_job(lease)?;
        job.status = JobStatus::Pending;
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.progress = 0;
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.run_at = run_at;
        job.updated_at = now;
        let job_type = job.job_type.clone();

        tables.push_pending(&job_type, run_at, lease.job_id);
        Ok(())
    }

    async fn fail(&self, lease: &LeaseToken, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.lock();

        let job = tables.leased_job(lease)?;
        job.status = JobStatus::Failed;
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.finished_at = Some(now);
        job.updated_at = now;
        let (job_type, key) = (job.job_type.clone(), job.idempotency_key.clone());

        tables.release_key(&job_type, &key, lease.job_id);
        Ok(())
    }

    async fn record_progress(&self, job_id: JobId, percent: u8) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.lock();

        match tables.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.progress = job.progress.max(percent.min(100));
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(RelayError::job_not_found(job_id)),
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReclaimedJob>> {
        self.check_available()?;
        let mut tables = self.tables.lock();

        let mut expired: Vec<(DateTime<Utc>, JobId)> = tables
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .filter_map(|job| job.lease_expires_at.map(|at| (at, job.id)))
            .filter(|(at, _)| *at <= now)
            .collect();
        expired.sort();
        expired.truncate(limit);

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (_, job_id) in expired {
            let Some(job) = tables.jobs.get_mut(&job_id) else {
                continue;
            };
            job.attempts += 1;
            job.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;

            let outcome = if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                ReclaimOutcome::Failed
            } else {
                job.status = JobStatus::Pending;
                job.progress = 0;
                job.run_at = now;
                ReclaimOutcome::Requeued
            };
            let entry = ReclaimedJob {
                job_id,
                job_type: job.job_type.clone(),
                attempts: job.attempts,
                outcome,
            };
            let key = job.idempotency_key.clone();

            match outcome {
                ReclaimOutcome::Requeued => tables.push_pending(&entry.job_type, now, job_id),
                ReclaimOutcome::Failed => tables.release_key(&entry.job_type, &key, job_id),
            }
            reclaimed.push(entry);
        }

        Ok(reclaimed)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        self.check_available()?;
        Ok(self.tables.lock().jobs.get(&job_id).cloned())
    }

    async fn queue_depths(&self) -> Result<QueueDepths> {
        self.check_available()?;
        let tables = self.tables.lock();

        let pending = tables
            .pending
            .iter()
            .map(|(job_type, queue)| (job_type.clone(), queue.len() as u64))
            .collect();
        let processing = tables
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .count() as u64;

        Ok(QueueDepths {
            pending,
            processing,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    fn new_job(key: &str) -> NewJob {
        NewJob {
            job_type: "fax".to_string(),
            idempotency_key: key.to_string(),
            payload: json!({ "document": key }),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_while_non_terminal() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let first = store.enqueue(new_job("fax-123"), now).await.unwrap();
        let second = store.enqueue(new_job("fax-123"), now).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_key_released_after_completion() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let first = store.enqueue(new_job("fax-1"), now).await.unwrap();
        let job = store.lease("fax", "w1", LEASE, now).await.unwrap().unwrap();
        store.complete(&job.lease().unwrap(), now).await.unwrap();

        let second = store.enqueue(new_job("fax-1"), now).await.unwrap();
        assert!(second.created);
        assert_ne!(first.job_id, second.job_id);

        let completed = store.get(first.job_id).await.unwrap().unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.progress, 100);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_and_fifo() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let a = store.enqueue(new_job("a"), now).await.unwrap();
        let b = store.enqueue(new_job("b"), now).await.unwrap();

        let first = store.lease("fax", "w1", LEASE, now).await.unwrap().unwrap();
        let second = store.lease("fax", "w2", LEASE, now).await.unwrap().unwrap();
        assert_eq!(first.id, a.job_id);
        assert_eq!(second.id, b.job_id);
        assert_eq!(first.status, JobStatus::Processing);
        assert_eq!(first.lease_expires_at, Some(now + chrono::Duration::seconds(30)));

        assert!(store.lease("fax", "w3", LEASE, now).await.unwrap().is_none());
        assert!(store.lease("email", "w3", LEASE, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_delays_next_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(new_job("fax-9"), now).await.unwrap();

        let job = store.lease("fax", "w1", LEASE, now).await.unwrap().unwrap();
        let run_at = now + chrono::Duration::seconds(2);
        store.retry(&job.lease().unwrap(), "modem busy", run_at, now).await.unwrap();

        assert!(store.lease("fax", "w1", LEASE, now).await.unwrap().is_none());
        let again = store.lease("fax", "w1", LEASE, run_at).await.unwrap().unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(again.last_error.as_deref(), Some("modem busy"));
    }

    #[tokio::test]
    async fn test_stale_lease_is_rejected() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(new_job("fax-5"), now).await.unwrap();

        let job = store.lease("fax", "w1", LEASE, now).await.unwrap().unwrap();
        let stale = job.lease().unwrap();

        let later = now + chrono::Duration::seconds(31);
        let reclaimed = store.reclaim_expired(later, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].outcome, ReclaimOutcome::Requeued);

        let error = store.complete(&stale, later).await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::LeaseLost);
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_reclaim_fails_job_on_last_attempt() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut job = new_job("fax-7");
        job.max_attempts = 1;
        store.enqueue(job, now).await.unwrap();

        store.lease("fax", "w1", LEASE, now).await.unwrap().unwrap();
        let reclaimed = store
            .reclaim_expired(now + chrono::Duration::seconds(60), 10)
            .await
            .unwrap();

        assert_eq!(reclaimed[0].outcome, ReclaimOutcome::Failed);
        let stored = store.get(reclaimed[0].job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
    }

    #[tokio::test]
    async fn test_unexpired_leases_untouched() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(new_job("fax-8"), now).await.unwrap();
        store.lease("fax", "w1", LEASE, now).await.unwrap().unwrap();

        let reclaimed = store
            .reclaim_expired(now + chrono::Duration::seconds(5), 10)
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(new_job("fax-2"), now).await.unwrap();
        let job = store.lease("fax", "w1", LEASE, now).await.unwrap().unwrap();

        store.record_progress(job.id, 60).await.unwrap();
        store.record_progress(job.id, 30).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress, 60);
    }

    #[tokio::test]
    async fn test_progress_restarts_with_each_attempt() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(new_job("fax-3"), now).await.unwrap();

        let job = store.lease("fax", "w1", LEASE, now).await.unwrap().unwrap();
        store.record_progress(job.id, 80).await.unwrap();
        store.retry(&job.lease().unwrap(), "modem busy", now, now).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress, 0);

        let job = store.lease("fax", "w1", LEASE, now).await.unwrap().unwrap();
        store.record_progress(job.id, 40).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress, 40);

        store
            .reclaim_expired(now + chrono::Duration::seconds(60), 10)
            .await
            .unwrap();
        let requeued = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.progress, 0);
    }

    #[test]
    fn test_lease_expired_error_carries_code() {
        let expected = crate::jobs::job::JobError::retryable("lease expired before the job was acknowledged")
            .with_code(ErrorCode::LeaseExpired.as_str());
        assert_eq!(LEASE_EXPIRED_ERROR, expected.to_string());
    }

    #[tokio::test]
    async fn test_queue_depths() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(new_job("a"), now).await.unwrap();
        store.enqueue(new_job("b"), now).await.unwrap();
        store.lease("fax", "w1", LEASE, now).await.unwrap();

        let depths = store.queue_depths().await.unwrap();
        assert_eq!(depths.pending.get("fax"), Some(&1));
        assert_eq!(depths.processing, 1);
        assert_eq!(depths.max_pending(), 1);
    }

    #[tokio::test]
    async fn test_outage_surfaces_store_unavailable() {
        let store = InMemoryJobStore::new();
        store.set_available(false);

        let error = store.enqueue(new_job("x"), Utc::now()).await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::StoreUnavailable);
        assert!(store.ping().await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
