//! Job records, handler contract and execution context.
//!
//! - **Job**: the stored record, owned by the [`JobStore`](super::JobStore)
//! - **JobStatus**: `pending → processing → completed | pending (retry) | failed`
//! - **JobHandler**: the pluggable unit of work, registered per job type
//! - **JobContext**: what a handler sees while running one attempt

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use super::store::JobStore;
use crate::error::{ErrorCode, RelayError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|e| {
            RelayError::with_internal(ErrorCode::InvalidInput, "Invalid job id", e.to_string())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be leased (new, or scheduled for a retry)
    Pending,
    /// Leased by a worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted or a fatal error
    Failed,
}

impl JobStatus {
    /// Terminal jobs never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(RelayError::corrupt_record("status", format!("unknown status '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A stored unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Failed attempts so far (handler failures and expired leases)
    pub attempts: u32,
    pub max_attempts: u32,
    /// Last reported progress, 0-100
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be leased
    pub run_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn pending(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: new.job_type,
            idempotency_key: new.idempotency_key,
            payload: new.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            progress: 0,
            created_at: now,
            updated_at: now,
            run_at: now,
            lease_expires_at: None,
            lease_owner: None,
            last_error: None,
            finished_at: None,
        }
    }

    /// The attempt number a handler run of this record represents (1-based).
    pub fn current_attempt(&self) -> u32 {
        self.attempts + 1
    }

    /// Lease held on this record, if it is processing.
    pub fn lease(&self) -> Option<LeaseToken> {
        if self.status != JobStatus::Processing {
            return None;
        }
        self.lease_owner.as_ref().map(|owner| LeaseToken {
            job_id: self.id,
            job_type: self.job_type.clone(),
            owner: owner.clone(),
            attempts: self.attempts,
        })
    }
}

/// Input to an enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

/// Proof of a lease, checked by every transition out of `processing`.
///
/// A transition only applies while the job is still processing under the same
/// owner and attempt count; otherwise it was reclaimed and the result is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub job_id: JobId,
    pub job_type: String,
    pub owner: String,
    pub attempts: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure returned by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    /// False skips the remaining attempts
    pub retryable: bool,
    pub code: Option<String>,
}

impl JobError {
    /// A failure worth another attempt.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// A failure no retry can fix (malformed payload, rejected request).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Tag with `code` unless the handler already chose one.
    pub fn or_code(mut self, code: impl Into<String>) -> Self {
        if self.code.is_none() {
            self.code = Some(code.into());
        }
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<RelayError> for JobError {
    fn from(error: RelayError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().as_str().to_string()),
        }
    }
}

/// Result type for handler execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Progress
// ═══════════════════════════════════════════════════════════════════════════════

/// Progress callback handed to handlers.
///
/// Values are clamped to 100 and never move backwards: reporting 30 after 60
/// leaves progress at 60.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    current: Arc<AtomicU8>,
    store: Option<Arc<dyn JobStore>>,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, initial: u8, store: Arc<dyn JobStore>) -> Self {
        Self {
            job_id,
            current: Arc::new(AtomicU8::new(initial.min(100))),
            store: Some(store),
        }
    }

    /// A reporter that only tracks progress locally.
    pub fn detached(job_id: JobId) -> Self {
        Self {
            job_id,
            current: Arc::new(AtomicU8::new(0)),
            store: None,
        }
    }

    /// Advance the local value; returns the effective progress.
    pub fn advance(&self, percent: u8) -> u8 {
        let target = percent.min(100);
        let previous = self.current.fetch_max(target, Ordering::AcqRel);
        previous.max(target)
    }

    /// Report progress, persisting it when it moved forward.
    pub async fn report(&self, percent: u8) -> u8 {
        let before = self.current();
        let effective = self.advance(percent);
        if effective > before {
            if let Some(store) = &self.store {
                if let Err(e) = store.record_progress(self.job_id, effective).await {
                    tracing::debug!(job_id = %self.job_id, error = %e, "Failed to persist progress");
                }
            }
        }
        effective
    }

    pub fn current(&self) -> u8 {
        self.current.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("current", &self.current())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one attempt.
pub struct JobContext {
    job: Job,
    progress: ProgressReporter,
    shutdown: watch::Receiver<bool>,
}

impl JobContext {
    pub fn new(job: Job, progress: ProgressReporter, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            job,
            progress,
            shutdown,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.job.current_attempt()
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Deserialize the payload; a payload of the wrong shape is a fatal error.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.job.payload.clone()).map_err(|e| {
            JobError::fatal(format!("invalid payload for '{}': {}", self.job.job_type, e))
                .with_code(ErrorCode::DeserializationError.as_str())
        })
    }

    pub async fn report_progress(&self, percent: u8) -> u8 {
        self.progress.report(percent).await
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// True once the worker has started a graceful shutdown.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job.id,
            job_type = %self.job.job_type,
            attempt = self.attempt(),
            message
        );
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job.id,
            job_type = %self.job.job_type,
            attempt = self.attempt(),
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Executes jobs of one type.
///
/// A job may be delivered more than once after a stalled lease is reclaimed,
/// so handlers must tolerate repeated delivery of the same payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt. Return `JobError::retryable` for transient failures and
    /// `JobError::fatal` for failures no retry can fix.
    async fn handle(&self, ctx: &JobContext) -> JobResult;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
