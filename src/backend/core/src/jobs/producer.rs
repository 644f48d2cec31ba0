//! Enqueue side of the queue.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::job::{JobId, NewJob};
use super::store::{EnqueueOutcome, JobStore};
use crate::error::{ErrorCode, RelayError, Result};
use crate::telemetry::metrics::JobMetrics;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 512;

/// Full enqueue request, as accepted by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides the configured default
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Writes jobs to the store.
///
/// No internal retry: on `StoreUnavailable` the caller retries with the same
/// idempotency key, which is safe because enqueue is idempotent.
#[derive(Clone)]
pub struct JobProducer {
    store: Arc<dyn JobStore>,
    default_max_attempts: u32,
}

impl JobProducer {
    pub fn new(store: Arc<dyn JobStore>, default_max_attempts: u32) -> Self {
        Self {
            store,
            default_max_attempts,
        }
    }

    /// Enqueue `payload` under `(job_type, idempotency_key)` and return the job id.
    ///
    /// If a pending or processing job already holds the key, its id is returned
    /// and nothing is written.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        job_type: &str,
        idempotency_key: &str,
        payload: &T,
    ) -> Result<JobId> {
        let outcome = self
            .submit(EnqueueRequest {
                job_type: job_type.to_string(),
                idempotency_key: idempotency_key.to_string(),
                payload: serde_json::to_value(payload)?,
                max_attempts: None,
            })
            .await?;
        Ok(outcome.job_id)
    }

    /// Enqueue with full control, reporting whether a new job was created.
    pub async fn submit(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        validate(&request)?;

        let job_type = request.job_type.clone();
        let new_job = NewJob {
            job_type: request.job_type,
            idempotency_key: request.idempotency_key,
            payload: request.payload,
            max_attempts: request.max_attempts.unwrap_or(self.default_max_attempts),
        };
        let key = new_job.idempotency_key.clone();

        let outcome = self.store.enqueue(new_job, Utc::now()).await?;
        JobMetrics::record_enqueued(&job_type, outcome.created);

        if outcome.created {
            info!(job_id = %outcome.job_id, job_type = %job_type, key = %key, "Job enqueued");
        } else {
            debug!(job_id = %outcome.job_id, job_type = %job_type, key = %key, "Duplicate enqueue, returning existing job");
        }
        Ok(outcome)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }
}

fn validate(request: &EnqueueRequest) -> Result<()> {
    if request.job_type.trim().is_empty() {
        return Err(RelayError::validation("job_type must not be empty"));
    }
    if request.idempotency_key.trim().is_empty() {
        return Err(RelayError::new(
            ErrorCode::InvalidIdempotencyKey,
            "idempotency_key must be a stable, non-empty identifier",
        ));
    }
    if request.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(RelayError::new(
            ErrorCode::InvalidIdempotencyKey,
            format!("idempotency_key exceeds {} bytes", MAX_IDEMPOTENCY_KEY_LEN),
        ));
    }
    if request.max_attempts == Some(0) {
        return Err(RelayError::validation("max_attempts must be at least 1"));
    }
    Ok(())
}
