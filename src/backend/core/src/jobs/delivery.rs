//! Built-in handler that delivers a job's payload to an upstream HTTP endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::job::{JobContext, JobError, JobHandler, JobResult};
use crate::config::DeliveryRoute;
use crate::error::{ErrorCode, RelayError, Result};
use crate::limiter::{Admission, AdmissionLimiter};

const MAX_ERROR_BODY: usize = 256;

/// POSTs the job payload as JSON, gated by an admission limiter.
///
/// The limiter key is the payload's `caller` field, falling back to the job
/// type. 2xx acks the job; 429, 5xx and network errors are retried; any
/// other status fails the job.
pub struct HttpDeliveryHandler {
    client: reqwest::Client,
    url: String,
    limiter: Arc<AdmissionLimiter>,
}

impl HttpDeliveryHandler {
    pub fn new(route: &DeliveryRoute, limiter: Arc<AdmissionLimiter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(route.timeout_ms))
            .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                RelayError::with_internal(
                    ErrorCode::ConfigurationError,
                    "Failed to build delivery HTTP client",
                    e.to_string(),
                )
            })?;
        Ok(Self::with_client(client, route.url.clone(), limiter))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>, limiter: Arc<AdmissionLimiter>) -> Self {
        Self {
            client,
            url: url.into(),
            limiter,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn limiter_key(ctx: &JobContext) -> String {
        ctx.payload()
            .get("caller")
            .and_then(serde_json::Value::as_str)
            .filter(|caller| !caller.is_empty())
            .unwrap_or(ctx.job_type())
            .to_string()
    }
}

#[async_trait]
impl JobHandler for HttpDeliveryHandler {
    async fn handle(&self, ctx: &JobContext) -> JobResult {
        let key = Self::limiter_key(ctx);
        match self.limiter.acquire(&key).await {
            Admission::Immediate => {}
            admission => debug!(
                job_id = %ctx.job_id(),
                key = %key,
                admission = ?admission,
                "Delivery admitted after limiter"
            ),
        }
        ctx.report_progress(10).await;

        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &ctx.job().idempotency_key)
            .header("X-Relay-Job-Id", ctx.job_id().to_string())
            .header("X-Relay-Attempt", ctx.attempt().to_string())
            .json(ctx.payload())
            .send()
            .await
            .map_err(|e| {
                let code = if e.is_timeout() {
                    ErrorCode::UpstreamTimeout
                } else if e.is_connect() {
                    ErrorCode::NetworkError
                } else {
                    ErrorCode::ExternalServiceError
                };
                JobError::retryable(format!("delivery to {} failed: {}", self.url, e))
                    .with_code(code.as_str())
            })?;
        ctx.report_progress(50).await;

        let status = response.status();
        if status.is_success() {
            ctx.report_progress(100).await;
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
        let message = if snippet.is_empty() {
            format!("upstream returned {}", status)
        } else {
            format!("upstream returned {}: {}", status, snippet)
        };
        let code = format!("HTTP_{}", status.as_u16());

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(JobError::retryable(message).with_code(code))
        } else {
            Err(JobError::fatal(message).with_code(code))
        }
    }
}
