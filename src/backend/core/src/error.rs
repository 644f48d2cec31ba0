//! Error handling for Relay Core.
//!
//! This module provides:
//! - A single crate error type, [`RelayError`], with machine-readable codes
//! - HTTP status code mapping for the admin API
//! - User-friendly messages kept apart from internal diagnostics
//! - Severity-aware logging and an error counter
//!
//! Job handlers do not return [`RelayError`]; they return
//! [`JobError`](crate::jobs::JobError), which the worker records on the job.
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("relay.toml").with_error_code(ErrorCode::InvalidConfiguration)
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and surface in admin API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    LeaseLost,
    LeaseExpired,
    HandlerFailure,
    NoHandlerRegistered,
    InvalidIdempotencyKey,

    // Limiter Errors (1100-1199)
    LimiterStoreUnavailable,
    AcquireTimeout,
    AcquireCancelled,

    // Store Errors (2000-2099)
    StoreUnavailable,
    StoreError,
    CorruptRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // External Service Errors (3000-3099)
    ExternalServiceError,
    NetworkError,
    UpstreamTimeout,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::LeaseLost => 1001,
            Self::LeaseExpired => 1002,
            Self::HandlerFailure => 1003,
            Self::NoHandlerRegistered => 1004,
            Self::InvalidIdempotencyKey => 1005,

            Self::LimiterStoreUnavailable => 1100,
            Self::AcquireTimeout => 1101,
            Self::AcquireCancelled => 1102,

            Self::StoreUnavailable => 2000,
            Self::StoreError => 2001,
            Self::CorruptRecord => 2002,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ExternalServiceError => 3000,
            Self::NetworkError => 3001,
            Self::UpstreamTimeout => 3002,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// The wire name, as serialized in API responses and recorded on jobs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::LeaseLost => "LEASE_LOST",
            Self::LeaseExpired => "LEASE_EXPIRED",
            Self::HandlerFailure => "HANDLER_FAILURE",
            Self::NoHandlerRegistered => "NO_HANDLER_REGISTERED",
            Self::InvalidIdempotencyKey => "INVALID_IDEMPOTENCY_KEY",
            Self::LimiterStoreUnavailable => "LIMITER_STORE_UNAVAILABLE",
            Self::AcquireTimeout => "ACQUIRE_TIMEOUT",
            Self::AcquireCancelled => "ACQUIRE_CANCELLED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::StoreError => "STORE_ERROR",
            Self::CorruptRecord => "CORRUPT_RECORD",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::DeserializationError => "DESERIALIZATION_ERROR",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidInput => "INVALID_INPUT",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::InvalidConfiguration => "INVALID_CONFIGURATION",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::JobNotFound => StatusCode::NOT_FOUND,

            Self::LeaseLost => StatusCode::CONFLICT,

            Self::InvalidIdempotencyKey | Self::ValidationError | Self::InvalidInput => {
                StatusCode::BAD_REQUEST
            }

            Self::NoHandlerRegistered => StatusCode::UNPROCESSABLE_ENTITY,

            Self::AcquireTimeout | Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,

            Self::StoreUnavailable | Self::LimiterStoreUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            Self::ExternalServiceError | Self::NetworkError => StatusCode::BAD_GATEWAY,

            Self::AcquireCancelled => StatusCode::REQUEST_TIMEOUT,

            Self::LeaseExpired
            | Self::HandlerFailure
            | Self::StoreError
            | Self::CorruptRecord
            | Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is transient and worth retrying by the caller.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable
                | Self::LimiterStoreUnavailable
                | Self::HandlerFailure
                | Self::LeaseExpired
                | Self::AcquireTimeout
                | Self::NetworkError
                | Self::ExternalServiceError
                | Self::UpstreamTimeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "limiter",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            3000..=3099 => "external_service",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown job)
    Low,
    /// Operational noise (timeouts, lost leases, handler failures)
    Medium,
    /// System errors (corrupt records, misconfiguration)
    High,
    /// Requires immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::InvalidIdempotencyKey
            | ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::AcquireCancelled => Self::Low,

            ErrorCode::LeaseLost
            | ErrorCode::LeaseExpired
            | ErrorCode::HandlerFailure
            | ErrorCode::AcquireTimeout
            | ErrorCode::UpstreamTimeout
            | ErrorCode::LimiterStoreUnavailable => Self::Medium,

            ErrorCode::StoreError
            | ErrorCode::CorruptRecord
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ExternalServiceError
            | ErrorCode::NetworkError
            | ErrorCode::NoHandlerRegistered
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StoreUnavailable | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job id, limiter key)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.retry_after_secs.is_none()
            && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Relay Core.
#[derive(Error, Debug)]
pub struct RelayError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl RelayError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Configuration is invalid",
            message,
        )
    }

    /// The backing job store could not be reached.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StoreUnavailable,
            "The job store is unavailable",
            message,
        )
        .with_details(ErrorDetails::new().with_suggestion("Retry with the same idempotency key"))
    }

    /// The limiter's window or metrics store could not be reached.
    pub fn limiter_store_unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::LimiterStoreUnavailable,
            "The rate-limit store is unavailable",
            message,
        )
    }

    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let job_id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id))
    }

    /// A lease-guarded transition found the job no longer held by this lease.
    pub fn lease_lost(job_id: impl fmt::Display, owner: &str) -> Self {
        let job_id = job_id.to_string();
        Self::with_internal(
            ErrorCode::LeaseLost,
            format!("Lease on job {} is no longer held", job_id),
            format!("owner={}", owner),
        )
        .with_details(ErrorDetails::new().with_entity("job", job_id))
    }

    pub fn corrupt_record(key: impl Into<String>, reason: impl Into<String>) -> Self {
        let key = key.into();
        Self::with_internal(
            ErrorCode::CorruptRecord,
            "A stored record could not be decoded",
            format!("{}: {}", key, reason.into()),
        )
        .with_details(ErrorDetails::new().with_entity("record", key))
    }

    pub fn acquire_timeout(key: &str, waited: std::time::Duration) -> Self {
        Self::new(
            ErrorCode::AcquireTimeout,
            format!("Timed out waiting for admission on key '{}'", key),
        )
        .with_context("waited_ms", waited.as_millis() as u64)
    }

    pub fn acquire_cancelled(key: &str) -> Self {
        Self::new(
            ErrorCode::AcquireCancelled,
            format!("Admission wait on key '{}' was cancelled", key),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// True when the failure means the store itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::StoreUnavailable | ErrorCode::LimiterStoreUnavailable
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "Critical error"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "relay_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,

    pub numeric_code: u32,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&RelayError> for ErrorResponse {
    fn from(error: &RelayError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error with a message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error with a specific code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| RelayError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| RelayError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| RelayError::new(ErrorCode::JobNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| RelayError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for RelayError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_io_error()
        {
            (ErrorCode::StoreUnavailable, "Unable to connect to the store")
        } else if error.is_timeout() {
            (ErrorCode::StoreUnavailable, "Store operation timed out")
        } else {
            (ErrorCode::StoreError, "A store error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::UpstreamTimeout, "External service request timed out")
        } else if error.is_connect() {
            (ErrorCode::NetworkError, "Failed to connect to external service")
        } else {
            (ErrorCode::ExternalServiceError, "External service request failed")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::UpstreamTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for RelayError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::InvalidConfiguration, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::UpstreamTimeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::NetworkError, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<RelayError>() {
            Ok(relay_error) => relay_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::InvalidConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::JobNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::InvalidIdempotencyKey.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ErrorCode::ValidationError.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::InvalidInput.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::NoHandlerRegistered.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorCode::StoreUnavailable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorCode::LeaseLost.http_status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::StoreUnavailable.is_retryable());
        assert!(ErrorCode::HandlerFailure.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::LeaseLost.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::LeaseExpired.category(), "job");
        assert_eq!(ErrorCode::AcquireTimeout.category(), "limiter");
        assert_eq!(ErrorCode::CorruptRecord.category(), "store");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_error_code_as_str_matches_wire_name() {
        for code in [
            ErrorCode::StoreUnavailable,
            ErrorCode::LeaseExpired,
            ErrorCode::HandlerFailure,
            ErrorCode::NoHandlerRegistered,
            ErrorCode::LimiterStoreUnavailable,
            ErrorCode::ExternalServiceError,
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), serde_json::json!(code.as_str()));
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let missing = RelayError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(missing.code(), ErrorCode::InvalidConfiguration);

        let refused = RelayError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.code(), ErrorCode::NetworkError);
    }

    #[test]
    fn test_job_not_found_details() {
        let error = RelayError::job_not_found("abc-123");
        assert_eq!(error.code(), ErrorCode::JobNotFound);
        assert_eq!(error.details().entity_type.as_deref(), Some("job"));
        assert_eq!(error.details().entity_id.as_deref(), Some("abc-123"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_store_unavailable_is_unavailable() {
        let error = RelayError::store_unavailable("connection refused");
        assert!(error.is_unavailable());
        assert!(error.is_retryable());
        assert_eq!(error.severity(), ErrorSeverity::Critical);
        assert!(error.details().suggested_action.is_some());
    }

    #[test]
    fn test_error_context() {
        let error = RelayError::validation("Invalid input")
            .with_context("field", "idempotency_key")
            .with_context("reason", "empty");

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("reason"));
    }

    #[test]
    fn test_error_response_serialization() {
        let error = RelayError::new(ErrorCode::InvalidIdempotencyKey, "Idempotency key must not be empty");
        let response = ErrorResponse::from(&error);

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("INVALID_IDEMPOTENCY_KEY"));
        assert!(json.contains("1005"));
        assert!(json.contains("must not be empty"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ValidationError),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::LeaseLost),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::CorruptRecord),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StoreUnavailable),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.with_error_code(ErrorCode::JobNotFound).unwrap_err();
        assert_eq!(error.code(), ErrorCode::JobNotFound);
    }

    #[test]
    fn test_error_display() {
        let error = RelayError::with_internal(
            ErrorCode::StoreUnavailable,
            "The job store is unavailable",
            "Connection refused: localhost:6379",
        );

        let display = format!("{}", error);
        assert!(display.starts_with("[STORE_UNAVAILABLE]"));
        assert!(display.contains("The job store is unavailable"));
        assert!(display.contains("Connection refused"));
    }
}
