#![allow(clippy::result_large_err)]
//! # Relay Core
//!
//! Idempotent background jobs, a retrying worker and a per-key admission
//! limiter for rate-limited upstreams.
//!
//! ## Architecture
//!
//! - **Jobs**: idempotent enqueue, lease-guarded transitions, bounded retries with exponential backoff
//! - **Worker**: concurrent lease slots, stalled-job reaper, graceful shutdown
//! - **Limiter**: per-key token windows with a FIFO wait list; fails open when its store is down
//! - **Monitor**: queue depth, limiter and error-rate sampling with threshold alerts
//! - **Telemetry**: structured logging, OTLP span export and Prometheus metrics
//! - **Health**: store health checks for the admin API

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod jobs;
pub mod limiter;
pub mod monitor;
pub mod runtime;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, RelayError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, RelayError, Result};
    pub use crate::jobs::{
        Job, JobContext, JobError, JobHandler, JobId, JobProducer, JobResult, JobStatus, JobStore,
        JobWorker,
    };
    pub use crate::limiter::{Admission, AdmissionLimiter, LimiterMetrics, LimiterRegistry};
    pub use crate::monitor::{Alert, AlertRule, AlertSeverity, Breach, MetricsSnapshot, Monitor};
    pub use crate::runtime::Runtime;
}
