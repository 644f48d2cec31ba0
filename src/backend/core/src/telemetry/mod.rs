//! Telemetry: structured logging, span export and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_core::config::Config;
//! use relay_core::telemetry::init_telemetry;
//!
//! let config = Config::load().expect("config");
//! let telemetry = init_telemetry(&config.observability).expect("telemetry");
//! // ...
//! telemetry.shutdown();
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{build_filter, init_logging, LogFormat, TelemetryGuard};
pub use metrics::{init_metrics, AlertMetrics, JobMetrics, LimiterMetricsRecorder, MetricsRegistry};

use crate::config::ObservabilityConfig;
use crate::error::Result;

/// Handle for the installed telemetry stack.
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
    guard: TelemetryGuard,
}

impl TelemetryHandle {
    /// Flush spans and log the shutdown.
    pub fn shutdown(self) {
        self.guard.shutdown();
    }
}

/// Install metrics, then logging (and span export when configured).
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<TelemetryHandle> {
    let metrics = init_metrics()?;
    let guard = init_logging(config)?;
    Ok(TelemetryHandle { metrics, guard })
}
