//! Prometheus metrics for the queue, the limiter and the alert loop.
//!
//! Recording goes through the `metrics` facade, so the helpers below are
//! no-ops until [`init_metrics`] installs the Prometheus recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_core::telemetry::metrics::{init_metrics, JobMetrics};
//!
//! let registry = init_metrics().expect("metrics recorder");
//! JobMetrics::record_outcome("fax", "completed");
//! println!("{}", registry.render());
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{ErrorCode, RelayError, Result};

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Handle used by the admin API to render `/metrics`.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// The installed registry, or an empty one before [`init_metrics`].
    pub fn global() -> Self {
        Self {
            handle: PROMETHEUS.get().cloned(),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder. Later calls return the installed one.
pub fn init_metrics() -> Result<MetricsRegistry> {
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(MetricsRegistry {
            handle: Some(handle.clone()),
        });
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), DURATION_BUCKETS)
        .and_then(|builder| builder.install_recorder())
        .map_err(|e| {
            RelayError::with_internal(
                ErrorCode::ConfigurationError,
                "Failed to install metrics recorder",
                e.to_string(),
            )
        })?;

    register_metric_descriptions();
    let handle = PROMETHEUS.get_or_init(|| handle).clone();
    tracing::info!("Metrics initialized");

    Ok(MetricsRegistry {
        handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Queue
    describe_counter!("relay_jobs_enqueued_total", "Enqueue calls, by whether a job was created");
    describe_counter!("relay_jobs_processed_total", "Handler runs by outcome");
    describe_counter!("relay_jobs_reclaimed_total", "Stalled jobs taken back by the reaper");
    describe_histogram!("relay_job_duration_seconds", "Handler execution time in seconds");
    describe_gauge!("relay_queue_depth", "Pending jobs per job type");
    describe_gauge!("relay_job_error_rate", "Failed share of recent job outcomes");

    // Limiter
    describe_counter!("relay_limiter_admissions_total", "Limiter grants by outcome");
    describe_counter!("relay_limiter_degraded_total", "Grants made without a store check");
    describe_histogram!("relay_limiter_wait_seconds", "Time queued callers waited");
    describe_gauge!("relay_limiter_queued_ratio", "queued / (allowed + queued + rejected)");

    // Alerts and errors
    describe_counter!("relay_alerts_total", "Alerts fired");
    describe_counter!("relay_errors_total", "Errors constructed, by code");
}

/// Job queue metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn record_enqueued(job_type: &str, created: bool) {
        counter!(
            "relay_jobs_enqueued_total",
            "job_type" => job_type.to_string(),
            "created" => created.to_string(),
        )
        .increment(1);
    }

    /// `outcome` is `completed`, `retried` or `failed`.
    pub fn record_outcome(job_type: &str, outcome: &'static str) {
        counter!(
            "relay_jobs_processed_total",
            "job_type" => job_type.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
    }

    pub fn record_duration(job_type: &str, duration: Duration) {
        histogram!("relay_job_duration_seconds", "job_type" => job_type.to_string())
            .record(duration.as_secs_f64());
    }

    /// `outcome` is `requeued` or `failed`.
    pub fn record_reclaimed(outcome: &'static str) {
        counter!("relay_jobs_reclaimed_total", "outcome" => outcome).increment(1);
    }

    pub fn set_queue_depth(job_type: &str, depth: u64) {
        gauge!("relay_queue_depth", "job_type" => job_type.to_string()).set(depth as f64);
    }

    pub fn set_error_rate(rate: f64) {
        gauge!("relay_job_error_rate").set(rate);
    }
}

/// Admission limiter metrics.
pub struct LimiterMetricsRecorder;

impl LimiterMetricsRecorder {
    pub fn record_admission(service: &str, outcome: &'static str) {
        counter!(
            "relay_limiter_admissions_total",
            "service" => service.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
    }

    pub fn record_degraded(service: &str) {
        counter!("relay_limiter_degraded_total", "service" => service.to_string()).increment(1);
    }

    pub fn record_wait(service: &str, waited: Duration) {
        histogram!("relay_limiter_wait_seconds", "service" => service.to_string())
            .record(waited.as_secs_f64());
    }

    pub fn set_queued_ratio(service: &str, ratio: f64) {
        gauge!("relay_limiter_queued_ratio", "service" => service.to_string()).set(ratio);
    }
}

pub struct AlertMetrics;

impl AlertMetrics {
    pub fn record_fired(name: &str, severity: &'static str) {
        counter!(
            "relay_alerts_total",
            "name" => name.to_string(),
            "severity" => severity,
        )
        .increment(1);
    }
}
