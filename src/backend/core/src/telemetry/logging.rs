//! Structured logging with optional OpenTelemetry export.
//!
//! - JSON format for production, pretty or compact for local runs
//! - Base level plus per-module overrides through `EnvFilter`
//! - OTLP span export when an endpoint is configured

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_sdk::Resource;
use std::str::FromStr;
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

use crate::config::ObservabilityConfig;
use crate::error::{ErrorCode, RelayError, Result};

/// Dependencies that are chatty at `info`.
const QUIET_MODULES: &[(&str, &str)] = &[
    ("hyper", "warn"),
    ("h2", "warn"),
    ("tower", "warn"),
    ("reqwest", "warn"),
    ("redis", "warn"),
];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(RelayError::configuration(format!(
                "unknown log format '{}', expected json, pretty or compact",
                other
            ))),
        }
    }
}

/// Keeps the OTLP pipeline alive; flushes it on shutdown.
#[derive(Debug)]
pub struct TelemetryGuard {
    otlp: bool,
}

impl TelemetryGuard {
    pub fn exporting_spans(&self) -> bool {
        self.otlp
    }

    /// Flush buffered spans.
    pub fn shutdown(self) {
        if self.otlp {
            opentelemetry::global::shutdown_tracer_provider();
        }
        tracing::info!("Telemetry shutdown complete");
    }
}

/// Build the filter: `RUST_LOG` when set, else the configured level, plus
/// quiet levels for noisy dependencies.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    let mut filter = EnvFilter::try_new(&base).map_err(|e| {
        RelayError::with_internal(ErrorCode::InvalidConfiguration, "Invalid log level", e.to_string())
    })?;

    for (module, module_level) in QUIET_MODULES {
        let directive = format!("{}={}", module, module_level).parse().map_err(|e| {
            RelayError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid log directive",
                format!("{}", e),
            )
        })?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(config: &ObservabilityConfig) -> Result<TelemetryGuard> {
    let filter = build_filter(&config.log_level)?;
    let format: LogFormat = config.log_format.parse()?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_target(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    };

    let otel_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => Some(otlp_layer(endpoint, &config.service_name)?),
        None => None,
    };
    let otlp = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(filter)
        .try_init()
        .map_err(|e| {
            RelayError::with_internal(
                ErrorCode::ConfigurationError,
                "Failed to install log subscriber",
                e.to_string(),
            )
        })?;

    tracing::info!(
        service_name = %config.service_name,
        format = ?format,
        otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("disabled"),
        "Logging initialized"
    );
    Ok(TelemetryGuard { otlp })
}

fn otlp_layer<S>(endpoint: &str, service_name: &str) -> Result<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| {
            RelayError::with_internal(
                ErrorCode::ConfigurationError,
                "Failed to install OTLP exporter",
                e.to_string(),
            )
        })?;

    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_build_filter_rejects_garbage() {
        if std::env::var("RUST_LOG").is_err() {
            assert!(build_filter("info").is_ok());
            assert!(build_filter("relay_core=debug,info").is_ok());
            assert!(build_filter("not a [level").is_err());
        }
    }
}
