//! Configuration management.
//!
//! Sources are layered: built-in defaults, then an optional file, then
//! environment variables prefixed with `RELAY` using `__` as the section
//! separator (`RELAY__QUEUE__MAX_ATTEMPTS=5`).

use crate::error::{RelayError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Admin HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis connection shared by the job, window and metrics stores
    #[serde(default)]
    pub redis: RedisConfig,

    /// Which store backend to run against
    #[serde(default)]
    pub store: StoreConfig,

    /// Job queue and worker settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Admission limiter settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Metrics and alert loop
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Routes served by the built-in HTTP delivery handler
    #[serde(default)]
    pub delivery: Vec<DeliveryRoute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key written by Relay
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Concurrent lease slots per worker instance
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Idle sleep between empty lease attempts
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// Maximum stalled jobs reclaimed per reaper pass
    #[serde(default = "default_reap_batch_size")]
    pub reap_batch_size: usize,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Audit window for completed jobs; 0 keeps them forever
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,

    /// Capacity of the worker lifecycle event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl QueueConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            lease_duration_ms: default_lease_duration_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            reap_batch_size: default_reap_batch_size(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            completed_retention_secs: default_completed_retention_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Requests allowed per window for one tracked service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitSettings {
    pub requests: u32,
    pub window_ms: u64,
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests: default_limiter_requests(),
            window_ms: default_limiter_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    /// Requests per window for the `default` service
    #[serde(default = "default_limiter_requests")]
    pub requests: u32,

    #[serde(default = "default_limiter_window_ms")]
    pub window_ms: u64,

    /// Retention of the shared allowed/queued/rejected counters
    #[serde(default = "default_metrics_ttl_secs")]
    pub metrics_ttl_secs: u64,

    /// Idle per-key slots older than this are dropped by the cleanup task
    #[serde(default = "default_idle_eviction_ms")]
    pub idle_eviction_ms: u64,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Per-service overrides
    #[serde(default)]
    pub services: HashMap<String, RateLimitSettings>,
}

impl LimiterConfig {
    /// Settings for every tracked service, `default` included.
    pub fn service_settings(&self) -> HashMap<String, RateLimitSettings> {
        let mut services = self.services.clone();
        services
            .entry(DEFAULT_SERVICE.to_string())
            .or_insert(RateLimitSettings {
                requests: self.requests,
                window_ms: self.window_ms,
            });
        services
    }

    pub fn metrics_ttl(&self) -> Duration {
        Duration::from_secs(self.metrics_ttl_secs)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            requests: default_limiter_requests(),
            window_ms: default_limiter_window_ms(),
            metrics_ttl_secs: default_metrics_ttl_secs(),
            idle_eviction_ms: default_idle_eviction_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            services: HashMap::new(),
        }
    }
}

/// Name of the limiter service that always exists.
pub const DEFAULT_SERVICE: &str = "default";

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    /// Cooldown applied to built-in alert rules
    #[serde(default = "default_alert_cooldown_ms")]
    pub alert_cooldown_ms: u64,

    /// Capacity of the alert log
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,

    #[serde(default = "default_error_window_ms")]
    pub error_window_ms: u64,

    #[serde(default)]
    pub thresholds: AlertThresholds,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_millis(self.alert_cooldown_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            alert_cooldown_ms: default_alert_cooldown_ms(),
            max_alerts: default_max_alerts(),
            error_window_ms: default_error_window_ms(),
            thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertThresholds {
    /// Pending jobs of a single type
    #[serde(default = "default_queue_depth_threshold")]
    pub queue_depth: u64,

    /// queued / (allowed + queued + rejected) for any service
    #[serde(default = "default_queued_ratio_threshold")]
    pub limiter_queued_ratio: f64,

    #[serde(default = "default_error_rate_threshold")]
    pub error_rate: f64,

    /// Below this many outcomes the error rate reads as zero
    #[serde(default = "default_min_error_samples")]
    pub min_error_samples: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth_threshold(),
            limiter_queued_ratio: default_queued_ratio_threshold(),
            error_rate: default_error_rate_threshold(),
            min_error_samples: default_min_error_samples(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `json`, `pretty` or `compact`
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
            service_name: default_service_name(),
        }
    }
}

/// A job type delivered by POSTing its payload to an upstream URL.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryRoute {
    pub job_type: String,
    pub url: String,

    /// Limiter service guarding the upstream
    #[serde(default = "default_delivery_service")]
    pub service: String,

    #[serde(default = "default_delivery_timeout_ms")]
    pub timeout_ms: u64,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_key_prefix() -> String { "relay".to_string() }
fn default_concurrency() -> usize { 1 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_backoff_ms() -> u64 { 2_000 }
fn default_max_backoff_ms() -> u64 { 300_000 }
fn default_lease_duration_ms() -> u64 { 30_000 }
fn default_poll_interval_ms() -> u64 { 1_000 }
fn default_reaper_interval_ms() -> u64 { 5_000 }
fn default_reap_batch_size() -> usize { 100 }
fn default_shutdown_timeout_ms() -> u64 { 5_000 }
fn default_completed_retention_secs() -> u64 { 7 * 24 * 3600 }
fn default_event_buffer() -> usize { 1024 }
fn default_limiter_requests() -> u32 { 1 }
fn default_limiter_window_ms() -> u64 { 1_000 }
fn default_metrics_ttl_secs() -> u64 { 24 * 3600 }
fn default_idle_eviction_ms() -> u64 { 300_000 }
fn default_cleanup_interval_ms() -> u64 { 60_000 }
fn default_monitor_interval_ms() -> u64 { 60_000 }
fn default_alert_cooldown_ms() -> u64 { 300_000 }
fn default_max_alerts() -> usize { 100 }
fn default_error_window_ms() -> u64 { 300_000 }
fn default_queue_depth_threshold() -> u64 { 100 }
fn default_queued_ratio_threshold() -> f64 { 0.5 }
fn default_error_rate_threshold() -> f64 { 0.25 }
fn default_min_error_samples() -> u64 { 5 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }
fn default_service_name() -> String { "relay".to_string() }
fn default_delivery_service() -> String { DEFAULT_SERVICE.to_string() }
fn default_delivery_timeout_ms() -> u64 { 10_000 }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("RELAY").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("RELAY").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// In-memory stores, short intervals; used by tests and local runs.
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig {
                backend: StoreBackend::Memory,
            },
            ..Self::default()
        }
    }

    /// Reject settings the worker or limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.concurrency == 0 {
            return Err(RelayError::configuration("queue.concurrency must be at least 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(RelayError::configuration("queue.max_attempts must be at least 1"));
        }
        if self.queue.base_backoff_ms > self.queue.max_backoff_ms {
            return Err(RelayError::configuration(
                "queue.base_backoff_ms must not exceed queue.max_backoff_ms",
            ));
        }
        if self.queue.lease_duration_ms == 0 {
            return Err(RelayError::configuration("queue.lease_duration_ms must be positive"));
        }
        for (service, settings) in self.limiter.service_settings() {
            if settings.requests == 0 || settings.window_ms == 0 {
                return Err(RelayError::configuration(format!(
                    "limiter service '{}' needs positive requests and window_ms",
                    service
                )));
            }
        }
        Ok(())
    }
}
