//! Admission control for rate-limited dependencies.
//!
//! One [`AdmissionLimiter`] per tracked service, each holding a token window
//! per caller key in a [`WindowStore`] and a FIFO wait list per key in the
//! process. [`LimiterRegistry`] owns the configured limiters and the cleanup
//! task that evicts idle keys.

pub mod admission;
pub mod metrics;
pub mod window;

pub use admission::{Admission, AdmissionLimiter};
pub use metrics::{
    AdmissionOutcome, InMemoryLimiterMetricsStore, LimiterMetrics, LimiterMetricsStore,
    RedisLimiterMetricsStore,
};
pub use window::{InMemoryWindowStore, RateLimitWindow, RedisWindowStore, WindowDecision, WindowStore};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LimiterConfig, DEFAULT_SERVICE};
use crate::error::Result;
use crate::telemetry::metrics::LimiterMetricsRecorder;

/// Limiters for every configured service.
pub struct LimiterRegistry {
    limiters: HashMap<String, Arc<AdmissionLimiter>>,
    default: Arc<AdmissionLimiter>,
    windows: Arc<dyn WindowStore>,
    metrics: Arc<dyn LimiterMetricsStore>,
    cleanup_interval: Duration,
}

impl LimiterRegistry {
    pub fn new(
        config: &LimiterConfig,
        windows: Arc<dyn WindowStore>,
        metrics: Arc<dyn LimiterMetricsStore>,
    ) -> Self {
        let mut limiters = HashMap::new();
        for (service, settings) in config.service_settings() {
            let limiter = AdmissionLimiter::new(
                service.clone(),
                settings,
                windows.clone(),
                metrics.clone(),
                config.idle_eviction(),
            );
            limiters.insert(service, limiter);
        }

        let default = match limiters.get(DEFAULT_SERVICE) {
            Some(limiter) => limiter.clone(),
            None => {
                let limiter = AdmissionLimiter::new(
                    DEFAULT_SERVICE,
                    Default::default(),
                    windows.clone(),
                    metrics.clone(),
                    config.idle_eviction(),
                );
                limiters.insert(DEFAULT_SERVICE.to_string(), limiter.clone());
                limiter
            }
        };

        Self {
            limiters,
            default,
            windows,
            metrics,
            cleanup_interval: config.cleanup_interval(),
        }
    }

    /// Registry over fresh in-memory stores.
    pub fn in_memory(config: &LimiterConfig) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryWindowStore::new()),
            Arc::new(InMemoryLimiterMetricsStore::new()),
        )
    }

    pub fn get(&self, service: &str) -> Option<Arc<AdmissionLimiter>> {
        self.limiters.get(service).cloned()
    }

    /// The limiter for `service`, or the `default` one for unknown services.
    pub fn get_or_default(&self, service: &str) -> Arc<AdmissionLimiter> {
        self.get(service).unwrap_or_else(|| self.default.clone())
    }

    pub fn default_limiter(&self) -> Arc<AdmissionLimiter> {
        self.default.clone()
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.limiters.keys().cloned().collect();
        services.sort();
        services
    }

    pub fn window_store(&self) -> &Arc<dyn WindowStore> {
        &self.windows
    }

    pub fn metrics_store(&self) -> &Arc<dyn LimiterMetricsStore> {
        &self.metrics
    }

    /// Counters for every service.
    pub async fn metrics(&self) -> BTreeMap<String, LimiterMetrics> {
        let mut all = BTreeMap::new();
        for (service, limiter) in &self.limiters {
            all.insert(service.clone(), limiter.metrics().await);
        }
        all
    }

    /// Check that the window store is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.windows.ping().await
    }

    /// One cleanup pass: evict idle keys and purge expired windows.
    pub async fn cleanup(&self) -> usize {
        let mut evicted = 0;
        for limiter in self.limiters.values() {
            evicted += limiter.evict_idle();
        }
        match self.default.purge_windows().await {
            Ok(purged) if purged > 0 => debug!(purged, "Purged expired limiter windows"),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Window purge skipped"),
        }
        evicted
    }

    /// Run [`cleanup`](Self::cleanup) every `cleanup_interval_ms` until `shutdown` fires.
    pub fn start_cleanup_task(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let interval = self.cleanup_interval;
        info!(interval_ms = interval.as_millis() as u64, "Limiter cleanup task started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.cleanup().await;
                        if evicted > 0 {
                            debug!(evicted, "Evicted idle limiter keys");
                        }
                        for (service, metrics) in registry.metrics().await {
                            LimiterMetricsRecorder::set_queued_ratio(&service, metrics.queued_ratio());
                        }
                    }
                }
            }
            debug!("Limiter cleanup task stopped");
        })
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("services", &self.services())
            .field("window_store", &self.windows.backend_name())
            .finish()
    }
}

/// Log once at startup where limiter state lives.
pub(crate) fn log_backends(registry: &LimiterRegistry) {
    if registry.windows.backend_name() == "memory" {
        warn!("Limiter windows are process-local; limits are per instance");
    } else {
        info!(
            window_store = registry.windows.backend_name(),
            metrics_store = registry.metrics.backend_name(),
            services = ?registry.services(),
            "Limiter stores ready"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSettings;

    #[test]
    fn test_registry_always_has_default() {
        let registry = LimiterRegistry::in_memory(&LimiterConfig::default());
        assert_eq!(registry.services(), vec![DEFAULT_SERVICE.to_string()]);
        assert_eq!(registry.get_or_default("unknown").service(), DEFAULT_SERVICE);
    }

    #[tokio::test]
    async fn test_services_share_stores_but_not_windows() {
        let mut config = LimiterConfig::default();
        config
            .services
            .insert("fax-api".to_string(), RateLimitSettings { requests: 2, window_ms: 1000 });
        let registry = LimiterRegistry::in_memory(&config);

        let fax = registry.get("fax-api").unwrap();
        assert_eq!(fax.settings().requests, 2);
        assert_eq!(fax.acquire("acme").await, Admission::Immediate);
        assert_eq!(registry.default_limiter().acquire("acme").await, Admission::Immediate);

        let metrics = registry.metrics().await;
        assert_eq!(metrics["fax-api"].allowed, 1);
        assert_eq!(metrics[DEFAULT_SERVICE].allowed, 1);
    }
}
