//! Health checkers for the job store and the limiter stores.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::check::ComponentHealth;
use crate::jobs::JobStore;
use crate::limiter::{LimiterMetricsStore, WindowStore};

/// A health check for one component.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> ComponentHealth;
}

/// Checks the job store. Down means unhealthy: nothing can be enqueued or leased.
pub struct JobStoreHealthChecker {
    store: Arc<dyn JobStore>,
}

impl JobStoreHealthChecker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthChecker for JobStoreHealthChecker {
    fn name(&self) -> &str {
        "job_store"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let health = match self.store.ping().await {
            Ok(()) => ComponentHealth::healthy(self.name()),
            Err(e) => ComponentHealth::unhealthy(self.name()).with_error(e.to_string()),
        };
        health
            .with_backend(self.store.backend_name())
            .with_latency(start.elapsed())
    }
}

/// Checks the limiter's window and metrics stores. Down means degraded: the
/// limiter keeps admitting without a check.
pub struct LimiterStoreHealthChecker {
    windows: Arc<dyn WindowStore>,
    metrics: Arc<dyn LimiterMetricsStore>,
}

impl LimiterStoreHealthChecker {
    pub fn new(windows: Arc<dyn WindowStore>, metrics: Arc<dyn LimiterMetricsStore>) -> Self {
        Self { windows, metrics }
    }
}

#[async_trait]
impl HealthChecker for LimiterStoreHealthChecker {
    fn name(&self) -> &str {
        "limiter_store"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let errors: Vec<String> = [self.windows.ping().await, self.metrics.ping().await]
            .into_iter()
            .filter_map(|result| result.err().map(|e| e.to_string()))
            .collect();

        let health = if errors.is_empty() {
            ComponentHealth::healthy(self.name())
        } else {
            ComponentHealth::degraded(self.name()).with_error(errors.join("; "))
        };
        health
            .with_backend(self.windows.backend_name())
            .with_latency(start.elapsed())
    }
}
