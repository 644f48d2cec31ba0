//! Health check system.
//!
//! Checks every registered component concurrently, each under a timeout, and
//! folds the results into one [`HealthReport`].

mod check;
mod checker;

pub use check::*;
pub use checker::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Health service managing all health checks.
pub struct HealthService {
    service: String,
    check_timeout: Duration,
    checkers: Vec<Arc<dyn HealthChecker>>,
    started_at: Instant,
}

impl HealthService {
    pub fn new(service: impl Into<String>, check_timeout: Duration) -> Self {
        Self {
            service: service.into(),
            check_timeout,
            checkers: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn register_checker(&mut self, checker: Arc<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    /// Run all health checks concurrently with a timeout per check.
    pub async fn check_health(&self) -> HealthReport {
        let futures: Vec<_> = self
            .checkers
            .iter()
            .map(|checker| {
                let checker = checker.clone();
                let timeout = self.check_timeout;
                async move {
                    match tokio::time::timeout(timeout, checker.check()).await {
                        Ok(health) => health,
                        Err(_) => ComponentHealth::unhealthy(checker.name())
                            .with_error(format!("health check timed out after {:?}", timeout)),
                    }
                }
            })
            .collect();

        let components = futures::future::join_all(futures).await;
        HealthReport::new(&self.service, self.started_at.elapsed(), components)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl std::fmt::Debug for HealthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthService")
            .field("service", &self.service)
            .field("checkers", &self.checkers.len())
            .finish()
    }
}
