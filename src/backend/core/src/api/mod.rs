//! Admin HTTP API.
//!
//! Unversioned:
//! - `GET /health` - job store and limiter store checks
//! - `GET /metrics` - Prometheus text format
//!
//! Under `/api/v1`:
//! - `POST /jobs`, `GET /jobs/:id`
//! - `GET /queues`
//! - `GET /limiters`
//! - `GET /alerts`, `DELETE /alerts`
//! - `GET /snapshot`
//!
//! Successful responses use the [`ApiResponse`] envelope; failures render a
//! [`RelayError`](crate::error::RelayError) as its JSON error envelope.

mod handlers;

use axum::{
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::health::HealthService;
use crate::jobs::{JobProducer, JobStore};
use crate::limiter::LimiterRegistry;
use crate::monitor::Monitor;
use crate::runtime::Runtime;
use crate::telemetry::MetricsRegistry;

pub use handlers::LimiterSummary;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub producer: JobProducer,
    pub store: Arc<dyn JobStore>,
    pub limiters: Arc<LimiterRegistry>,
    pub monitor: Arc<Monitor>,
    pub health: Arc<HealthService>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn from_runtime(runtime: &Runtime, metrics: MetricsRegistry) -> Self {
        Self {
            producer: runtime.producer().clone(),
            store: runtime.store().clone(),
            limiters: runtime.limiters().clone(),
            monitor: runtime.monitor().clone(),
            health: runtime.health().clone(),
            metrics,
        }
    }
}

/// Build the admin router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/api/v1", v1_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/jobs", axum::routing::post(handlers::create_job))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/queues", get(handlers::list_queues))
        .route("/limiters", get(handlers::list_limiters))
        .route("/alerts", get(handlers::list_alerts).delete(handlers::clear_alerts))
        .route("/snapshot", get(handlers::get_snapshot))
}

/// API response wrapper.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: Some(code.into()),
        }
    }

    pub fn from_relay_error(err: &crate::error::RelayError) -> Self {
        Self::error_with_code(err.user_message(), err.code().as_str())
    }
}
