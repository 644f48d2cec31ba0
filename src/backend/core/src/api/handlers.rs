//! Admin API handlers.
//!
//! Handlers return `Result<impl IntoResponse, RelayError>` so that errors are
//! converted to HTTP status codes by `RelayError`'s `IntoResponse`.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::error::RelayError;
use crate::jobs::{EnqueueRequest, JobId};
use crate::monitor::AlertSeverity;

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check_health().await;
    let status = StatusCode::from_u16(report.http_status()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(report))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    if !state.metrics.is_installed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics recorder not installed\n".to_string(),
        );
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, RelayError> {
    let outcome = state.producer.submit(req).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(outcome))))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, RelayError> {
    let job_id = JobId::from_uuid(id);
    let job = state
        .store
        .get(job_id)
        .await?
        .ok_or_else(|| RelayError::job_not_found(job_id))?;

    Ok(Json(ApiResponse::success(job)))
}

pub async fn list_queues(State(state): State<AppState>) -> Result<impl IntoResponse, RelayError> {
    let depths = state.store.queue_depths().await?;
    Ok(Json(ApiResponse::success(depths)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Limiters
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSummary {
    pub service: String,
    pub requests: u32,
    pub window_ms: u64,
    pub allowed: u64,
    pub queued: u64,
    pub rejected: u64,
    pub queued_ratio: f64,
    pub tracked_keys: usize,
}

pub async fn list_limiters(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.limiters.metrics().await;
    let summaries: Vec<LimiterSummary> = state
        .limiters
        .services()
        .into_iter()
        .filter_map(|service| {
            let limiter = state.limiters.get(&service)?;
            let counters = metrics.get(&service).copied().unwrap_or_default();
            let settings = limiter.settings();
            Some(LimiterSummary {
                requests: settings.requests,
                window_ms: settings.window_ms,
                allowed: counters.allowed,
                queued: counters.queued,
                rejected: counters.rejected,
                queued_ratio: counters.queued_ratio(),
                tracked_keys: limiter.tracked_keys(),
                service,
            })
        })
        .collect();

    Json(ApiResponse::success(summaries))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Alerts & Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    /// Most recent N alerts
    pub limit: Option<usize>,
    pub severity: Option<AlertSeverity>,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> impl IntoResponse {
    let mut alerts: Vec<_> = state
        .monitor
        .alerts()
        .list()
        .into_iter()
        .filter(|a| query.severity.map_or(true, |s| a.severity == s))
        .collect();
    if let Some(limit) = query.limit {
        let skip = alerts.len().saturating_sub(limit);
        alerts.drain(..skip);
    }

    Json(ApiResponse::success(alerts))
}

pub async fn clear_alerts(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.monitor.alerts().clear();
    tracing::info!(cleared, "Alert log cleared");
    Json(ApiResponse::success(serde_json::json!({ "cleared": cleared })))
}

/// The monitor's last snapshot, or a fresh one before the first tick.
pub async fn get_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = match state.monitor.latest() {
        Some(snapshot) => snapshot,
        None => state.monitor.collect().await,
    };
    Json(ApiResponse::success(snapshot))
}
