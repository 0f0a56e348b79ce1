//! System endpoints: health check, statistics, operator actions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::service::stats::{HealthReport, StatsSnapshot};

/// `GET /health` — Derived health status with statistics.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns the derived health status (healthy, warning, degraded, critical), \
                   the statistics snapshot it was computed from, and the snapshot time.",
    responses(
        (status = 200, description = "Health report", body = HealthReport),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.engine.health_report().await;
    (StatusCode::OK, Json(report))
}

/// `GET /stats` — Fresh statistics snapshot.
#[utoipa::path(
    get,
    path = "/stats",
    tag = "System",
    summary = "Delivery statistics",
    description = "Computes a fresh snapshot of connection, message, subscription, and \
                   performance statistics.",
    responses(
        (status = 200, description = "Statistics snapshot", body = StatsSnapshot),
    )
)]
pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.engine.stats_snapshot().await))
}

/// Acknowledgment body for the statistics reset.
#[derive(Debug, Serialize, ToSchema)]
pub struct ResetResponse {
    /// Always `true` once the reset completed.
    pub reset: bool,
    /// When the reset happened.
    pub timestamp: String,
}

/// `POST /admin/stats/reset` — Operator counter reset.
#[utoipa::path(
    post,
    path = "/admin/stats/reset",
    tag = "System",
    summary = "Reset statistics",
    description = "Zeroes every delivery counter and clears the bounded history buffers. \
                   Counters otherwise accumulate monotonically for the process lifetime.",
    responses(
        (status = 200, description = "Counters reset", body = ResetResponse),
    )
)]
pub async fn reset_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.reset_stats().await;
    (
        StatusCode::OK,
        Json(ResetResponse {
            reset: true,
            timestamp: Utc::now().to_rfc3339(),
        }),
    )
}

/// System routes mounted at the root level.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/admin/stats/reset", post(reset_stats_handler))
}
