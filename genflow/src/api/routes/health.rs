//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::server::AppState;
use crate::manager::HealthStatus;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/live", get(liveness_check))
}

/// Full health report. HTTP 503 only when a component is outright unhealthy.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.manager.health().await;
    let code = if report
        .components
        .iter()
        .any(|c| c.status == HealthStatus::Unhealthy)
    {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

/// Liveness check - is the service alive?
async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}
