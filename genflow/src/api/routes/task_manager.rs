//! Task manager control routes.

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Serialize;

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::domain::ManagerState;
use crate::manager::{HealthReport, ManagerSummary};
use crate::worker::ThreadInfo;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/summary", get(summary))
        .route("/threads", get(threads))
        .route("/health", get(health))
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub state: ManagerState,
}

/// Result of a control call; `changed` is false when the call was a no-op.
#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub changed: bool,
    pub state: ManagerState,
}

async fn status(State(state): State<AppState>) -> Json<StateResponse> {
    Json(StateResponse {
        state: state.manager.get_status(),
    })
}

fn transition(state: &AppState, changed: bool) -> Json<TransitionResponse> {
    Json(TransitionResponse {
        changed,
        state: state.manager.get_status(),
    })
}

async fn start(State(state): State<AppState>) -> ApiResult<Json<TransitionResponse>> {
    let changed = state.manager.start().await?;
    Ok(transition(&state, changed))
}

/// Blocks until in-flight tasks finished or the grace period forced them to stop.
async fn stop(State(state): State<AppState>) -> ApiResult<Json<TransitionResponse>> {
    let changed = state.manager.stop().await?;
    Ok(transition(&state, changed))
}

async fn pause(State(state): State<AppState>) -> ApiResult<Json<TransitionResponse>> {
    let changed = state.manager.pause().await?;
    Ok(transition(&state, changed))
}

async fn resume(State(state): State<AppState>) -> ApiResult<Json<TransitionResponse>> {
    let changed = state.manager.resume().await?;
    Ok(transition(&state, changed))
}

async fn summary(State(state): State<AppState>) -> ApiResult<Json<ManagerSummary>> {
    Ok(Json(state.manager.get_summary().await?))
}

async fn threads(State(state): State<AppState>) -> Json<Vec<ThreadInfo>> {
    Json(state.manager.get_threads())
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.manager.health().await)
}
