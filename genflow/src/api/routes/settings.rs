//! Runtime settings and log filter routes.

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::config::{RuntimeSettings, RuntimeSettingsUpdate};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_settings).put(update_settings))
        .route("/log-filter", get(get_log_filter).put(set_log_filter))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogFilterBody {
    pub filter: String,
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<RuntimeSettings>> {
    Ok(Json(state.manager.settings().get().await?))
}

/// A changed thread cap takes effect on the next manager start.
async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<RuntimeSettingsUpdate>,
) -> ApiResult<Json<RuntimeSettings>> {
    Ok(Json(state.manager.settings().update(update).await?))
}

async fn get_log_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilterBody>> {
    let logging = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::internal("Logging is not managed by this process"))?;
    Ok(Json(LogFilterBody {
        filter: logging.get_filter(),
    }))
}

/// Apply the filter now and persist it for the next start.
async fn set_log_filter(
    State(state): State<AppState>,
    Json(body): Json<LogFilterBody>,
) -> ApiResult<Json<LogFilterBody>> {
    let logging = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::internal("Logging is not managed by this process"))?;
    let filter = body.filter.trim();
    if filter.is_empty() {
        return Err(ApiError::validation("filter must not be empty"));
    }
    logging.set_filter(filter)?;
    state.manager.settings().set_log_filter(filter).await?;
    Ok(Json(LogFilterBody {
        filter: logging.get_filter(),
    }))
}
