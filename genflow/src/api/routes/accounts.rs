//! Account pool routes, nested under `/api/accounts/{platform}`.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::accounts::{Account, AccountUsageStats, ClearReport, ImportReport, RefreshOutcome};
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::Platform;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_accounts).post(add_accounts).delete(clear_accounts))
        .route("/usage", get(usage))
        .route("/login", post(login))
        .route("/batch-refresh", post(batch_refresh))
        .route("/refresh-all", post(refresh_all))
        .route("/{id}", axum::routing::delete(delete_account))
        .route("/{id}/refresh-cookie", post(refresh_cookie))
        .route("/{id}/cookie", put(set_cookie))
}

fn parse_platform(platform: &str) -> Result<Platform, ApiError> {
    Platform::parse(&platform.to_ascii_lowercase())
        .ok_or_else(|| ApiError::validation(format!("Unknown platform: {}", platform)))
}

/// Load an account and check that it belongs to `platform`.
async fn account_on(state: &AppState, platform: Platform, id: &str) -> ApiResult<Account> {
    let account = state.manager.accounts().get(id).await?;
    if account.platform != platform {
        return Err(ApiError::not_found(format!(
            "Account '{}' not found on {}",
            id, platform
        )));
    }
    Ok(account)
}

#[derive(Debug, Deserialize)]
pub struct AddAccountsRequest {
    /// One account per line, fields separated by `----`.
    pub accounts_text: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountIdsRequest {
    pub account_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetCookieRequest {
    pub cookie: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub account_id: String,
    pub refreshed: bool,
}

async fn list_accounts(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<Json<Vec<Account>>> {
    let platform = parse_platform(&platform)?;
    Ok(Json(state.manager.accounts().list(platform).await?))
}

async fn add_accounts(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Json(request): Json<AddAccountsRequest>,
) -> ApiResult<Json<ImportReport>> {
    let platform = parse_platform(&platform)?;
    if request.accounts_text.trim().is_empty() {
        return Err(ApiError::validation("accounts_text must not be empty"));
    }
    let report = state
        .manager
        .accounts()
        .add_accounts(platform, &request.accounts_text)
        .await?;
    Ok(Json(report))
}

/// Rejected with 409 while any account of the platform is bound to a task.
async fn clear_accounts(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<Json<ClearReport>> {
    let platform = parse_platform(&platform)?;
    Ok(Json(state.manager.accounts().clear(platform).await?))
}

async fn delete_account(
    State(state): State<AppState>,
    Path((platform, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let platform = parse_platform(&platform)?;
    account_on(&state, platform, &id).await?;
    state.manager.accounts().delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn usage(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<Json<Vec<AccountUsageStats>>> {
    let platform = parse_platform(&platform)?;
    Ok(Json(state.manager.accounts().usage_stats(platform).await?))
}

async fn login(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<Json<Account>> {
    let platform = parse_platform(&platform)?;
    Ok(Json(state.manager.accounts().login(platform).await?))
}

async fn refresh_cookie(
    State(state): State<AppState>,
    Path((platform, id)): Path<(String, String)>,
) -> ApiResult<Json<RefreshResponse>> {
    let platform = parse_platform(&platform)?;
    account_on(&state, platform, &id).await?;
    state.manager.accounts().refresh_cookie(&id).await?;
    Ok(Json(RefreshResponse {
        account_id: id,
        refreshed: true,
    }))
}

/// Ids that do not belong to the platform are reported as failures.
async fn batch_refresh(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Json(request): Json<AccountIdsRequest>,
) -> ApiResult<Json<Vec<RefreshOutcome>>> {
    let platform = parse_platform(&platform)?;
    if request.account_ids.is_empty() {
        return Err(ApiError::validation("account_ids must not be empty"));
    }

    let accounts = state.manager.accounts();
    let known: HashSet<String> = accounts
        .list(platform)
        .await?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let (ours, foreign): (Vec<String>, Vec<String>) = request
        .account_ids
        .into_iter()
        .partition(|id| known.contains(id));

    let mut outcomes = accounts.batch_refresh(&ours).await?;
    outcomes.extend(foreign.into_iter().map(|id| RefreshOutcome {
        error: Some(format!("Account '{}' not found on {}", id, platform)),
        account_id: id,
        success: false,
    }));
    Ok(Json(outcomes))
}

async fn refresh_all(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<Json<Vec<RefreshOutcome>>> {
    let platform = parse_platform(&platform)?;
    Ok(Json(state.manager.accounts().refresh_all(platform).await?))
}

async fn set_cookie(
    State(state): State<AppState>,
    Path((platform, id)): Path<(String, String)>,
    Json(request): Json<SetCookieRequest>,
) -> ApiResult<Json<Account>> {
    let platform = parse_platform(&platform)?;
    account_on(&state, platform, &id).await?;
    Ok(Json(
        state
            .manager
            .accounts()
            .set_cookie(&id, &request.cookie)
            .await?,
    ))
}
