//! Per-pipeline task routes.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::artifacts::{ArtifactAsset, build_zip};
use crate::domain::{PipelineKind, Platform, TaskStatus};
use crate::queue::{BatchOutcome, BulkCreateReport, StatusCounts, Task, TaskPage};

/// Header carrying the per-id failures of a batch download.
pub const FAILED_HEADER: &str = "x-genflow-failed";

/// Create the tasks router, nested under `/api/tasks/{kind}`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(create_tasks))
        .route("/stats", get(stats))
        .route("/before-today", delete(delete_before_today))
        .route("/batch-retry", post(batch_retry))
        .route("/batch-delete", post(batch_delete))
        .route("/batch-download", post(batch_download))
        .route("/import-folder", post(import_folder))
        .route("/batch-create-from-table", post(batch_create_from_table))
        .route(
            "/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/{id}/retry", post(retry_task))
        .route("/{id}/download", get(download_task))
}

fn parse_kind(kind: &str) -> Result<PipelineKind, ApiError> {
    PipelineKind::parse(kind)
        .ok_or_else(|| ApiError::validation(format!("Unknown pipeline kind: {}", kind)))
}

fn parse_platform(platform: &str) -> Result<Platform, ApiError> {
    Platform::parse(&platform.to_ascii_lowercase())
        .ok_or_else(|| ApiError::validation(format!("Unknown platform: {}", platform)))
}

/// Split the optional `platform` key off a create body.
fn split_platform(mut item: Value) -> Result<(Option<Platform>, Value), ApiError> {
    let platform = match item.as_object_mut().and_then(|o| o.remove("platform")) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(parse_platform(&s)?),
        Some(_) => return Err(ApiError::validation("platform must be a string")),
    };
    Ok((platform, item))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub status: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TaskIdsRequest {
    #[serde(default)]
    pub task_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImportFolderRequest {
    pub folder: PathBuf,
    pub platform: Option<String>,
    /// Shared parameters copied into every created task.
    #[serde(default)]
    pub template: Value,
}

#[derive(Debug, Deserialize)]
pub struct TableRequest {
    pub rows: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<TaskPage>> {
    let kind = parse_kind(&kind)?;
    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            TaskStatus::parse(&s.to_ascii_uppercase())
                .ok_or_else(|| ApiError::validation(format!("Unknown status: {}", s)))
        })
        .transpose()?;
    let page = state
        .manager
        .queue()
        .list(
            kind,
            status,
            params.page.unwrap_or(1),
            params.page_size.unwrap_or(20),
        )
        .await?;
    Ok(Json(page))
}

/// An object body creates one task (201); an array creates one per element.
async fn create_tasks(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let kind = parse_kind(&kind)?;
    let queue = state.manager.queue();

    match body {
        Value::Array(items) => {
            let items = items
                .into_iter()
                .map(split_platform)
                .collect::<Result<Vec<_>, _>>()?;
            let outcomes = queue.enqueue_many(kind, items).await;
            Ok(Json(outcomes).into_response())
        }
        Value::Object(_) => {
            let (platform, payload) = split_platform(body)?;
            let task = queue.enqueue(kind, platform, payload).await?;
            Ok((StatusCode::CREATED, Json(task)).into_response())
        }
        _ => Err(ApiError::validation(
            "Request body must be a task object or an array of task objects",
        )),
    }
}

async fn get_task(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Json<Task>> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.manager.queue().get_for_kind(kind, &id).await?))
}

async fn update_task(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Task>> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.manager.queue().update(kind, &id, payload).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let kind = parse_kind(&kind)?;
    state.manager.queue().delete(kind, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_task(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Json<Task>> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.manager.queue().retry_for_kind(kind, &id).await?))
}

/// An empty id list retries every failed task of the kind.
async fn batch_retry(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(request): Json<TaskIdsRequest>,
) -> ApiResult<Json<Vec<BatchOutcome>>> {
    let kind = parse_kind(&kind)?;
    let outcomes = state
        .manager
        .queue()
        .batch_retry(kind, &request.task_ids)
        .await?;
    Ok(Json(outcomes))
}

async fn batch_delete(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(request): Json<TaskIdsRequest>,
) -> ApiResult<Json<Vec<BatchOutcome>>> {
    let kind = parse_kind(&kind)?;
    if request.task_ids.is_empty() {
        return Err(ApiError::validation("task_ids must not be empty"));
    }
    Ok(Json(
        state
            .manager
            .queue()
            .batch_delete(kind, &request.task_ids)
            .await,
    ))
}

/// JSON with every non-ASCII character escaped, so it fits in a header value.
fn ascii_json<T: Serialize>(value: &T) -> ApiResult<String> {
    let json = serde_json::to_string(value).map_err(|e| ApiError::internal(e.to_string()))?;
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut [0; 2]) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}

fn content_type_for(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or_default();
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

fn attachment(name: &str, bytes: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(name)),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// Zip of every requested task's assets. Ids that could not be fetched are
/// listed in the `X-Genflow-Failed` header.
async fn batch_download(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(request): Json<TaskIdsRequest>,
) -> ApiResult<Response> {
    let kind = parse_kind(&kind)?;
    if request.task_ids.is_empty() {
        return Err(ApiError::validation("task_ids must not be empty"));
    }

    let fetch = state.artifacts.fetch(kind, &request.task_ids).await?;
    let failed = fetch.failed();
    let Some(archive) = fetch.archive.clone() else {
        let details = serde_json::to_value(&failed).map_err(|e| ApiError::internal(e.to_string()))?;
        return Err(
            ApiError::not_found("None of the requested tasks have downloadable artifacts")
                .with_details(details),
        );
    };

    let name = format!(
        "{}_artifacts_{}.zip",
        kind,
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let mut response = attachment(&name, archive);
    if !failed.is_empty() {
        let value = HeaderValue::from_str(&ascii_json(&failed)?)
            .map_err(|e| ApiError::internal(e.to_string()))?;
        response.headers_mut().insert(FAILED_HEADER, value);
    }
    Ok(response)
}

/// A single asset is returned as is; several are zipped.
async fn download_task(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let kind = parse_kind(&kind)?;
    let mut bundle = state.artifacts.fetch_one(kind, &id).await?;

    if bundle.assets.len() == 1 {
        if let Some(ArtifactAsset { name, bytes }) = bundle.assets.pop() {
            return Ok(attachment(&name, bytes));
        }
    }

    let assets = bundle.assets;
    let archive = tokio::task::spawn_blocking(move || build_zip(&assets))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(attachment(&format!("task_{}.zip", bundle.task_id), archive))
}

async fn stats(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<StatusCounts>> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.manager.queue().stats(kind).await?))
}

async fn import_folder(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(request): Json<ImportFolderRequest>,
) -> ApiResult<Json<BulkCreateReport>> {
    let kind = parse_kind(&kind)?;
    let platform = request.platform.as_deref().map(parse_platform).transpose()?;
    let template = if request.template.is_null() {
        Value::Object(Default::default())
    } else {
        request.template
    };
    let report = state
        .manager
        .queue()
        .import_folder(kind, platform, &request.folder, &template)
        .await?;
    Ok(Json(report))
}

async fn batch_create_from_table(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(request): Json<TableRequest>,
) -> ApiResult<Json<BulkCreateReport>> {
    let kind = parse_kind(&kind)?;
    Ok(Json(
        state
            .manager
            .queue()
            .batch_create_from_table(kind, &request.rows)
            .await,
    ))
}

/// Delete every task of the kind created before today, whatever its status.
async fn delete_before_today(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<DeletedResponse>> {
    let kind = parse_kind(&kind)?;
    let tz = state.manager.accounts().config().timezone;
    let deleted = state
        .manager
        .queue()
        .delete_before_today(Some(kind), tz)
        .await?;
    Ok(Json(DeletedResponse { deleted }))
}
