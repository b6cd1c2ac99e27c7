//! Task database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::domain::{PipelineKind, Platform, TaskStatus};

/// Task database model.
/// One row per generation task, for every pipeline kind.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskDbModel {
    pub id: String,
    /// text2img, img2img, img2video, text2video, first_last_frame_img2video, digital_human
    pub pipeline_kind: String,
    /// jimeng, qingying
    pub platform: String,
    /// Status: PENDING, RUNNING, SUCCEEDED, FAILED
    pub status: String,
    /// JSON payload for the pipeline kind
    pub payload: String,
    pub bound_account_id: Option<String>,
    /// Worker unit holding the claim between dequeue and start
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    /// JSON blob with artifact references
    pub result: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<String>,
    pub retry_count: i64,
    pub queue_seq: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub updated_at: i64,
}

impl TaskDbModel {
    pub fn new(kind: PipelineKind, platform: Platform, payload: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_kind: kind.as_str().to_string(),
            platform: platform.as_str().to_string(),
            status: TaskStatus::Pending.as_str().to_string(),
            payload: payload.into(),
            bound_account_id: None,
            claimed_by: None,
            claimed_at: None,
            result: None,
            error: None,
            failure_kind: None,
            retry_count: 0,
            // Assigned by the repository on insert.
            queue_seq: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn get_status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }
}

/// Count of tasks per (kind, status).
#[derive(Debug, Clone, FromRow)]
pub struct TaskStatusCount {
    pub pipeline_kind: String,
    pub status: String,
    pub count: i64,
}

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub kind: Option<PipelineKind>,
    pub status: Option<TaskStatus>,
}

/// Pagination for task listings.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// 1-based page number with a fixed page size.
    pub fn page(page: u32, page_size: u32) -> Self {
        let page_size = page_size.clamp(1, 500);
        Self {
            limit: page_size,
            offset: page.saturating_sub(1).saturating_mul(page_size),
        }
    }
}
