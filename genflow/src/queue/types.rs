//! Task queue types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::database::models::TaskDbModel;
use crate::database::time::ms_to_datetime;
use crate::domain::{FailureKind, PipelineKind, Platform, TaskPayload, TaskStatus};
use crate::{Error, Result};

/// Artifacts produced by a successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A generation task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub kind: PipelineKind,
    pub platform: Platform,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub bound_account_id: Option<String>,
    /// Worker unit holding the task, from dequeue until completion.
    pub claimed_by: Option<String>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Running, or claimed by a worker that has not started it yet.
    pub fn is_in_flight(&self) -> bool {
        self.status == TaskStatus::Running || self.claimed_by.is_some()
    }
}

impl TryFrom<TaskDbModel> for Task {
    type Error = Error;

    fn try_from(model: TaskDbModel) -> Result<Self> {
        let kind = PipelineKind::parse(&model.pipeline_kind).ok_or_else(|| {
            Error::Other(format!(
                "task {} has unknown pipeline kind '{}'",
                model.id, model.pipeline_kind
            ))
        })?;
        let status = TaskStatus::parse(&model.status).ok_or_else(|| {
            Error::Other(format!(
                "task {} has unknown status '{}'",
                model.id, model.status
            ))
        })?;
        let platform = Platform::parse(&model.platform).unwrap_or_else(|| kind.default_platform());
        let payload = TaskPayload::from_json(kind, &model.payload)?;
        let result = model
            .result
            .as_deref()
            .map(serde_json::from_str::<TaskResult>)
            .transpose()?;

        Ok(Self {
            id: model.id,
            kind,
            platform,
            status,
            payload,
            bound_account_id: model.bound_account_id,
            claimed_by: model.claimed_by,
            result,
            error: model.error,
            failure_kind: model.failure_kind.as_deref().and_then(FailureKind::parse),
            retry_count: model.retry_count.clamp(0, u32::MAX as i64) as u32,
            created_at: ms_to_datetime(model.created_at),
            started_at: model.started_at.map(ms_to_datetime),
            finished_at: model.finished_at.map(ms_to_datetime),
            updated_at: ms_to_datetime(model.updated_at),
        })
    }
}

/// Per-id outcome of a batch operation.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub task_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn from_result<T>(task_id: impl Into<String>, result: &Result<T>) -> Self {
        Self {
            task_id: task_id.into(),
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        }
    }
}

/// Per-item outcome of a multi-task create.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueOutcome {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A row that could not be turned into a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRow {
    /// 1-based position in the submitted rows (or the sorted folder listing).
    pub row: usize,
    pub reason: String,
}

/// Result of a table or folder import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkCreateReport {
    pub created_task_ids: Vec<String>,
    pub failed_rows: Vec<FailedRow>,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Succeeded => self.succeeded += count,
            TaskStatus::Failed => self.failed += count,
        }
        self.total += count;
    }

    pub fn merge(&mut self, other: &StatusCounts) {
        self.pending += other.pending;
        self.running += other.running;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.total += other.total;
    }
}

/// Counts per status per pipeline kind, computed from current task rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub kinds: BTreeMap<PipelineKind, StatusCounts>,
    pub total: StatusCounts,
}

/// One page of a task listing.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}
