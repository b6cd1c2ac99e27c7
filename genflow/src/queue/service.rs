//! Task queue service.

use chrono_tz::Tz;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::import::{first_missing_file, folder_payload, list_folder_images, normalize_row};
use super::types::{
    BatchOutcome, BulkCreateReport, EnqueueOutcome, FailedRow, QueueSnapshot, StatusCounts, Task,
    TaskPage, TaskResult,
};
use crate::database::models::{Pagination, TaskDbModel, TaskFilter};
use crate::database::repositories::TaskRepository;
use crate::database::time::start_of_today_ms;
use crate::domain::{FailureKind, PipelineKind, Platform, TaskPayload, TaskStatus};
use crate::{Error, Result};

/// Task queues for every pipeline kind over one task table.
///
/// Each kind is a separate FIFO namespace. Dequeue is a single conditional
/// update, so concurrent callers never receive the same task.
pub struct TaskQueue {
    repo: Arc<dyn TaskRepository>,
    notifiers: HashMap<PipelineKind, Arc<Notify>>,
}

impl TaskQueue {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self {
        let notifiers = PipelineKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(Notify::new())))
            .collect();
        Self { repo, notifiers }
    }

    /// Notifier signalled whenever a task of `kind` becomes pending.
    pub fn notifier(&self, kind: PipelineKind) -> Arc<Notify> {
        self.notifiers
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    fn notify(&self, kind: PipelineKind) {
        if let Some(notify) = self.notifiers.get(&kind) {
            notify.notify_one();
        }
    }

    fn resolve_platform(kind: PipelineKind, platform: Option<Platform>) -> Result<Platform> {
        let platform = platform.unwrap_or_else(|| kind.default_platform());
        if !kind.supports(platform) {
            return Err(Error::validation(format!(
                "{} tasks cannot run on {}",
                kind, platform
            )));
        }
        Ok(platform)
    }

    /// Validate and enqueue one task.
    pub async fn enqueue(
        &self,
        kind: PipelineKind,
        platform: Option<Platform>,
        payload: Value,
    ) -> Result<Task> {
        let platform = Self::resolve_platform(kind, platform)?;
        let payload = TaskPayload::from_value(kind, payload)?;
        let model = TaskDbModel::new(kind, platform, payload.to_json()?);
        let created = self.repo.create_task(&model).await?;

        info!(task_id = %created.id, kind = %kind, platform = %platform, "Enqueued task");
        self.notify(kind);
        Task::try_from(created)
    }

    /// Enqueue several payloads; each succeeds or fails on its own.
    pub async fn enqueue_many(
        &self,
        kind: PipelineKind,
        items: Vec<(Option<Platform>, Value)>,
    ) -> Vec<EnqueueOutcome> {
        let mut outcomes = Vec::with_capacity(items.len());
        for (index, (platform, payload)) in items.into_iter().enumerate() {
            let outcome = match self.enqueue(kind, platform, payload).await {
                Ok(task) => EnqueueOutcome {
                    index,
                    task: Some(task),
                    error: None,
                },
                Err(e) => EnqueueOutcome {
                    index,
                    task: None,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        Task::try_from(self.repo.get_task(task_id).await?)
    }

    /// Fetch a task, treating a task of another kind as unknown.
    pub async fn get_for_kind(&self, kind: PipelineKind, task_id: &str) -> Result<Task> {
        let task = self.get(task_id).await?;
        if task.kind != kind {
            return Err(Error::not_found("Task", task_id));
        }
        Ok(task)
    }

    /// Claim the oldest unclaimed pending task of `kind` for `worker`.
    pub async fn dequeue_next(&self, kind: PipelineKind, worker: &str) -> Result<Option<Task>> {
        match self.repo.claim_next_pending(kind, worker).await? {
            Some(model) => {
                debug!(task_id = %model.id, worker = %worker, "Claimed task");
                Task::try_from(model).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Give a claimed task back, behind every other pending task of its kind.
    pub async fn release_to_tail(&self, task_id: &str, worker: &str) -> Result<()> {
        if self.repo.requeue_claimed(task_id, worker).await? {
            debug!(task_id = %task_id, worker = %worker, "Returned task to queue tail");
            return Ok(());
        }
        Err(self.transition_error(task_id, "pending").await)
    }

    pub async fn mark_running(&self, task_id: &str, account_id: &str, worker: &str) -> Result<()> {
        if self.repo.mark_running(task_id, account_id, worker).await? {
            return Ok(());
        }
        Err(self.transition_error(task_id, "running").await)
    }

    pub async fn mark_succeeded(&self, task_id: &str, result: &TaskResult) -> Result<()> {
        let result = serde_json::to_string(result)?;
        if self.repo.mark_succeeded(task_id, &result).await? {
            info!(task_id = %task_id, "Task succeeded");
            return Ok(());
        }
        Err(self.transition_error(task_id, "succeeded").await)
    }

    pub async fn mark_failed(
        &self,
        task_id: &str,
        error: &str,
        failure_kind: FailureKind,
    ) -> Result<()> {
        if self
            .repo
            .mark_failed(task_id, error, failure_kind.as_str())
            .await?
        {
            info!(
                task_id = %task_id,
                failure_kind = %failure_kind,
                error = %error,
                "Task failed"
            );
            return Ok(());
        }
        Err(self.transition_error(task_id, "failed").await)
    }

    async fn transition_error(&self, task_id: &str, to: &str) -> Error {
        match self.repo.find_task(task_id).await {
            Ok(Some(task)) => {
                let from = if task.claimed_by.is_some() && task.status == TaskStatus::Pending.as_str()
                {
                    "claimed".to_string()
                } else {
                    task.status.to_lowercase()
                };
                Error::invalid_transition(from, to)
            }
            Ok(None) => Error::not_found("Task", task_id),
            Err(e) => e,
        }
    }

    /// failed -> pending with a fresh account selection.
    pub async fn retry(&self, task_id: &str) -> Result<Task> {
        if !self.repo.reset_for_retry(task_id).await? {
            return Err(self.transition_error(task_id, "pending").await);
        }
        let task = self.get(task_id).await?;
        info!(task_id = %task_id, retry_count = task.retry_count, "Task re-queued for retry");
        self.notify(task.kind);
        Ok(task)
    }

    pub async fn retry_for_kind(&self, kind: PipelineKind, task_id: &str) -> Result<Task> {
        self.get_for_kind(kind, task_id).await?;
        self.retry(task_id).await
    }

    /// Retry each id independently. An empty list retries every failed task of `kind`.
    pub async fn batch_retry(
        &self,
        kind: PipelineKind,
        task_ids: &[String],
    ) -> Result<Vec<BatchOutcome>> {
        let ids = if task_ids.is_empty() {
            self.repo
                .list_ids_by_status(kind, TaskStatus::Failed)
                .await?
        } else {
            task_ids.to_vec()
        };

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.retry_for_kind(kind, &id).await;
            outcomes.push(BatchOutcome::from_result(id, &result));
        }
        Ok(outcomes)
    }

    /// Replace the payload of an unclaimed pending or failed task.
    pub async fn update(&self, kind: PipelineKind, task_id: &str, payload: Value) -> Result<Task> {
        let task = self.get_for_kind(kind, task_id).await?;
        if task.is_in_flight() || task.status == TaskStatus::Succeeded {
            return Err(Error::conflict(format!(
                "task {} is {} and cannot be edited",
                task_id,
                if task.is_in_flight() { "in flight" } else { "finished" }
            )));
        }
        let payload = TaskPayload::from_value(kind, payload)?;
        if !self.repo.update_payload(task_id, &payload.to_json()?).await? {
            return Err(Error::conflict(format!(
                "task {} was picked up while editing",
                task_id
            )));
        }
        self.get(task_id).await
    }

    /// Delete one task. Running or claimed tasks are rejected.
    pub async fn delete(&self, kind: PipelineKind, task_id: &str) -> Result<()> {
        let task = self.get_for_kind(kind, task_id).await?;
        if task.is_in_flight() {
            return Err(Error::conflict(format!(
                "task {} is bound to a live worker",
                task_id
            )));
        }
        if !self.repo.delete_task(task_id).await? {
            return Err(Error::conflict(format!(
                "task {} was picked up while deleting",
                task_id
            )));
        }
        info!(task_id = %task_id, "Task deleted");
        Ok(())
    }

    pub async fn batch_delete(&self, kind: PipelineKind, task_ids: &[String]) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            let result = self.delete(kind, id).await;
            outcomes.push(BatchOutcome::from_result(id.clone(), &result));
        }
        outcomes
    }

    /// Delete every task created before the start of today in `tz`, whatever its status.
    pub async fn delete_before_today(&self, kind: Option<PipelineKind>, tz: Tz) -> Result<u64> {
        let cutoff = start_of_today_ms(tz);
        let deleted = self.repo.delete_created_before(kind, cutoff).await?;
        info!(deleted, "Deleted tasks created before today");
        Ok(deleted)
    }

    pub async fn stats(&self, kind: PipelineKind) -> Result<StatusCounts> {
        let mut snapshot = self.snapshot_for(Some(kind)).await?;
        Ok(snapshot.kinds.remove(&kind).unwrap_or_default())
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        self.snapshot_for(None).await
    }

    async fn snapshot_for(&self, kind: Option<PipelineKind>) -> Result<QueueSnapshot> {
        let mut snapshot = QueueSnapshot::default();
        let kinds: Vec<PipelineKind> = match kind {
            Some(kind) => vec![kind],
            None => PipelineKind::ALL.to_vec(),
        };
        for kind in kinds {
            snapshot.kinds.insert(kind, StatusCounts::default());
        }

        for row in self.repo.count_by_status(kind).await? {
            let (Some(kind), Some(status)) = (
                PipelineKind::parse(&row.pipeline_kind),
                TaskStatus::parse(&row.status),
            ) else {
                warn!(kind = %row.pipeline_kind, status = %row.status, "Skipping unknown task bucket");
                continue;
            };
            let count = row.count.max(0) as u64;
            snapshot.kinds.entry(kind).or_default().add(status, count);
            snapshot.total.add(status, count);
        }
        Ok(snapshot)
    }

    /// List tasks of `kind`, newest first. `page` is 1-based.
    pub async fn list(
        &self,
        kind: PipelineKind,
        status: Option<TaskStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<TaskPage> {
        let pagination = Pagination::page(page.max(1), page_size);
        let filter = TaskFilter {
            kind: Some(kind),
            status,
        };
        let (models, total) = self.repo.list_tasks(&filter, &pagination).await?;
        let tasks = models
            .into_iter()
            .map(Task::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(TaskPage {
            tasks,
            total,
            page: page.max(1),
            page_size: pagination.limit,
        })
    }

    /// Create one task per table row; referenced files must exist.
    pub async fn batch_create_from_table(
        &self,
        kind: PipelineKind,
        rows: &[Value],
    ) -> BulkCreateReport {
        let mut report = BulkCreateReport::default();
        for (index, row) in rows.iter().enumerate() {
            match self.create_from_row(kind, row).await {
                Ok(task) => report.created_task_ids.push(task.id),
                Err(e) => report.failed_rows.push(FailedRow {
                    row: index + 1,
                    reason: e.to_string(),
                }),
            }
        }
        info!(
            kind = %kind,
            created = report.created_task_ids.len(),
            failed = report.failed_rows.len(),
            "Created tasks from table"
        );
        report
    }

    async fn create_from_row(&self, kind: PipelineKind, row: &Value) -> Result<Task> {
        let normalized = normalize_row(kind, row)?;
        let platform = Self::resolve_platform(kind, normalized.platform)?;
        let payload = TaskPayload::from_value(kind, normalized.payload)?;
        if let Some(missing) = first_missing_file(&payload.input_files()).await {
            return Err(Error::validation(format!("file not found: {}", missing)));
        }
        self.enqueue(kind, Some(platform), payload.to_value()?)
            .await
    }

    /// Create one task per image in `folder`, sharing the template's parameters.
    pub async fn import_folder(
        &self,
        kind: PipelineKind,
        platform: Option<Platform>,
        folder: &Path,
        template: &Value,
    ) -> Result<BulkCreateReport> {
        if kind.folder_image_field().is_none() {
            return Err(Error::validation(format!(
                "{} does not take image inputs from a folder",
                kind
            )));
        }
        let platform = Self::resolve_platform(kind, platform)?;
        let images = list_folder_images(folder).await?;

        let mut report = BulkCreateReport::default();
        for (index, image) in images.iter().enumerate() {
            let result = match folder_payload(kind, template, image) {
                Ok(payload) => self.enqueue(kind, Some(platform), payload).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(task) => report.created_task_ids.push(task.id),
                Err(e) => report.failed_rows.push(FailedRow {
                    row: index + 1,
                    reason: format!("{}: {}", image.display(), e),
                }),
            }
        }
        info!(
            kind = %kind,
            folder = %folder.display(),
            created = report.created_task_ids.len(),
            "Imported folder"
        );
        Ok(report)
    }

    /// Running or claimed tasks.
    pub async fn in_flight(&self) -> Result<Vec<Task>> {
        self.repo
            .list_in_flight()
            .await?
            .into_iter()
            .map(Task::try_from)
            .collect()
    }

    /// Put an abandoned running or claimed task back in the queue.
    pub async fn reset_abandoned(&self, task_id: &str) -> Result<bool> {
        let reset = self.repo.reset_running_to_pending(task_id).await?;
        if reset {
            if let Ok(task) = self.get(task_id).await {
                self.notify(task.kind);
            }
        }
        Ok(reset)
    }

    /// Startup recovery: no worker survives a restart.
    pub async fn recover(&self) -> Result<u64> {
        let recovered = self.repo.recover_interrupted().await?;
        if recovered > 0 {
            warn!(recovered, "Reset interrupted tasks to pending");
        }
        Ok(recovered)
    }

    pub async fn pending_count(&self, kind: PipelineKind) -> Result<u64> {
        self.repo.count_pending(kind).await
    }

    /// Pending tasks per target platform; platforms without work are omitted.
    pub async fn pending_by_platform(&self) -> Result<BTreeMap<Platform, u64>> {
        let mut counts = BTreeMap::new();
        for (platform, count) in self.repo.count_pending_by_platform().await? {
            if let Some(platform) = Platform::parse(&platform) {
                *counts.entry(platform).or_default() += count.max(0) as u64;
            }
        }
        Ok(counts)
    }

    pub async fn ping(&self) -> Result<()> {
        self.repo.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxTaskRepository;
    use crate::database::test_pool;
    use serde_json::json;

    async fn queue() -> TaskQueue {
        TaskQueue::new(Arc::new(SqlxTaskRepository::new(test_pool().await)))
    }

    async fn run_to_failure(queue: &TaskQueue, kind: PipelineKind) -> Task {
        let task = queue.dequeue_next(kind, "w0").await.unwrap().unwrap();
        queue.mark_running(&task.id, "acc", "w0").await.unwrap();
        queue
            .mark_failed(&task.id, "boom", FailureKind::GenerationFailed)
            .await
            .unwrap();
        queue.get(&task.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_validates_payload_and_platform() {
        let queue = queue().await;
        let err = queue
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": ""}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = queue
            .enqueue(
                PipelineKind::Text2Img,
                Some(Platform::Qingying),
                json!({"prompt": "x"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let task = queue
            .enqueue(
                PipelineKind::Img2Video,
                Some(Platform::Qingying),
                json!({"image_path": "/a.png"}),
            )
            .await
            .unwrap();
        assert_eq!(task.platform, Platform::Qingying);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_dequeue_fifo_and_release_to_tail() {
        let queue = queue().await;
        let a = queue
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "a"}))
            .await
            .unwrap();
        let b = queue
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "b"}))
            .await
            .unwrap();

        let first = queue
            .dequeue_next(PipelineKind::Text2Img, "w0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, a.id);
        queue.release_to_tail(&a.id, "w0").await.unwrap();

        let next = queue
            .dequeue_next(PipelineKind::Text2Img, "w0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, b.id);
        let after = queue
            .dequeue_next(PipelineKind::Text2Img, "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.id, a.id);
        assert_eq!(after.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_completion_requires_running() {
        let queue = queue().await;
        let task = queue
            .enqueue(PipelineKind::Text2Video, None, json!({"prompt": "waves"}))
            .await
            .unwrap();

        let err = queue
            .mark_succeeded(&task.id, &TaskResult::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let err = queue
            .mark_failed("missing", "x", FailureKind::Other)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        queue
            .dequeue_next(PipelineKind::Text2Video, "w0")
            .await
            .unwrap();
        queue.mark_running(&task.id, "acc", "w0").await.unwrap();
        let result = TaskResult {
            artifacts: vec!["out.mp4".into()],
            metadata: None,
        };
        queue.mark_succeeded(&task.id, &result).await.unwrap();
        assert!(queue.mark_succeeded(&task.id, &result).await.is_err());

        let done = queue.get(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.result, Some(result));
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_only_from_failed() {
        let queue = queue().await;
        let pending = queue
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "a"}))
            .await
            .unwrap();
        assert!(queue.retry(&pending.id).await.unwrap_err().is_conflict());

        let failed = run_to_failure(&queue, PipelineKind::Text2Img).await;
        assert_eq!(failed.failure_kind, Some(FailureKind::GenerationFailed));

        let retried = queue.retry(&failed.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error.is_none());
        assert!(retried.bound_account_id.is_none());
    }

    #[tokio::test]
    async fn test_batch_retry_empty_means_all_failed() {
        let queue = queue().await;
        for prompt in ["a", "b"] {
            queue
                .enqueue(PipelineKind::Text2Img, None, json!({"prompt": prompt}))
                .await
                .unwrap();
        }
        run_to_failure(&queue, PipelineKind::Text2Img).await;
        run_to_failure(&queue, PipelineKind::Text2Img).await;

        let outcomes = queue
            .batch_retry(PipelineKind::Text2Img, &[])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.success));

        let outcomes = queue
            .batch_retry(PipelineKind::Text2Img, &["nope".to_string()])
            .await
            .unwrap();
        assert!(!outcomes[0].success);
    }

    #[tokio::test]
    async fn test_delete_and_update_reject_in_flight() {
        let queue = queue().await;
        let task = queue
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "a"}))
            .await
            .unwrap();
        let idle = queue
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "b"}))
            .await
            .unwrap();
        queue
            .dequeue_next(PipelineKind::Text2Img, "w0")
            .await
            .unwrap();

        let err = queue.delete(PipelineKind::Text2Img, &task.id).await.unwrap_err();
        assert!(err.is_conflict());
        let err = queue
            .update(PipelineKind::Text2Img, &task.id, json!({"prompt": "c"}))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let updated = queue
            .update(PipelineKind::Text2Img, &idle.id, json!({"prompt": "c"}))
            .await
            .unwrap();
        assert_eq!(updated.payload.prompt(), Some("c"));

        // Kind namespaces are separate.
        assert!(
            queue
                .delete(PipelineKind::Img2Img, &idle.id)
                .await
                .unwrap_err()
                .is_not_found()
        );

        let outcomes = queue
            .batch_delete(PipelineKind::Text2Img, &[task.id.clone(), idle.id.clone()])
            .await;
        assert!(!outcomes[0].success);
        assert!(outcomes[1].success);
    }

    #[tokio::test]
    async fn test_snapshot_and_list() {
        let queue = queue().await;
        for prompt in ["a", "b", "c"] {
            queue
                .enqueue(PipelineKind::Text2Img, None, json!({"prompt": prompt}))
                .await
                .unwrap();
        }
        run_to_failure(&queue, PipelineKind::Text2Img).await;

        let stats = queue.stats(PipelineKind::Text2Img).await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 3);

        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.kinds.len(), PipelineKind::ALL.len());
        assert_eq!(snapshot.total.total, 3);

        let page = queue
            .list(PipelineKind::Text2Img, Some(TaskStatus::Pending), 1, 1)
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_create_from_table() {
        let queue = queue().await;
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.png");
        tokio::fs::write(&image, b"png").await.unwrap();
        let image = image.to_string_lossy().into_owned();

        let rows = vec![
            json!({"image_path": image, "prompt": "pan left", "second": "5"}),
            json!({"prompt": "no image"}),
            json!({"image_path": "/definitely/missing.png"}),
        ];
        let report = queue
            .batch_create_from_table(PipelineKind::Img2Video, &rows)
            .await;
        assert_eq!(report.created_task_ids.len(), 1);
        let failed: Vec<usize> = report.failed_rows.iter().map(|r| r.row).collect();
        assert_eq!(failed, vec![2, 3]);
        assert!(report.failed_rows[1].reason.contains("file not found"));
    }

    #[tokio::test]
    async fn test_import_folder() {
        let queue = queue().await;
        let dir = tempfile::tempdir().unwrap();
        for name in ["2.png", "1.jpg", "readme.md"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let report = queue
            .import_folder(
                PipelineKind::Img2Img,
                None,
                dir.path(),
                &json!({"prompt": "watercolor"}),
            )
            .await
            .unwrap();
        assert_eq!(report.created_task_ids.len(), 2);
        let first = queue.get(&report.created_task_ids[0]).await.unwrap();
        assert!(first.payload.input_files()[0].ends_with("1.jpg"));

        assert!(
            queue
                .import_folder(PipelineKind::Text2Img, None, dir.path(), &json!({}))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_recover_and_reset_abandoned() {
        let queue = queue().await;
        let task = queue
            .enqueue(PipelineKind::DigitalHuman, None, json!({"image_path": "a.png", "audio_path": "a.mp3"}))
            .await
            .unwrap();
        queue
            .dequeue_next(PipelineKind::DigitalHuman, "w0")
            .await
            .unwrap();
        queue.mark_running(&task.id, "acc", "w0").await.unwrap();
        assert_eq!(queue.in_flight().await.unwrap().len(), 1);

        assert!(queue.reset_abandoned(&task.id).await.unwrap());
        assert!(!queue.reset_abandoned(&task.id).await.unwrap());
        let reset = queue.get(&task.id).await.unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.retry_count, 0);
        assert_eq!(queue.recover().await.unwrap(), 0);
    }
}
