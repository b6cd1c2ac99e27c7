//! Task repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{Pagination, TaskDbModel, TaskFilter, TaskStatusCount};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::domain::{PipelineKind, TaskStatus};
use crate::{Error, Result};

/// Next tail position of the shared FIFO ordering.
const NEXT_QUEUE_SEQ: &str = "(SELECT COALESCE(MAX(queue_seq), 0) + 1 FROM tasks)";

/// Task repository trait.
///
/// Every state-changing method is a single conditional statement; the `bool`
/// results report whether the guarded row was actually updated.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, task: &TaskDbModel) -> Result<TaskDbModel>;
    async fn get_task(&self, id: &str) -> Result<TaskDbModel>;
    async fn find_task(&self, id: &str) -> Result<Option<TaskDbModel>>;

    /// Atomically claim the oldest unclaimed pending task of `kind` for `worker`.
    async fn claim_next_pending(
        &self,
        kind: PipelineKind,
        worker: &str,
    ) -> Result<Option<TaskDbModel>>;
    /// Drop `worker`'s claim and move the task to the queue tail.
    async fn requeue_claimed(&self, id: &str, worker: &str) -> Result<bool>;
    async fn mark_running(&self, id: &str, account_id: &str, worker: &str) -> Result<bool>;
    async fn mark_succeeded(&self, id: &str, result: &str) -> Result<bool>;
    async fn mark_failed(&self, id: &str, error: &str, failure_kind: &str) -> Result<bool>;
    /// failed -> pending, incrementing `retry_count`.
    async fn reset_for_retry(&self, id: &str) -> Result<bool>;
    /// running -> pending without counting a retry (liveness recovery).
    async fn reset_running_to_pending(&self, id: &str) -> Result<bool>;
    async fn update_payload(&self, id: &str, payload: &str) -> Result<bool>;
    /// Delete a task that is neither running nor claimed.
    async fn delete_task(&self, id: &str) -> Result<bool>;
    /// Delete tasks created before `cutoff_ms`, whatever their status.
    async fn delete_created_before(&self, kind: Option<PipelineKind>, cutoff_ms: i64)
    -> Result<u64>;

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        pagination: &Pagination,
    ) -> Result<(Vec<TaskDbModel>, u64)>;
    async fn list_ids_by_status(&self, kind: PipelineKind, status: TaskStatus)
    -> Result<Vec<String>>;
    /// Running or claimed tasks.
    async fn list_in_flight(&self) -> Result<Vec<TaskDbModel>>;
    async fn count_by_status(&self, kind: Option<PipelineKind>) -> Result<Vec<TaskStatusCount>>;
    async fn count_pending(&self, kind: PipelineKind) -> Result<u64>;
    /// Pending tasks per target platform.
    async fn count_pending_by_platform(&self) -> Result<Vec<(String, i64)>>;

    /// Reset every running task and clear every claim. Returns affected rows.
    async fn recover_interrupted(&self) -> Result<u64>;
    async fn ping(&self) -> Result<()>;
}

/// SQLx implementation of TaskRepository.
pub struct SqlxTaskRepository {
    pool: SqlitePool,
}

impl SqlxTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for SqlxTaskRepository {
    async fn create_task(&self, task: &TaskDbModel) -> Result<TaskDbModel> {
        let sql = format!(
            r#"
            INSERT INTO tasks (
                id, pipeline_kind, platform, status, payload, retry_count,
                queue_seq, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, {NEXT_QUEUE_SEQ}, ?, ?)
            RETURNING *
            "#
        );
        retry_on_sqlite_busy("create_task", || async {
            Ok(sqlx::query_as::<_, TaskDbModel>(&sql)
                .bind(&task.id)
                .bind(&task.pipeline_kind)
                .bind(&task.platform)
                .bind(&task.status)
                .bind(&task.payload)
                .bind(task.retry_count)
                .bind(task.created_at)
                .bind(task.updated_at)
                .fetch_one(&self.pool)
                .await?)
        })
        .await
    }

    async fn get_task(&self, id: &str) -> Result<TaskDbModel> {
        self.find_task(id)
            .await?
            .ok_or_else(|| Error::not_found("Task", id))
    }

    async fn find_task(&self, id: &str) -> Result<Option<TaskDbModel>> {
        Ok(
            sqlx::query_as::<_, TaskDbModel>("SELECT * FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn claim_next_pending(
        &self,
        kind: PipelineKind,
        worker: &str,
    ) -> Result<Option<TaskDbModel>> {
        retry_on_sqlite_busy("claim_next_pending", || async {
            let now = now_ms();
            Ok(sqlx::query_as::<_, TaskDbModel>(
                r#"
                UPDATE tasks
                SET claimed_by = ?, claimed_at = ?, updated_at = ?
                WHERE id = (
                    SELECT id FROM tasks
                    WHERE pipeline_kind = ? AND status = 'PENDING' AND claimed_by IS NULL
                    ORDER BY queue_seq ASC, created_at ASC, id ASC
                    LIMIT 1
                )
                AND status = 'PENDING' AND claimed_by IS NULL
                RETURNING *
                "#,
            )
            .bind(worker)
            .bind(now)
            .bind(now)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?)
        })
        .await
    }

    async fn requeue_claimed(&self, id: &str, worker: &str) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET claimed_by = NULL, claimed_at = NULL, queue_seq = {NEXT_QUEUE_SEQ}, updated_at = ?
            WHERE id = ? AND status = 'PENDING' AND claimed_by = ?
            "#
        );
        retry_on_sqlite_busy("requeue_claimed", || async {
            let done = sqlx::query(&sql)
                .bind(now_ms())
                .bind(id)
                .bind(worker)
                .execute(&self.pool)
                .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn mark_running(&self, id: &str, account_id: &str, worker: &str) -> Result<bool> {
        retry_on_sqlite_busy("mark_running", || async {
            let now = now_ms();
            let done = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'RUNNING', bound_account_id = ?, started_at = ?, updated_at = ?
                WHERE id = ? AND status = 'PENDING' AND claimed_by = ?
                "#,
            )
            .bind(account_id)
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(worker)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn mark_succeeded(&self, id: &str, result: &str) -> Result<bool> {
        retry_on_sqlite_busy("mark_succeeded", || async {
            let now = now_ms();
            let done = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'SUCCEEDED', result = ?, error = NULL, failure_kind = NULL,
                    claimed_by = NULL, claimed_at = NULL, finished_at = ?, updated_at = ?
                WHERE id = ? AND status = 'RUNNING'
                "#,
            )
            .bind(result)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str, failure_kind: &str) -> Result<bool> {
        retry_on_sqlite_busy("mark_failed", || async {
            let now = now_ms();
            let done = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'FAILED', error = ?, failure_kind = ?,
                    claimed_by = NULL, claimed_at = NULL, finished_at = ?, updated_at = ?
                WHERE id = ? AND status = 'RUNNING'
                "#,
            )
            .bind(error)
            .bind(failure_kind)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn reset_for_retry(&self, id: &str) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'PENDING', retry_count = retry_count + 1, error = NULL,
                failure_kind = NULL, result = NULL, bound_account_id = NULL,
                claimed_by = NULL, claimed_at = NULL, started_at = NULL, finished_at = NULL,
                queue_seq = {NEXT_QUEUE_SEQ}, updated_at = ?
            WHERE id = ? AND status = 'FAILED'
            "#
        );
        retry_on_sqlite_busy("reset_for_retry", || async {
            let done = sqlx::query(&sql)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn reset_running_to_pending(&self, id: &str) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'PENDING', bound_account_id = NULL, claimed_by = NULL,
                claimed_at = NULL, started_at = NULL, queue_seq = {NEXT_QUEUE_SEQ}, updated_at = ?
            WHERE id = ? AND (status = 'RUNNING' OR (status = 'PENDING' AND claimed_by IS NOT NULL))
            "#
        );
        retry_on_sqlite_busy("reset_running_to_pending", || async {
            let done = sqlx::query(&sql)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn update_payload(&self, id: &str, payload: &str) -> Result<bool> {
        retry_on_sqlite_busy("update_payload", || async {
            let done = sqlx::query(
                r#"
                UPDATE tasks SET payload = ?, updated_at = ?
                WHERE id = ? AND claimed_by IS NULL AND status IN ('PENDING', 'FAILED')
                "#,
            )
            .bind(payload)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("delete_task", || async {
            let done = sqlx::query(
                "DELETE FROM tasks WHERE id = ? AND status <> 'RUNNING' AND claimed_by IS NULL",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn delete_created_before(
        &self,
        kind: Option<PipelineKind>,
        cutoff_ms: i64,
    ) -> Result<u64> {
        retry_on_sqlite_busy("delete_created_before", || async {
            let done = match kind {
                Some(kind) => {
                    sqlx::query("DELETE FROM tasks WHERE created_at < ? AND pipeline_kind = ?")
                        .bind(cutoff_ms)
                        .bind(kind.as_str())
                        .execute(&self.pool)
                        .await?
                }
                None => {
                    sqlx::query("DELETE FROM tasks WHERE created_at < ?")
                        .bind(cutoff_ms)
                        .execute(&self.pool)
                        .await?
                }
            };
            Ok(done.rows_affected())
        })
        .await
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        pagination: &Pagination,
    ) -> Result<(Vec<TaskDbModel>, u64)> {
        let mut conditions = Vec::new();
        if filter.kind.is_some() {
            conditions.push("pipeline_kind = ?");
        }
        if filter.status.is_some() {
            conditions.push("status = ?");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM tasks {}", where_clause);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(kind) = filter.kind {
            count_query = count_query.bind(kind.as_str());
        }
        if let Some(status) = filter.status {
            count_query = count_query.bind(status.as_str());
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let list_sql = format!(
            "SELECT * FROM tasks {} ORDER BY created_at DESC, queue_seq DESC LIMIT ? OFFSET ?",
            where_clause
        );
        let mut list_query = sqlx::query_as::<_, TaskDbModel>(&list_sql);
        if let Some(kind) = filter.kind {
            list_query = list_query.bind(kind.as_str());
        }
        if let Some(status) = filter.status {
            list_query = list_query.bind(status.as_str());
        }
        let tasks = list_query
            .bind(pagination.limit as i64)
            .bind(pagination.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok((tasks, total.max(0) as u64))
    }

    async fn list_ids_by_status(
        &self,
        kind: PipelineKind,
        status: TaskStatus,
    ) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT id FROM tasks WHERE pipeline_kind = ? AND status = ? ORDER BY queue_seq",
        )
        .bind(kind.as_str())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_in_flight(&self) -> Result<Vec<TaskDbModel>> {
        Ok(sqlx::query_as::<_, TaskDbModel>(
            "SELECT * FROM tasks WHERE status = 'RUNNING' OR claimed_by IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn count_by_status(&self, kind: Option<PipelineKind>) -> Result<Vec<TaskStatusCount>> {
        let counts = match kind {
            Some(kind) => {
                sqlx::query_as::<_, TaskStatusCount>(
                    r#"
                    SELECT pipeline_kind, status, COUNT(*) AS count FROM tasks
                    WHERE pipeline_kind = ?
                    GROUP BY pipeline_kind, status
                    "#,
                )
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TaskStatusCount>(
                    r#"
                    SELECT pipeline_kind, status, COUNT(*) AS count FROM tasks
                    GROUP BY pipeline_kind, status
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(counts)
    }

    async fn count_pending(&self, kind: PipelineKind) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE pipeline_kind = ? AND status = 'PENDING'",
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_pending_by_platform(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT platform, COUNT(*) FROM tasks WHERE status = 'PENDING' GROUP BY platform",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        retry_on_sqlite_busy("recover_interrupted", || async {
            let done = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'PENDING', bound_account_id = NULL, claimed_by = NULL,
                    claimed_at = NULL, started_at = NULL, updated_at = ?
                WHERE status = 'RUNNING' OR claimed_by IS NOT NULL
                "#,
            )
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;
    use crate::domain::Platform;

    fn task(kind: PipelineKind) -> TaskDbModel {
        TaskDbModel::new(kind, Platform::Jimeng, r#"{"prompt":"p"}"#)
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_queue_seq() {
        let repo = SqlxTaskRepository::new(test_pool().await);
        let a = repo.create_task(&task(PipelineKind::Text2Img)).await.unwrap();
        let b = repo.create_task(&task(PipelineKind::Text2Img)).await.unwrap();
        assert!(b.queue_seq > a.queue_seq);
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_per_kind() {
        let repo = SqlxTaskRepository::new(test_pool().await);
        let first = repo.create_task(&task(PipelineKind::Text2Img)).await.unwrap();
        let _video = repo.create_task(&task(PipelineKind::Text2Video)).await.unwrap();
        let second = repo.create_task(&task(PipelineKind::Text2Img)).await.unwrap();

        let claimed = repo
            .claim_next_pending(PipelineKind::Text2Img, "w0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w0"));

        let claimed = repo
            .claim_next_pending(PipelineKind::Text2Img, "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(
            repo.claim_next_pending(PipelineKind::Text2Img, "w2")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_requeue_moves_to_tail() {
        let repo = SqlxTaskRepository::new(test_pool().await);
        let first = repo.create_task(&task(PipelineKind::Img2Img)).await.unwrap();
        let second = repo.create_task(&task(PipelineKind::Img2Img)).await.unwrap();

        let claimed = repo
            .claim_next_pending(PipelineKind::Img2Img, "w0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert!(repo.requeue_claimed(&first.id, "w0").await.unwrap());
        // Only the claim holder may requeue.
        assert!(!repo.requeue_claimed(&first.id, "w0").await.unwrap());

        let next = repo
            .claim_next_pending(PipelineKind::Img2Img, "w0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, second.id);
    }

    #[tokio::test]
    async fn test_guarded_transitions() {
        let repo = SqlxTaskRepository::new(test_pool().await);
        let created = repo.create_task(&task(PipelineKind::Text2Img)).await.unwrap();

        assert!(!repo.mark_succeeded(&created.id, "{}").await.unwrap());
        assert!(!repo.mark_running(&created.id, "acc", "w0").await.unwrap());

        repo.claim_next_pending(PipelineKind::Text2Img, "w0")
            .await
            .unwrap();
        assert!(repo.mark_running(&created.id, "acc", "w0").await.unwrap());
        assert!(!repo.delete_task(&created.id).await.unwrap());
        assert!(repo.mark_failed(&created.id, "boom", "other").await.unwrap());
        assert!(!repo.mark_failed(&created.id, "again", "other").await.unwrap());

        assert!(repo.reset_for_retry(&created.id).await.unwrap());
        let reset = repo.get_task(&created.id).await.unwrap();
        assert_eq!(reset.status, "PENDING");
        assert_eq!(reset.retry_count, 1);
        assert!(reset.error.is_none());
        assert!(reset.bound_account_id.is_none());
    }

    #[tokio::test]
    async fn test_list_and_counts() {
        let repo = SqlxTaskRepository::new(test_pool().await);
        for _ in 0..3 {
            repo.create_task(&task(PipelineKind::Text2Img)).await.unwrap();
        }
        repo.create_task(&task(PipelineKind::DigitalHuman)).await.unwrap();

        let filter = TaskFilter {
            kind: Some(PipelineKind::Text2Img),
            status: Some(TaskStatus::Pending),
        };
        let (page, total) = repo
            .list_tasks(&filter, &Pagination::new(2, 0))
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);

        let counts = repo.count_by_status(None).await.unwrap();
        let text2img: i64 = counts
            .iter()
            .filter(|c| c.pipeline_kind == "text2img")
            .map(|c| c.count)
            .sum();
        assert_eq!(text2img, 3);
        assert_eq!(repo.count_pending(PipelineKind::DigitalHuman).await.unwrap(), 1);
        let by_platform = repo.count_pending_by_platform().await.unwrap();
        assert_eq!(by_platform.len(), 1);
        assert_eq!(by_platform[0].0, "jimeng");
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let repo = SqlxTaskRepository::new(test_pool().await);
        let a = repo.create_task(&task(PipelineKind::Text2Img)).await.unwrap();
        let _b = repo.create_task(&task(PipelineKind::Text2Img)).await.unwrap();
        repo.claim_next_pending(PipelineKind::Text2Img, "w0")
            .await
            .unwrap();
        repo.mark_running(&a.id, "acc", "w0").await.unwrap();
        repo.claim_next_pending(PipelineKind::Text2Img, "w1")
            .await
            .unwrap();

        assert_eq!(repo.recover_interrupted().await.unwrap(), 2);
        assert!(repo.list_in_flight().await.unwrap().is_empty());
        let a = repo.get_task(&a.id).await.unwrap();
        assert_eq!(a.status, "PENDING");
        assert_eq!(a.retry_count, 0);
    }
}
