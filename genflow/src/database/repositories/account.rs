//! Account repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    AccountDbModel, AccountHealthCount, AccountUsageCount, UsageOutcome,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::domain::{AccountHealth, PipelineKind, Platform};
use crate::{Error, Result};

/// Account repository trait.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn create_account(&self, account: &AccountDbModel) -> Result<AccountDbModel>;
    async fn get_account(&self, id: &str) -> Result<AccountDbModel>;
    async fn find_by_identifier(
        &self,
        platform: Platform,
        identifier: &str,
    ) -> Result<Option<AccountDbModel>>;
    async fn list_accounts(&self, platform: Option<Platform>) -> Result<Vec<AccountDbModel>>;

    /// Delete an unbound account.
    async fn delete_account(&self, id: &str) -> Result<bool>;
    /// Delete every unbound account of `platform`, returning the deleted count.
    async fn delete_unbound(&self, platform: Platform) -> Result<u64>;

    /// Atomically bind the best-ranked eligible account of `platform` to `task_id`.
    ///
    /// Eligible: has a cookie, not unhealthy, unbound, and fewer than `daily_quota`
    /// usage rows for `kind` since `since_ms`.
    async fn bind_eligible(
        &self,
        platform: Platform,
        kind: PipelineKind,
        task_id: &str,
        since_ms: i64,
        daily_quota: u32,
    ) -> Result<Option<AccountDbModel>>;
    async fn release_binding(&self, account_id: &str, task_id: &str) -> Result<bool>;
    async fn release_bindings_for_task(&self, task_id: &str) -> Result<u64>;
    async fn clear_all_bindings(&self) -> Result<u64>;

    /// Insert a usage row and update counters and health in one transaction.
    async fn record_usage(
        &self,
        account_id: &str,
        kind: PipelineKind,
        outcome: UsageOutcome,
        failure_threshold: u32,
    ) -> Result<AccountDbModel>;
    async fn set_cookie(&self, id: &str, cookie: &str) -> Result<AccountDbModel>;
    /// Replace the cookie only; health and the failure streak are untouched.
    async fn rotate_cookie(&self, id: &str, cookie: &str) -> Result<AccountDbModel>;
    async fn set_health(&self, id: &str, health: AccountHealth) -> Result<AccountDbModel>;

    async fn usage_since(&self, platform: Platform, since_ms: i64)
    -> Result<Vec<AccountUsageCount>>;
    async fn health_counts(&self) -> Result<Vec<AccountHealthCount>>;
    /// Accounts with a cookie and health other than unhealthy.
    async fn count_eligible(&self, platform: Platform) -> Result<u64>;
}

/// SQLx implementation of AccountRepository.
pub struct SqlxAccountRepository {
    pool: SqlitePool,
}

impl SqlxAccountRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl AccountRepository for SqlxAccountRepository {
    async fn create_account(&self, account: &AccountDbModel) -> Result<AccountDbModel> {
        let inserted = sqlx::query_as::<_, AccountDbModel>(
            r#"
            INSERT INTO accounts (
                id, platform, identifier, secret, cookie, health, usage_count,
                consecutive_failures, cookie_updated_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&account.id)
        .bind(&account.platform)
        .bind(&account.identifier)
        .bind(&account.secret)
        .bind(&account.cookie)
        .bind(&account.health)
        .bind(account.usage_count)
        .bind(account.consecutive_failures)
        .bind(account.cookie_updated_at)
        .bind(account.created_at)
        .bind(account.updated_at)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(row),
            Err(err) if is_unique_violation(&err) => Err(Error::validation(format!(
                "account '{}' already exists on {}",
                account.identifier, account.platform
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_account(&self, id: &str) -> Result<AccountDbModel> {
        sqlx::query_as::<_, AccountDbModel>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Account", id))
    }

    async fn find_by_identifier(
        &self,
        platform: Platform,
        identifier: &str,
    ) -> Result<Option<AccountDbModel>> {
        Ok(sqlx::query_as::<_, AccountDbModel>(
            "SELECT * FROM accounts WHERE platform = ? AND identifier = ?",
        )
        .bind(platform.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_accounts(&self, platform: Option<Platform>) -> Result<Vec<AccountDbModel>> {
        let accounts = match platform {
            Some(platform) => {
                sqlx::query_as::<_, AccountDbModel>(
                    "SELECT * FROM accounts WHERE platform = ? ORDER BY created_at, id",
                )
                .bind(platform.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, AccountDbModel>(
                    "SELECT * FROM accounts ORDER BY platform, created_at, id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(accounts)
    }

    async fn delete_account(&self, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("delete_account", || async {
            let done = sqlx::query("DELETE FROM accounts WHERE id = ? AND bound_task_id IS NULL")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn delete_unbound(&self, platform: Platform) -> Result<u64> {
        retry_on_sqlite_busy("delete_unbound", || async {
            let done =
                sqlx::query("DELETE FROM accounts WHERE platform = ? AND bound_task_id IS NULL")
                    .bind(platform.as_str())
                    .execute(&self.pool)
                    .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn bind_eligible(
        &self,
        platform: Platform,
        kind: PipelineKind,
        task_id: &str,
        since_ms: i64,
        daily_quota: u32,
    ) -> Result<Option<AccountDbModel>> {
        let bound = retry_on_sqlite_busy("bind_eligible", || async {
            Ok(sqlx::query_as::<_, AccountDbModel>(
                r#"
                UPDATE accounts
                SET bound_task_id = ?1, bound_at = ?2, updated_at = ?2
                WHERE id = (
                    SELECT a.id FROM accounts a
                    WHERE a.platform = ?3
                      AND a.bound_task_id IS NULL
                      AND a.cookie IS NOT NULL AND a.cookie <> ''
                      AND a.health <> 'unhealthy'
                      AND (
                          SELECT COUNT(*) FROM account_usage u
                          WHERE u.account_id = a.id AND u.pipeline_kind = ?4 AND u.used_at >= ?5
                      ) < ?6
                    ORDER BY a.usage_count ASC, COALESCE(a.last_used_at, 0) ASC, a.id ASC
                    LIMIT 1
                )
                AND bound_task_id IS NULL
                RETURNING *
                "#,
            )
            .bind(task_id)
            .bind(now_ms())
            .bind(platform.as_str())
            .bind(kind.as_str())
            .bind(since_ms)
            .bind(i64::from(daily_quota))
            .fetch_optional(&self.pool)
            .await?)
        })
        .await;

        match bound {
            Err(Error::DatabaseSqlx(err)) if is_unique_violation(&err) => Err(Error::conflict(
                format!("task {} already holds an account binding", task_id),
            )),
            other => other,
        }
    }

    async fn release_binding(&self, account_id: &str, task_id: &str) -> Result<bool> {
        retry_on_sqlite_busy("release_binding", || async {
            let done = sqlx::query(
                r#"
                UPDATE accounts SET bound_task_id = NULL, bound_at = NULL, updated_at = ?
                WHERE id = ? AND bound_task_id = ?
                "#,
            )
            .bind(now_ms())
            .bind(account_id)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn release_bindings_for_task(&self, task_id: &str) -> Result<u64> {
        retry_on_sqlite_busy("release_bindings_for_task", || async {
            let done = sqlx::query(
                r#"
                UPDATE accounts SET bound_task_id = NULL, bound_at = NULL, updated_at = ?
                WHERE bound_task_id = ?
                "#,
            )
            .bind(now_ms())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn clear_all_bindings(&self) -> Result<u64> {
        retry_on_sqlite_busy("clear_all_bindings", || async {
            let done = sqlx::query(
                r#"
                UPDATE accounts SET bound_task_id = NULL, bound_at = NULL, updated_at = ?
                WHERE bound_task_id IS NOT NULL
                "#,
            )
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn record_usage(
        &self,
        account_id: &str,
        kind: PipelineKind,
        outcome: UsageOutcome,
        failure_threshold: u32,
    ) -> Result<AccountDbModel> {
        retry_on_sqlite_busy("record_usage", || async {
            let now = now_ms();
            let mut tx = self.pool.begin().await?;

            let updated = sqlx::query_as::<_, AccountDbModel>(
                r#"
                UPDATE accounts
                SET usage_count = usage_count + 1,
                    last_used_at = ?1,
                    updated_at = ?1,
                    consecutive_failures = CASE ?2
                        WHEN 'SUCCESS' THEN 0
                        WHEN 'FAILURE' THEN consecutive_failures + 1
                        ELSE consecutive_failures
                    END,
                    health = CASE
                        WHEN ?2 = 'SUCCESS' THEN 'healthy'
                        WHEN ?2 = 'FAILURE' AND consecutive_failures + 1 >= ?3 THEN 'unhealthy'
                        ELSE health
                    END
                WHERE id = ?4
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(outcome.as_str())
            .bind(i64::from(failure_threshold.max(1)))
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("Account", account_id))?;

            sqlx::query(
                r#"
                INSERT INTO account_usage (account_id, pipeline_kind, outcome, used_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(account_id)
            .bind(kind.as_str())
            .bind(outcome.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(updated)
        })
        .await
    }

    async fn set_cookie(&self, id: &str, cookie: &str) -> Result<AccountDbModel> {
        retry_on_sqlite_busy("set_cookie", || async {
            let now = now_ms();
            sqlx::query_as::<_, AccountDbModel>(
                r#"
                UPDATE accounts
                SET cookie = ?1, cookie_updated_at = ?2, updated_at = ?2, health = 'healthy',
                    consecutive_failures = 0
                WHERE id = ?3
                RETURNING *
                "#,
            )
            .bind(cookie)
            .bind(now)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Account", id))
        })
        .await
    }

    async fn rotate_cookie(&self, id: &str, cookie: &str) -> Result<AccountDbModel> {
        retry_on_sqlite_busy("rotate_cookie", || async {
            let now = now_ms();
            sqlx::query_as::<_, AccountDbModel>(
                r#"
                UPDATE accounts
                SET cookie = ?1, cookie_updated_at = ?2, updated_at = ?2
                WHERE id = ?3
                RETURNING *
                "#,
            )
            .bind(cookie)
            .bind(now)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Account", id))
        })
        .await
    }

    async fn set_health(&self, id: &str, health: AccountHealth) -> Result<AccountDbModel> {
        retry_on_sqlite_busy("set_health", || async {
            sqlx::query_as::<_, AccountDbModel>(
                "UPDATE accounts SET health = ?, updated_at = ? WHERE id = ? RETURNING *",
            )
            .bind(health.as_str())
            .bind(now_ms())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Account", id))
        })
        .await
    }

    async fn usage_since(
        &self,
        platform: Platform,
        since_ms: i64,
    ) -> Result<Vec<AccountUsageCount>> {
        Ok(sqlx::query_as::<_, AccountUsageCount>(
            r#"
            SELECT u.account_id, u.pipeline_kind, COUNT(*) AS count
            FROM account_usage u
            JOIN accounts a ON a.id = u.account_id
            WHERE a.platform = ? AND u.used_at >= ?
            GROUP BY u.account_id, u.pipeline_kind
            "#,
        )
        .bind(platform.as_str())
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn health_counts(&self) -> Result<Vec<AccountHealthCount>> {
        Ok(sqlx::query_as::<_, AccountHealthCount>(
            r#"
            SELECT platform, health, COUNT(*) AS count FROM accounts
            GROUP BY platform, health
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn count_eligible(&self, platform: Platform) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM accounts
            WHERE platform = ? AND cookie IS NOT NULL AND cookie <> '' AND health <> 'unhealthy'
            "#,
        )
        .bind(platform.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    async fn seed(repo: &SqlxAccountRepository, identifier: &str, usage: i64) -> AccountDbModel {
        let mut account = AccountDbModel::new(
            Platform::Jimeng,
            identifier,
            Some("pw".into()),
            Some(format!("cookie-{identifier}")),
        );
        account.usage_count = usage;
        repo.create_account(&account).await.unwrap()
    }

    #[tokio::test]
    async fn test_rotate_cookie_keeps_health_and_failures() {
        let repo = SqlxAccountRepository::new(test_pool().await);
        let account = seed(&repo, "a", 0).await;
        for _ in 0..2 {
            repo.record_usage(&account.id, PipelineKind::Text2Img, UsageOutcome::Failure, 3)
                .await
                .unwrap();
        }

        let rotated = repo.rotate_cookie(&account.id, "sid=next").await.unwrap();
        assert_eq!(rotated.cookie.as_deref(), Some("sid=next"));
        assert_eq!(rotated.consecutive_failures, 2);
        assert_eq!(rotated.health, account.health);

        let failed = repo
            .record_usage(&account.id, PipelineKind::Text2Img, UsageOutcome::Failure, 3)
            .await
            .unwrap();
        assert_eq!(failed.health, AccountHealth::Unhealthy.as_str());

        // A manual cookie update still clears the streak.
        let reset = repo.set_cookie(&account.id, "sid=manual").await.unwrap();
        assert_eq!(reset.consecutive_failures, 0);
        assert_eq!(reset.health, AccountHealth::Healthy.as_str());

        assert!(matches!(
            repo.rotate_cookie("missing", "sid").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_identifier_is_validation_error() {
        let repo = SqlxAccountRepository::new(test_pool().await);
        seed(&repo, "alice", 0).await;
        let dup = AccountDbModel::new(Platform::Jimeng, "alice", None, None);
        assert!(matches!(
            repo.create_account(&dup).await,
            Err(Error::Validation(_))
        ));
        // Same identifier on another platform is fine.
        let other = AccountDbModel::new(Platform::Qingying, "alice", None, None);
        repo.create_account(&other).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_prefers_lowest_usage_and_is_exclusive() {
        let repo = SqlxAccountRepository::new(test_pool().await);
        seed(&repo, "a", 5).await;
        let low = seed(&repo, "b", 1).await;
        seed(&repo, "c", 9).await;

        let bound = repo
            .bind_eligible(Platform::Jimeng, PipelineKind::Text2Img, "t1", 0, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bound.id, low.id);
        assert_eq!(bound.bound_task_id.as_deref(), Some("t1"));

        let next = repo
            .bind_eligible(Platform::Jimeng, PipelineKind::Text2Img, "t2", 0, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.identifier, "a");

        assert!(!repo.delete_account(&low.id).await.unwrap());
        assert!(repo.release_binding(&low.id, "t1").await.unwrap());
        assert!(!repo.release_binding(&low.id, "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_bind_skips_missing_cookie_and_unhealthy() {
        let repo = SqlxAccountRepository::new(test_pool().await);
        let no_cookie = AccountDbModel::new(Platform::Jimeng, "nocookie", None, None);
        repo.create_account(&no_cookie).await.unwrap();
        let sick = seed(&repo, "sick", 0).await;
        repo.set_health(&sick.id, AccountHealth::Unhealthy)
            .await
            .unwrap();

        assert!(
            repo.bind_eligible(Platform::Jimeng, PipelineKind::Text2Img, "t", 0, 10)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(repo.count_eligible(Platform::Jimeng).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bind_respects_daily_quota() {
        let repo = SqlxAccountRepository::new(test_pool().await);
        let account = seed(&repo, "solo", 0).await;
        repo.record_usage(&account.id, PipelineKind::DigitalHuman, UsageOutcome::Success, 3)
            .await
            .unwrap();

        assert!(
            repo.bind_eligible(Platform::Jimeng, PipelineKind::DigitalHuman, "t", 0, 1)
                .await
                .unwrap()
                .is_none()
        );
        // Quota is per kind.
        assert!(
            repo.bind_eligible(Platform::Jimeng, PipelineKind::Text2Img, "t", 0, 10)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_record_usage_health_transitions() {
        let repo = SqlxAccountRepository::new(test_pool().await);
        let account = seed(&repo, "flaky", 0).await;

        for _ in 0..2 {
            let updated = repo
                .record_usage(&account.id, PipelineKind::Text2Img, UsageOutcome::Failure, 3)
                .await
                .unwrap();
            assert_ne!(updated.health, "unhealthy");
        }
        let updated = repo
            .record_usage(&account.id, PipelineKind::Text2Img, UsageOutcome::Failure, 3)
            .await
            .unwrap();
        assert_eq!(updated.health, "unhealthy");
        assert_eq!(updated.consecutive_failures, 3);
        assert_eq!(updated.usage_count, 3);

        let updated = repo
            .record_usage(&account.id, PipelineKind::Text2Img, UsageOutcome::Success, 3)
            .await
            .unwrap();
        assert_eq!(updated.health, "healthy");
        assert_eq!(updated.consecutive_failures, 0);

        let aborted = repo
            .record_usage(&account.id, PipelineKind::Text2Img, UsageOutcome::Aborted, 3)
            .await
            .unwrap();
        assert_eq!(aborted.usage_count, 5);
        assert_eq!(aborted.health, "healthy");

        let usage = repo.usage_since(Platform::Jimeng, 0).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].count, 5);
    }

    #[tokio::test]
    async fn test_delete_unbound_keeps_bound() {
        let repo = SqlxAccountRepository::new(test_pool().await);
        seed(&repo, "a", 0).await;
        seed(&repo, "b", 0).await;
        repo.bind_eligible(Platform::Jimeng, PipelineKind::Text2Img, "t", 0, 10)
            .await
            .unwrap();

        assert_eq!(repo.delete_unbound(Platform::Jimeng).await.unwrap(), 1);
        assert_eq!(repo.list_accounts(None).await.unwrap().len(), 1);
        assert_eq!(repo.clear_all_bindings().await.unwrap(), 1);
    }
}
