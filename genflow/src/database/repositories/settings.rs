//! Settings repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::SettingDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

/// Key/value settings repository trait.
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<SettingDbModel>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    async fn list_settings(&self) -> Result<Vec<SettingDbModel>>;
}

/// SQLx implementation of SettingsRepository.
pub struct SqlxSettingsRepository {
    pool: SqlitePool,
}

impl SqlxSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for SqlxSettingsRepository {
    async fn get_setting(&self, key: &str) -> Result<Option<SettingDbModel>> {
        Ok(
            sqlx::query_as::<_, SettingDbModel>("SELECT * FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        retry_on_sqlite_busy("set_setting", || async {
            sqlx::query(
                r#"
                INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_settings(&self) -> Result<Vec<SettingDbModel>> {
        Ok(
            sqlx::query_as::<_, SettingDbModel>("SELECT * FROM settings ORDER BY key")
                .fetch_all(&self.pool)
                .await?,
        )
    }
}
