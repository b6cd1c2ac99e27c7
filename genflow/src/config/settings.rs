//! Runtime settings stored in the `settings` table.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::info;

use crate::database::repositories::SettingsRepository;
use crate::{Error, Result};

pub const AUTOMATION_MAX_THREADS_RANGE: RangeInclusive<u32> = 1..=32;

const KEY_MAX_THREADS: &str = "automation_max_threads";
const KEY_AUTO_RETRY: &str = "auto_retry_enabled";
const KEY_HIDE_WINDOW: &str = "hide_window";
const KEY_LOG_FILTER: &str = "log_filter";

/// Settings that can change while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Global cap on concurrently executing tasks, applied when the manager starts.
    pub automation_max_threads: u32,
    pub auto_retry_enabled: bool,
    /// Ask executors to run their automation without a visible window.
    pub hide_window: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            automation_max_threads: 3,
            auto_retry_enabled: false,
            hide_window: false,
        }
    }
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeSettingsUpdate {
    pub automation_max_threads: Option<u32>,
    pub auto_retry_enabled: Option<bool>,
    pub hide_window: Option<bool>,
}

pub struct SettingsService {
    repo: Arc<dyn SettingsRepository>,
}

impl SettingsService {
    pub fn new(repo: Arc<dyn SettingsRepository>) -> Self {
        Self { repo }
    }

    async fn read<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(self
            .repo
            .get_setting(key)
            .await?
            .and_then(|s| s.value.parse::<T>().ok())
            .unwrap_or(default))
    }

    /// Current settings; unset or unparsable values fall back to their defaults.
    pub async fn get(&self) -> Result<RuntimeSettings> {
        let defaults = RuntimeSettings::default();
        let threads = self
            .read(KEY_MAX_THREADS, defaults.automation_max_threads)
            .await?;
        Ok(RuntimeSettings {
            automation_max_threads: threads.clamp(
                *AUTOMATION_MAX_THREADS_RANGE.start(),
                *AUTOMATION_MAX_THREADS_RANGE.end(),
            ),
            auto_retry_enabled: self.read(KEY_AUTO_RETRY, defaults.auto_retry_enabled).await?,
            hide_window: self.read(KEY_HIDE_WINDOW, defaults.hide_window).await?,
        })
    }

    pub async fn update(&self, update: RuntimeSettingsUpdate) -> Result<RuntimeSettings> {
        if let Some(threads) = update.automation_max_threads {
            if !AUTOMATION_MAX_THREADS_RANGE.contains(&threads) {
                return Err(Error::validation(format!(
                    "automation_max_threads must be between {} and {}",
                    AUTOMATION_MAX_THREADS_RANGE.start(),
                    AUTOMATION_MAX_THREADS_RANGE.end()
                )));
            }
            self.repo
                .set_setting(KEY_MAX_THREADS, &threads.to_string())
                .await?;
        }
        if let Some(enabled) = update.auto_retry_enabled {
            self.repo
                .set_setting(KEY_AUTO_RETRY, &enabled.to_string())
                .await?;
        }
        if let Some(hide) = update.hide_window {
            self.repo
                .set_setting(KEY_HIDE_WINDOW, &hide.to_string())
                .await?;
        }

        let settings = self.get().await?;
        info!(?settings, "Runtime settings updated");
        Ok(settings)
    }

    /// Persisted log filter directive, if one was saved.
    pub async fn log_filter(&self) -> Result<Option<String>> {
        Ok(self
            .repo
            .get_setting(KEY_LOG_FILTER)
            .await?
            .map(|s| s.value)
            .filter(|v| !v.trim().is_empty()))
    }

    pub async fn set_log_filter(&self, directive: &str) -> Result<()> {
        self.repo.set_setting(KEY_LOG_FILTER, directive).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxSettingsRepository;
    use crate::database::test_pool;

    async fn service() -> SettingsService {
        SettingsService::new(Arc::new(SqlxSettingsRepository::new(test_pool().await)))
    }

    #[tokio::test]
    async fn test_defaults_when_unset() {
        let settings = service().await.get().await.unwrap();
        assert_eq!(settings, RuntimeSettings::default());
        assert_eq!(settings.automation_max_threads, 3);
    }

    #[tokio::test]
    async fn test_partial_update() {
        let service = service().await;
        let updated = service
            .update(RuntimeSettingsUpdate {
                automation_max_threads: Some(8),
                hide_window: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.automation_max_threads, 8);
        assert!(updated.hide_window);
        assert!(!updated.auto_retry_enabled);
    }

    #[tokio::test]
    async fn test_thread_cap_out_of_range() {
        let service = service().await;
        for threads in [0, 33] {
            let err = service
                .update(RuntimeSettingsUpdate {
                    automation_max_threads: Some(threads),
                    ..Default::default()
                })
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
        assert_eq!(service.get().await.unwrap().automation_max_threads, 3);
    }

    #[tokio::test]
    async fn test_log_filter_round_trip() {
        let service = service().await;
        assert!(service.log_filter().await.unwrap().is_none());
        service.set_log_filter("genflow=debug").await.unwrap();
        assert_eq!(
            service.log_filter().await.unwrap().as_deref(),
            Some("genflow=debug")
        );
    }
}
