//! Process configuration.
//!
//! Static configuration comes from the environment (after `.env` is loaded);
//! runtime-tunable settings live in the database, see [`SettingsService`].

mod settings;

pub use settings::{
    AUTOMATION_MAX_THREADS_RANGE, RuntimeSettings, RuntimeSettingsUpdate, SettingsService,
};

use chrono_tz::Tz;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::accounts::AccountPoolConfig;
use crate::domain::{PipelineKind, Platform};
use crate::manager::TaskManagerConfig;
use crate::worker::WorkerPoolConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:genflow.db?mode=rwc";

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Request body size limit in bytes
    pub body_limit: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8088,
            enable_cors: true,
            body_limit: 10 * 1024 * 1024,
        }
    }
}

impl ApiServerConfig {
    /// Load API server config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `API_BIND_ADDRESS` (e.g. "0.0.0.0")
    /// - `API_PORT` (e.g. "8088")
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(bind_address) = std::env::var("API_BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            config.bind_address = bind_address;
        }

        if let Ok(port) = std::env::var("API_PORT")
            && let Ok(parsed) = port.parse::<u16>()
        {
            config.port = parsed;
        }

        config
    }
}

/// Everything read from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub log_retention_days: u64,
    pub api: ApiServerConfig,
    pub manager: TaskManagerConfig,
    pub accounts: AccountPoolConfig,
    pub output_dir: PathBuf,
    /// Shell command per pipeline kind (`GENFLOW_EXECUTOR_<KIND>`).
    pub executors: HashMap<PipelineKind, String>,
    /// Credential helper command per platform (`GENFLOW_CREDENTIAL_<PLATFORM>`).
    pub credential_commands: HashMap<Platform, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let output_dir = PathBuf::from("outputs");
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: PathBuf::from("logs"),
            log_retention_days: 7,
            api: ApiServerConfig::default(),
            manager: TaskManagerConfig {
                workers: WorkerPoolConfig {
                    output_dir: output_dir.clone(),
                    ..Default::default()
                },
                ..Default::default()
            },
            accounts: AccountPoolConfig::default(),
            output_dir,
            executors: HashMap::new(),
            credential_commands: HashMap::new(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(format!("{} has an invalid value '{}'", key, raw))),
        None => Ok(None),
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = env_var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = env_var("GENFLOW_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(days) = env_parse("GENFLOW_LOG_RETENTION_DAYS")? {
            config.log_retention_days = days;
        }
        config.api = ApiServerConfig::from_env_or_default();

        let workers = &mut config.manager.workers;
        if let Some(n) = env_parse::<usize>("GENFLOW_WORKERS_PER_KIND")? {
            if n == 0 {
                return Err(Error::config("GENFLOW_WORKERS_PER_KIND must be at least 1"));
            }
            workers.workers_per_kind = n;
        }
        if let Some(ms) = env_parse("GENFLOW_POLL_INTERVAL_MS")? {
            workers.poll_interval_ms = ms;
        }
        if let Some(secs) = env_parse("GENFLOW_TASK_TIMEOUT_SECS")? {
            workers.task_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("GENFLOW_STOP_GRACE_SECS")? {
            config.manager.stop_grace_secs = secs;
        }
        if let Some(secs) = env_parse("GENFLOW_LIVENESS_SECS")? {
            config.manager.liveness_threshold_secs = secs;
        }

        if let Some(threshold) = env_parse::<u32>("GENFLOW_FAILURE_THRESHOLD")? {
            config.accounts.failure_threshold = threshold.max(1);
        }
        if let Some(name) = env_var("GENFLOW_TIMEZONE") {
            config.accounts.timezone = name
                .parse::<Tz>()
                .map_err(|_| Error::config(format!("unknown timezone '{}'", name)))?;
        }

        if let Some(dir) = env_var("GENFLOW_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
            config.manager.workers.output_dir = config.output_dir.clone();
        }

        for kind in PipelineKind::ALL {
            if let Some(command) = env_var(&format!("GENFLOW_EXECUTOR_{}", kind.env_suffix())) {
                config.executors.insert(kind, command);
            }
        }
        for platform in Platform::ALL {
            let key = format!("GENFLOW_CREDENTIAL_{}", platform.as_str().to_ascii_uppercase());
            if let Some(command) = env_var(&key) {
                config.credential_commands.insert(platform, command);
            }
        }

        Ok(config)
    }

    pub fn timezone(&self) -> Tz {
        self.accounts.timezone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::DEFAULT_FAILURE_THRESHOLD;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.api.port, 8088);
        assert_eq!(config.manager.workers.workers_per_kind, 2);
        assert_eq!(config.manager.stop_grace_secs, 30);
        assert_eq!(config.accounts.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(config.timezone(), chrono_tz::Asia::Shanghai);
        assert_eq!(config.manager.workers.output_dir, config.output_dir);
        assert!(config.executors.is_empty());
    }
}
