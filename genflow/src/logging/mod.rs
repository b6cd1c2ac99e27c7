//! Logging setup with a reloadable filter and daily-rolling log files.
//!
//! - Runtime log level changes via `tracing_subscriber::reload`
//! - Console plus file output, both stamped in local time
//! - Retention cleanup of old rolled files

use chrono::{Local, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::config::SettingsService;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "genflow=info,sqlx=warn,tower_http=info";

/// Rolled files are named `genflow.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "genflow.log";

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Live handle on the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
    retention_days: u64,
}

impl LoggingConfig {
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter, e.g. `"genflow=debug,sqlx=warn"`.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::validation(format!("Invalid filter directive: {e}")))?;
        self.handle
            .reload(filter)
            .map_err(|e| crate::Error::Other(format!("Log filter reload: {e}")))?;
        info!(%directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Apply a filter saved by an earlier `PUT /api/settings/log-filter`.
    pub async fn apply_persisted_filter(&self, settings: &SettingsService) {
        match settings.log_filter().await {
            Ok(Some(directive)) => match self.set_filter(&directive) {
                Ok(()) => info!(filter = %directive, "Applied persisted log filter"),
                Err(e) => warn!("Failed to apply persisted log filter: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to load persisted log filter: {}", e),
        }
    }

    /// Prune rolled files now and then once a day until `cancel` fires.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel: CancellationToken) {
        let log_dir = self.log_dir.clone();
        let retention_days = self.retention_days;

        tokio::spawn(async move {
            let mut daily = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = daily.tick() => {
                        let cutoff = Utc::now()
                            .date_naive()
                            .checked_sub_days(chrono::Days::new(retention_days))
                            .unwrap_or(NaiveDate::MIN);
                        match prune_rolled_logs(&log_dir, cutoff).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "Pruned old log files"),
                            Err(e) => warn!(error = %e, "Log retention sweep failed"),
                        }
                    }
                }
            }
            debug!("Log retention sweep stopped");
        });
    }
}

/// Date suffix of a rolled file name such as `genflow.log.2024-05-01`.
fn rolled_file_date(file_name: &str) -> Option<NaiveDate> {
    let suffix = file_name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

/// Remove rolled files dated strictly before `cutoff`.
async fn prune_rolled_logs(log_dir: &Path, cutoff: NaiveDate) -> std::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let expired = entry
            .file_name()
            .to_str()
            .and_then(rolled_file_date)
            .is_some_and(|date| date < cutoff);
        if !expired || !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Could not remove old log file");
        } else {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process, or
/// buffered file output is lost.
pub fn init_logging(
    log_dir: &Path,
    retention_days: u64,
) -> crate::Result<(Arc<LoggingConfig>, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    let config = Arc::new(LoggingConfig {
        handle: filter_handle,
        log_dir: log_dir.to_path_buf(),
        retention_days,
    });
    Ok((config, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("genflow=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_rolled_file_date() {
        assert_eq!(
            rolled_file_date("genflow.log.2024-05-01"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(rolled_file_date("genflow.log"), None);
        assert_eq!(rolled_file_date("genflow.log.not-a-date"), None);
        assert_eq!(rolled_file_date("other.log.2024-05-01"), None);
    }

    #[tokio::test]
    async fn test_prune_rolled_logs() {
        let dir = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();
        let old = today - chrono::Days::new(30);
        let names = [
            format!("{}.{}", LOG_FILE_PREFIX, today.format("%Y-%m-%d")),
            format!("{}.{}", LOG_FILE_PREFIX, old.format("%Y-%m-%d")),
            format!("other.log.{}", old.format("%Y-%m-%d")),
        ];
        for name in &names {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let cutoff = today - chrono::Days::new(7);
        assert_eq!(prune_rolled_logs(dir.path(), cutoff).await.unwrap(), 1);
        assert!(!dir.path().join(&names[1]).exists());
        assert!(dir.path().join(&names[0]).exists());
        assert!(dir.path().join(&names[2]).exists());
    }
}
