//! Backoff for writes that race other connections on the SQLite lock.

use rand::random;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

const MAX_BUSY_RETRIES: u32 = 12;
const BASE_DELAY: Duration = Duration::from_millis(10);
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Message fragments SQLite uses for `SQLITE_BUSY` and `SQLITE_LOCKED`.
const BUSY_MESSAGES: &[&str] = &[
    "database is locked",
    "database is busy",
    "database table is locked",
];

fn mentions_busy(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    BUSY_MESSAGES.iter().any(|m| message.contains(m))
}

fn is_busy(err: &Error) -> bool {
    match err {
        // Primary result codes 5 (BUSY) and 6 (LOCKED).
        Error::DatabaseSqlx(sqlx::Error::Database(db)) => {
            matches!(db.code().as_deref(), Some("5" | "6")) || mentions_busy(db.message())
        }
        Error::DatabaseSqlx(other) => mentions_busy(&other.to_string()),
        _ => false,
    }
}

/// Exponential delay for `attempt` (0-based) plus up to 25% jitter, capped at [`MAX_DELAY`].
fn backoff(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1u32 << attempt.min(16)).min(MAX_DELAY);
    let jitter_ms = random::<u64>() % (exp.as_millis() as u64 / 4 + 1);
    (exp + Duration::from_millis(jitter_ms)).min(MAX_DELAY)
}

/// Run `op` until it succeeds, fails for a reason other than a busy
/// database, or runs out of retries.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if attempt < MAX_BUSY_RETRIES && is_busy(&err) => {
                let delay = backoff(attempt);
                attempt += 1;
                debug!(op = op_name, attempt, ?delay, "SQLite busy, backing off");
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}
