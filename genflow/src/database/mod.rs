//! SQLite persistence: pool setup, migrations, models and repositories.
//!
//! Every timestamp column holds Unix epoch milliseconds, see [`time`].

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

pub type DbPool = Pool<Sqlite>;

/// Upper bound for [`default_pool_size`].
const MAX_DEFAULT_POOL_SIZE: u32 = 8;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Applied to each new connection.
const CONNECTION_PRAGMAS: &[&str] = &[
    "PRAGMA wal_autocheckpoint = 1000",
    // 16 MiB page cache
    "PRAGMA cache_size = -16000",
    "PRAGMA temp_store = MEMORY",
];

async fn apply_connection_pragmas(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    for pragma in CONNECTION_PRAGMAS {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }
    Ok(())
}

/// File databases must end up in WAL mode; in-memory ones report `memory`.
async fn verify_journal_mode(pool: &DbPool) -> Result<(), sqlx::Error> {
    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(pool).await?;
    if !matches!(mode.as_str(), "wal" | "memory") {
        tracing::warn!(journal_mode = %mode, "Journal mode is not WAL, switching");
        sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;
    }
    Ok(())
}

/// Two connections per core, capped at [`MAX_DEFAULT_POOL_SIZE`].
pub fn default_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32 * 2)
        .unwrap_or(4)
        .min(MAX_DEFAULT_POOL_SIZE)
}

/// Open a WAL-mode pool, e.g. `init_pool_with_size("sqlite:genflow.db?mode=rwc", 8)`.
///
/// `sqlite::memory:` gives every connection its own database, so use a
/// single connection for in-memory pools.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options)
        .await?;

    verify_journal_mode(&pool).await?;

    tracing::info!(max_connections, "Database pool ready");

    Ok(pool)
}

pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, default_pool_size()).await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::debug!("Database migrations applied");
    Ok(())
}

/// Single-connection in-memory database with migrations applied.
#[cfg(test)]
pub(crate) async fn test_pool() -> DbPool {
    let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_pool() {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();

        // In-memory databases report "memory"; file databases report "wal".
        assert!(result.0 == "memory" || result.0 == "wal");
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = test_pool().await;
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '_sqlx%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for expected in ["account_usage", "accounts", "settings", "tasks"] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }
}
