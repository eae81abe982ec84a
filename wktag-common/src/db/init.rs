//! Database initialization
//!
//! The supervisor and every worker process open their own pool onto the same
//! SQLite file, so the pool is configured for multi-process write access:
//! WAL journaling plus a busy timeout, with application-level retry on top
//! for contention that outlasts the timeout.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every connection (milliseconds)
pub const BUSY_TIMEOUT_MS: u64 = 5000;

/// Open (creating if needed) the shared database
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    init_database_with(db_path, 8).await
}

/// Open the shared database with an explicit pool size
///
/// Workers only ever run one unit at a time and use a small pool; the
/// supervisor's reaper needs little more.
pub async fn init_database_with(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Applied per connection: a PRAGMA issued once would only reach one
    // connection of the pool
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    Ok(pool)
}
