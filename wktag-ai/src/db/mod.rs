//! Database access for wktag-ai
//!
//! Shared SQLite file in the root folder. The supervisor, the scanner and
//! every worker process open their own pool onto it.

pub mod units;

pub use units::{UnitCounts, UnitState, WorkUnit};

use sqlx::SqlitePool;
use std::path::Path;
use wktag_common::Result;

/// Pool size for worker processes (one unit in flight at a time)
pub const WORKER_POOL_SIZE: u32 = 2;

/// Open the shared database and make sure wktag tables exist
pub async fn open_store(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    tracing::debug!("Opening tagging store: {}", db_path.display());
    let pool = wktag_common::db::init_database_with(db_path, max_connections).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create wktag tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    // One row per audio file to tag
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_units (
            unit_id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            state TEXT NOT NULL DEFAULT 'pending'
                CHECK (state IN ('pending', 'done', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_work_units_state ON work_units(state, unit_id)")
        .execute(pool)
        .await?;

    // The primary key is the claim: a second insert for the same unit fails
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_claims (
            unit_id TEXT PRIMARY KEY,
            claimed_by TEXT NOT NULL,
            claimed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_work_claims_owner ON work_claims(claimed_by)")
        .execute(pool)
        .await?;

    // Measured model footprints keyed by model-set fingerprint
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS capacity_estimates (
            fingerprint TEXT PRIMARY KEY,
            models TEXT NOT NULL,
            backbone_vram_mb INTEGER NOT NULL,
            per_worker_ram_mb INTEGER NOT NULL,
            measured_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
