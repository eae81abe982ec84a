//! Work unit persistence
//!
//! A work unit is one audio file to tag. Its id is the SHA-256 of the path,
//! so re-scanning a library never duplicates units.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use wktag_common::{Error, Result};

/// Processing state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Pending,
    Done,
    Failed,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::Done => "done",
            UnitState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for UnitState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(UnitState::Pending),
            "done" => Ok(UnitState::Done),
            "failed" => Ok(UnitState::Failed),
            other => Err(Error::InvalidInput(format!("unknown unit state: {}", other))),
        }
    }
}

/// One audio file to tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    pub unit_id: String,
    pub path: String,
    pub state: UnitState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl WorkUnit {
    /// Fresh pending unit for `path`
    pub fn pending(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            unit_id: unit_id_for_path(&path),
            path,
            state: UnitState::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Stable unit id: hex SHA-256 of the path
pub fn unit_id_for_path(path: &str) -> String {
    format!("{:x}", Sha256::digest(path.as_bytes()))
}

/// Per-state unit totals plus live claims
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounts {
    pub pending: u64,
    pub done: u64,
    pub failed: u64,
    pub claimed: u64,
}

/// Register a unit; returns false if it was already known
pub async fn enqueue_unit(pool: &SqlitePool, unit: &WorkUnit) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO work_units (unit_id, path, state, attempts, updated_at)
        VALUES (?, ?, 'pending', 0, ?)
        "#,
    )
    .bind(&unit.unit_id)
    .bind(&unit.path)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Load one unit by id
pub async fn load_unit(pool: &SqlitePool, unit_id: &str) -> Result<Option<WorkUnit>> {
    let row = sqlx::query(
        r#"
        SELECT unit_id, path, state, attempts, last_error
        FROM work_units
        WHERE unit_id = ?
        "#,
    )
    .bind(unit_id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| unit_from_row(&row)).transpose()
}

pub(crate) fn unit_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkUnit> {
    let state: String = row.get("state");
    let attempts: i64 = row.get("attempts");
    Ok(WorkUnit {
        unit_id: row.get("unit_id"),
        path: row.get("path"),
        state: state.parse()?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error: row.get("last_error"),
    })
}

/// Totals for progress reporting
pub async fn unit_counts(pool: &SqlitePool) -> Result<UnitCounts> {
    let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM work_units GROUP BY state")
        .fetch_all(pool)
        .await?;

    let mut counts = UnitCounts::default();
    for row in rows {
        let state: String = row.get("state");
        let n = u64::try_from(row.get::<i64, _>("n")).unwrap_or(0);
        match state.parse::<UnitState>()? {
            UnitState::Pending => counts.pending = n,
            UnitState::Done => counts.done = n,
            UnitState::Failed => counts.failed = n,
        }
    }

    let claimed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_claims")
        .fetch_one(pool)
        .await?;
    counts.claimed = u64::try_from(claimed).unwrap_or(0);

    Ok(counts)
}

/// Move failed units back to pending so they are picked up again
pub async fn requeue_failed(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE work_units
        SET state = 'pending', updated_at = ?
        WHERE state = 'failed'
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
