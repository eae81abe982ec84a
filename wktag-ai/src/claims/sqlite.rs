//! SQLite claim store
//!
//! `work_claims.unit_id` is the primary key, so SQLite itself arbitrates
//! concurrent claims across processes: the losing insert fails with a unique
//! violation, reported as [`ClaimInsert::Conflict`]. The insert is also
//! conditional on the unit still being pending, so a claim taken from a
//! stale candidate list is a conflict too. Writes go through
//! [`retry_on_lock`] for contention that outlasts `busy_timeout`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use wktag_common::{Error, Result};

use super::{ClaimInsert, ClaimRecord, ClaimStore, UnitOutcome};
use crate::db::units::unit_from_row;
use crate::db::WorkUnit;
use crate::utils::retry_on_lock;

/// Default ceiling on lock-contention retries
pub const DEFAULT_MAX_LOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SqliteClaimStore {
    pool: SqlitePool,
    max_lock_wait: Duration,
}

impl SqliteClaimStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait: DEFAULT_MAX_LOCK_WAIT,
        }
    }

    pub fn with_max_lock_wait(mut self, max_lock_wait: Duration) -> Self {
        self.max_lock_wait = max_lock_wait;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ClaimStore for SqliteClaimStore {
    async fn candidate_units(&self, limit: usize) -> Result<Vec<WorkUnit>> {
        let rows = sqlx::query(
            r#"
            SELECT u.unit_id, u.path, u.state, u.attempts, u.last_error
            FROM work_units u
            LEFT JOIN work_claims c ON c.unit_id = u.unit_id
            WHERE u.state = 'pending' AND c.unit_id IS NULL
            ORDER BY u.unit_id ASC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(unit_from_row).collect()
    }

    async fn insert_claim(&self, unit_id: &str, claimed_by: &str) -> Result<ClaimInsert> {
        let claimed_at = Utc::now().to_rfc3339();

        retry_on_lock("claim insert", self.max_lock_wait, || async {
            // Candidates may be stale: only a still-pending unit can be claimed
            let result = sqlx::query(
                r#"
                INSERT INTO work_claims (unit_id, claimed_by, claimed_at)
                SELECT ?, ?, ?
                WHERE EXISTS (
                    SELECT 1 FROM work_units WHERE unit_id = ? AND state = 'pending'
                )
                "#,
            )
            .bind(unit_id)
            .bind(claimed_by)
            .bind(&claimed_at)
            .bind(unit_id)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() == 1 => Ok(ClaimInsert::Inserted),
                Ok(_) => Ok(ClaimInsert::Conflict),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(ClaimInsert::Conflict),
                Err(e) => Err(Error::Database(e)),
            }
        })
        .await
    }

    async fn delete_claim(&self, unit_id: &str, claimed_by: &str) -> Result<bool> {
        retry_on_lock("claim delete", self.max_lock_wait, || async {
            let result = sqlx::query("DELETE FROM work_claims WHERE unit_id = ? AND claimed_by = ?")
                .bind(unit_id)
                .bind(claimed_by)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn delete_claims_owned_by(&self, claimed_by: &str) -> Result<u64> {
        retry_on_lock("owner claim delete", self.max_lock_wait, || async {
            let result = sqlx::query("DELETE FROM work_claims WHERE claimed_by = ?")
                .bind(claimed_by)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn list_claims(&self) -> Result<Vec<ClaimRecord>> {
        let rows = sqlx::query("SELECT unit_id, claimed_by, claimed_at FROM work_claims ORDER BY unit_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let claimed_at: String = row.get("claimed_at");
                let claimed_at = DateTime::parse_from_rfc3339(&claimed_at)
                    .map_err(|e| Error::Internal(format!("bad claimed_at {:?}: {}", claimed_at, e)))?
                    .with_timezone(&Utc);
                Ok(ClaimRecord {
                    unit_id: row.get("unit_id"),
                    claimed_by: row.get("claimed_by"),
                    claimed_at,
                })
            })
            .collect()
    }

    async fn complete_unit(&self, unit_id: &str, outcome: &UnitOutcome) -> Result<()> {
        let (state, last_error) = match outcome {
            UnitOutcome::Done => ("done", None),
            UnitOutcome::Failed(reason) => ("failed", Some(reason.as_str())),
        };
        let updated_at = Utc::now().to_rfc3339();

        retry_on_lock("unit completion", self.max_lock_wait, || async {
            sqlx::query(
                r#"
                UPDATE work_units
                SET state = ?, attempts = attempts + 1, last_error = ?, updated_at = ?
                WHERE unit_id = ?
                "#,
            )
            .bind(state)
            .bind(last_error)
            .bind(&updated_at)
            .bind(unit_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}
