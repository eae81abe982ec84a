//! Claim-based work discovery
//!
//! Workers coordinate through the claims store alone: a unit is theirs once
//! their insert into the claim table succeeds. The store's unique key on
//! `unit_id` is the only cross-process synchronisation primitive, so at most
//! one live claim exists per unit. Losing an insert race is normal and means
//! "try the next candidate".
//!
//! Delivery is at-least-once. A worker that dies mid-unit leaves its claim
//! behind; the claim is released either by the next incarnation of the same
//! component (on startup) or by the [`ClaimReaper`] once the owner is
//! failed or gone. The unit is then picked up again, so processing must be
//! idempotent.

mod memory;
mod sqlite;

pub use memory::MemoryClaimStore;
pub use sqlite::SqliteClaimStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wktag_common::Result;

use crate::db::WorkUnit;
use crate::error::{TaggerError, TaggerResult};

/// A live claim on one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimRecord {
    pub unit_id: String,
    pub claimed_by: String,
    pub claimed_at: DateTime<Utc>,
}

/// Result of an atomic claim insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimInsert {
    Inserted,
    /// Another worker holds the claim, or the unit is no longer pending
    Conflict,
}

/// How a claimed unit finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Done,
    Failed(String),
}

/// Storage contract for claims and work units
///
/// `candidate_units` must order by ascending `unit_id` and return only
/// pending, unclaimed units. `insert_claim` must be atomic: concurrent
/// inserts for one unit yield exactly one `Inserted`, and a unit that is no
/// longer pending (or unknown) yields `Conflict`.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn candidate_units(&self, limit: usize) -> Result<Vec<WorkUnit>>;

    async fn insert_claim(&self, unit_id: &str, claimed_by: &str) -> Result<ClaimInsert>;

    /// Delete the claim if `claimed_by` still owns it
    async fn delete_claim(&self, unit_id: &str, claimed_by: &str) -> Result<bool>;

    /// Delete every claim owned by `claimed_by`
    async fn delete_claims_owned_by(&self, claimed_by: &str) -> Result<u64>;

    async fn list_claims(&self) -> Result<Vec<ClaimRecord>>;

    async fn complete_unit(&self, unit_id: &str, outcome: &UnitOutcome) -> Result<()>;
}

/// Default number of candidates fetched per discovery query
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Worker-side discovery over a [`ClaimStore`]
#[derive(Clone)]
pub struct WorkDiscovery {
    store: Arc<dyn ClaimStore>,
    batch_size: usize,
}

impl WorkDiscovery {
    pub fn new(store: Arc<dyn ClaimStore>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Claim the lowest-id pending, unclaimed unit
    ///
    /// Walks candidates in ascending `unit_id` order and tries the atomic
    /// insert on each; a conflict moves on to the next. When a whole batch
    /// is lost to other workers the query is re-run, since those units are
    /// now excluded. Returns `None` once no candidates remain.
    pub async fn discover_and_claim(&self, worker_id: &str) -> TaggerResult<Option<WorkUnit>> {
        loop {
            let candidates = self.store.candidate_units(self.batch_size).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for unit in candidates {
                match self.claim(&unit.unit_id, worker_id).await {
                    Ok(()) => {
                        debug!(worker_id, unit_id = %unit.unit_id, "Claimed unit");
                        return Ok(Some(unit));
                    }
                    Err(TaggerError::ClaimConflict(_)) => {
                        debug!(worker_id, unit_id = %unit.unit_id, "Unit already claimed, advancing");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Atomically claim one specific unit
    ///
    /// Fails with [`TaggerError::ClaimConflict`] when another worker holds it.
    pub async fn claim(&self, unit_id: &str, worker_id: &str) -> TaggerResult<()> {
        match self.store.insert_claim(unit_id, worker_id).await? {
            ClaimInsert::Inserted => Ok(()),
            ClaimInsert::Conflict => Err(TaggerError::ClaimConflict(unit_id.to_string())),
        }
    }

    /// Drop this worker's claim on `unit_id`
    pub async fn release(&self, unit_id: &str, worker_id: &str) -> TaggerResult<bool> {
        let released = self.store.delete_claim(unit_id, worker_id).await?;
        if !released {
            warn!(worker_id, unit_id, "Release found no claim owned by this worker");
        }
        Ok(released)
    }

    /// Release claims left under `worker_id` by a crashed predecessor
    pub async fn release_owned_by(&self, worker_id: &str) -> TaggerResult<u64> {
        let released = self.store.delete_claims_owned_by(worker_id).await?;
        if released > 0 {
            info!(worker_id, released, "Released claims left by previous incarnation");
        }
        Ok(released)
    }

    /// Record the unit's outcome (call before `release`)
    pub async fn complete(&self, unit_id: &str, outcome: &UnitOutcome) -> TaggerResult<()> {
        self.store.complete_unit(unit_id, outcome).await?;
        Ok(())
    }
}

/// Answers whether a claim owner is still entitled to its claims
pub trait LivenessOracle: Send + Sync {
    /// True while the component is registered and not failed
    fn is_live(&self, component_id: &str) -> bool;
}

/// Periodically releases claims whose owner is failed or unknown
pub struct ClaimReaper {
    store: Arc<dyn ClaimStore>,
    oracle: Arc<dyn LivenessOracle>,
}

impl ClaimReaper {
    pub fn new(store: Arc<dyn ClaimStore>, oracle: Arc<dyn LivenessOracle>) -> Self {
        Self { store, oracle }
    }

    /// One sweep; returns the number of claims released
    pub async fn reap_once(&self) -> TaggerResult<usize> {
        let mut released = 0;
        for claim in self.store.list_claims().await? {
            if self.oracle.is_live(&claim.claimed_by) {
                continue;
            }
            if self.store.delete_claim(&claim.unit_id, &claim.claimed_by).await? {
                info!(
                    unit_id = %claim.unit_id,
                    claimed_by = %claim.claimed_by,
                    "Released stale claim"
                );
                released += 1;
            }
        }
        Ok(released)
    }

    /// Sweep every `interval` until `shutdown` fires
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        warn!(error = %e, "Stale claim sweep failed");
                    }
                }
            }
        }
        debug!("Claim reaper stopped");
    }
}
