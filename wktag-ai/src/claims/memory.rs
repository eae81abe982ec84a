//! In-process claim store
//!
//! Backs tests and single-process runs. A single mutex around units and
//! claims makes every insert trivially atomic.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use wktag_common::Result;

use super::{ClaimInsert, ClaimRecord, ClaimStore, UnitOutcome};
use crate::db::{UnitState, WorkUnit};

#[derive(Default)]
struct State {
    units: BTreeMap<String, WorkUnit>,
    claims: BTreeMap<String, ClaimRecord>,
}

/// `BTreeMap`-backed store; iteration order is ascending `unit_id`
#[derive(Default)]
pub struct MemoryClaimStore {
    state: Mutex<State>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit (ignored if the id is already known)
    pub fn add_unit(&self, unit: WorkUnit) {
        let mut state = self.lock();
        state.units.entry(unit.unit_id.clone()).or_insert(unit);
    }

    pub fn unit(&self, unit_id: &str) -> Option<WorkUnit> {
        self.lock().units.get(unit_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn candidate_units(&self, limit: usize) -> Result<Vec<WorkUnit>> {
        let state = self.lock();
        Ok(state
            .units
            .values()
            .filter(|u| u.state == UnitState::Pending && !state.claims.contains_key(&u.unit_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_claim(&self, unit_id: &str, claimed_by: &str) -> Result<ClaimInsert> {
        let mut state = self.lock();
        let pending = state
            .units
            .get(unit_id)
            .map(|u| u.state == UnitState::Pending)
            .unwrap_or(false);
        if !pending || state.claims.contains_key(unit_id) {
            return Ok(ClaimInsert::Conflict);
        }
        state.claims.insert(
            unit_id.to_string(),
            ClaimRecord {
                unit_id: unit_id.to_string(),
                claimed_by: claimed_by.to_string(),
                claimed_at: Utc::now(),
            },
        );
        Ok(ClaimInsert::Inserted)
    }

    async fn delete_claim(&self, unit_id: &str, claimed_by: &str) -> Result<bool> {
        let mut state = self.lock();
        match state.claims.get(unit_id) {
            Some(claim) if claim.claimed_by == claimed_by => {
                state.claims.remove(unit_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_claims_owned_by(&self, claimed_by: &str) -> Result<u64> {
        let mut state = self.lock();
        let before = state.claims.len();
        state.claims.retain(|_, claim| claim.claimed_by != claimed_by);
        Ok((before - state.claims.len()) as u64)
    }

    async fn list_claims(&self) -> Result<Vec<ClaimRecord>> {
        Ok(self.lock().claims.values().cloned().collect())
    }

    async fn complete_unit(&self, unit_id: &str, outcome: &UnitOutcome) -> Result<()> {
        let mut state = self.lock();
        if let Some(unit) = state.units.get_mut(unit_id) {
            unit.attempts += 1;
            match outcome {
                UnitOutcome::Done => {
                    unit.state = UnitState::Done;
                    unit.last_error = None;
                }
                UnitOutcome::Failed(reason) => {
                    unit.state = UnitState::Failed;
                    unit.last_error = Some(reason.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_insert_conflicts() {
        let store = MemoryClaimStore::new();
        let unit = WorkUnit::pending("/a.wav");
        let id = unit.unit_id.clone();
        store.add_unit(unit);
        assert_eq!(store.insert_claim(&id, "w0").await.unwrap(), ClaimInsert::Inserted);
        assert_eq!(store.insert_claim(&id, "w1").await.unwrap(), ClaimInsert::Conflict);
        assert_eq!(store.list_claims().await.unwrap()[0].claimed_by, "w0");
    }

    #[tokio::test]
    async fn test_only_pending_units_can_be_claimed() {
        let store = MemoryClaimStore::new();
        let unit = WorkUnit::pending("/a.wav");
        let id = unit.unit_id.clone();
        store.add_unit(unit);
        store.complete_unit(&id, &UnitOutcome::Done).await.unwrap();

        assert_eq!(store.insert_claim(&id, "w0").await.unwrap(), ClaimInsert::Conflict);
        assert_eq!(store.insert_claim("missing", "w0").await.unwrap(), ClaimInsert::Conflict);
        assert!(store.list_claims().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_outcome_recorded() {
        let store = MemoryClaimStore::new();
        let unit = WorkUnit::pending("/a.wav");
        let id = unit.unit_id.clone();
        store.add_unit(unit);

        store
            .complete_unit(&id, &UnitOutcome::Failed("decoder error".to_string()))
            .await
            .unwrap();
        let unit = store.unit(&id).unwrap();
        assert_eq!(unit.state, UnitState::Failed);
        assert_eq!(unit.attempts, 1);
        assert_eq!(unit.last_error.as_deref(), Some("decoder error"));
        assert!(store.candidate_units(10).await.unwrap().is_empty());
    }
}
