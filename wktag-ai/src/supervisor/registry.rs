//! Health registry
//!
//! One entry per component, written only by the supervisor loop. Readers go
//! through [`StatusView`], which derives a status at query time so staleness
//! is judged against the reader's clock rather than the last tick.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use wktag_common::events::{HealthStatus, WorkerState};

use super::process::WorkerSpec;
use crate::claims::LivenessOracle;
use crate::error::{TaggerError, TaggerResult};
use crate::health::HealthFrame;
use crate::restart::CrashHistory;

/// Supervisor-owned record for one component
#[derive(Debug, Clone)]
pub(crate) struct RegistryEntry {
    pub(crate) spec: WorkerSpec,
    pub(crate) state: WorkerState,
    /// Incremented on every spawn
    pub(crate) generation: u64,
    pub(crate) pid: Option<u32>,
    pub(crate) last_frame: Option<HealthFrame>,
    /// Supervisor receipt time of `last_frame`
    pub(crate) last_seen: Option<Instant>,
    pub(crate) spawned_at: Instant,
    pub(crate) healthy_since: Option<Instant>,
    pub(crate) history: CrashHistory,
    pub(crate) restart_at: Option<Instant>,
    /// Last status announced on the event bus
    pub(crate) reported_status: HealthStatus,
    pub(crate) failure_reason: Option<String>,
}

impl RegistryEntry {
    pub(crate) fn new(spec: WorkerSpec, now: Instant) -> Self {
        Self {
            spec,
            state: WorkerState::Stopped,
            generation: 0,
            pid: None,
            last_frame: None,
            last_seen: None,
            spawned_at: now,
            healthy_since: None,
            history: CrashHistory::new(),
            restart_at: None,
            reported_status: HealthStatus::Pending,
            failure_reason: None,
        }
    }

    /// Status as seen by outside observers
    ///
    /// - failed lifecycle or a failed frame: `Failed`
    /// - not running (crashed, stopping, stopped): `Unhealthy`
    /// - no frame yet: `Pending`
    /// - last frame older than `staleness_window`: `Healthy` downgrades to
    ///   `Unhealthy`; other statuses are kept
    pub(crate) fn derived_status(&self, now: Instant, staleness_window: Duration) -> HealthStatus {
        match self.state {
            WorkerState::Failed => return HealthStatus::Failed,
            WorkerState::Crashed | WorkerState::Stopping | WorkerState::Stopped => {
                return HealthStatus::Unhealthy
            }
            WorkerState::Pending | WorkerState::Healthy | WorkerState::Unhealthy => {}
        }

        let (frame, seen) = match (&self.last_frame, self.last_seen) {
            (Some(frame), Some(seen)) => (frame, seen),
            _ => return HealthStatus::Pending,
        };

        let stale = now.saturating_duration_since(seen) > staleness_window;
        match frame.status {
            HealthStatus::Healthy if stale => HealthStatus::Unhealthy,
            status => status,
        }
    }
}

/// Read-only snapshot of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentSummary {
    pub component_id: String,
    pub status: HealthStatus,
    pub state: WorkerState,
    pub execution_tier: u8,
    pub restart_count: u32,
    pub pid: Option<u32>,
    pub current_unit_id: Option<String>,
    pub failure_reason: Option<String>,
}

/// All entries, keyed by component id
#[derive(Debug, Default)]
pub(crate) struct HealthRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl HealthRegistry {
    pub(crate) fn get(&self, component_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(component_id)
    }

    pub(crate) fn get_mut(&mut self, component_id: &str) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(component_id)
    }

    pub(crate) fn insert(&mut self, component_id: String, entry: RegistryEntry) {
        self.entries.insert(component_id, entry);
    }

    pub(crate) fn remove(&mut self, component_id: &str) -> Option<RegistryEntry> {
        self.entries.remove(component_id)
    }

    pub(crate) fn contains(&self, component_id: &str) -> bool {
        self.entries.contains_key(component_id)
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.entries.iter()
    }

}

/// Cloneable read-only view of the registry
#[derive(Debug, Clone)]
pub struct StatusView {
    registry: Arc<RwLock<HealthRegistry>>,
    staleness_window: Duration,
}

impl StatusView {
    pub(crate) fn new(registry: Arc<RwLock<HealthRegistry>>, staleness_window: Duration) -> Self {
        Self {
            registry,
            staleness_window,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HealthRegistry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_component_status(&self, component_id: &str) -> TaggerResult<HealthStatus> {
        self.read()
            .get(component_id)
            .map(|entry| entry.derived_status(Instant::now(), self.staleness_window))
            .ok_or_else(|| TaggerError::UnknownComponent(component_id.to_string()))
    }

    pub fn lifecycle_state(&self, component_id: &str) -> TaggerResult<WorkerState> {
        self.read()
            .get(component_id)
            .map(|entry| entry.state)
            .ok_or_else(|| TaggerError::UnknownComponent(component_id.to_string()))
    }

    pub fn restart_count(&self, component_id: &str) -> TaggerResult<u32> {
        self.read()
            .get(component_id)
            .map(|entry| entry.history.restart_count())
            .ok_or_else(|| TaggerError::UnknownComponent(component_id.to_string()))
    }

    pub fn list_component_ids(&self) -> Vec<String> {
        self.read().ids()
    }

    pub fn summaries(&self) -> Vec<ComponentSummary> {
        let now = Instant::now();
        self.read()
            .iter()
            .map(|(id, entry)| ComponentSummary {
                component_id: id.clone(),
                status: entry.derived_status(now, self.staleness_window),
                state: entry.state,
                execution_tier: entry.spec.execution_tier,
                restart_count: entry.history.restart_count(),
                pid: entry.pid,
                current_unit_id: entry.last_frame.as_ref().and_then(|f| f.current_unit_id.clone()),
                failure_reason: entry.failure_reason.clone(),
            })
            .collect()
    }
}

impl LivenessOracle for StatusView {
    fn is_live(&self, component_id: &str) -> bool {
        self.read()
            .get(component_id)
            .map(|entry| entry.state != WorkerState::Failed)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::CacheMode;
    use wktag_common::events::DevicePreference;

    fn entry(now: Instant) -> RegistryEntry {
        let mut entry = RegistryEntry::new(
            WorkerSpec {
                component_id: "worker:discovery:0".to_string(),
                execution_tier: 0,
                device_preference: DevicePreference::Gpu,
                cache_mode: CacheMode::Cached,
            },
            now,
        );
        entry.state = WorkerState::Pending;
        entry
    }

    fn with_frame(mut entry: RegistryEntry, status: HealthStatus, seen: Instant) -> RegistryEntry {
        entry.last_frame = Some(HealthFrame::new("worker:discovery:0", status, 0));
        entry.last_seen = Some(seen);
        entry
    }

    const WINDOW: Duration = Duration::from_secs(15);

    #[tokio::test(start_paused = true)]
    async fn test_no_frame_is_pending() {
        let now = Instant::now();
        assert_eq!(entry(now).derived_status(now + Duration::from_secs(600), WINDOW), HealthStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_healthy_is_unhealthy() {
        let now = Instant::now();
        let e = with_frame(entry(now), HealthStatus::Healthy, now);
        assert_eq!(e.derived_status(now + WINDOW, WINDOW), HealthStatus::Healthy);
        assert_eq!(
            e.derived_status(now + WINDOW + Duration::from_millis(1), WINDOW),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_frame_is_terminal_even_when_stale() {
        let now = Instant::now();
        let e = with_frame(entry(now), HealthStatus::Failed, now);
        assert_eq!(e.derived_status(now + Duration::from_secs(3600), WINDOW), HealthStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_running_states_are_unhealthy() {
        let now = Instant::now();
        for state in [WorkerState::Crashed, WorkerState::Stopping, WorkerState::Stopped] {
            let mut e = with_frame(entry(now), HealthStatus::Healthy, now);
            e.state = state;
            assert_eq!(e.derived_status(now, WINDOW), HealthStatus::Unhealthy, "{}", state);
        }
        let mut e = entry(now);
        e.state = WorkerState::Failed;
        assert_eq!(e.derived_status(now, WINDOW), HealthStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_liveness() {
        let registry = Arc::new(RwLock::new(HealthRegistry::default()));
        let view = StatusView::new(registry.clone(), WINDOW);
        let now = Instant::now();

        registry.write().unwrap().insert("a".to_string(), entry(now));
        let mut failed = entry(now);
        failed.state = WorkerState::Failed;
        registry.write().unwrap().insert("b".to_string(), failed);

        assert!(view.is_live("a"));
        assert!(!view.is_live("b"));
        assert!(!view.is_live("c"));
        assert!(matches!(
            view.get_component_status("c"),
            Err(TaggerError::UnknownComponent(_))
        ));
        assert_eq!(view.list_component_ids(), vec!["a", "b"]);
    }
}
