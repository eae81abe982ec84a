//! Worker processing loop
//!
//! One worker handles one unit at a time:
//!
//! 1. Check headroom for its device; without it, report unhealthy and back off
//! 2. Claim the lowest-id pending unit; with none, report idle and poll later
//! 3. Run the processor, record the outcome, release the claim
//!
//! A stop request (or a vanished supervisor) is honoured between units. The
//! unit in flight is always finished first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wktag_common::events::{DevicePreference, HealthStatus};

use super::heartbeat::{spawn_heartbeat, spawn_stop_listener, Activity};
use super::processor::{ProcessingError, Processor};
use crate::claims::{ClaimStore, UnitOutcome, WorkDiscovery};
use crate::db::WorkUnit;
use crate::error::{TaggerError, TaggerResult};
use crate::health::{FrameWriter, Phase};
use crate::resources::{headroom_from, Headroom, ResourceMonitor, ResourceSnapshot};
use crate::tier::{CacheMode, CapacityEstimate};

/// Everything a worker process is told at launch
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub component_id: String,
    pub execution_tier: u8,
    pub device_preference: DevicePreference,
    pub cache_mode: CacheMode,
    pub frame_interval: Duration,
    pub frame_write_timeout: Duration,
    pub poll_interval: Duration,
    pub vram_budget_mb: u64,
    pub ram_budget_mb: u64,
    /// Per-unit memory estimate used for headroom checks
    pub estimate: CapacityEstimate,
}

/// Collaborators built during worker initialization
pub struct WorkerDeps {
    pub store: Arc<dyn ClaimStore>,
    pub monitor: Arc<ResourceMonitor>,
    pub processor: Arc<dyn Processor>,
}

/// Counters reported when the worker exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: u64,
    pub failed: u64,
    /// Units handed back unprocessed after resource exhaustion
    pub released: u64,
}

/// Run a worker over the given health channel and control input
///
/// `init` builds the store, monitor and processor. If it fails the worker
/// reports `Failed` (so the supervisor does not restart it) and the error is
/// returned. Otherwise the loop runs until a stop request or until the
/// supervisor becomes unreachable.
pub async fn serve<W, R, F, Fut>(
    settings: WorkerSettings,
    frames: W,
    control: R,
    init: F,
) -> TaggerResult<RunSummary>
where
    W: AsyncWrite + Send + Unpin + 'static,
    R: AsyncRead + Send + Unpin + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = TaggerResult<WorkerDeps>>,
{
    let shutdown = CancellationToken::new();
    let (activity_tx, activity_rx) = watch::channel(Activity::initializing());
    let flush_timeout = settings.frame_write_timeout.saturating_mul(2);

    let heartbeat = spawn_heartbeat(
        settings.component_id.clone(),
        FrameWriter::new(frames, settings.frame_write_timeout),
        activity_rx,
        settings.frame_interval,
        shutdown.clone(),
    );
    let listener = spawn_stop_listener(control, shutdown.clone());

    let outcome = match init().await {
        Ok(deps) => {
            let runtime = WorkerRuntime::new(settings, deps, activity_tx, shutdown);
            Ok(runtime.run().await)
        }
        Err(e) => {
            error!(component_id = %settings.component_id, error = %e, "Worker initialization failed");
            activity_tx.send_replace(Activity::new(HealthStatus::Failed, Phase::Initializing));
            drop(activity_tx);
            Err(e)
        }
    };

    if tokio::time::timeout(flush_timeout, heartbeat).await.is_err() {
        warn!("Final health frame not flushed");
    }
    listener.abort();
    outcome
}

struct WorkerRuntime {
    settings: WorkerSettings,
    discovery: WorkDiscovery,
    monitor: Arc<ResourceMonitor>,
    processor: Arc<dyn Processor>,
    activity: watch::Sender<Activity>,
    shutdown: CancellationToken,
    /// Claims under our id may exist that we no longer work on
    stale_claims: bool,
    summary: RunSummary,
}

impl WorkerRuntime {
    fn new(
        settings: WorkerSettings,
        deps: WorkerDeps,
        activity: watch::Sender<Activity>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            discovery: WorkDiscovery::new(deps.store),
            monitor: deps.monitor,
            processor: deps.processor,
            activity,
            shutdown,
            // A previous incarnation may have died holding a claim
            stale_claims: true,
            summary: RunSummary::default(),
        }
    }

    async fn run(mut self) -> RunSummary {
        info!(
            component_id = %self.settings.component_id,
            tier = self.settings.execution_tier,
            device = %self.settings.device_preference,
            cache_mode = %self.settings.cache_mode,
            "Worker started"
        );

        while !self.shutdown.is_cancelled() {
            if self.stale_claims && !self.release_stale_claims().await {
                self.back_off().await;
                continue;
            }

            let device = match self.headroom().await {
                Headroom::Gpu => DevicePreference::Gpu,
                Headroom::Cpu => DevicePreference::Cpu,
                Headroom::Recovering => {
                    let reason = TaggerError::TransientResourceExhaustion(format!(
                        "no headroom for {} MB VRAM or {} MB RAM",
                        self.settings.estimate.backbone_vram_mb, self.settings.estimate.per_worker_ram_mb
                    ));
                    debug!(component_id = %self.settings.component_id, "{}", reason);
                    self.back_off().await;
                    continue;
                }
            };

            let unit = match self.discovery.discover_and_claim(&self.settings.component_id).await {
                Ok(Some(unit)) => unit,
                Ok(None) => {
                    self.set(Activity::new(HealthStatus::Healthy, Phase::Idle));
                    self.sleep(self.settings.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    warn!(component_id = %self.settings.component_id, error = %e, "Work discovery failed");
                    self.back_off().await;
                    continue;
                }
            };

            if !self.process(unit, device).await {
                self.back_off().await;
            }
        }

        self.set(Activity::new(HealthStatus::Healthy, Phase::Stopping));
        info!(
            component_id = %self.settings.component_id,
            completed = self.summary.completed,
            failed = self.summary.failed,
            released = self.summary.released,
            "Worker stopping"
        );
        self.summary
    }

    /// Process one claimed unit; false when resources ran out
    async fn process(&mut self, unit: WorkUnit, device: DevicePreference) -> bool {
        let id = self.settings.component_id.clone();
        self.set(Activity::processing(&unit.unit_id));

        let (outcome, exhausted) = match self.processor.process(&unit, device).await {
            Ok(output) => {
                info!(component_id = %id, unit_id = %unit.unit_id, device = %device, summary = ?output.summary, "Unit done");
                self.summary.completed += 1;
                (Some(UnitOutcome::Done), false)
            }
            Err(ProcessingError::ResourceExhausted(detail)) => {
                let reason = TaggerError::TransientResourceExhaustion(detail);
                warn!(component_id = %id, unit_id = %unit.unit_id, "{}, handing unit back", reason);
                self.summary.released += 1;
                (None, true)
            }
            Err(ProcessingError::Failed(detail)) => {
                warn!(component_id = %id, unit_id = %unit.unit_id, detail = %detail, "Unit failed");
                self.summary.failed += 1;
                (Some(UnitOutcome::Failed(detail)), false)
            }
        };

        if let Some(outcome) = outcome {
            if let Err(e) = self.discovery.complete(&unit.unit_id, &outcome).await {
                warn!(component_id = %id, unit_id = %unit.unit_id, error = %e, "Failed to record unit outcome");
            }
        }
        if let Err(e) = self.discovery.release(&unit.unit_id, &id).await {
            warn!(component_id = %id, unit_id = %unit.unit_id, error = %e, "Failed to release claim");
            self.stale_claims = true;
        }

        !exhausted
    }

    async fn release_stale_claims(&mut self) -> bool {
        match self.discovery.release_owned_by(&self.settings.component_id).await {
            Ok(_) => {
                self.stale_claims = false;
                true
            }
            Err(e) => {
                warn!(component_id = %self.settings.component_id, error = %e, "Failed to release own claims");
                false
            }
        }
    }

    async fn headroom(&self) -> Headroom {
        let s = &self.settings;
        match s.device_preference {
            DevicePreference::Gpu => {
                self.monitor
                    .check_headroom(
                        s.vram_budget_mb,
                        s.ram_budget_mb,
                        s.estimate.backbone_vram_mb,
                        s.estimate.per_worker_ram_mb,
                    )
                    .await
            }
            // CPU workers never look at the GPU
            DevicePreference::Cpu => {
                let ram = self.monitor.get_ram_snapshot().await;
                headroom_from(
                    &ResourceSnapshot::default(),
                    &ram,
                    s.vram_budget_mb,
                    s.ram_budget_mb,
                    s.estimate.backbone_vram_mb,
                    s.estimate.per_worker_ram_mb,
                )
            }
        }
    }

    async fn back_off(&self) {
        self.set(Activity::new(HealthStatus::Unhealthy, Phase::BackingOff));
        self.sleep(self.settings.poll_interval).await;
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    fn set(&self, activity: Activity) {
        self.activity.send_if_modified(|current| {
            if *current == activity {
                false
            } else {
                *current = activity;
                true
            }
        });
    }
}
