//! Worker supervisor
//!
//! Owns the pool of out-of-process workers. Liveness is judged only from
//! each worker's health channel, never from the claims store: the supervisor
//! has no access to it.
//!
//! All registry mutation happens on one task, [`Supervisor::run`], which
//! multiplexes:
//! - health channel events (one reader task per worker)
//! - process exits (one process task per worker)
//! - a periodic tick (restarts, startup grace, healthy reset, staleness)
//! - operator commands from cloned [`SupervisorHandle`]s
//! - shutdown
//!
//! Lifecycle per component:
//!
//! ```text
//! pending -> healthy <-> unhealthy -> stopping -> stopped
//!    |          |            |
//!    +----------+------------+--> crashed --(delay)--> pending
//!                                    |
//!                                    +--(limits exceeded)--> failed
//! ```

mod process;
mod registry;

pub use process::{
    ChildProcess, ChildProcessLauncher, LaunchedWorker, ProcessHandle, WorkerLaunchTemplate, WorkerLauncher,
    WorkerSpec, STOP_COMMAND,
};
pub use registry::{ComponentSummary, StatusView};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wktag_common::events::{EventBus, HealthStatus, WorkerEvent, WorkerState};

use crate::error::{TaggerError, TaggerResult};
use crate::health::{spawn_frame_reader, ChannelEvent, HealthFrame};
use crate::restart::{RestartDecision, RestartPolicy};
use crate::tier::TierDecision;
use process::{spawn_process_task, ProcessControl, ProcessExit};
use registry::{HealthRegistry, RegistryEntry};

/// Pool member names: `worker:discovery:{n}`
pub const WORKER_ID_PREFIX: &str = "worker:discovery:";

pub fn worker_component_id(index: usize) -> String {
    format!("{}{}", WORKER_ID_PREFIX, index)
}

/// Supervisor timing and restart settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub frame_interval: Duration,
    pub staleness_multiplier: u32,
    /// A worker silent this long after spawn is killed and counted as crashed
    pub startup_grace: Duration,
    pub stop_grace: Duration,
    pub tick_interval: Duration,
    pub restart: RestartPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_secs(5),
            staleness_multiplier: 3,
            startup_grace: Duration::from_secs(30),
            stop_grace: Duration::from_secs(120),
            tick_interval: Duration::from_secs(1),
            restart: RestartPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    /// Frames older than this no longer vouch for health
    pub fn staleness_window(&self) -> Duration {
        self.frame_interval * self.staleness_multiplier
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Spawn {
        spec: WorkerSpec,
        reply: Reply<TaggerResult<ComponentSummary>>,
    },
    Stop {
        component_id: String,
        grace: Option<Duration>,
        reply: Reply<TaggerResult<oneshot::Receiver<()>>>,
    },
    Remove {
        component_id: String,
        grace: Option<Duration>,
        reply: Reply<TaggerResult<oneshot::Receiver<()>>>,
    },
    Pause {
        grace: Option<Duration>,
        reply: Reply<Vec<oneshot::Receiver<()>>>,
    },
    Resume {
        reply: Reply<usize>,
    },
    Reset {
        component_id: String,
        reply: Reply<TaggerResult<()>>,
    },
    ApplyTier {
        decision: TierDecision,
        reply: Reply<()>,
    },
}

/// Cloneable command interface to a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
}

fn gone() -> TaggerError {
    TaggerError::Protocol("supervisor is not running".to_string())
}

impl SupervisorHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> TaggerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())
    }

    /// Start a worker; returns once the process exists (not once healthy)
    pub async fn spawn(&self, spec: WorkerSpec) -> TaggerResult<ComponentSummary> {
        self.call(|reply| Command::Spawn { spec, reply }).await?
    }

    /// Gracefully stop a worker; resolves once its process has exited
    ///
    /// `grace` defaults to the configured stop grace; the process is killed
    /// when it elapses.
    pub async fn stop(&self, component_id: &str, grace: Option<Duration>) -> TaggerResult<()> {
        let component_id = component_id.to_string();
        let exited = self
            .call(|reply| Command::Stop {
                component_id,
                grace,
                reply,
            })
            .await??;
        let _ = exited.await;
        Ok(())
    }

    /// Stop a worker and forget it; its claims become stale
    pub async fn remove(&self, component_id: &str, grace: Option<Duration>) -> TaggerResult<()> {
        let component_id = component_id.to_string();
        let exited = self
            .call(|reply| Command::Remove {
                component_id,
                grace,
                reply,
            })
            .await??;
        let _ = exited.await;
        Ok(())
    }

    /// Stop every running worker, keeping their restart counters
    pub async fn pause(&self, grace: Option<Duration>) -> TaggerResult<()> {
        let waiters = self.call(|reply| Command::Pause { grace, reply }).await?;
        for exited in waiters {
            let _ = exited.await;
        }
        Ok(())
    }

    /// Respawn workers stopped by `pause`; returns how many were started
    pub async fn resume(&self) -> TaggerResult<usize> {
        self.call(|reply| Command::Resume { reply }).await
    }

    /// Operator reset: clear restart counters and revive a failed worker
    pub async fn reset(&self, component_id: &str) -> TaggerResult<()> {
        let component_id = component_id.to_string();
        self.call(|reply| Command::Reset { component_id, reply }).await?
    }

    /// Scale the pool to a tier decision
    pub async fn apply_tier(&self, decision: TierDecision) -> TaggerResult<()> {
        self.call(|reply| Command::ApplyTier { decision, reply }).await
    }
}

/// Live process bookkeeping for the current incarnation
struct ProcessSlot {
    generation: u64,
    control: mpsc::UnboundedSender<ProcessControl>,
    _reader: JoinHandle<()>,
    _task: JoinHandle<()>,
}

/// What to do once a stopping worker's process is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterStop {
    Stay,
    Remove,
    Respawn,
}

pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    registry: Arc<RwLock<HealthRegistry>>,
    events: EventBus,
    commands: mpsc::Receiver<Command>,
    channel_tx: mpsc::UnboundedSender<ChannelEvent>,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
    exit_rx: mpsc::UnboundedReceiver<ProcessExit>,
    processes: HashMap<String, ProcessSlot>,
    after_stop: HashMap<String, AfterStop>,
    stop_waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
    /// Stopped by pause, to be respawned by resume
    paused_ids: HashSet<String>,
    paused: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn WorkerLauncher>, events: EventBus) -> (Self, SupervisorHandle) {
        let (cmd_tx, commands) = mpsc::channel(64);
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            config,
            launcher,
            registry: Arc::new(RwLock::new(HealthRegistry::default())),
            events,
            commands,
            channel_tx,
            channel_rx,
            exit_tx,
            exit_rx,
            processes: HashMap::new(),
            after_stop: HashMap::new(),
            stop_waiters: HashMap::new(),
            paused_ids: HashSet::new(),
            paused: false,
        };
        (supervisor, SupervisorHandle { tx: cmd_tx })
    }

    pub fn status_view(&self) -> StatusView {
        StatusView::new(self.registry.clone(), self.config.staleness_window())
    }

    fn read(&self) -> RwLockReadGuard<'_, HealthRegistry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HealthRegistry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Run until `shutdown` fires, then stop every worker and return
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Supervisor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = self.channel_rx.recv() => self.on_channel_event(event),
                Some(exit) = self.exit_rx.recv() => self.on_process_exit(exit),
                Some(command) = self.commands.recv() => self.on_command(command),
                _ = ticker.tick() => self.on_tick(),
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        info!(workers = self.processes.len(), "Supervisor shutting down, stopping workers");
        let grace = self.config.stop_grace;
        let ids = self.read().ids();
        for id in ids {
            self.begin_stop(&id, grace, AfterStop::Stay);
        }

        while !self.processes.is_empty() {
            tokio::select! {
                Some(exit) = self.exit_rx.recv() => self.on_process_exit(exit),
                Some(event) = self.channel_rx.recv() => self.on_channel_event(event),
                else => break,
            }
        }
        info!("Supervisor stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Spawn { spec, reply } => {
                let _ = reply.send(self.spawn(spec));
            }
            Command::Stop {
                component_id,
                grace,
                reply,
            } => {
                let grace = grace.unwrap_or(self.config.stop_grace);
                let _ = reply.send(self.stop(&component_id, grace, AfterStop::Stay));
            }
            Command::Remove {
                component_id,
                grace,
                reply,
            } => {
                let grace = grace.unwrap_or(self.config.stop_grace);
                let _ = reply.send(self.stop(&component_id, grace, AfterStop::Remove));
            }
            Command::Pause { grace, reply } => {
                let grace = grace.unwrap_or(self.config.stop_grace);
                let _ = reply.send(self.pause(grace));
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume());
            }
            Command::Reset { component_id, reply } => {
                let _ = reply.send(self.reset(&component_id));
            }
            Command::ApplyTier { decision, reply } => {
                self.apply_tier(&decision);
                let _ = reply.send(());
            }
        }
    }

    /// Register (or re-register) and start a worker
    fn spawn(&mut self, spec: WorkerSpec) -> TaggerResult<ComponentSummary> {
        let id = spec.component_id.clone();
        if self.processes.contains_key(&id) {
            return Err(TaggerError::Spawn {
                component_id: id,
                reason: "already running".to_string(),
            });
        }

        {
            let mut registry = self.write();
            match registry.get_mut(&id) {
                Some(entry) => entry.spec = spec,
                None => registry.insert(id.clone(), RegistryEntry::new(spec, Instant::now())),
            }
        }

        if let Err(e) = self.start_incarnation(&id) {
            // A worker that never started leaves nothing worth keeping
            let mut registry = self.write();
            if registry.get(&id).map(|entry| entry.generation == 0).unwrap_or(false) {
                registry.remove(&id);
            }
            return Err(e);
        }
        self.summary(&id)
    }

    fn summary(&self, id: &str) -> TaggerResult<ComponentSummary> {
        self.status_view()
            .summaries()
            .into_iter()
            .find(|s| s.component_id == id)
            .ok_or_else(|| TaggerError::UnknownComponent(id.to_string()))
    }

    /// Launch a fresh incarnation for a registered component
    fn start_incarnation(&mut self, id: &str) -> TaggerResult<()> {
        let spec = self
            .read()
            .get(id)
            .map(|entry| entry.spec.clone())
            .ok_or_else(|| TaggerError::UnknownComponent(id.to_string()))?;

        let launched = self.launcher.launch(&spec)?;
        let pid = launched.process.id();
        let now = Instant::now();

        let generation = {
            let mut registry = self.write();
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| TaggerError::UnknownComponent(id.to_string()))?;
            entry.generation += 1;
            entry.state = WorkerState::Pending;
            entry.pid = pid;
            entry.last_frame = None;
            entry.last_seen = None;
            entry.spawned_at = now;
            entry.healthy_since = None;
            entry.restart_at = None;
            entry.failure_reason = None;
            entry.generation
        };

        let reader = spawn_frame_reader(id.to_string(), generation, launched.channel, self.channel_tx.clone());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = spawn_process_task(id.to_string(), generation, launched.process, control_rx, self.exit_tx.clone());
        self.processes.insert(
            id.to_string(),
            ProcessSlot {
                generation,
                control: control_tx,
                _reader: reader,
                _task: task,
            },
        );

        info!(
            component_id = %id,
            generation,
            pid = ?pid,
            tier = spec.execution_tier,
            device = %spec.device_preference,
            "Worker spawned"
        );
        self.events.emit_lossy(WorkerEvent::WorkerSpawned {
            component_id: id.to_string(),
            execution_tier: spec.execution_tier,
            device_preference: spec.device_preference,
            pid,
            timestamp: wktag_common::time::now(),
        });
        self.publish_status(id);
        Ok(())
    }

    /// Request a stop; the receiver fires once the process is gone
    fn stop(&mut self, id: &str, grace: Duration, after: AfterStop) -> TaggerResult<oneshot::Receiver<()>> {
        if !self.read().contains(id) {
            return Err(TaggerError::UnknownComponent(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.stop_waiters.entry(id.to_string()).or_default().push(tx);
        self.begin_stop(id, grace, after);
        Ok(rx)
    }

    fn begin_stop(&mut self, id: &str, grace: Duration, after: AfterStop) {
        self.after_stop.insert(id.to_string(), after);

        match self.processes.get(id) {
            Some(slot) => {
                let mut registry = self.write();
                if let Some(entry) = registry.get_mut(id) {
                    if entry.state != WorkerState::Stopping {
                        info!(component_id = %id, grace_s = grace.as_secs_f64(), "Stopping worker");
                    }
                    // A crashed or failed process is already being killed
                    if entry.state.is_running() {
                        entry.state = WorkerState::Stopping;
                        entry.healthy_since = None;
                    }
                    entry.restart_at = None;
                }
                drop(registry);
                let _ = slot.control.send(ProcessControl::Stop { grace });
                self.publish_status(id);
            }
            None => {
                // Nothing running: settle immediately
                {
                    let mut registry = self.write();
                    if let Some(entry) = registry.get_mut(id) {
                        entry.restart_at = None;
                        if entry.state != WorkerState::Failed {
                            entry.state = WorkerState::Stopped;
                        }
                    }
                }
                self.finish_stop(id, true);
            }
        }
    }

    /// Process gone after a stop request
    fn finish_stop(&mut self, id: &str, graceful: bool) {
        let after = self.after_stop.remove(id).unwrap_or(AfterStop::Stay);

        if let Some(waiters) = self.stop_waiters.remove(id) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }

        match after {
            AfterStop::Remove => {
                self.write().remove(id);
                self.paused_ids.remove(id);
                info!(component_id = %id, "Worker removed");
            }
            AfterStop::Respawn if self.paused => {
                self.paused_ids.insert(id.to_string());
            }
            AfterStop::Respawn => {
                if let Err(e) = self.start_incarnation(id) {
                    self.on_launch_failure(id, &e);
                }
            }
            AfterStop::Stay => {}
        }

        self.events.emit_lossy(WorkerEvent::WorkerStopped {
            component_id: id.to_string(),
            graceful,
            timestamp: wktag_common::time::now(),
        });
        if after != AfterStop::Remove {
            self.publish_status(id);
        }
    }

    fn pause(&mut self, grace: Duration) -> Vec<oneshot::Receiver<()>> {
        self.paused = true;
        let ids: Vec<String> = self.processes.keys().cloned().collect();
        info!(workers = ids.len(), "Pausing worker pool");

        let mut waiters = Vec::new();
        for id in ids {
            // A crashed worker still being killed keeps its pending restart
            let resumable = self
                .read()
                .get(&id)
                .map(|entry| {
                    entry.state.is_running()
                        || (entry.state == WorkerState::Crashed && entry.restart_at.is_some())
                })
                .unwrap_or(false);
            if resumable {
                self.paused_ids.insert(id.clone());
            }
            if let Ok(rx) = self.stop(&id, grace, AfterStop::Stay) {
                waiters.push(rx);
            }
        }
        waiters
    }

    fn resume(&mut self) -> usize {
        self.paused = false;
        let ids: Vec<String> = self.paused_ids.drain().collect();
        let mut started = 0;

        for id in ids {
            let stopped = self
                .read()
                .get(&id)
                .map(|entry| entry.state == WorkerState::Stopped)
                .unwrap_or(false);
            if !stopped || self.processes.contains_key(&id) {
                continue;
            }
            match self.start_incarnation(&id) {
                Ok(()) => started += 1,
                Err(e) => self.on_launch_failure(&id, &e),
            }
        }
        info!(started, "Worker pool resumed");
        started
    }

    fn reset(&mut self, id: &str) -> TaggerResult<()> {
        let revive = {
            let mut registry = self.write();
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| TaggerError::UnknownComponent(id.to_string()))?;
            entry.history.reset();
            if entry.state == WorkerState::Failed {
                entry.state = WorkerState::Crashed;
                entry.failure_reason = None;
                entry.restart_at = Some(Instant::now());
                true
            } else {
                false
            }
        };
        info!(component_id = %id, revive, "Restart counters reset by operator");

        if revive && !self.processes.contains_key(id) && !self.paused {
            if let Err(e) = self.start_incarnation(id) {
                self.on_launch_failure(id, &e);
            }
        }
        Ok(())
    }

    /// Converge the pool onto a tier decision
    fn apply_tier(&mut self, decision: &TierDecision) {
        self.events.emit_lossy(WorkerEvent::TierSelected {
            tier: decision.tier,
            worker_count: decision.worker_count,
            device_preference: decision.device_preference,
            timestamp: wktag_common::time::now(),
        });

        let device = match decision.device_preference {
            Some(device) if !decision.is_refusal() => device,
            _ => {
                let hint = decision
                    .refusal
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "raise ram_budget_mb or vram_budget_mb".to_string());
                let exhausted = TaggerError::PersistentResourceExhaustion(hint);
                error!(tier = decision.tier, "{}; running zero workers", exhausted);
                let grace = self.config.stop_grace;
                let ids = self.read().ids();
                for id in ids {
                    if id.starts_with(WORKER_ID_PREFIX) {
                        let _ = self.stop(&id, grace, AfterStop::Remove);
                    }
                }
                return;
            }
        };

        info!(
            tier = decision.tier,
            workers = decision.worker_count,
            device = %device,
            cache_mode = %decision.cache_mode,
            "Applying execution tier"
        );

        let grace = self.config.stop_grace;
        let desired: Vec<String> = (0..decision.worker_count).map(worker_component_id).collect();

        // Scale down
        let ids = self.read().ids();
        for id in ids {
            if id.starts_with(WORKER_ID_PREFIX) && !desired.contains(&id) {
                let _ = self.stop(&id, grace, AfterStop::Remove);
            }
        }

        for id in desired {
            let spec = WorkerSpec {
                component_id: id.clone(),
                execution_tier: decision.tier,
                device_preference: device,
                cache_mode: decision.cache_mode,
            };

            let existing = self.read().get(&id).map(|entry| (entry.spec.clone(), entry.state));
            match existing {
                None => {
                    self.write().insert(id.clone(), RegistryEntry::new(spec, Instant::now()));
                    if self.paused {
                        self.paused_ids.insert(id);
                    } else if let Err(e) = self.start_incarnation(&id) {
                        self.on_launch_failure(&id, &e);
                    }
                }
                Some((current, _)) if current == spec => {}
                Some((_, state)) => {
                    if let Some(entry) = self.write().get_mut(&id) {
                        entry.spec = spec;
                    }
                    // Running workers pick up the new tier on their next incarnation
                    if state.is_running() && self.processes.contains_key(&id) {
                        let _ = self.stop(&id, grace, AfterStop::Respawn);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Channel and process events
    // ------------------------------------------------------------------

    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.processes
            .get(id)
            .map(|slot| slot.generation == generation)
            .unwrap_or(false)
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        if !self.is_current(event.component_id(), event.generation()) {
            debug!(
                component_id = %event.component_id(),
                generation = event.generation(),
                "Ignoring event from previous incarnation"
            );
            return;
        }

        match event {
            ChannelEvent::Frame { component_id, frame, .. } => self.on_frame(&component_id, frame),
            ChannelEvent::Closed {
                component_id, reason, ..
            } => {
                let running = self
                    .read()
                    .get(&component_id)
                    .map(|entry| matches!(entry.state, WorkerState::Pending | WorkerState::Healthy | WorkerState::Unhealthy))
                    .unwrap_or(false);
                if running {
                    let reason = reason.unwrap_or_else(|| "health channel closed".to_string());
                    self.on_crash(&component_id, &reason);
                }
            }
        }
    }

    fn on_frame(&mut self, id: &str, frame: HealthFrame) {
        let now = Instant::now();
        let mut failed_reason = None;
        {
            let mut registry = self.write();
            let Some(entry) = registry.get_mut(id) else {
                return;
            };
            entry.last_seen = Some(now);

            if matches!(entry.state, WorkerState::Pending | WorkerState::Healthy | WorkerState::Unhealthy) {
                match frame.status {
                    HealthStatus::Healthy => {
                        if entry.state != WorkerState::Healthy || entry.healthy_since.is_none() {
                            entry.healthy_since = Some(now);
                        }
                        entry.state = WorkerState::Healthy;
                    }
                    HealthStatus::Unhealthy => {
                        entry.state = WorkerState::Unhealthy;
                        entry.healthy_since = None;
                    }
                    HealthStatus::Pending => {}
                    HealthStatus::Failed => {
                        entry.state = WorkerState::Failed;
                        entry.healthy_since = None;
                        entry.restart_at = None;
                        let reason = "worker reported failed".to_string();
                        entry.failure_reason = Some(reason.clone());
                        failed_reason = Some(reason);
                    }
                }
            }
            entry.last_frame = Some(frame);
        }

        if let Some(reason) = failed_reason {
            error!(component_id = %id, "Worker reported unrecoverable failure");
            self.events.emit_lossy(WorkerEvent::WorkerFailed {
                component_id: id.to_string(),
                reason,
                timestamp: wktag_common::time::now(),
            });
        }
        self.publish_status(id);
    }

    fn on_process_exit(&mut self, exit: ProcessExit) {
        let id = exit.component_id.as_str();
        if !self.is_current(id, exit.generation) {
            return;
        }
        self.processes.remove(id);

        let state = self.read().get(id).map(|entry| entry.state);
        if let Some(entry) = self.write().get_mut(id) {
            entry.pid = None;
        }
        debug!(component_id = %id, code = ?exit.code, forced = exit.forced, "Worker process exited");

        match state {
            Some(WorkerState::Stopping) | Some(WorkerState::Stopped) => {
                if let Some(entry) = self.write().get_mut(id) {
                    entry.state = WorkerState::Stopped;
                }
                info!(component_id = %id, code = ?exit.code, graceful = !exit.forced, "Worker stopped");
                self.finish_stop(id, !exit.forced);
            }
            Some(WorkerState::Pending) | Some(WorkerState::Healthy) | Some(WorkerState::Unhealthy) => {
                // Exit observed before channel EOF
                let reason = match exit.code {
                    Some(code) => format!("process exited with code {}", code),
                    None => "process terminated by signal".to_string(),
                };
                self.on_crash(id, &reason);
            }
            Some(WorkerState::Crashed) | Some(WorkerState::Failed) => {
                // A stop requested while crashed still wants its acknowledgement
                if self.after_stop.contains_key(id) {
                    if let Some(entry) = self.write().get_mut(id) {
                        if entry.state == WorkerState::Crashed {
                            entry.state = WorkerState::Stopped;
                        }
                    }
                    self.finish_stop(id, !exit.forced);
                } else {
                    self.try_due_restart(id, Instant::now());
                }
            }
            None => {}
        }
    }

    /// Unexpected loss of a running worker
    fn on_crash(&mut self, id: &str, reason: &str) {
        let now = Instant::now();
        let policy = self.config.restart.clone();

        let (decision, restart_count) = {
            let mut registry = self.write();
            let Some(entry) = registry.get_mut(id) else {
                return;
            };
            entry.state = WorkerState::Crashed;
            entry.healthy_since = None;
            entry.history.record_crash(now, policy.rapid_window);
            let decision = policy.decide(&entry.history, now);
            match decision {
                RestartDecision::RestartAfter(delay) => entry.restart_at = Some(now + delay),
                RestartDecision::MarkFailed(reason) => {
                    entry.state = WorkerState::Failed;
                    entry.restart_at = None;
                    entry.failure_reason = Some(reason.to_string());
                }
            }
            (decision, entry.history.restart_count())
        };

        // The process may still be alive (e.g. it closed stdout)
        if let Some(slot) = self.processes.get(id) {
            let _ = slot.control.send(ProcessControl::Kill);
        }

        let crash = TaggerError::WorkerCrash {
            component_id: id.to_string(),
            reason: reason.to_string(),
        };
        warn!(restart_count, "{}", crash);
        self.events.emit_lossy(WorkerEvent::WorkerCrashed {
            component_id: id.to_string(),
            restart_count,
            reason: reason.to_string(),
            timestamp: wktag_common::time::now(),
        });

        match decision {
            RestartDecision::RestartAfter(delay) => {
                info!(component_id = %id, delay_s = delay.as_secs_f64(), "Restart scheduled");
                self.events.emit_lossy(WorkerEvent::WorkerRestartScheduled {
                    component_id: id.to_string(),
                    delay_ms: delay.as_millis() as u64,
                    timestamp: wktag_common::time::now(),
                });
            }
            RestartDecision::MarkFailed(reason) => {
                error!(component_id = %id, reason = %reason, "Worker marked failed, no further restarts");
                self.events.emit_lossy(WorkerEvent::WorkerFailed {
                    component_id: id.to_string(),
                    reason: reason.to_string(),
                    timestamp: wktag_common::time::now(),
                });
            }
        }
        self.publish_status(id);
    }

    /// A restart could not even launch the process: count it as a crash
    fn on_launch_failure(&mut self, id: &str, err: &TaggerError) {
        error!(component_id = %id, error = %err, "Worker launch failed");
        if let Some(entry) = self.write().get_mut(id) {
            entry.state = WorkerState::Pending;
        }
        self.on_crash(id, &err.to_string());
    }

    fn try_due_restart(&mut self, id: &str, now: Instant) {
        if self.paused || self.processes.contains_key(id) {
            return;
        }
        let due = self
            .read()
            .get(id)
            .map(|entry| entry.state == WorkerState::Crashed && entry.restart_at.map(|t| t <= now).unwrap_or(false))
            .unwrap_or(false);
        if due {
            if let Err(e) = self.start_incarnation(id) {
                self.on_launch_failure(id, &e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    fn on_tick(&mut self) {
        let now = Instant::now();
        let ids = self.read().ids();

        for id in ids {
            self.try_due_restart(&id, now);
            self.check_startup_grace(&id, now);
            self.check_healthy_reset(&id, now);
            self.publish_status(&id);
        }
    }

    fn check_startup_grace(&mut self, id: &str, now: Instant) {
        let silent_too_long = self
            .read()
            .get(id)
            .map(|entry| {
                entry.state == WorkerState::Pending
                    && entry.last_frame.is_none()
                    && now.saturating_duration_since(entry.spawned_at) > self.config.startup_grace
            })
            .unwrap_or(false);

        if silent_too_long && self.processes.contains_key(id) {
            warn!(
                component_id = %id,
                grace_s = self.config.startup_grace.as_secs_f64(),
                "No health frame within startup grace"
            );
            self.on_crash(id, "no health frame within startup grace");
        }
    }

    fn check_healthy_reset(&mut self, id: &str, now: Instant) {
        let policy = &self.config.restart;
        let window = self.config.staleness_window();
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = registry.get_mut(id) {
            // A silent worker is not healthy; its streak restarts with the next fresh frame
            if entry.derived_status(now, window) != HealthStatus::Healthy {
                entry.healthy_since = None;
                return;
            }
            if entry.history.restart_count() == 0 {
                return;
            }
            if let Some(since) = entry.healthy_since {
                if policy.should_reset(since, now) {
                    info!(
                        component_id = %id,
                        restart_count = entry.history.restart_count(),
                        "Healthy long enough, restart counters cleared"
                    );
                    entry.history.reset();
                }
            }
        }
    }

    /// Emit a status-change event if the derived status moved
    fn publish_status(&mut self, id: &str) {
        let window = self.config.staleness_window();
        let change = {
            let mut registry = self.write();
            registry.get_mut(id).and_then(|entry| {
                let status = entry.derived_status(Instant::now(), window);
                if status == entry.reported_status {
                    None
                } else {
                    let old = entry.reported_status;
                    entry.reported_status = status;
                    Some((old, status))
                }
            })
        };

        if let Some((old_status, new_status)) = change {
            debug!(component_id = %id, %old_status, %new_status, "Status changed");
            self.events.emit_lossy(WorkerEvent::WorkerStatusChanged {
                component_id: id.to_string(),
                old_status,
                new_status,
                timestamp: wktag_common::time::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_window() {
        let config = SupervisorConfig::default();
        assert_eq!(config.staleness_window(), Duration::from_secs(15));
    }

    #[test]
    fn test_worker_component_id() {
        assert_eq!(worker_component_id(2), "worker:discovery:2");
    }
}
