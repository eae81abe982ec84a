//! Integration tests for the worker supervisor
//!
//! Workers are in-process fakes: the launcher hands the supervisor one end of
//! a duplex pipe as the health channel and a scripted process handle, and
//! gives the test the other end. Tests run on a paused clock, so restart
//! delays and grace periods elapse instantly but keep their ordering.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wktag_ai::health::{encode_frame, HealthFrame};
use wktag_ai::restart::RestartPolicy;
use wktag_ai::supervisor::{
    LaunchedWorker, ProcessHandle, StatusView, Supervisor, SupervisorConfig, SupervisorHandle, WorkerLauncher,
    WorkerSpec,
};
use wktag_ai::tier::{select_tier, Budgets, CacheMode, CapacityEstimate};
use wktag_ai::{TaggerError, TaggerResult};
use wktag_common::events::{DevicePreference, EventBus, HealthStatus, WorkerEvent, WorkerState};

// ============================================================================
// Fakes
// ============================================================================

type ExitSlot = Arc<watch::Sender<Option<Option<i32>>>>;

struct FakeProcess {
    pid: u32,
    exit_tx: ExitSlot,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    stop_requested: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
    exit_on_stop: bool,
    kill_delay: Duration,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn signal_stop(&mut self) -> std::io::Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.exit_on_stop {
            self.exit_tx.send_replace(Some(Some(0)));
        }
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        loop {
            let current = *self.exit_rx.borrow_and_update();
            if let Some(code) = current {
                return Ok(code);
            }
            if self.exit_rx.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.kill_delay).await;
        self.exit_tx.send_replace(Some(None));
        Ok(())
    }
}

/// Test-side end of one launched worker
struct FakeWorker {
    spec: WorkerSpec,
    frames: Option<DuplexStream>,
    exit: ExitSlot,
    stop_requested: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl FakeWorker {
    async fn report(&mut self, status: HealthStatus) {
        let frame = HealthFrame::new(self.spec.component_id.clone(), status, 0);
        let line = encode_frame(&frame).unwrap();
        let frames = self.frames.as_mut().expect("channel already closed");
        frames.write_all(line.as_bytes()).await.unwrap();
        frames.flush().await.unwrap();
    }

    /// Close the channel and exit non-zero
    fn crash(&mut self) {
        self.frames.take();
        self.exit.send_replace(Some(Some(1)));
    }

    /// Close the channel but leave the process running
    fn hang_up(&mut self) {
        self.frames.take();
    }
}

struct FakeLauncher {
    next_pid: AtomicU32,
    exit_on_stop: AtomicBool,
    kill_delay_ms: AtomicU64,
    fail: AtomicBool,
    launched: mpsc::UnboundedSender<FakeWorker>,
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self, spec: &WorkerSpec) -> TaggerResult<LaunchedWorker> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TaggerError::Spawn {
                component_id: spec.component_id.clone(),
                reason: "launcher disabled".to_string(),
            });
        }

        let (worker_end, supervisor_end) = tokio::io::duplex(16 * 1024);
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let killed = Arc::new(AtomicBool::new(false));

        let _ = self.launched.send(FakeWorker {
            spec: spec.clone(),
            frames: Some(worker_end),
            exit: exit_tx.clone(),
            stop_requested: stop_requested.clone(),
            killed: killed.clone(),
        });

        Ok(LaunchedWorker {
            process: Box::new(FakeProcess {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                exit_tx,
                exit_rx,
                stop_requested,
                killed,
                exit_on_stop: self.exit_on_stop.load(Ordering::SeqCst),
                kill_delay: Duration::from_millis(self.kill_delay_ms.load(Ordering::SeqCst)),
            }),
            channel: Box::new(supervisor_end),
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    handle: SupervisorHandle,
    view: StatusView,
    launcher: Arc<FakeLauncher>,
    launched: mpsc::UnboundedReceiver<FakeWorker>,
    events: broadcast::Receiver<WorkerEvent>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(config: SupervisorConfig) -> Self {
        let (tx, launched) = mpsc::unbounded_channel();
        let launcher = Arc::new(FakeLauncher {
            next_pid: AtomicU32::new(1000),
            exit_on_stop: AtomicBool::new(true),
            kill_delay_ms: AtomicU64::new(0),
            fail: AtomicBool::new(false),
            launched: tx,
        });
        let bus = EventBus::new(1024);
        let events = bus.subscribe();

        let (supervisor, handle) = Supervisor::new(config, launcher.clone(), bus);
        let view = supervisor.status_view();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(shutdown.clone()));

        Self {
            handle,
            view,
            launcher,
            launched,
            events,
            shutdown,
            task,
        }
    }

    async fn next_launch(&mut self) -> FakeWorker {
        tokio::time::timeout(Duration::from_secs(3600), self.launched.recv())
            .await
            .expect("no worker launched within an hour")
            .expect("launcher dropped")
    }

    fn no_pending_launch(&mut self) -> bool {
        self.launched.try_recv().is_err()
    }

    async fn wait_for_state(&self, id: &str, state: WorkerState) {
        let view = self.view.clone();
        let reached = tokio::time::timeout(Duration::from_secs(3600), async {
            while view.lifecycle_state(id).ok() != Some(state) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "{} never reached {}", id, state);
    }

    fn drain_events(&mut self) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    async fn finish(self) {
        self.shutdown.cancel();
        self.task.await.unwrap();
    }
}

fn spec(id: &str) -> WorkerSpec {
    WorkerSpec {
        component_id: id.to_string(),
        execution_tier: 0,
        device_preference: DevicePreference::Gpu,
        cache_mode: CacheMode::Cached,
    }
}

const W0: &str = "worker:discovery:0";

// ============================================================================
// Health and staleness
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_spawn_starts_pending_then_follows_frames() {
    let mut h = Harness::start(SupervisorConfig::default());

    let summary = h.handle.spawn(spec(W0)).await.unwrap();
    assert_eq!(summary.status, HealthStatus::Pending);
    assert_eq!(summary.pid, Some(1000));

    let mut worker = h.next_launch().await;
    worker.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;
    assert_eq!(h.view.get_component_status(W0).unwrap(), HealthStatus::Healthy);

    worker.report(HealthStatus::Unhealthy).await;
    h.wait_for_state(W0, WorkerState::Unhealthy).await;
    assert_eq!(h.view.get_component_status(W0).unwrap(), HealthStatus::Unhealthy);

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, WorkerEvent::WorkerSpawned { component_id, .. } if component_id == W0)));
    assert!(events.iter().any(|e| matches!(
        e,
        WorkerEvent::WorkerStatusChanged {
            old_status: HealthStatus::Pending,
            new_status: HealthStatus::Healthy,
            ..
        }
    )));

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_healthy_reads_unhealthy() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;

    worker.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;

    // Window is 5 s x 3
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(h.view.get_component_status(W0).unwrap(), HealthStatus::Unhealthy);

    worker.report(HealthStatus::Healthy).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.view.get_component_status(W0).unwrap(), HealthStatus::Healthy);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_worker_is_never_restarted() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;

    worker.report(HealthStatus::Unhealthy).await;
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(h.view.lifecycle_state(W0).unwrap(), WorkerState::Unhealthy);
    assert_eq!(h.view.restart_count(W0).unwrap(), 0);
    assert!(h.no_pending_launch());
    assert!(!worker.killed.load(Ordering::SeqCst));

    h.finish().await;
}

// ============================================================================
// Crash handling and restart policy
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_restart_backoff_then_rapid_limit_fails() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;

    for (crash, expected_delay) in [1u64, 2, 4, 8, 16].into_iter().enumerate() {
        worker.crash();
        let crashed_at = Instant::now();
        worker = h.next_launch().await;
        let waited = crashed_at.elapsed();

        let expected = Duration::from_secs(expected_delay);
        assert!(
            waited >= expected && waited <= expected + Duration::from_secs(1),
            "crash {}: restarted after {:?}, expected ~{:?}",
            crash + 1,
            waited,
            expected
        );
        assert_eq!(h.view.restart_count(W0).unwrap(), crash as u32 + 1);
    }

    // Sixth crash inside five minutes
    worker.crash();
    h.wait_for_state(W0, WorkerState::Failed).await;
    assert_eq!(h.view.get_component_status(W0).unwrap(), HealthStatus::Failed);
    assert_eq!(h.view.restart_count(W0).unwrap(), 6);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(h.no_pending_launch());

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, WorkerEvent::WorkerFailed { component_id, .. } if component_id == W0)));
    let scheduled: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::WorkerRestartScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec![1000, 2000, 4000, 8000, 16000]);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_worker_killed_after_startup_grace() {
    let mut h = Harness::start(SupervisorConfig::default());
    let started = Instant::now();
    h.handle.spawn(spec(W0)).await.unwrap();
    let silent = h.next_launch().await;

    let replacement = h.next_launch().await;
    assert!(silent.killed.load(Ordering::SeqCst));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(h.view.restart_count(W0).unwrap(), 1);
    assert_eq!(replacement.spec, silent.spec);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_reported_failure_is_terminal() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;

    worker.report(HealthStatus::Failed).await;
    h.wait_for_state(W0, WorkerState::Failed).await;
    worker.crash();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(h.no_pending_launch());
    assert_eq!(h.view.get_component_status(W0).unwrap(), HealthStatus::Failed);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_operator_reset_revives_failed_worker() {
    let config = SupervisorConfig {
        restart: RestartPolicy {
            rapid_limit: 0,
            ..RestartPolicy::default()
        },
        ..SupervisorConfig::default()
    };
    let mut h = Harness::start(config);
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;

    worker.crash();
    h.wait_for_state(W0, WorkerState::Failed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.handle.reset(W0).await.unwrap();
    let mut revived = h.next_launch().await;
    assert_eq!(h.view.restart_count(W0).unwrap(), 0);

    revived.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_counts_as_crash() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;

    h.launcher.fail.store(true, Ordering::SeqCst);
    worker.crash();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.view.restart_count(W0).unwrap() >= 2);

    h.launcher.fail.store(false, Ordering::SeqCst);
    let _relaunched = h.next_launch().await;
    assert_eq!(h.view.lifecycle_state(W0).unwrap(), WorkerState::Pending);

    h.finish().await;
}

// ============================================================================
// Stop, pause, resume
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_graceful_stop() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;
    worker.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;

    h.handle.stop(W0, None).await.unwrap();

    assert_eq!(h.view.lifecycle_state(W0).unwrap(), WorkerState::Stopped);
    assert!(worker.stop_requested.load(Ordering::SeqCst));
    assert!(!worker.killed.load(Ordering::SeqCst));
    assert_eq!(h.view.restart_count(W0).unwrap(), 0);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(h.no_pending_launch());
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, WorkerEvent::WorkerStopped { graceful: true, .. })));

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_kills_after_grace() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.launcher.exit_on_stop.store(false, Ordering::SeqCst);
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;
    worker.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;

    let started = Instant::now();
    h.handle.stop(W0, Some(Duration::from_secs(5))).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(worker.killed.load(Ordering::SeqCst));
    assert_eq!(h.view.lifecycle_state(W0).unwrap(), WorkerState::Stopped);
    assert_eq!(h.view.restart_count(W0).unwrap(), 0);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, WorkerEvent::WorkerStopped { graceful: false, .. })));

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_resume_keeps_restart_counters() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;

    worker.crash();
    let mut worker = h.next_launch().await;
    worker.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;
    assert_eq!(h.view.restart_count(W0).unwrap(), 1);

    h.handle.pause(None).await.unwrap();
    assert_eq!(h.view.lifecycle_state(W0).unwrap(), WorkerState::Stopped);
    assert_eq!(h.view.restart_count(W0).unwrap(), 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.no_pending_launch());

    assert_eq!(h.handle.resume().await.unwrap(), 1);
    let mut resumed = h.next_launch().await;
    assert_eq!(h.view.restart_count(W0).unwrap(), 1);
    resumed.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_healthy_period_clears_counters() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;

    worker.crash();
    let mut worker = h.next_launch().await;
    assert_eq!(h.view.restart_count(W0).unwrap(), 1);

    // Keep frames flowing for just over five minutes
    for _ in 0..62 {
        worker.report(HealthStatus::Healthy).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    assert_eq!(h.view.restart_count(W0).unwrap(), 0);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_silence_does_not_count_as_healthy_period() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;

    worker.crash();
    let mut worker = h.next_launch().await;
    worker.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;

    // One frame, then nothing for longer than the reset period
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(h.view.get_component_status(W0).unwrap(), HealthStatus::Unhealthy);
    assert_eq!(h.view.restart_count(W0).unwrap(), 1);

    // The streak starts over from the next fresh frame
    worker.report(HealthStatus::Healthy).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.view.restart_count(W0).unwrap(), 1);
    for _ in 0..62 {
        worker.report(HealthStatus::Healthy).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    assert_eq!(h.view.restart_count(W0).unwrap(), 0);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_during_crash_kill_resumes_worker() {
    let mut h = Harness::start(SupervisorConfig::default());
    h.launcher.kill_delay_ms.store(10_000, Ordering::SeqCst);
    h.handle.spawn(spec(W0)).await.unwrap();
    let mut worker = h.next_launch().await;
    worker.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;

    // Channel lost while the process lives on: crashed, restart pending, kill in flight
    worker.hang_up();
    h.wait_for_state(W0, WorkerState::Crashed).await;

    h.handle.pause(None).await.unwrap();
    assert!(worker.killed.load(Ordering::SeqCst));
    assert_eq!(h.view.lifecycle_state(W0).unwrap(), WorkerState::Stopped);
    assert_eq!(h.view.restart_count(W0).unwrap(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.no_pending_launch());

    assert_eq!(h.handle.resume().await.unwrap(), 1);
    let mut resumed = h.next_launch().await;
    resumed.report(HealthStatus::Healthy).await;
    h.wait_for_state(W0, WorkerState::Healthy).await;
    assert_eq!(h.view.restart_count(W0).unwrap(), 1);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_component_errors() {
    let h = Harness::start(SupervisorConfig::default());

    assert!(matches!(
        h.handle.stop("worker:discovery:9", None).await,
        Err(TaggerError::UnknownComponent(_))
    ));
    assert!(matches!(
        h.handle.reset("worker:discovery:9").await,
        Err(TaggerError::UnknownComponent(_))
    ));
    assert!(matches!(
        h.view.get_component_status("worker:discovery:9"),
        Err(TaggerError::UnknownComponent(_))
    ));

    h.finish().await;
}

// ============================================================================
// Tier application
// ============================================================================

const ESTIMATE: CapacityEstimate = CapacityEstimate {
    backbone_vram_mb: 8192,
    per_worker_ram_mb: 2457,
};

fn budgets(vram_budget_mb: u64, ram_budget_mb: u64, max_workers: usize) -> Budgets {
    Budgets {
        vram_budget_mb,
        ram_budget_mb,
        max_workers,
    }
}

#[tokio::test(start_paused = true)]
async fn test_apply_tier_scales_pool() {
    let mut h = Harness::start(SupervisorConfig::default());

    let full = select_tier(&ESTIMATE, &budgets(20_000, 8_000, 4), true);
    assert_eq!((full.tier, full.worker_count), (0, 4));
    h.handle.apply_tier(full).await.unwrap();

    let mut workers = Vec::new();
    for _ in 0..4 {
        workers.push(h.next_launch().await);
    }
    assert_eq!(h.view.list_component_ids().len(), 4);

    let smaller = select_tier(&ESTIMATE, &budgets(20_000, 8_000, 2), true);
    assert_eq!((smaller.tier, smaller.worker_count), (0, 2));
    h.handle.apply_tier(smaller).await.unwrap();

    let view = h.view.clone();
    tokio::time::timeout(Duration::from_secs(600), async {
        while view.list_component_ids().len() != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.view.list_component_ids(), vec!["worker:discovery:0", "worker:discovery:1"]);
    assert!(h.no_pending_launch());

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_apply_tier_respawns_on_spec_change() {
    let mut h = Harness::start(SupervisorConfig::default());

    h.handle
        .apply_tier(select_tier(&ESTIMATE, &budgets(20_000, 8_000, 2), true))
        .await
        .unwrap();
    let _first = h.next_launch().await;
    let _second = h.next_launch().await;

    // No GPU: tier 3, a single CPU worker
    let cpu = select_tier(&ESTIMATE, &budgets(20_000, 8_000, 4), false);
    assert_eq!((cpu.tier, cpu.worker_count), (3, 1));
    h.handle.apply_tier(cpu).await.unwrap();

    let respawned = h.next_launch().await;
    assert_eq!(respawned.spec.component_id, W0);
    assert_eq!(respawned.spec.execution_tier, 3);
    assert_eq!(respawned.spec.device_preference, DevicePreference::Cpu);
    assert_eq!(respawned.spec.cache_mode, CacheMode::Sequential);

    let view = h.view.clone();
    tokio::time::timeout(Duration::from_secs(600), async {
        while view.list_component_ids() != vec![W0.to_string()] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_refusal_runs_zero_workers() {
    let mut h = Harness::start(SupervisorConfig::default());

    h.handle
        .apply_tier(select_tier(&ESTIMATE, &budgets(20_000, 8_000, 1), true))
        .await
        .unwrap();
    let _worker = h.next_launch().await;

    let refuse = select_tier(&ESTIMATE, &budgets(2_000, 500, 4), false);
    assert!(refuse.is_refusal());
    assert_eq!(refuse.worker_count, 0);
    h.handle.apply_tier(refuse).await.unwrap();

    let view = h.view.clone();
    tokio::time::timeout(Duration::from_secs(600), async {
        while !view.list_component_ids().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(h.no_pending_launch());
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, WorkerEvent::TierSelected { tier: 4, worker_count: 0, .. })));

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_refusal_at_startup_keeps_supervisor_running() {
    let mut h = Harness::start(SupervisorConfig::default());

    let refuse = select_tier(&ESTIMATE, &budgets(2_000, 500, 4), true);
    assert!(refuse.is_refusal());
    h.handle.apply_tier(refuse).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.no_pending_launch());
    assert!(h.view.list_component_ids().is_empty());
    assert!(!h.task.is_finished());

    // Still serving commands
    h.handle
        .apply_tier(select_tier(&ESTIMATE, &budgets(20_000, 8_000, 1), true))
        .await
        .unwrap();
    let worker = h.next_launch().await;
    assert_eq!(worker.spec.component_id, W0);

    h.finish().await;
}
