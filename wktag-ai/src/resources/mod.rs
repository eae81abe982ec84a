//! Resource monitor
//!
//! Answers "is there room for one more unit of ML work, and where?" from
//! TTL-cached VRAM and RAM snapshots. GPU capability is probed once per
//! process lifetime. The monitor holds no policy: budgets and estimates come
//! from the caller.

mod probe;

pub use probe::{GpuProbe, MemoryProbe, MemoryReading, NvidiaSmiProbe, SysinfoMemoryProbe};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use wktag_common::time::{Clock, SystemClock};

use crate::error::TaggerError;

/// Where the next unit of work may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Headroom {
    Gpu,
    Cpu,
    /// Neither budget has room; back off and retry
    Recovering,
}

impl std::fmt::Display for Headroom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Headroom::Gpu => write!(f, "gpu"),
            Headroom::Cpu => write!(f, "cpu"),
            Headroom::Recovering => write!(f, "recovering"),
        }
    }
}

/// Point-in-time resource reading
///
/// A snapshot with `error` set has zeroed usage fields and must be read as
/// "cannot confirm headroom".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ResourceSnapshot {
    pub vram_used_mb: u64,
    pub vram_total_mb: u64,
    pub ram_used_mb: u64,
    pub ram_total_mb: u64,
    pub gpu_capable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResourceSnapshot {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Headroom arithmetic
///
/// `vram_ok` requires a capable GPU, an error-free VRAM reading and
/// `used + estimate <= budget`; `ram_ok` likewise for RAM.
pub fn headroom_from(
    vram: &ResourceSnapshot,
    ram: &ResourceSnapshot,
    vram_budget_mb: u64,
    ram_budget_mb: u64,
    vram_estimate_mb: u64,
    ram_estimate_mb: u64,
) -> Headroom {
    let vram_ok = vram.gpu_capable
        && vram.is_ok()
        && vram.vram_used_mb.saturating_add(vram_estimate_mb) <= vram_budget_mb;
    let ram_ok = ram.is_ok() && ram.ram_used_mb.saturating_add(ram_estimate_mb) <= ram_budget_mb;

    match (vram_ok, ram_ok) {
        (true, _) => Headroom::Gpu,
        (false, true) => Headroom::Cpu,
        (false, false) => Headroom::Recovering,
    }
}

struct Cached {
    taken_at: Instant,
    snapshot: ResourceSnapshot,
}

/// TTL-cached view of host GPU and RAM
pub struct ResourceMonitor {
    gpu: Arc<dyn GpuProbe>,
    memory: Arc<dyn MemoryProbe>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    gpu_capable: OnceCell<bool>,
    vram_cache: Mutex<Option<Cached>>,
    ram_cache: Mutex<Option<Cached>>,
}

impl ResourceMonitor {
    pub fn new(gpu: Arc<dyn GpuProbe>, memory: Arc<dyn MemoryProbe>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            gpu,
            memory,
            clock,
            ttl,
            gpu_capable: OnceCell::new(),
            vram_cache: Mutex::new(None),
            ram_cache: Mutex::new(None),
        }
    }

    /// Monitor backed by `nvidia-smi`, `sysinfo` and the system clock
    pub fn system(ttl: Duration, probe_timeout: Duration) -> Self {
        Self::new(
            Arc::new(NvidiaSmiProbe::new(probe_timeout)),
            Arc::new(SysinfoMemoryProbe::new()),
            Arc::new(SystemClock),
            ttl,
        )
    }

    /// One-time GPU capability probe
    ///
    /// Any probe failure means "not capable". The result is cached for the
    /// life of the monitor.
    pub async fn check_gpu_capability(&self) -> bool {
        *self
            .gpu_capable
            .get_or_init(|| async {
                match self.gpu.probe_capability().await {
                    Ok(()) => {
                        info!("GPU capability detected");
                        true
                    }
                    Err(reason) => {
                        warn!(reason = %reason, "{}; GPU tiers unavailable", TaggerError::GpuCapabilityAbsent);
                        false
                    }
                }
            })
            .await
    }

    /// VRAM snapshot, cached for the TTL
    pub async fn get_vram_snapshot(&self) -> ResourceSnapshot {
        if let Some(snapshot) = self.cached(&self.vram_cache) {
            return snapshot;
        }

        let gpu_capable = self.check_gpu_capability().await;
        let snapshot = if !gpu_capable {
            ResourceSnapshot {
                gpu_capable,
                error: Some("GPU not capable".to_string()),
                ..Default::default()
            }
        } else {
            match self.gpu.vram().await {
                Ok(reading) => ResourceSnapshot {
                    vram_used_mb: reading.used_mb,
                    vram_total_mb: reading.total_mb,
                    gpu_capable,
                    ..Default::default()
                },
                Err(e) => {
                    debug!(error = %e, "VRAM probe failed");
                    ResourceSnapshot {
                        gpu_capable,
                        error: Some(e),
                        ..Default::default()
                    }
                }
            }
        };

        self.store(&self.vram_cache, snapshot.clone());
        snapshot
    }

    /// RAM snapshot, cached for the TTL
    pub async fn get_ram_snapshot(&self) -> ResourceSnapshot {
        if let Some(snapshot) = self.cached(&self.ram_cache) {
            return snapshot;
        }

        let gpu_capable = self.check_gpu_capability().await;
        let snapshot = match self.memory.ram().await {
            Ok(reading) => ResourceSnapshot {
                ram_used_mb: reading.used_mb,
                ram_total_mb: reading.total_mb,
                gpu_capable,
                ..Default::default()
            },
            Err(e) => {
                debug!(error = %e, "RAM probe failed");
                ResourceSnapshot {
                    gpu_capable,
                    error: Some(e),
                    ..Default::default()
                }
            }
        };

        self.store(&self.ram_cache, snapshot.clone());
        snapshot
    }

    /// Recommend where the next unit may run
    pub async fn check_headroom(
        &self,
        vram_budget_mb: u64,
        ram_budget_mb: u64,
        vram_estimate_mb: u64,
        ram_estimate_mb: u64,
    ) -> Headroom {
        let vram = self.get_vram_snapshot().await;
        let ram = self.get_ram_snapshot().await;
        headroom_from(&vram, &ram, vram_budget_mb, ram_budget_mb, vram_estimate_mb, ram_estimate_mb)
    }

    fn cached(&self, slot: &Mutex<Option<Cached>>) -> Option<ResourceSnapshot> {
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(|c| {
            if self.clock.now().saturating_duration_since(c.taken_at) < self.ttl {
                Some(c.snapshot.clone())
            } else {
                None
            }
        })
    }

    fn store(&self, slot: &Mutex<Option<Cached>>, snapshot: ResourceSnapshot) {
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Cached {
            taken_at: self.clock.now(),
            snapshot,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use wktag_common::time::ManualClock;

    struct ScriptedGpu {
        capable: bool,
        used_mb: AtomicU64,
        capability_calls: AtomicUsize,
        vram_calls: AtomicUsize,
    }

    impl ScriptedGpu {
        fn new(capable: bool, used_mb: u64) -> Self {
            Self {
                capable,
                used_mb: AtomicU64::new(used_mb),
                capability_calls: AtomicUsize::new(0),
                vram_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GpuProbe for ScriptedGpu {
        async fn probe_capability(&self) -> Result<(), String> {
            self.capability_calls.fetch_add(1, Ordering::SeqCst);
            if self.capable {
                Ok(())
            } else {
                Err("no device".to_string())
            }
        }

        async fn vram(&self) -> Result<MemoryReading, String> {
            self.vram_calls.fetch_add(1, Ordering::SeqCst);
            Ok(MemoryReading {
                used_mb: self.used_mb.load(Ordering::SeqCst),
                total_mb: 24_000,
            })
        }
    }

    struct FailingMemory;

    #[async_trait]
    impl MemoryProbe for FailingMemory {
        async fn ram(&self) -> Result<MemoryReading, String> {
            Err("procfs unavailable".to_string())
        }
    }

    struct FixedMemory(u64);

    #[async_trait]
    impl MemoryProbe for FixedMemory {
        async fn ram(&self) -> Result<MemoryReading, String> {
            Ok(MemoryReading {
                used_mb: self.0,
                total_mb: 32_000,
            })
        }
    }

    fn snapshot(vram_used: u64, ram_used: u64, gpu_capable: bool) -> ResourceSnapshot {
        ResourceSnapshot {
            vram_used_mb: vram_used,
            ram_used_mb: ram_used,
            gpu_capable,
            ..Default::default()
        }
    }

    #[test]
    fn test_headroom_truth_table() {
        // (vram_used, ram_used) against budgets 10_000 / 10_000 and estimates 2_000 / 2_000
        let cases = [
            (1_000, 1_000, Headroom::Gpu),
            (1_000, 9_000, Headroom::Gpu),
            (9_000, 1_000, Headroom::Cpu),
            (9_000, 9_000, Headroom::Recovering),
            (8_000, 8_000, Headroom::Gpu),
        ];
        for (vram_used, ram_used, expected) in cases {
            let snap = snapshot(vram_used, ram_used, true);
            assert_eq!(
                headroom_from(&snap, &snap, 10_000, 10_000, 2_000, 2_000),
                expected,
                "vram_used={} ram_used={}",
                vram_used,
                ram_used
            );
        }
    }

    #[test]
    fn test_errored_snapshot_never_confirms_headroom() {
        let mut vram = snapshot(0, 0, true);
        vram.error = Some("probe failed".to_string());
        let ram = snapshot(0, 0, true);
        assert_eq!(headroom_from(&vram, &ram, 10_000, 10_000, 1, 1), Headroom::Cpu);

        let mut ram = ram;
        ram.error = Some("probe failed".to_string());
        assert_eq!(headroom_from(&vram, &ram, 10_000, 10_000, 1, 1), Headroom::Recovering);
    }

    #[test]
    fn test_incapable_gpu_never_recommends_gpu() {
        let snap = snapshot(0, 0, false);
        assert_eq!(headroom_from(&snap, &snap, 10_000, 10_000, 1, 1), Headroom::Cpu);
    }

    #[tokio::test]
    async fn test_capability_probed_once() {
        let gpu = Arc::new(ScriptedGpu::new(false, 0));
        let clock = Arc::new(ManualClock::new());
        let monitor = ResourceMonitor::new(gpu.clone(), Arc::new(FixedMemory(1_000)), clock.clone(), Duration::from_secs(1));

        assert!(!monitor.check_gpu_capability().await);
        clock.advance(Duration::from_secs(3600));
        assert!(!monitor.check_gpu_capability().await);
        assert_eq!(gpu.capability_calls.load(Ordering::SeqCst), 1);

        let vram = monitor.get_vram_snapshot().await;
        assert!(vram.error.is_some());
        assert_eq!(gpu.vram_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_vram_snapshot_cached_until_ttl() {
        let gpu = Arc::new(ScriptedGpu::new(true, 1_000));
        let clock = Arc::new(ManualClock::new());
        let monitor = ResourceMonitor::new(gpu.clone(), Arc::new(FixedMemory(1_000)), clock.clone(), Duration::from_secs(1));

        assert_eq!(monitor.get_vram_snapshot().await.vram_used_mb, 1_000);
        gpu.used_mb.store(5_000, Ordering::SeqCst);

        clock.advance(Duration::from_millis(999));
        assert_eq!(monitor.get_vram_snapshot().await.vram_used_mb, 1_000);
        assert_eq!(gpu.vram_calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_millis(1));
        assert_eq!(monitor.get_vram_snapshot().await.vram_used_mb, 5_000);
        assert_eq!(gpu.vram_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ram_probe_failure_zeroes_usage() {
        let monitor = ResourceMonitor::new(
            Arc::new(ScriptedGpu::new(true, 0)),
            Arc::new(FailingMemory),
            Arc::new(ManualClock::new()),
            Duration::from_secs(1),
        );
        let ram = monitor.get_ram_snapshot().await;
        assert_eq!(ram.ram_used_mb, 0);
        assert_eq!(ram.ram_total_mb, 0);
        assert!(ram.error.is_some());

        // GPU still has room, so work goes there
        assert_eq!(monitor.check_headroom(10_000, 10_000, 2_000, 2_000).await, Headroom::Gpu);
    }
}
