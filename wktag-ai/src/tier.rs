//! Execution tier selector
//!
//! Deterministic mapping from a capacity estimate, the configured budgets and
//! GPU capability to a discrete operating mode. Pure: no I/O, no logging, no
//! side effects. The supervisor acts on the decision.
//!
//! | Tier | GPU | Condition | Workers | Cache |
//! |------|-----|-----------|---------|-------|
//! | 0 | yes | vram ≥ 2×backbone, ram ≥ 2×per_worker | min(2·vram/backbone, 2·ram/per_worker, max) | cached |
//! | 1 | yes | vram ≥ backbone, ram ≥ per_worker | min(vram/backbone, ram/per_worker, max(1, max/2)) | cached |
//! | 2 | yes | vram ≥ 0.5×backbone | 1 | sequential |
//! | 3 | no | ram ≥ 0.6×backbone + 0.4×per_worker | 1 | sequential |
//! | 4 | - | otherwise | 0 | refuse |
//!
//! Tiers are tried top-down and the first whose condition holds wins, so
//! raising a budget can only move the selection to a lower (better) tier.

use serde::{Deserialize, Serialize};
use wktag_common::events::DevicePreference;

/// Lowest (worst) tier: refuse to run
pub const REFUSE_TIER: u8 = 4;

/// Measured footprint of one model-set configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityEstimate {
    /// VRAM held by one loaded backbone model (MB)
    pub backbone_vram_mb: u64,
    /// RAM held by one worker process (MB)
    pub per_worker_ram_mb: u64,
}

/// Configured ceilings on resource usage attributable to tagging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub vram_budget_mb: u64,
    pub ram_budget_mb: u64,
    pub max_workers: usize,
}

/// How workers hold models between units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Models stay loaded across units
    Cached,
    /// Load, use, unload per unit
    Sequential,
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheMode::Cached => write!(f, "cached"),
            CacheMode::Sequential => write!(f, "sequential"),
        }
    }
}

impl std::str::FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cached" => Ok(CacheMode::Cached),
            "sequential" => Ok(CacheMode::Sequential),
            other => Err(format!("unknown cache mode: {}", other)),
        }
    }
}

/// Selected operating mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDecision {
    pub tier: u8,
    pub worker_count: usize,
    pub cache_mode: CacheMode,
    /// None for the refuse tier
    pub device_preference: Option<DevicePreference>,
    /// Minimum budgets that would lift a refusal (tier 4 only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<RefusalHint>,
}

/// Budgets needed to reach the cheapest GPU and CPU tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefusalHint {
    pub ram_budget_mb: u64,
    pub ram_needed_for_cpu_mb: u64,
    pub vram_budget_mb: u64,
    /// None when the host has no usable GPU
    pub vram_needed_for_gpu_mb: Option<u64>,
}

impl std::fmt::Display for RefusalHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "raise ram_budget_mb from {} to at least {} for CPU tagging",
            self.ram_budget_mb, self.ram_needed_for_cpu_mb
        )?;
        if let Some(vram) = self.vram_needed_for_gpu_mb {
            write!(
                f,
                ", or vram_budget_mb from {} to at least {} for sequential GPU tagging",
                self.vram_budget_mb, vram
            )?;
        }
        Ok(())
    }
}

impl TierDecision {
    pub fn is_refusal(&self) -> bool {
        self.tier == REFUSE_TIER
    }
}

/// Tier 2 VRAM threshold: half a backbone, rounded up
fn tier2_vram_threshold(estimate: &CapacityEstimate) -> u64 {
    estimate.backbone_vram_mb.div_ceil(2)
}

/// Tier 3 RAM threshold: 0.6×backbone + 0.4×per_worker, rounded up
fn tier3_ram_threshold(estimate: &CapacityEstimate) -> u64 {
    // Integer tenths keep the comparison exact
    (6 * estimate.backbone_vram_mb + 4 * estimate.per_worker_ram_mb).div_ceil(10)
}

fn ratio(budget: u64, unit: u64) -> u64 {
    if unit == 0 {
        u64::MAX
    } else {
        budget / unit
    }
}

fn clamp_count(count: u64, cap: usize) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX).min(cap)
}

/// Select the best tier whose condition holds
pub fn select_tier(estimate: &CapacityEstimate, budgets: &Budgets, gpu_capable: bool) -> TierDecision {
    let backbone = estimate.backbone_vram_mb;
    let per_worker = estimate.per_worker_ram_mb;
    let vram = budgets.vram_budget_mb;
    let ram = budgets.ram_budget_mb;

    if gpu_capable && budgets.max_workers > 0 {
        // Tier 0: room for two backbones and two workers' RAM
        if vram >= backbone.saturating_mul(2) && ram >= per_worker.saturating_mul(2) {
            let by_vram = ratio(vram.saturating_mul(2), backbone);
            let by_ram = ratio(ram.saturating_mul(2), per_worker);
            let count = clamp_count(by_vram.min(by_ram), budgets.max_workers);
            return TierDecision {
                tier: 0,
                worker_count: count.max(1),
                cache_mode: CacheMode::Cached,
                device_preference: Some(DevicePreference::Gpu),
                refusal: None,
            };
        }

        // Tier 1: one backbone, one worker
        if vram >= backbone && ram >= per_worker {
            let cap = (budgets.max_workers / 2).max(1);
            let count = clamp_count(ratio(vram, backbone).min(ratio(ram, per_worker)), cap);
            return TierDecision {
                tier: 1,
                worker_count: count.max(1),
                cache_mode: CacheMode::Cached,
                device_preference: Some(DevicePreference::Gpu),
                refusal: None,
            };
        }

        // Tier 2: sequential load/use/unload on the GPU
        if vram >= tier2_vram_threshold(estimate) {
            return TierDecision {
                tier: 2,
                worker_count: 1,
                cache_mode: CacheMode::Sequential,
                device_preference: Some(DevicePreference::Gpu),
                refusal: None,
            };
        }
    }

    // Tier 3: CPU only
    if budgets.max_workers > 0 && ram >= tier3_ram_threshold(estimate) {
        return TierDecision {
            tier: 3,
            worker_count: 1,
            cache_mode: CacheMode::Sequential,
            device_preference: Some(DevicePreference::Cpu),
            refusal: None,
        };
    }

    TierDecision {
        tier: REFUSE_TIER,
        worker_count: 0,
        cache_mode: CacheMode::Sequential,
        device_preference: None,
        refusal: Some(RefusalHint {
            ram_budget_mb: ram,
            ram_needed_for_cpu_mb: tier3_ram_threshold(estimate),
            vram_budget_mb: vram,
            vram_needed_for_gpu_mb: gpu_capable.then(|| tier2_vram_threshold(estimate)),
        }),
    }
}
