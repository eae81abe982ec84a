//! Configuration for wktag-ai
//!
//! Loaded from `wktag-ai.toml` (see [`wktag_common::config::load_toml_config`]),
//! then overridden by `WKTAG_*` environment variables, then by command-line
//! flags in `main`. [`TaggerConfig::validate`] runs last; any error it returns
//! is fatal at startup.
//!
//! ```toml
//! [resources]
//! vram_budget_mb = 20000
//! ram_budget_mb = 8000
//! max_workers = 4
//!
//! [worker]
//! processor_command = ["wktag-infer", "--models", "/opt/models"]
//!
//! [capacity]
//! models = ["backbone-v3", "genre-head", "mood-head"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wktag_common::config::{env_override, load_toml_config, LoggingConfig};
use wktag_common::time::secs_f64_to_duration;

use crate::error::{TaggerError, TaggerResult};
use crate::restart::RestartPolicy;
use crate::tier::{Budgets, CapacityEstimate};

/// Module name used to locate the TOML file
pub const MODULE_NAME: &str = "wktag-ai";

pub const VRAM_BUDGET_ENV: &str = "WKTAG_VRAM_BUDGET_MB";
pub const RAM_BUDGET_ENV: &str = "WKTAG_RAM_BUDGET_MB";
pub const MAX_WORKERS_ENV: &str = "WKTAG_MAX_WORKERS";

/// `[supervisor]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub frame_interval_s: f64,
    pub staleness_multiplier: u32,
    pub startup_grace_s: f64,
    pub stop_grace_s: f64,
    pub reaper_interval_s: f64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            frame_interval_s: 5.0,
            staleness_multiplier: 3,
            startup_grace_s: 30.0,
            stop_grace_s: 120.0,
            reaper_interval_s: 30.0,
        }
    }
}

/// `[resources]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    /// Required
    pub vram_budget_mb: Option<u64>,
    /// Required
    pub ram_budget_mb: Option<u64>,
    pub max_workers: usize,
    pub resource_cache_ttl_s: f64,
    pub gpu_probe_timeout_s: f64,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            vram_budget_mb: None,
            ram_budget_mb: None,
            max_workers: 4,
            resource_cache_ttl_s: 1.0,
            gpu_probe_timeout_s: 5.0,
        }
    }
}

/// `[restart]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSection {
    pub rapid_restart_window_s: u64,
    pub rapid_restart_limit: u32,
    pub lifetime_restart_limit: u32,
    pub restart_backoff_cap_s: u64,
    pub healthy_reset_s: u64,
}

impl Default for RestartSection {
    fn default() -> Self {
        Self {
            rapid_restart_window_s: 300,
            rapid_restart_limit: 5,
            lifetime_restart_limit: 20,
            restart_backoff_cap_s: 60,
            healthy_reset_s: 300,
        }
    }
}

/// `[worker]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub poll_interval_s: f64,
    pub frame_write_timeout_ms: u64,
    /// Program and leading arguments of the inference command
    pub processor_command: Vec<String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            poll_interval_s: 2.0,
            frame_write_timeout_ms: 2000,
            processor_command: Vec::new(),
        }
    }
}

/// `[capacity]`
///
/// When both footprints are set they are used as-is; otherwise the estimate
/// is looked up by model-set fingerprint and measured on a miss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacitySection {
    pub models: Vec<String>,
    pub backbone_vram_mb: Option<u64>,
    pub per_worker_ram_mb: Option<u64>,
}

impl CapacitySection {
    /// Estimate pinned in config, if fully specified
    pub fn pinned_estimate(&self) -> Option<CapacityEstimate> {
        match (self.backbone_vram_mb, self.per_worker_ram_mb) {
            (Some(backbone_vram_mb), Some(per_worker_ram_mb)) => Some(CapacityEstimate {
                backbone_vram_mb,
                per_worker_ram_mb,
            }),
            _ => None,
        }
    }
}

/// Complete `wktag-ai.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggerConfig {
    pub root_folder: Option<PathBuf>,
    pub supervisor: SupervisorSection,
    pub resources: ResourcesSection,
    pub restart: RestartSection,
    pub worker: WorkerSection,
    pub capacity: CapacitySection,
    pub logging: LoggingConfig,
}

impl TaggerConfig {
    /// TOML file (explicit or discovered) plus environment overrides
    pub fn load(explicit: Option<&Path>) -> TaggerResult<Self> {
        let mut config: TaggerConfig =
            load_toml_config(explicit, MODULE_NAME).map_err(|e| TaggerError::Config(e.to_string()))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> TaggerResult<Self> {
        wktag_common::config::parse_toml(content).map_err(|e| TaggerError::Config(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) -> TaggerResult<()> {
        let env_err = |e: wktag_common::Error| TaggerError::Config(e.to_string());

        if let Some(v) = env_override::<u64>(VRAM_BUDGET_ENV).map_err(env_err)? {
            self.resources.vram_budget_mb = Some(v);
        }
        if let Some(v) = env_override::<u64>(RAM_BUDGET_ENV).map_err(env_err)? {
            self.resources.ram_budget_mb = Some(v);
        }
        if let Some(v) = env_override::<usize>(MAX_WORKERS_ENV).map_err(env_err)? {
            self.resources.max_workers = v;
        }
        Ok(())
    }

    /// Reject configurations the supervisor cannot run with
    pub fn validate(&self) -> TaggerResult<()> {
        self.budgets()?;

        let s = &self.supervisor;
        if !(s.frame_interval_s.is_finite() && s.frame_interval_s > 0.0) {
            return Err(TaggerError::Config(format!(
                "supervisor.frame_interval_s must be positive (got {})",
                s.frame_interval_s
            )));
        }
        if s.staleness_multiplier < 1 {
            return Err(TaggerError::Config(
                "supervisor.staleness_multiplier must be at least 1".to_string(),
            ));
        }
        if s.startup_grace_s < s.frame_interval_s {
            return Err(TaggerError::Config(format!(
                "supervisor.startup_grace_s ({}) must be at least frame_interval_s ({})",
                s.startup_grace_s, s.frame_interval_s
            )));
        }
        if self.resources.max_workers == 0 {
            return Err(TaggerError::Config("resources.max_workers must be at least 1".to_string()));
        }
        if !(self.resources.resource_cache_ttl_s.is_finite() && self.resources.resource_cache_ttl_s >= 0.0) {
            return Err(TaggerError::Config(
                "resources.resource_cache_ttl_s must be non-negative".to_string(),
            ));
        }
        if self.restart.rapid_restart_limit == 0 || self.restart.lifetime_restart_limit == 0 {
            return Err(TaggerError::Config("restart limits must be at least 1".to_string()));
        }
        if self.restart.restart_backoff_cap_s == 0 {
            return Err(TaggerError::Config(
                "restart.restart_backoff_cap_s must be at least 1".to_string(),
            ));
        }
        if !(self.worker.poll_interval_s.is_finite() && self.worker.poll_interval_s > 0.0) {
            return Err(TaggerError::Config("worker.poll_interval_s must be positive".to_string()));
        }
        Ok(())
    }

    /// Configured budgets; missing values are a configuration error
    pub fn budgets(&self) -> TaggerResult<Budgets> {
        let vram_budget_mb = self.resources.vram_budget_mb.ok_or_else(|| {
            TaggerError::Config(format!(
                "resources.vram_budget_mb is required (or set {})",
                VRAM_BUDGET_ENV
            ))
        })?;
        let ram_budget_mb = self.resources.ram_budget_mb.ok_or_else(|| {
            TaggerError::Config(format!(
                "resources.ram_budget_mb is required (or set {})",
                RAM_BUDGET_ENV
            ))
        })?;
        Ok(Budgets {
            vram_budget_mb,
            ram_budget_mb,
            max_workers: self.resources.max_workers,
        })
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            rapid_window: Duration::from_secs(self.restart.rapid_restart_window_s),
            rapid_limit: self.restart.rapid_restart_limit,
            lifetime_limit: self.restart.lifetime_restart_limit,
            backoff_cap: Duration::from_secs(self.restart.restart_backoff_cap_s),
            healthy_reset_after: Duration::from_secs(self.restart.healthy_reset_s),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        secs_f64_to_duration(self.supervisor.frame_interval_s)
    }

    pub fn startup_grace(&self) -> Duration {
        secs_f64_to_duration(self.supervisor.startup_grace_s)
    }

    pub fn stop_grace(&self) -> Duration {
        secs_f64_to_duration(self.supervisor.stop_grace_s)
    }

    pub fn reaper_interval(&self) -> Duration {
        secs_f64_to_duration(self.supervisor.reaper_interval_s)
    }

    pub fn resource_cache_ttl(&self) -> Duration {
        secs_f64_to_duration(self.resources.resource_cache_ttl_s)
    }

    pub fn gpu_probe_timeout(&self) -> Duration {
        secs_f64_to_duration(self.resources.gpu_probe_timeout_s)
    }

    pub fn poll_interval(&self) -> Duration {
        secs_f64_to_duration(self.worker.poll_interval_s)
    }

    pub fn frame_write_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.frame_write_timeout_ms)
    }
}
