//! ML inference collaborator
//!
//! The worker hands one unit at a time to a [`Processor`]. The production
//! implementation shells out to a configured inference command; the worker
//! never retries on the processor's behalf beyond releasing the claim.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use wktag_common::events::DevicePreference;

use crate::db::WorkUnit;
use crate::error::{TaggerError, TaggerResult};
use crate::tier::{CacheMode, CapacityEstimate};

/// Exit status meaning "out of memory, try again later" (EX_TEMPFAIL)
pub const EXIT_RESOURCE_EXHAUSTED: i32 = 75;

/// Environment variable carrying the cache mode to the inference command
pub const CACHE_MODE_ENV: &str = "WKTAG_CACHE_MODE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Memory ran out mid-unit; release the claim and back off
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The unit itself could not be processed
    #[error("processing failed: {0}")]
    Failed(String),
}

/// What the processor produced for a unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Last line of the command's stdout, if any
    pub summary: Option<String>,
}

#[async_trait]
pub trait Processor: Send + Sync {
    /// Run inference for one unit on the hinted device
    async fn process(&self, unit: &WorkUnit, device: DevicePreference) -> Result<ProcessOutput, ProcessingError>;

    /// Measure the model set's memory footprint
    async fn measure(&self) -> Result<CapacityEstimate, ProcessingError>;
}

/// Runs `<command...> --device <gpu|cpu> <path>` per unit
#[derive(Debug, Clone)]
pub struct ExternalCommandProcessor {
    program: String,
    args: Vec<String>,
    cache_mode: CacheMode,
}

impl ExternalCommandProcessor {
    /// `command` is the program followed by its leading arguments
    pub fn new(command: &[String]) -> TaggerResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| TaggerError::Config("worker.processor_command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            cache_mode: CacheMode::Cached,
        })
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(CACHE_MODE_ENV, self.cache_mode.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Deserialize)]
struct Footprint {
    backbone_vram_mb: u64,
    per_worker_ram_mb: u64,
}

fn tail(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl Processor for ExternalCommandProcessor {
    async fn process(&self, unit: &WorkUnit, device: DevicePreference) -> Result<ProcessOutput, ProcessingError> {
        let mut cmd = self.command();
        cmd.arg("--device").arg(device.to_string()).arg(&unit.path);
        debug!(unit_id = %unit.unit_id, device = %device, program = %self.program, "Running inference command");

        let output = cmd
            .output()
            .await
            .map_err(|e| ProcessingError::Failed(format!("{} not runnable: {}", self.program, e)))?;

        if output.status.success() {
            return Ok(ProcessOutput {
                summary: tail(&output.stdout),
            });
        }

        let detail = tail(&output.stderr).unwrap_or_else(|| output.status.to_string());
        match output.status.code() {
            Some(EXIT_RESOURCE_EXHAUSTED) => Err(ProcessingError::ResourceExhausted(detail)),
            _ => Err(ProcessingError::Failed(detail)),
        }
    }

    async fn measure(&self) -> Result<CapacityEstimate, ProcessingError> {
        let mut cmd = self.command();
        cmd.arg("--measure-footprint");

        let output = cmd
            .output()
            .await
            .map_err(|e| ProcessingError::Failed(format!("{} not runnable: {}", self.program, e)))?;
        if !output.status.success() {
            let detail = tail(&output.stderr).unwrap_or_else(|| output.status.to_string());
            return Err(ProcessingError::Failed(format!("footprint measurement failed: {}", detail)));
        }

        let line = tail(&output.stdout)
            .ok_or_else(|| ProcessingError::Failed("footprint measurement printed nothing".to_string()))?;
        let footprint: Footprint = serde_json::from_str(&line)
            .map_err(|e| ProcessingError::Failed(format!("bad footprint JSON {:?}: {}", line, e)))?;

        Ok(CapacityEstimate {
            backbone_vram_mb: footprint.backbone_vram_mb,
            per_worker_ram_mb: footprint.per_worker_ram_mb,
        })
    }
}
