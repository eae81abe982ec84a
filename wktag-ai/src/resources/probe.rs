//! Host probes behind the resource monitor
//!
//! GPU data comes from `nvidia-smi`; RAM from `sysinfo`. Both are traits so
//! tests can substitute scripted readings.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio::process::Command;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// One memory reading in megabytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryReading {
    pub used_mb: u64,
    pub total_mb: u64,
}

/// GPU capability and VRAM usage
#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// Whether a usable GPU is present. Errors mean "not capable".
    async fn probe_capability(&self) -> Result<(), String>;

    /// Current VRAM usage summed over all devices
    async fn vram(&self) -> Result<MemoryReading, String>;
}

/// System RAM usage
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    async fn ram(&self) -> Result<MemoryReading, String>;
}

/// `nvidia-smi` backed GPU probe
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    program: String,
    timeout: Duration,
}

impl NvidiaSmiProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "nvidia-smi".to_string(),
            timeout,
        }
    }

    /// Use a different executable (wrappers, tests)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("{} not runnable: {}", self.program, e)),
            Err(_) => {
                return Err(format!(
                    "{} timed out after {} ms",
                    self.program,
                    self.timeout.as_millis()
                ))
            }
        };

        if !output.status.success() {
            return Err(format!("{} exited with {}", self.program, output.status));
        }
        String::from_utf8(output.stdout).map_err(|e| format!("{} output not UTF-8: {}", self.program, e))
    }
}

#[async_trait]
impl GpuProbe for NvidiaSmiProbe {
    async fn probe_capability(&self) -> Result<(), String> {
        let listing = self.run(&["-L"]).await?;
        if listing.lines().any(|l| l.trim_start().starts_with("GPU ")) {
            Ok(())
        } else {
            Err("no GPU listed".to_string())
        }
    }

    async fn vram(&self) -> Result<MemoryReading, String> {
        let csv = self
            .run(&["--query-gpu=memory.used,memory.total", "--format=csv,noheader,nounits"])
            .await?;
        parse_vram_csv(&csv)
    }
}

/// Sum `used, total` rows (MB) from nvidia-smi CSV output
pub(crate) fn parse_vram_csv(csv: &str) -> Result<MemoryReading, String> {
    let mut reading = MemoryReading::default();
    let mut rows = 0;

    for line in csv.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split(',').map(str::trim);
        let used = fields.next().and_then(|f| f.parse::<u64>().ok());
        let total = fields.next().and_then(|f| f.parse::<u64>().ok());
        match (used, total) {
            (Some(used), Some(total)) => {
                reading.used_mb += used;
                reading.total_mb += total;
                rows += 1;
            }
            _ => return Err(format!("unparseable nvidia-smi row: {:?}", line)),
        }
    }

    if rows == 0 {
        return Err("nvidia-smi reported no devices".to_string());
    }
    Ok(reading)
}

/// `sysinfo` backed RAM probe
pub struct SysinfoMemoryProbe {
    system: Mutex<System>,
}

impl SysinfoMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryProbe for SysinfoMemoryProbe {
    async fn ram(&self) -> Result<MemoryReading, String> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| "memory probe lock poisoned".to_string())?;
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err("total memory reported as zero".to_string());
        }
        Ok(MemoryReading {
            used_mb: system.used_memory() / BYTES_PER_MB,
            total_mb: total / BYTES_PER_MB,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vram_csv_sums_devices() {
        let reading = parse_vram_csv("1024, 8192\n512, 8192\n").unwrap();
        assert_eq!(
            reading,
            MemoryReading {
                used_mb: 1536,
                total_mb: 16384,
            }
        );
    }

    #[test]
    fn test_parse_vram_csv_rejects_garbage() {
        assert!(parse_vram_csv("").is_err());
        assert!(parse_vram_csv("[N/A], [N/A]").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_capable() {
        let probe = NvidiaSmiProbe::new(Duration::from_secs(2)).with_program("wktag-no-such-gpu-tool");
        assert!(probe.probe_capability().await.is_err());
        assert!(probe.vram().await.is_err());
    }

    #[tokio::test]
    async fn test_sysinfo_reports_nonzero_total() {
        let probe = SysinfoMemoryProbe::new();
        let reading = probe.ram().await.unwrap();
        assert!(reading.total_mb > 0);
        assert!(reading.used_mb <= reading.total_mb);
    }
}
