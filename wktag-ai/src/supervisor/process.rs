//! Worker process abstraction
//!
//! The supervisor only needs four things from a process: an id, a graceful
//! stop signal, a way to wait for exit, and a forced kill. Everything else
//! (how the process is started, what the channel is) sits behind
//! [`WorkerLauncher`], so tests can run workers as in-process tasks.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wktag_common::events::DevicePreference;

use crate::error::{TaggerError, TaggerResult};
use crate::tier::{CacheMode, CapacityEstimate};

/// Line written to a worker's stdin to request a graceful stop
pub const STOP_COMMAND: &str = "stop";

/// What to run for one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSpec {
    pub component_id: String,
    pub execution_tier: u8,
    pub device_preference: DevicePreference,
    pub cache_mode: CacheMode,
}

/// Handle to a running worker process
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, if there is one
    fn id(&self) -> Option<u32>;

    /// Ask the worker to finish its current unit and exit
    async fn signal_stop(&mut self) -> std::io::Result<()>;

    /// Wait for exit; `None` when terminated by a signal
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Terminate immediately and reap
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A started worker: its process plus the read end of its health channel
pub struct LaunchedWorker {
    pub process: Box<dyn ProcessHandle>,
    pub channel: Box<dyn AsyncRead + Send + Unpin>,
}

/// Starts worker processes
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &WorkerSpec) -> TaggerResult<LaunchedWorker>;
}

/// Settings every worker process of the pool shares
#[derive(Debug, Clone)]
pub struct WorkerLaunchTemplate {
    /// Executable to re-run in worker mode
    pub exe: PathBuf,
    pub db_path: PathBuf,
    /// Default tracing filter for the worker when RUST_LOG is unset
    pub log_level: String,
    pub frame_interval: Duration,
    pub frame_write_timeout: Duration,
    pub poll_interval: Duration,
    pub resource_cache_ttl: Duration,
    pub gpu_probe_timeout: Duration,
    pub vram_budget_mb: u64,
    pub ram_budget_mb: u64,
    pub estimate: CapacityEstimate,
    pub processor_command: Vec<String>,
}

impl WorkerLaunchTemplate {
    /// Command-line arguments for `wktag-ai worker`
    ///
    /// Workers read no config file; everything they need is on this line.
    pub fn args(&self, spec: &WorkerSpec) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--component-id".to_string(),
            spec.component_id.clone(),
            "--tier".to_string(),
            spec.execution_tier.to_string(),
            "--device".to_string(),
            spec.device_preference.to_string(),
            "--cache-mode".to_string(),
            spec.cache_mode.to_string(),
            "--db-path".to_string(),
            self.db_path.display().to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
            "--frame-interval-ms".to_string(),
            self.frame_interval.as_millis().to_string(),
            "--frame-write-timeout-ms".to_string(),
            self.frame_write_timeout.as_millis().to_string(),
            "--poll-interval-ms".to_string(),
            self.poll_interval.as_millis().to_string(),
            "--resource-cache-ttl-ms".to_string(),
            self.resource_cache_ttl.as_millis().to_string(),
            "--gpu-probe-timeout-ms".to_string(),
            self.gpu_probe_timeout.as_millis().to_string(),
            "--vram-budget-mb".to_string(),
            self.vram_budget_mb.to_string(),
            "--ram-budget-mb".to_string(),
            self.ram_budget_mb.to_string(),
            "--vram-estimate-mb".to_string(),
            self.estimate.backbone_vram_mb.to_string(),
            "--ram-estimate-mb".to_string(),
            self.estimate.per_worker_ram_mb.to_string(),
        ];
        if !self.processor_command.is_empty() {
            args.push("--".to_string());
            args.extend(self.processor_command.iter().cloned());
        }
        args
    }
}

/// Launches workers by re-executing this binary in `worker` mode
///
/// The child's stdout is the health channel and its stdin carries the stop
/// command; stderr is inherited so worker logs reach the supervisor's log.
pub struct ChildProcessLauncher {
    template: WorkerLaunchTemplate,
}

impl ChildProcessLauncher {
    pub fn new(template: WorkerLaunchTemplate) -> Self {
        Self { template }
    }
}

impl WorkerLauncher for ChildProcessLauncher {
    fn launch(&self, spec: &WorkerSpec) -> TaggerResult<LaunchedWorker> {
        let spawn_err = |reason: String| TaggerError::Spawn {
            component_id: spec.component_id.clone(),
            reason,
        };

        let mut child = Command::new(&self.template.exe)
            .args(self.template.args(spec))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(format!("{}: {}", self.template.exe.display(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("stdout not captured".to_string()))?;
        let stdin = child.stdin.take();

        debug!(component_id = %spec.component_id, pid = ?child.id(), "Worker process started");
        Ok(LaunchedWorker {
            process: Box::new(ChildProcess { child, stdin }),
            channel: Box::new(stdout),
        })
    }
}

/// [`ProcessHandle`] over a tokio child process
pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn signal_stop(&mut self) -> std::io::Result<()> {
        // Closing stdin after the command doubles as an EOF signal
        if let Some(mut stdin) = self.stdin.take() {
            stdin.write_all(format!("{}\n", STOP_COMMAND).as_bytes()).await?;
            stdin.flush().await?;
        }
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Request sent to a process task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessControl {
    Stop { grace: Duration },
    Kill,
}

/// Reported once per incarnation when its process is gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcessExit {
    pub component_id: String,
    pub generation: u64,
    pub code: Option<i32>,
    /// True when the supervisor had to kill it
    pub forced: bool,
}

/// Own a process until it exits, acting on stop and kill requests
///
/// Keeps the potentially long grace-period wait off the supervisor loop.
pub(crate) fn spawn_process_task(
    component_id: String,
    generation: u64,
    mut process: Box<dyn ProcessHandle>,
    mut control: mpsc::UnboundedReceiver<ProcessControl>,
    exits: mpsc::UnboundedSender<ProcessExit>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (code, forced) = tokio::select! {
            status = process.wait() => (exit_code(&component_id, status), false),
            request = control.recv() => match request {
                Some(ProcessControl::Stop { grace }) => {
                    if let Err(e) = process.signal_stop().await {
                        debug!(component_id = %component_id, error = %e, "Stop signal not delivered");
                    }
                    match tokio::time::timeout(grace, process.wait()).await {
                        Ok(status) => (exit_code(&component_id, status), false),
                        Err(_) => {
                            warn!(
                                component_id = %component_id,
                                grace_s = grace.as_secs_f64(),
                                "Worker ignored stop request, killing"
                            );
                            kill(&component_id, process.as_mut()).await;
                            (None, true)
                        }
                    }
                }
                Some(ProcessControl::Kill) | None => {
                    kill(&component_id, process.as_mut()).await;
                    (None, true)
                }
            },
        };

        let _ = exits.send(ProcessExit {
            component_id,
            generation,
            code,
            forced,
        });
    })
}

fn exit_code(component_id: &str, status: std::io::Result<Option<i32>>) -> Option<i32> {
    match status {
        Ok(code) => code,
        Err(e) => {
            warn!(component_id = %component_id, error = %e, "Waiting for worker exit failed");
            None
        }
    }
}

async fn kill(component_id: &str, process: &mut dyn ProcessHandle) {
    if let Err(e) = process.kill().await {
        warn!(component_id = %component_id, error = %e, "Failed to kill worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> WorkerLaunchTemplate {
        WorkerLaunchTemplate {
            exe: PathBuf::from("/usr/bin/wktag-ai"),
            db_path: PathBuf::from("/var/lib/wktag/wktag.db"),
            log_level: "info".to_string(),
            frame_interval: Duration::from_secs(5),
            frame_write_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            resource_cache_ttl: Duration::from_secs(1),
            gpu_probe_timeout: Duration::from_secs(5),
            vram_budget_mb: 20_000,
            ram_budget_mb: 8_000,
            estimate: CapacityEstimate {
                backbone_vram_mb: 8192,
                per_worker_ram_mb: 2457,
            },
            processor_command: vec!["wktag-infer".to_string(), "--fast".to_string()],
        }
    }

    #[test]
    fn test_worker_args() {
        let spec = WorkerSpec {
            component_id: "worker:discovery:1".to_string(),
            execution_tier: 3,
            device_preference: DevicePreference::Cpu,
            cache_mode: CacheMode::Sequential,
        };
        let args = template().args(&spec);

        assert_eq!(args[0], "worker");
        let joined = args.join(" ");
        assert!(joined.contains("--component-id worker:discovery:1"));
        assert!(joined.contains("--device cpu"));
        assert!(joined.contains("--cache-mode sequential"));
        assert!(joined.contains("--frame-interval-ms 5000"));
        assert!(joined.ends_with("-- wktag-infer --fast"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let mut template = template();
        template.exe = PathBuf::from("/nonexistent/wktag-ai");
        let launcher = ChildProcessLauncher::new(template);
        let spec = WorkerSpec {
            component_id: "worker:discovery:0".to_string(),
            execution_tier: 0,
            device_preference: DevicePreference::Gpu,
            cache_mode: CacheMode::Cached,
        };
        assert!(matches!(launcher.launch(&spec), Err(TaggerError::Spawn { .. })));
    }
}
