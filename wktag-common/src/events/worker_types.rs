//! Worker-related type definitions
//!
//! Shared between the worker processes (which report health) and the
//! supervisor (which interprets it), and carried by lifecycle events.

use serde::{Deserialize, Serialize};

/// Four-state health contract reported by workers
///
/// Interpretation rules are binding on every consumer:
/// - `Pending`: no liveness judgment is made yet
/// - `Healthy`: normal operation
/// - `Unhealthy`: alive and self-repairing; never treated as death
/// - `Failed`: terminal; no restart
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pending,
    Healthy,
    Unhealthy,
    Failed,
}

impl HealthStatus {
    /// True only for the terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, HealthStatus::Failed)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Pending => write!(f, "pending"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Execution device a worker prefers (or is told to use)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Gpu,
    Cpu,
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DevicePreference::Gpu => write!(f, "gpu"),
            DevicePreference::Cpu => write!(f, "cpu"),
        }
    }
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(DevicePreference::Gpu),
            "cpu" => Ok(DevicePreference::Cpu),
            other => Err(format!("unknown device preference: {}", other)),
        }
    }
}

/// Supervisor-side lifecycle of one worker
///
/// `Pending -> Healthy <-> Unhealthy -> {Stopped | Crashed}`,
/// `Crashed -> Pending` after the restart delay, `Crashed -> Failed` once
/// the restart policy is exhausted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Pending,
    Healthy,
    Unhealthy,
    /// Graceful stop requested, waiting for exit
    Stopping,
    Stopped,
    /// Exited unexpectedly, restart scheduled
    Crashed,
    Failed,
}

impl WorkerState {
    /// Process is expected to be alive in this state
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            WorkerState::Pending | WorkerState::Healthy | WorkerState::Unhealthy | WorkerState::Stopping
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Pending => "pending",
            WorkerState::Healthy => "healthy",
            WorkerState::Unhealthy => "unhealthy",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Crashed => "crashed",
            WorkerState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}
