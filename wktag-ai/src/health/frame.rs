//! Health frame wire format
//!
//! One JSON object per line:
//!
//! ```text
//! {"component_id":"worker:discovery:0","status":"healthy","phase":"processing","current_unit_id":"3fa1…","timestamp_ms":120500,"seq":24}
//! ```
//!
//! `timestamp_ms` is monotonic milliseconds since the worker process started.
//! The supervisor judges staleness by its own receipt time, never by this
//! field, so clocks of the two processes need not agree.

use serde::{Deserialize, Serialize};
use wktag_common::events::HealthStatus;

use crate::error::{TaggerError, TaggerResult};

/// Free-form activity hint attached to a frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    Processing,
    Idle,
    BackingOff,
    Stopping,
    /// Any phase name this build does not know
    #[serde(other)]
    Unknown,
}

/// One immutable health report from a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthFrame {
    pub component_id: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_unit_id: Option<String>,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub seq: u64,
}

impl HealthFrame {
    pub fn new(component_id: impl Into<String>, status: HealthStatus, timestamp_ms: u64) -> Self {
        Self {
            component_id: component_id.into(),
            status,
            phase: None,
            current_unit_id: None,
            timestamp_ms,
            seq: 0,
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_unit(mut self, unit_id: Option<String>) -> Self {
        self.current_unit_id = unit_id;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

/// Serialize a frame as a newline-terminated JSON line
pub fn encode_frame(frame: &HealthFrame) -> TaggerResult<String> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| TaggerError::Protocol(format!("Failed to encode frame: {}", e)))?;
    line.push('\n');
    Ok(line)
}

/// Parse one line into a frame
pub fn decode_frame(line: &str) -> TaggerResult<HealthFrame> {
    serde_json::from_str(line.trim())
        .map_err(|e| TaggerError::Protocol(format!("Malformed frame {:?}: {}", truncate(line, 120), e)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
