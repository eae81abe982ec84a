//! Error types for wktag-ai
//!
//! Resource and claim errors are recovered where they occur (retried, or
//! routed through tier and restart decisions). None of them crosses the
//! process boundary: that boundary is a message channel, not a call stack.
//! Only configuration errors are fatal at startup.

use thiserror::Error;

/// Tagging service error taxonomy
#[derive(Debug, Error)]
pub enum TaggerError {
    /// Both budgets briefly exceeded; worker reports unhealthy and retries
    #[error("Transient resource exhaustion: {0}")]
    TransientResourceExhaustion(String),

    /// Tier selection refused every tier; zero workers run
    #[error("Persistent resource exhaustion: {0}")]
    PersistentResourceExhaustion(String),

    /// Worker channel closed unexpectedly
    #[error("Worker {component_id} crashed: {reason}")]
    WorkerCrash { component_id: String, reason: String },

    /// Another worker won the claim race (expected, not a failure)
    #[error("Unit {0} already claimed")]
    ClaimConflict(String),

    /// GPU probe failed; only CPU tiers are available
    #[error("GPU capability absent")]
    GpuCapabilityAbsent,

    /// Worker-side: frame write failed, the supervisor is gone
    #[error("Parent unreachable: {0}")]
    ParentUnreachable(String),

    /// Invalid or missing configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker process could not be started
    #[error("Failed to spawn {component_id}: {reason}")]
    Spawn { component_id: String, reason: String },

    /// Unknown component id
    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    /// Claims/work store failure
    #[error("Store error: {0}")]
    Store(#[from] wktag_common::Error),

    /// Library scan could not start
    #[error("Scan error: {0}")]
    Scan(#[from] crate::scanner::ScanError),

    /// Malformed health frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for TaggerError {
    fn from(err: sqlx::Error) -> Self {
        TaggerError::Store(wktag_common::Error::Database(err))
    }
}

/// Result type for wktag-ai operations
pub type TaggerResult<T> = Result<T, TaggerError>;
