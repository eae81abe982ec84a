//! Common error types for WKTAG

use thiserror::Error;

/// Common result type for WKTAG operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across WKTAG crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for SQLite lock contention ("database is locked" / "busy")
    ///
    /// These are the only database errors worth retrying; everything else
    /// (constraint violations, schema errors) fails immediately.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            #[cfg(feature = "sqlx")]
            Error::Database(db_err) => {
                let msg = db_err.to_string();
                msg.contains("database is locked") || msg.contains("database is busy")
            }
            _ => false,
        }
    }
}
