//! # WKTAG Common Library
//!
//! Shared code for the WKTAG tagging service and its worker processes:
//! - Error type
//! - Configuration loading and root folder resolution
//! - Database connection setup
//! - Worker lifecycle event types and EventBus
//! - Time utilities and injectable clocks

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
