//! wktag-ai - ML audio tagging worker orchestration
//!
//! A supervisor keeps a pool of out-of-process tagging workers alive. Each
//! worker reports liveness over a line-delimited health channel and pulls
//! work by claiming units in the shared SQLite store. How many workers run,
//! and on which device, is decided up front by the tier selector from the
//! configured memory budgets.
//!
//! - [`supervisor`]: worker lifecycle, crash detection, restarts
//! - [`health`]: health frame wire format and channel IO
//! - [`claims`]: claim-based work discovery and the stale-claim reaper
//! - [`resources`]: GPU/RAM probing and headroom checks
//! - [`tier`]: execution tier selection
//! - [`restart`]: restart policy
//! - [`worker`]: the worker process loop

pub mod capacity;
pub mod claims;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod resources;
pub mod restart;
pub mod scanner;
pub mod supervisor;
pub mod tier;
pub mod utils;
pub mod worker;

pub use crate::error::{TaggerError, TaggerResult};
