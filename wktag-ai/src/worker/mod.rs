//! Worker process side of the supervisor contract
//!
//! A worker is this binary started in `worker` mode. It writes health frames
//! to stdout, reads the stop command from stdin and logs to stderr.

mod heartbeat;
mod processor;
mod runtime;

pub use heartbeat::{spawn_heartbeat, spawn_stop_listener, Activity};
pub use processor::{
    ExternalCommandProcessor, ProcessOutput, ProcessingError, Processor, CACHE_MODE_ENV, EXIT_RESOURCE_EXHAUSTED,
};
pub use runtime::{serve, RunSummary, WorkerDeps, WorkerSettings};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::claims::SqliteClaimStore;
use crate::db;
use crate::error::TaggerResult;
use crate::resources::ResourceMonitor;

/// Host-facing parts of a worker launch
#[derive(Debug, Clone)]
pub struct WorkerEnvironment {
    pub db_path: PathBuf,
    pub processor_command: Vec<String>,
    pub resource_cache_ttl: Duration,
    pub gpu_probe_timeout: Duration,
}

/// Run a worker on this process's stdio
pub async fn run_worker_process(settings: WorkerSettings, env: WorkerEnvironment) -> TaggerResult<RunSummary> {
    let cache_mode = settings.cache_mode;

    serve(settings, tokio::io::stdout(), tokio::io::stdin(), move || async move {
        let processor = ExternalCommandProcessor::new(&env.processor_command)?.with_cache_mode(cache_mode);
        let pool = db::open_store(&env.db_path, db::WORKER_POOL_SIZE).await?;
        let monitor = ResourceMonitor::system(env.resource_cache_ttl, env.gpu_probe_timeout);

        Ok(WorkerDeps {
            store: Arc::new(SqliteClaimStore::new(pool)),
            monitor: Arc::new(monitor),
            processor: Arc::new(processor),
        })
    })
    .await
}
