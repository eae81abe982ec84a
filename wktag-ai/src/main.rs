//! wktag-ai - ML audio tagging service
//!
//! Subcommands:
//! - `supervise`: select an execution tier and run the worker pool
//! - `worker`: one worker process (started by the supervisor, not by hand)
//! - `scan`: register audio files as pending work units
//! - `tier`: print the tier decision for the current host and config

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wktag_common::config::{database_path, resolve_root_folder};
use wktag_common::events::{DevicePreference, EventBus};
use wktag_common::time::millis_to_duration;

use wktag_ai::capacity;
use wktag_ai::claims::{ClaimReaper, SqliteClaimStore};
use wktag_ai::config::TaggerConfig;
use wktag_ai::db::{self, units};
use wktag_ai::resources::ResourceMonitor;
use wktag_ai::scanner;
use wktag_ai::supervisor::{ChildProcessLauncher, Supervisor, SupervisorConfig, WorkerLaunchTemplate};
use wktag_ai::tier::{self, CacheMode, CapacityEstimate, TierDecision};
use wktag_ai::worker::{self, ExternalCommandProcessor, WorkerEnvironment, WorkerSettings};
use wktag_ai::TaggerError;

/// Supervisor-side pool size (supervisor, reaper, progress reporting)
const SUPERVISOR_POOL_SIZE: u32 = 4;

const EVENT_BUS_CAPACITY: usize = 256;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "wktag-ai", version, about = "ML audio tagging worker orchestration")]
struct Cli {
    /// Config file (default: ~/.config/wktag/wktag-ai.toml, then /etc/wktag/wktag-ai.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root folder holding the shared database
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool until interrupted
    Supervise {
        /// Override resources.max_workers
        #[arg(long)]
        max_workers: Option<usize>,
    },

    /// Run one worker process
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Register audio files under a folder as pending work
    Scan {
        folder: PathBuf,

        /// Also return failed units to pending
        #[arg(long)]
        retry_failed: bool,
    },

    /// Print the execution tier this host would run at
    Tier,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long)]
    component_id: String,
    #[arg(long)]
    tier: u8,
    #[arg(long)]
    device: DevicePreference,
    #[arg(long)]
    cache_mode: CacheMode,
    #[arg(long)]
    db_path: PathBuf,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    frame_interval_ms: u64,
    #[arg(long)]
    frame_write_timeout_ms: u64,
    #[arg(long)]
    poll_interval_ms: u64,
    #[arg(long)]
    resource_cache_ttl_ms: u64,
    #[arg(long)]
    gpu_probe_timeout_ms: u64,
    #[arg(long)]
    vram_budget_mb: u64,
    #[arg(long)]
    ram_budget_mb: u64,
    #[arg(long)]
    vram_estimate_mb: u64,
    #[arg(long)]
    ram_estimate_mb: u64,
    /// Inference command and its leading arguments
    #[arg(last = true)]
    processor_command: Vec<String>,
}

/// Log to stderr; stdout belongs to the health channel in worker mode
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wktag_ai={level},wktag_common={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Worker(args) => {
            init_tracing(&args.log_level);
            let code = match run_worker(args).await {
                Ok(()) => 0,
                Err(e) => {
                    error!("Worker exiting: {:#}", e);
                    1
                }
            };
            // The stdin reader may still be parked in a blocking read
            std::process::exit(code);
        }
        Command::Supervise { max_workers } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(n) = max_workers {
                config.resources.max_workers = n;
            }
            init_tracing(&config.logging.level);
            supervise(config, cli.root_folder.as_deref()).await
        }
        Command::Scan { folder, retry_failed } => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(&config.logging.level);
            scan(&config, cli.root_folder.as_deref(), &folder, retry_failed).await
        }
        Command::Tier => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(&config.logging.level);
            print_tier(&config, cli.root_folder.as_deref()).await
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<TaggerConfig> {
    TaggerConfig::load(explicit).context("Failed to load configuration")
}

async fn open_root_store(config: &TaggerConfig, cli_root: Option<&Path>) -> Result<(PathBuf, SqlitePool)> {
    let root_folder = resolve_root_folder(cli_root, config.root_folder.as_deref());
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;

    let db_path = database_path(&root_folder);
    info!("Database: {}", db_path.display());
    let pool = db::open_store(&db_path, SUPERVISOR_POOL_SIZE)
        .await
        .with_context(|| format!("Failed to open {}", db_path.display()))?;
    Ok((db_path, pool))
}

/// Capacity estimate, GPU capability and the resulting tier
async fn decide_tier(config: &TaggerConfig, pool: &SqlitePool) -> Result<(CapacityEstimate, TierDecision)> {
    let processor = ExternalCommandProcessor::new(&config.worker.processor_command)?;
    let estimate = capacity::resolve_estimate(pool, &config.capacity, &processor).await?;

    let monitor = ResourceMonitor::system(config.resource_cache_ttl(), config.gpu_probe_timeout());
    let gpu_capable = monitor.check_gpu_capability().await;

    let decision = tier::select_tier(&estimate, &config.budgets()?, gpu_capable);
    Ok((estimate, decision))
}

fn supervisor_config(config: &TaggerConfig) -> SupervisorConfig {
    SupervisorConfig {
        frame_interval: config.frame_interval(),
        staleness_multiplier: config.supervisor.staleness_multiplier,
        startup_grace: config.startup_grace(),
        stop_grace: config.stop_grace(),
        restart: config.restart_policy(),
        ..SupervisorConfig::default()
    }
}

async fn supervise(config: TaggerConfig, cli_root: Option<&Path>) -> Result<()> {
    info!("Starting wktag-ai supervisor");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.validate().context("Invalid configuration")?;
    let budgets = config.budgets()?;
    let (db_path, pool) = open_root_store(&config, cli_root).await?;
    let (estimate, decision) = decide_tier(&config, &pool).await?;

    if decision.is_refusal() {
        warn!("Supervisor stays up with zero workers; raise the budgets and restart to begin tagging");
    }

    let template = WorkerLaunchTemplate {
        exe: std::env::current_exe().context("Cannot locate own executable")?,
        db_path,
        log_level: config.logging.level.clone(),
        frame_interval: config.frame_interval(),
        frame_write_timeout: config.frame_write_timeout(),
        poll_interval: config.poll_interval(),
        resource_cache_ttl: config.resource_cache_ttl(),
        gpu_probe_timeout: config.gpu_probe_timeout(),
        vram_budget_mb: budgets.vram_budget_mb,
        ram_budget_mb: budgets.ram_budget_mb,
        estimate,
        processor_command: config.worker.processor_command.clone(),
    };

    let events = EventBus::new(EVENT_BUS_CAPACITY);
    let (supervisor, handle) = Supervisor::new(
        supervisor_config(&config),
        Arc::new(ChildProcessLauncher::new(template)),
        events,
    );
    let view = supervisor.status_view();
    let shutdown = CancellationToken::new();

    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

    let reaper = ClaimReaper::new(Arc::new(SqliteClaimStore::new(pool.clone())), Arc::new(view.clone()));
    let reaper_task = tokio::spawn(reaper.run(config.reaper_interval(), shutdown.clone()));

    let progress_task = tokio::spawn(report_progress(pool.clone(), view, shutdown.clone()));

    handle.apply_tier(decision).await?;

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested, stopping workers");
    shutdown.cancel();

    for (name, task) in [("supervisor", supervisor_task), ("reaper", reaper_task), ("progress", progress_task)] {
        if let Err(e) = task.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }
    pool.close().await;
    info!("Supervisor stopped");
    Ok(())
}

async fn report_progress(pool: SqlitePool, view: wktag_ai::supervisor::StatusView, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match units::unit_counts(&pool).await {
                    Ok(counts) => info!(
                        pending = counts.pending,
                        claimed = counts.claimed,
                        done = counts.done,
                        failed = counts.failed,
                        workers = view.list_component_ids().len(),
                        "Progress"
                    ),
                    Err(e) => warn!(error = %e, "Failed to read unit counts"),
                }
            }
        }
    }
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let settings = WorkerSettings {
        component_id: args.component_id,
        execution_tier: args.tier,
        device_preference: args.device,
        cache_mode: args.cache_mode,
        frame_interval: millis_to_duration(args.frame_interval_ms),
        frame_write_timeout: millis_to_duration(args.frame_write_timeout_ms),
        poll_interval: millis_to_duration(args.poll_interval_ms),
        vram_budget_mb: args.vram_budget_mb,
        ram_budget_mb: args.ram_budget_mb,
        estimate: CapacityEstimate {
            backbone_vram_mb: args.vram_estimate_mb,
            per_worker_ram_mb: args.ram_estimate_mb,
        },
    };
    let env = WorkerEnvironment {
        db_path: args.db_path,
        processor_command: args.processor_command,
        resource_cache_ttl: millis_to_duration(args.resource_cache_ttl_ms),
        gpu_probe_timeout: millis_to_duration(args.gpu_probe_timeout_ms),
    };

    let summary = worker::run_worker_process(settings, env).await?;
    info!(
        completed = summary.completed,
        failed = summary.failed,
        released = summary.released,
        "Worker exited"
    );
    Ok(())
}

async fn scan(config: &TaggerConfig, cli_root: Option<&Path>, folder: &Path, retry_failed: bool) -> Result<()> {
    let (_, pool) = open_root_store(config, cli_root).await?;

    if retry_failed {
        let requeued = units::requeue_failed(&pool).await?;
        info!(requeued, "Failed units returned to pending");
    }

    let summary = scanner::scan_and_enqueue(&pool, folder)
        .await
        .with_context(|| format!("Scan of {} failed", folder.display()))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    pool.close().await;
    Ok(())
}

async fn print_tier(config: &TaggerConfig, cli_root: Option<&Path>) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let (_, pool) = open_root_store(config, cli_root).await?;
    let (estimate, decision) = decide_tier(config, &pool).await?;
    pool.close().await;

    let report = serde_json::json!({
        "estimate": estimate,
        "decision": decision,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    match decision.refusal {
        Some(hint) => Err(TaggerError::PersistentResourceExhaustion(hint.to_string()).into()),
        None => Ok(()),
    }
}
