//! JobForge CLI: run a worker or operate on the queue.
//!
//! Exit codes: 0 success, 2 validation/configuration error, 1 runtime
//! failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use forge_core::memory::MemoryStore;
use forge_core::store::{JobStore, Store};
use server_core::autopilot::{BundleExecutorHandler, BUNDLE_JOB_TYPE};
use server_core::config::{Config, FeatureFlags};
use server_core::store_pg::PgStore;
use server_core::worker::{HandlerRegistry, Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "jobforge", version, about = "Multi-tenant job router over a relational store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Worker operations
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Queue operations
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Run the worker loop
    Run {
        /// Claim and process one batch, then exit
        #[arg(long)]
        once: bool,
        /// Poll interval in seconds (overrides POLL_INTERVAL_MS)
        #[arg(long)]
        interval: Option<u64>,
        /// Backing store
        #[arg(long, value_enum, default_value = "postgres")]
        store: StoreKind,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Recover jobs whose heartbeat went stale
    Reap {
        /// Staleness threshold, e.g. 90s, 5m, 1h
        #[arg(long = "stale-after")]
        stale_after: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Postgres,
    /// Process-local store, for local runs and smoke tests
    Memory,
}

/// Errors split by exit code.
enum AppError {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(AppError::Config(e)) => {
            error!(error = %format!("{e:#}"), "configuration error");
            std::process::exit(2);
        }
        Err(AppError::Runtime(e)) => {
            error!(error = %format!("{e:#}"), "runtime failure");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Worker {
            command: WorkerCommands::Run {
                once,
                interval,
                store,
            },
        } => run_worker(once, interval, store).await,
        Commands::Queue {
            command: QueueCommands::Reap { stale_after },
        } => reap(&stale_after).await,
    }
}

async fn run_worker(once: bool, interval: Option<u64>, kind: StoreKind) -> Result<(), AppError> {
    let config = Config::from_env().map_err(AppError::Config)?;

    let store: Arc<dyn Store> = match kind {
        StoreKind::Postgres => Arc::new(
            PgStore::connect(&config.store_url)
                .await
                .map_err(|e| AppError::Runtime(anyhow!(e).context("connecting to store")))?,
        ),
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };

    let flags = FeatureFlags::from_env();
    let mut registry = HandlerRegistry::new();
    registry.register(
        BUNDLE_JOB_TYPE,
        Arc::new(BundleExecutorHandler::new(
            store.clone(),
            flags,
            config.policy_token_secrets.clone(),
        )),
    );

    let mut worker_config = WorkerConfig::from_config(&config);
    if let Some(seconds) = interval {
        worker_config.poll_interval = Duration::from_secs(seconds);
    }

    let worker = Arc::new(Worker::new(store, Arc::new(registry), worker_config));

    if once {
        let processed = worker.run_once().await.map_err(AppError::Runtime)?;
        info!(processed, "single worker pass complete");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    worker.run(shutdown).await.map_err(AppError::Runtime)
}

async fn reap(stale_after: &str) -> Result<(), AppError> {
    let stale_after = parse_duration(stale_after).map_err(AppError::Config)?;
    let config = Config::from_env().map_err(AppError::Config)?;
    let store = PgStore::connect(&config.store_url)
        .await
        .map_err(|e| AppError::Runtime(anyhow!(e).context("connecting to store")))?;

    let reaped = store
        .reap_stuck_jobs(
            chrono::Duration::from_std(stale_after)
                .map_err(|e| AppError::Config(anyhow!("stale-after out of range: {e}")))?,
        )
        .await
        .map_err(|e| AppError::Runtime(anyhow!(e)))?;

    let next_available = store
        .next_available_at(None)
        .await
        .map_err(|e| AppError::Runtime(anyhow!(e)))?;
    match next_available {
        Some(at) => info!(reaped, next_available_at = %at.to_rfc3339(), "reap complete"),
        None => info!(reaped, "reap complete; no pending jobs"),
    }
    println!("{reaped}");
    Ok(())
}

/// Parse `90s` / `5m` / `2h` / `1500ms` durations.
fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (value, unit) = raw
        .find(|c: char| !c.is_ascii_digit())
        .map(|idx| raw.split_at(idx))
        .ok_or_else(|| anyhow!("duration {raw:?} is missing a unit (ms, s, m, h)"))?;
    let value: u64 = value
        .parse()
        .with_context(|| format!("duration {raw:?} has an invalid number"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(anyhow!("unknown duration unit {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
    }
}
