use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use coordkit::config::CoordkitConfig;
use coordkit::lock::LockClient;
use coordkit::ratelimit::Throttle;
use coordkit::store::RedisStore;

/// Exercise the coordination primitives against a live configuration.
#[derive(Debug, Parser)]
#[command(name = "coordkit", version, about)]
struct Cli {
    /// YAML configuration file; `COORDKIT__*` variables override it
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admissions for a key through the configured period limit
    Take {
        /// Key to count against
        key: String,
        /// Number of admissions to attempt
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Acquire a lock in the shared store, hold it, then release it
    Lock {
        /// Lock key
        key: String,
        /// Record TTL in seconds (defaults to lock.default_ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,
        /// Seconds to hold the lock before releasing
        #[arg(long, default_value_t = 5)]
        hold: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let cli = Cli::parse();
    let config = CoordkitConfig::load(cli.config.as_deref())?;
    info!(store = %config.store.url, "Configuration loaded");

    match cli.command {
        Command::Take { key, count } => take(&config, &key, count).await,
        Command::Lock { key, ttl, hold } => {
            let ttl = Duration::from_secs(ttl.unwrap_or(config.lock.default_ttl_secs));
            lock(&config, key, ttl, Duration::from_secs(hold)).await
        }
    }
}

async fn take(config: &CoordkitConfig, key: &str, count: u32) -> anyhow::Result<()> {
    let throttle = Throttle::from_config(config).await?;
    if !throttle.is_enabled() {
        warn!("Period limit is disabled, every request is admitted");
    }

    for attempt in 1..=count {
        let state = throttle.check(key).await;
        let verdict = if state.is_admitted() { "admitted" } else { "rejected" };
        println!("{attempt}\t{state}\t{verdict}");
    }
    Ok(())
}

async fn lock(config: &CoordkitConfig, key: String, ttl: Duration, hold: Duration) -> anyhow::Result<()> {
    let store = Arc::new(RedisStore::connect(&config.store).await?);
    let client = LockClient::new(store).with_timeout(config.store.timeout());
    let handle = client.obtain(key);

    if !handle.try_lock(ttl).await? {
        println!("{}\tbusy", handle.key());
        return Ok(());
    }
    println!("{}\tacquired\t{}", handle.key(), handle.token());

    tokio::select! {
        _ = tokio::time::sleep(hold) => {}
        _ = shutdown_signal() => {}
    }

    let released = handle.unlock().await?;
    println!("{}\t{}", handle.key(), if released { "released" } else { "lost" });
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, releasing early");
        }
        _ = terminate => {
            info!("Received SIGTERM, releasing early");
        }
    }
}
