//! labrigd — the lab scheduler daemon.
//!
//! Single binary that assembles the scheduler: state store (redb),
//! drone backend, and the dispatcher tick loop.
//!
//! # Usage
//!
//! ```text
//! labrigd run --data-dir /var/lib/labrig --config /etc/labrig.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use labrig_dispatch::{Dispatcher, DispatcherConfig, LogNotifier};
use labrig_drone::SimDroneManager;
use labrig_state::StateStore;

#[derive(Parser)]
#[command(name = "labrigd", about = "Lab scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher loop.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/labrig")]
        data_dir: PathBuf,

        /// Dispatcher configuration file (TOML). Defaults apply when
        /// absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the tick interval in seconds.
        #[arg(long)]
        tick_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,labrigd=debug,labrig=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            config,
            tick_secs,
        } => run(data_dir, config, tick_secs).await,
    }
}

async fn run(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    tick_secs: Option<u64>,
) -> anyhow::Result<()> {
    info!("labrig daemon starting");

    let mut config = match &config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            DispatcherConfig::from_toml_str(&text)?
        }
        None => DispatcherConfig::default(),
    };
    if let Some(secs) = tick_secs {
        config.tick_interval_secs = secs;
    }

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("labrig.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let drones = Arc::new(SimDroneManager::new(config.max_processes));
    info!(capacity = config.max_processes, "drone backend initialized");

    let tick_interval = Duration::from_secs(config.tick_interval_secs);
    let mut dispatcher = Dispatcher::new(store, drones, Arc::new(LogNotifier), config);

    // Reconcile persisted state against the (empty) backend before the
    // first tick so interrupted work is rewound rather than orphaned.
    dispatcher.recover()?;
    info!("dispatcher recovered persisted state");

    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = dispatcher.tick() {
                    // A failed tick never kills the daemon; the next
                    // tick re-reads state and retries.
                    error!(error = %e, "dispatcher tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("labrig daemon stopped");
    Ok(())
}
