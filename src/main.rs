//! Command-line interface for change-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # One-shot replication of every replication set in each config file
//! change-sync sync --timeout 5m primary.json secondary.toml
//!
//! # Evaluate a pass without touching the destinations
//! change-sync sync --dry-run replication.json
//!
//! # Loop mode until Ctrl+C
//! change-sync watch --interval 30s replication.yaml
//! ```
//!
//! Exit codes: 0 when every pass succeeded, 1 when a replication or
//! configuration error was reported, 2 on any other error.

use anyhow::Context;
use change_sync::{load_config, parse_duration};
use change_sync_postgresql::{cleanup_tracking, new_postgresql_client, setup_tracking, PostgresBackend};
use clap::{Parser, Subcommand};
use replication::{SyncOptions, Synchronizer};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "change-sync")]
#[command(about = "Replicate change-tracked tables from one database to many")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate every replication set once
    Sync {
        /// Evaluate each pass without modifying destinations
        #[arg(long)]
        dry_run: bool,

        /// Per-statement timeout (e.g. "300", "30s", "5m")
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Config files (.json, .yaml, .yml or .toml), processed in order
        #[arg(required = true, value_name = "CONFIG")]
        configs: Vec<PathBuf>,
    },

    /// Replicate continuously until interrupted
    Watch {
        /// Evaluate each pass without modifying destinations
        #[arg(long)]
        dry_run: bool,

        /// Per-statement timeout (e.g. "300", "30s", "5m")
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Time between the starts of two passes
        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        interval: Duration,

        /// Config file (.json, .yaml, .yml or .toml)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Install change tracking on source tables
    SetupTracking {
        /// Source database connection string
        #[arg(long, env = "CHANGE_SYNC_SOURCE_URI")]
        source_uri: String,

        /// Table to track, bare or schema-qualified (default: all user tables)
        #[arg(long = "table", value_name = "TABLE")]
        tables: Vec<String>,
    },

    /// Remove change history older than the retention period
    CleanupTracking {
        /// Source database connection string
        #[arg(long, env = "CHANGE_SYNC_SOURCE_URI")]
        source_uri: String,

        /// Retention period (e.g. "12h", "2d")
        #[arg(long, value_parser = parse_duration)]
        retention: Duration,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Error: {e:#}");
            2
        }
    };
    std::process::exit(code);
}

/// Run a command, `Ok(false)` when it reported a replication or
/// configuration error.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Sync {
            dry_run,
            timeout,
            configs,
        } => Ok(run_sync(dry_run, timeout, configs).await),
        Commands::Watch {
            dry_run,
            timeout,
            interval,
            config,
        } => run_watch(dry_run, timeout, interval, config).await,
        Commands::SetupTracking { source_uri, tables } => {
            let mut client = new_postgresql_client(&source_uri, None)
                .await
                .context("Failed to connect to source database")?;
            match setup_tracking(&mut client, &tables).await {
                Ok(tables) => {
                    info!("Change tracking enabled on {} table(s)", tables.len());
                    Ok(true)
                }
                Err(e) => {
                    error!("Failed to set up change tracking: {e:#}");
                    Ok(false)
                }
            }
        }
        Commands::CleanupTracking {
            source_uri,
            retention,
        } => {
            let mut client = new_postgresql_client(&source_uri, None)
                .await
                .context("Failed to connect to source database")?;
            match cleanup_tracking(&mut client, retention).await {
                Ok(_) => Ok(true),
                Err(e) => {
                    error!("Failed to clean up change tracking: {e:#}");
                    Ok(false)
                }
            }
        }
    }
}

fn sync_options(dry_run: bool, timeout: Option<Duration>) -> SyncOptions {
    SyncOptions {
        dry_run,
        command_timeout: timeout,
        ..SyncOptions::default()
    }
}

async fn run_sync(dry_run: bool, timeout: Option<Duration>, configs: Vec<PathBuf>) -> bool {
    let mut success = true;

    for path in configs {
        info!("Processing config file {}", path.display());
        let config = match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("{e:#}");
                success = false;
                continue;
            }
        };

        let mut synchronizer = Synchronizer::new(
            PostgresBackend::new(timeout),
            config,
            sync_options(dry_run, timeout),
        );
        if !synchronizer.sync().await {
            error!("Replication of {} finished with errors", path.display());
            success = false;
        }
    }

    success
}

async fn run_watch(
    dry_run: bool,
    timeout: Option<Duration>,
    interval: Duration,
    path: PathBuf,
) -> anyhow::Result<bool> {
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return Ok(false);
        }
    };

    let options = SyncOptions {
        interval,
        ..sync_options(dry_run, timeout)
    };
    let mut synchronizer = Synchronizer::new(PostgresBackend::new(timeout), config, options);
    if !synchronizer.init().await.is_success() {
        warn!("Some replication sets could not be initialized, retrying on the next pass");
    }

    let mut events = synchronizer.subscribe();
    let notifier = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(
                "Replication set {} synced to version {}",
                event.replication_set, event.version
            );
        }
    });

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping after the current pass");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
        }
    });

    info!(
        "Watching {} every {}s",
        path.display(),
        interval.as_secs()
    );
    synchronizer.sync_loop(token).await;

    drop(synchronizer);
    notifier.await.context("Event notifier task failed")?;
    Ok(true)
}
