use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use slr_store::PgListingStore;
use slr_sync::{SyncConfig, Worker};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "slr")]
#[command(about = "Snapshot listing reconciler")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the reconcile loop until interrupted.
    Run,
    /// Run exactly one pass over the catalog, then exit.
    Pass,
    /// Create the listings schema and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(SyncConfig::config_path_from_env);
    let config = SyncConfig::load(&config_path)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let worker = match Worker::init(config).await {
                Ok(worker) => worker,
                Err(err) => {
                    // Startup is gated on the external dependencies; nothing
                    // useful can run without them.
                    error!(error = %err, "worker initialization failed");
                    return Err(err);
                }
            };
            info!("worker initialized; entering pass loop");
            tokio::select! {
                _ = worker.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; shutting down");
                }
            }
        }
        Commands::Pass => {
            let worker = Worker::init(config).await?;
            let stats = worker.runner.run_pass().await;
            println!(
                "pass complete: items={} fetched={} skipped={} failed={}",
                stats.total, stats.fetched, stats.skipped_coverage, stats.failed
            );
        }
        Commands::Migrate => {
            let store = PgListingStore::connect(config.database.connect_options()).await?;
            store.ensure_schema().await?;
            println!("listings schema ready");
        }
    }

    Ok(())
}
