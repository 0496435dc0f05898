//! Engine entry point: a long-running JSON-RPC server on stdio.

use anyhow::{Context, Result};
use clap::Parser;
use fetchd_core::config::EngineConfig;
use fetchd_core::controller::Controller;
use fetchd_core::events::EventBus;
use fetchd_core::storage::{Database, DownloadStore};
use fetchd_core::{rpc, supervisor};
use tracing::{info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout is the RPC channel; all logging goes to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "engine starting");

    // Configuration layering: defaults, then persisted settings, then CLI.
    let mut config = EngineConfig::default();
    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(path) = &args.database_path {
        config.database_path = Some(path.clone());
    }

    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!("creating download directory {}", config.download_dir.display())
    })?;

    // A database that cannot open is fatal: exit non-zero with diagnostics.
    let store = Database::open(config.database_path())
        .await
        .context("opening engine database")?;

    if let Ok(Some(json)) = store.get_setting("engine_config").await {
        match serde_json::from_str::<EngineConfig>(&json) {
            Ok(mut stored) => {
                // Explicit CLI paths win over stored settings.
                if let Some(dir) = &args.download_dir {
                    stored.download_dir = dir.clone();
                }
                if let Some(path) = &args.database_path {
                    stored.database_path = Some(path.clone());
                }
                config = stored;
            }
            Err(e) => warn!(error = %e, "ignoring undecodable stored settings"),
        }
    }

    let events = EventBus::new();
    let controller = Controller::start(config, store, events)
        .await
        .context("starting download controller")?;

    match args.stop_with_process {
        Some(pid) => {
            tokio::select! {
                result = rpc::serve_stdio(controller.clone()) => {
                    result.context("RPC front-end failed")?;
                }
                _ = supervisor::parent_exited(pid) => {
                    info!("parent exited, shutting down");
                    controller.shutdown().await;
                }
            }
        }
        None => {
            rpc::serve_stdio(controller).await.context("RPC front-end failed")?;
        }
    }

    info!("engine stopped");
    Ok(())
}
