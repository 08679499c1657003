//! Baton Orchestrator - the consumer-facing session process.
//!
//! Owns per-consumer queues and playback bookkeeping, serializes command
//! stampedes into single engine transitions, resolves deferred search
//! tokens, persists queue state, and serves the consumer WebSocket.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use baton_core::{bootstrap_orchestrator, consumer_router, serve, AppState};
use clap::Parser;
use tokio::signal;

use crate::config::OrchestratorConfig;

/// Baton Orchestrator - queues, transitions, consumer transport.
#[derive(Parser, Debug)]
#[command(name = "baton-orchestrator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "BATON_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Streaming socket path (overrides config file).
    #[arg(short, long, env = "SOCKET_PATH")]
    socket_path: Option<PathBuf>,

    /// Consumer WebSocket port (overrides config file).
    #[arg(short = 'p', long)]
    consumer_port: Option<u16>,

    /// Data directory for the persisted session store.
    #[arg(short = 'd', long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Baton Orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        OrchestratorConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket_path) = args.socket_path {
        config.socket_path = socket_path;
    }
    if let Some(port) = args.consumer_port {
        config.consumer_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }
    log::info!(
        "Configuration: socket={}, control_port={}, consumer_port={}, adapter={:?}",
        config.socket_path.display(),
        config.control_port,
        config.consumer_port,
        config.adapter
    );

    let core_config = config.to_core_config();
    let services = bootstrap_orchestrator(&core_config)
        .await
        .context("Failed to bootstrap orchestrator")?;

    let state = AppState {
        orchestrator: services.orchestrator.clone(),
        ws_manager: services.ws_manager.clone(),
    };
    let router = consumer_router(state);
    let server_cancel = services.cancel_token.clone();
    let consumer_port = core_config.consumer_port;
    let server_task = tokio::spawn(async move {
        if let Err(err) = serve(router, consumer_port, server_cancel).await {
            log::error!("Consumer server failed: {err}");
        }
    });

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    log::info!("Received shutdown signal");

    services.shutdown().await;
    server_task.abort();
    log::info!("Orchestrator stopped");
    Ok(())
}
