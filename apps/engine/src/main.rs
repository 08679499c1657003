//! Baton Engine - the audio streaming engine process.
//!
//! Owns playback sessions and their extractor/transcoder subprocesses,
//! emits framed audio and lifecycle events on the streaming socket, and
//! answers the orchestrator's control-plane requests over HTTP.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use baton_core::api::control;
use baton_core::{bootstrap_engine, serve};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::signal;

use crate::config::EngineConfig;

/// Baton Engine - extraction, transcoding, framed audio output.
#[derive(Parser, Debug)]
#[command(name = "baton-engine")]
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

    /// Control-plane port (overrides config file).
    #[arg(short = 'p', long, env = "CONTROL_PORT")]
    control_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Baton Engine v{}", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket_path) = args.socket_path {
        config.socket_path = socket_path;
    }
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    log::info!(
        "Configuration: socket={}, control_port={}",
        config.socket_path.display(),
        config.control_port
    );

    let core_config = config.to_core_config();
    let mut services = bootstrap_engine(&core_config)
        .await
        .context("Failed to bootstrap engine")?;

    // Control plane
    let router = control::router(services.engine.clone());
    let control_cancel = services.cancel_token.clone();
    let control_port = core_config.control_port;
    let control_task = tokio::spawn(async move {
        if let Err(err) = serve(router, control_port, control_cancel).await {
            log::error!("Control plane failed: {err}");
        }
    });

    // Peer monitor: EOF on the streaming socket means the orchestrator died
    let mut peer_read = services
        .take_peer_read()
        .context("peer read half already taken")?;
    let peer_monitor = async move {
        let mut scratch = [0u8; 64];
        loop {
            match peer_read.read(&mut scratch).await {
                Ok(0) | Err(_) => return,
                // The orchestrator does not write on this socket
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Received shutdown signal");
        }
        _ = peer_monitor => {
            log::warn!("Orchestrator disconnected, shutting down");
        }
    }

    services.shutdown().await;
    control_task.abort();
    log::info!("Engine stopped");
    Ok(())
}
