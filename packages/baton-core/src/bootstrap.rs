//! Application bootstrap and dependency wiring.
//!
//! The composition roots for both processes live here - the single place
//! where services are instantiated and wired together. The engine waits
//! for its orchestrator peer on the streaming socket; the orchestrator
//! connects out and probes the control plane.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::api::WsConnectionManager;
use crate::engine::{Engine, Extractor, Transcoder};
use crate::error::{BatonError, BatonResult};
use crate::events::{EventEmitter, NoopEventEmitter};
use crate::orchestrator::{
    EngineClient, JsonFileStore, MemoryStore, Orchestrator, SessionStore,
};
use crate::state::Config;
use crate::transport::{FrameWriter, SinkRegistry, SocketReader};

/// Timeout for control-plane HTTP requests.
const CONTROL_TIMEOUT_SECS: u64 = 10;

/// Everything the engine binary needs after bootstrap.
pub struct EngineServices {
    /// The engine service, bound to the accepted streaming socket.
    pub engine: Arc<Engine<OwnedWriteHalf>>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// Read half of the peer connection; EOF here means the orchestrator
    /// went away.
    peer_read: Option<OwnedReadHalf>,
}

impl EngineServices {
    /// Takes the peer read half for EOF monitoring. Yields once.
    pub fn take_peer_read(&mut self) -> Option<OwnedReadHalf> {
        self.peer_read.take()
    }

    /// Graceful shutdown: cancel background work and reap every session.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning engine shutdown...");
        self.cancel_token.cancel();
        let stopped = self.engine.stop_all().await;
        log::info!("[Bootstrap] Stopped {stopped} session(s)");
    }
}

/// Binds the streaming socket, waits for the orchestrator to connect, and
/// wires the engine.
///
/// A stale socket file from a previous run is removed before binding.
pub async fn bootstrap_engine(config: &Config) -> BatonResult<EngineServices> {
    config
        .validate()
        .map_err(BatonError::Configuration)?;

    if config.socket_path.exists() {
        log::info!(
            "[Bootstrap] Removing stale socket {}",
            config.socket_path.display()
        );
        std::fs::remove_file(&config.socket_path)
            .map_err(|e| BatonError::Configuration(format!("stale socket: {e}")))?;
    }

    let listener = UnixListener::bind(&config.socket_path)
        .map_err(|e| BatonError::Configuration(format!("socket bind: {e}")))?;
    log::info!(
        "[Bootstrap] Streaming socket at {}, waiting for orchestrator",
        config.socket_path.display()
    );

    let (stream, _) = listener
        .accept()
        .await
        .map_err(|e| BatonError::Transport(e.to_string()))?;
    log::info!("[Bootstrap] Orchestrator connected");

    let (peer_read, write_half) = stream.into_split();
    let writer = Arc::new(FrameWriter::new(write_half));
    let emitter: Arc<dyn EventEmitter> = Arc::new(NoopEventEmitter);

    let engine = Arc::new(Engine::new(
        writer,
        Extractor::new(),
        Transcoder::new(),
        emitter,
        config.streaming.clone(),
    ));

    Ok(EngineServices {
        engine,
        cancel_token: CancellationToken::new(),
        peer_read: Some(peer_read),
    })
}

/// Everything the orchestrator binary needs after bootstrap.
pub struct OrchestratorServices {
    /// The orchestrator service.
    pub orchestrator: Arc<Orchestrator>,
    /// Consumer transport tracking (also the notifier).
    pub ws_manager: Arc<WsConnectionManager>,
    /// Control-plane client, shared for health probes.
    pub engine_client: EngineClient,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// Write half of the streaming socket. Never written (control goes via
    /// HTTP) but held so the engine does not see a half-closed peer.
    _peer_write: OwnedWriteHalf,
}

impl OrchestratorServices {
    /// Graceful shutdown: stop sessions, flush persistence, drop transports.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning orchestrator shutdown...");
        self.cancel_token.cancel();
        self.orchestrator.shutdown().await;
        let closed = self.ws_manager.close_all();
        log::info!("[Bootstrap] Closed {closed} consumer connection(s)");
    }
}

/// Connects to the engine's sockets and wires the orchestrator.
pub async fn bootstrap_orchestrator(config: &Config) -> BatonResult<OrchestratorServices> {
    config
        .validate()
        .map_err(BatonError::Configuration)?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(CONTROL_TIMEOUT_SECS))
        .build()
        .map_err(|e| BatonError::Configuration(e.to_string()))?;
    let engine_client = EngineClient::new(
        http,
        format!("http://127.0.0.1:{}", config.control_port),
    );

    // Identity probe: fail fast when something else answers on the port
    match engine_client.health().await {
        Ok(health) => log::info!(
            "[Bootstrap] Engine v{} healthy, {} live session(s)",
            health.version,
            health.sessions
        ),
        Err(err) => log::warn!("[Bootstrap] Engine health probe failed: {err}"),
    }

    let store: Arc<dyn SessionStore> = match &config.data_dir {
        Some(dir) => Arc::new(JsonFileStore::new(dir).map_err(|e| {
            BatonError::Configuration(format!("data dir {}: {e}", dir.display()))
        })?),
        None => {
            log::warn!("[Bootstrap] No data dir configured; queues are memory-only");
            Arc::new(MemoryStore::new())
        }
    };

    let sinks = Arc::new(SinkRegistry::new());
    let ws_manager = Arc::new(WsConnectionManager::new());
    let emitter: Arc<dyn EventEmitter> = Arc::new(NoopEventEmitter);
    let cancel_token = CancellationToken::new();

    let orchestrator = Arc::new(Orchestrator::new(
        engine_client.clone(),
        store,
        ws_manager.clone(),
        emitter,
        sinks.clone(),
        config.clone(),
    ));

    // Streaming socket: reader task demuxes audio and fans out events
    let stream = UnixStream::connect(&config.socket_path)
        .await
        .map_err(|e| {
            BatonError::Configuration(format!(
                "streaming socket {}: {e}",
                config.socket_path.display()
            ))
        })?;
    let (read_half, write_half) = stream.into_split();

    let (events_tx, events_rx) = broadcast::channel(config.streaming.event_channel_capacity);
    let reader = SocketReader::new(sinks, events_tx);
    orchestrator.spawn_event_dispatch(events_rx, cancel_token.clone());

    tokio::spawn(async move {
        if let Err(err) = reader.run(read_half).await {
            log::error!("[Bootstrap] Streaming socket reader failed: {err}");
        }
    });

    ws_manager.spawn_heartbeat_checker(
        Duration::from_secs(config.ws_heartbeat_timeout_secs),
        Duration::from_secs(config.ws_heartbeat_check_interval_secs),
        cancel_token.clone(),
    );

    Ok(OrchestratorServices {
        orchestrator,
        ws_manager,
        engine_client,
        cancel_token,
        _peer_write: write_half,
    })
}
