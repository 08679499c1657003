//! Consumer WebSocket: command intake, event delivery, connection tracking.
//!
//! One socket per attached consumer transport. Client-initiated JSON
//! messages carry the command vocabulary; server-initiated JSON carries
//! [`ConsumerEvent`]s; binary messages carry audio frames for browser-mode
//! sessions. An initial `state` message is sent on connect via the
//! orchestrator's `Connected` command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use dashmap::DashMap;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::events::ConsumerEvent;
use crate::orchestrator::{Command, ConsumerNotifier};

// ─────────────────────────────────────────────────────────────────────────────
// Connection Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound traffic for one socket.
pub enum WsOutgoing {
    /// Serialized consumer event.
    Event(String),
    /// Audio frame (browser mode).
    Binary(Bytes),
}

struct Connection {
    consumer_id: String,
    outbound: mpsc::UnboundedSender<WsOutgoing>,
    last_heartbeat: Mutex<Instant>,
    cancel: CancellationToken,
}

/// Tracks active WebSocket connections and routes consumer events to them.
///
/// A consumer may hold several connections (two browser tabs); events fan
/// out to all of them. Connections that miss heartbeats past the timeout
/// are force-closed by the checker task.
pub struct WsConnectionManager {
    connections: DashMap<u64, Arc<Connection>>,
    next_id: AtomicU64,
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a connection, returning its RAII guard and outbound queue.
    pub fn register(
        self: &Arc<Self>,
        consumer_id: &str,
    ) -> (ConnectionGuard, mpsc::UnboundedReceiver<WsOutgoing>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = self.global_cancel.read().child_token();

        let connection = Arc::new(Connection {
            consumer_id: consumer_id.to_string(),
            outbound: outbound_tx,
            last_heartbeat: Mutex::new(Instant::now()),
            cancel: cancel.clone(),
        });
        self.connections.insert(id, connection);
        log::info!(
            "[WS] Connection {id} registered for {consumer_id} (total: {})",
            self.connections.len()
        );

        (
            ConnectionGuard {
                id,
                manager: Arc::clone(self),
                cancel,
            },
            outbound_rx,
        )
    }

    fn unregister(&self, id: u64) {
        if self.connections.remove(&id).is_some() {
            log::info!(
                "[WS] Connection {id} unregistered (remaining: {})",
                self.connections.len()
            );
        }
    }

    /// Records a heartbeat for a connection.
    pub fn heartbeat(&self, id: u64) {
        if let Some(connection) = self.connections.get(&id) {
            *connection.last_heartbeat.lock() = Instant::now();
        }
    }

    /// Number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// True when at least one connection belongs to the consumer.
    #[must_use]
    pub fn has_consumer(&self, consumer_id: &str) -> bool {
        self.connections
            .iter()
            .any(|c| c.value().consumer_id == consumer_id)
    }

    /// Force-closes all connections (shutdown).
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] Force-closing {count} connection(s)");
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }

    /// Spawns the heartbeat checker that drops stale connections.
    pub fn spawn_heartbeat_checker(
        self: &Arc<Self>,
        timeout: Duration,
        check_interval: Duration,
        cancel: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let now = Instant::now();
                let stale: Vec<u64> = manager
                    .connections
                    .iter()
                    .filter(|c| now.duration_since(*c.value().last_heartbeat.lock()) > timeout)
                    .map(|c| *c.key())
                    .collect();
                for id in stale {
                    log::warn!("[WS] Connection {id} missed heartbeats, closing");
                    if let Some((_, connection)) = manager.connections.remove(&id) {
                        connection.cancel.cancel();
                    }
                }
            }
        });
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerNotifier for WsConnectionManager {
    fn notify(&self, consumer_id: &str, event: &ConsumerEvent) {
        // Serialization cannot fail on these closed enum shapes
        let Ok(json) = serde_json::to_string(event) else {
            return;
        };
        for connection in self.connections.iter() {
            if connection.value().consumer_id == consumer_id {
                let _ = connection
                    .value()
                    .outbound
                    .send(WsOutgoing::Event(json.clone()));
            }
        }
    }

    fn notify_binary(&self, consumer_id: &str, frame: Bytes) {
        for connection in self.connections.iter() {
            if connection.value().consumer_id == consumer_id {
                let _ = connection
                    .value()
                    .outbound
                    .send(WsOutgoing::Binary(frame.clone()));
            }
        }
    }
}

/// RAII guard that unregisters a connection when dropped.
pub struct ConnectionGuard {
    id: u64,
    manager: Arc<WsConnectionManager>,
    cancel: CancellationToken,
}

impl ConnectionGuard {
    /// Connection id, for heartbeat bookkeeping.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token cancelled on force-close.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(self.id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Connect-time query parameters.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Consumer identity (user or guild id).
    pub consumer_id: String,
    /// Display name for persistence.
    #[serde(default)]
    pub username: String,
    /// Avatar URL for persistence.
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Client-initiated messages: the command vocabulary.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum WsIncoming {
    Play {
        #[serde(alias = "url", alias = "query")]
        input: String,
    },
    AddToQueue {
        #[serde(alias = "url", alias = "query")]
        input: String,
    },
    PlayFromQueue {
        index: usize,
    },
    Skip,
    Previous,
    Pause,
    Resume,
    ResumeFrom {
        seconds: f64,
    },
    Seek {
        seconds: f64,
    },
    RemoveFromQueue {
        index: usize,
    },
    ClearQueue,
    ResetSession,
    Search {
        query: String,
    },
    Heartbeat,
}

impl WsIncoming {
    /// Maps a wire message onto an orchestrator command. `None` for
    /// transport-level messages (heartbeat).
    fn into_command(self) -> Option<Command> {
        match self {
            Self::Play { input } => Some(Command::Play { input }),
            Self::AddToQueue { input } => Some(Command::AddToQueue { input }),
            Self::PlayFromQueue { index } => Some(Command::PlayFromQueue { index }),
            Self::Skip => Some(Command::Skip),
            Self::Previous => Some(Command::Previous),
            Self::Pause => Some(Command::Pause),
            Self::Resume => Some(Command::Resume),
            // resumeFrom is seek that also implies resuming from an offset
            Self::ResumeFrom { seconds } | Self::Seek { seconds } => {
                Some(Command::Seek { seconds })
            }
            Self::RemoveFromQueue { index } => Some(Command::RemoveFromQueue { index }),
            Self::ClearQueue => Some(Command::ClearQueue),
            Self::ResetSession => Some(Command::ResetSession),
            Self::Search { query } => Some(Command::Search { query }),
            Self::Heartbeat => None,
        }
    }
}

/// Upgrades `/ws?consumer_id=…` to the consumer protocol.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: ConnectParams) {
    let consumer_id = params.consumer_id.clone();
    let (guard, mut outbound_rx) = state.ws_manager.register(&consumer_id);
    let cancel = guard.cancel_token().clone();

    // Initial state snapshot travels back through the notifier
    if let Err(err) = state
        .orchestrator
        .command(
            &consumer_id,
            Command::Connected {
                username: params.username,
                avatar: params.avatar,
            },
        )
        .await
    {
        log::warn!("[WS] Connect rejected for {consumer_id}: {err}");
        let _ = send_error(socket, &err.to_string()).await;
        return;
    }

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            outgoing = outbound_rx.recv() => {
                let Some(outgoing) = outgoing else { break };
                let message = match outgoing {
                    WsOutgoing::Event(json) => Message::Text(json.into()),
                    WsOutgoing::Binary(frame) => Message::Binary(frame),
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }

            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        let parsed: WsIncoming = match serde_json::from_str(&text) {
                            Ok(parsed) => parsed,
                            Err(err) => {
                                log::debug!("[WS] Unparseable message from {consumer_id}: {err}");
                                continue;
                            }
                        };
                        if matches!(parsed, WsIncoming::Heartbeat) {
                            state.ws_manager.heartbeat(guard.id());
                            continue;
                        }
                        if let Some(command) = parsed.into_command() {
                            if let Err(err) =
                                state.orchestrator.command(&consumer_id, command).await
                            {
                                state.ws_manager.notify(
                                    &consumer_id,
                                    &ConsumerEvent::Error {
                                        message: err.to_string(),
                                    },
                                );
                            }
                        }
                    }
                    Message::Ping(_) => state.ws_manager.heartbeat(guard.id()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    drop(guard);
    // Last transport gone: let the session conserve the pipeline
    if !state.ws_manager.has_consumer(&consumer_id) {
        let _ = state
            .orchestrator
            .command(&consumer_id, Command::Disconnected)
            .await;
    }
    log::debug!("[WS] Socket closed for {consumer_id}");
}

async fn send_error(mut socket: WebSocket, message: &str) -> Result<(), axum::Error> {
    let event = ConsumerEvent::Error {
        message: message.to_string(),
    };
    // Closed enum shape; serialization cannot fail
    let json = serde_json::to_string(&event).unwrap_or_default();
    socket.send(Message::Text(json.into())).await?;
    socket.close().await
}
