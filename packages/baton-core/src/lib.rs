//! Baton Core - shared library for the Baton audio streaming service.
//!
//! Baton turns opaque media URLs (video sites, playlists) into continuously
//! decoded compressed audio streams and delivers them, fan-out and
//! per-session, to voice-chat relays and browser players. This crate holds
//! everything shared between the two processes:
//!
//! # Architecture
//!
//! - [`engine`]: per-session playback pipelines - extractor and transcoder
//!   subprocess supervision, framed audio output, seek and pause/resume
//! - [`orchestrator`]: per-consumer sessions - queues, the transition
//!   debouncer/serializer, deferred URL resolution, persistence
//! - [`transport`]: the framed streaming socket - length-prefixed audio
//!   records and newline-delimited events, demuxed to per-session sinks
//! - [`client`]: consumer-side adapters - pass-through, jitter buffer, and
//!   the browser's paced scheduler
//! - [`api`]: the engine control plane (HTTP) and the consumer WebSocket
//! - [`events`]: engine lifecycle and consumer-facing event types
//! - [`state`]: configuration shared by both processes
//! - [`error`]: centralized error types
//!
//! # Abstraction Traits
//!
//! - [`EventEmitter`](events::EventEmitter): observing domain events
//! - [`SessionStore`](orchestrator::SessionStore): durable queue state
//! - [`ConsumerNotifier`](orchestrator::ConsumerNotifier): delivery toward
//!   attached consumer transports
//!
//! Each trait has a default implementation suitable for the standalone
//! binaries; tests substitute captures.

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod client;
pub mod engine;
pub mod error;
pub mod events;
pub mod ogg;
pub mod orchestrator;
pub mod protocol_constants;
pub mod state;
pub mod transport;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{consumer_router, serve, AppState, ServerError, WsConnectionManager};
pub use bootstrap::{
    bootstrap_engine, bootstrap_orchestrator, EngineServices, OrchestratorServices,
};
pub use error::{BatonError, BatonResult, ErrorCode};
pub use events::{ConsumerEvent, EngineEvent, EventEmitter, LoggingEventEmitter, NoopEventEmitter};
pub use state::{AdapterMode, Config, StreamingConfig};
pub use utils::{now_iso8601, validate_session_id, IdValidationError};

// Re-export engine types
pub use engine::{Engine, Extractor, PlayRequest, SessionState, TranscodeFormat, Transcoder};

// Re-export orchestrator types
pub use orchestrator::{
    Command, ConsumerNotifier, EngineClient, Orchestrator, PersistedSession, SessionStore, Track,
    TrackQueue,
};

// Re-export transport types
pub use transport::{FrameWriter, RecordParser, SinkRegistry, SocketReader};

// Re-export client types
pub use client::{JitterBuffer, PassthroughAdapter, PlaybackScheduler};
