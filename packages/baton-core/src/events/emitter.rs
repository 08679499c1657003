//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than concrete
//! sockets or channels, enabling testing and alternative delivery paths.
//! Transport delivery (the streaming socket, the consumer WebSocket) happens
//! separately; this trait exists for observability and test capture.

use super::{ConsumerEvent, EngineEvent};

/// Trait for emitting domain events without knowledge of transport.
///
/// The engine calls [`emit_engine`](Self::emit_engine) alongside every event
/// it writes to the streaming socket; the orchestrator calls
/// [`emit_consumer`](Self::emit_consumer) alongside every WebSocket send.
pub trait EventEmitter: Send + Sync {
    /// Emits an engine lifecycle event.
    fn emit_engine(&self, event: &EngineEvent);

    /// Emits a consumer-facing event for the given consumer id.
    fn emit_consumer(&self, consumer_id: &str, event: &ConsumerEvent);
}

/// No-op emitter for production binaries.
///
/// Events reach their consumers via the socket and WebSocket; nothing else
/// needs a copy.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_engine(&self, _event: &EngineEvent) {
        // No-op: the streaming socket is the delivery path
    }

    fn emit_consumer(&self, _consumer_id: &str, _event: &ConsumerEvent) {
        // No-op
    }
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level. Useful for debugging event flow.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_engine(&self, event: &EngineEvent) {
        tracing::debug!(?event, "engine_event");
    }

    fn emit_consumer(&self, consumer_id: &str, event: &ConsumerEvent) {
        tracing::debug!(consumer_id, ?event, "consumer_event");
    }
}
