//! Event system for engine lifecycle and consumer communication.
//!
//! Two event families travel through baton:
//!
//! - [`EngineEvent`]: lifecycle events the engine writes on the streaming
//!   socket, interleaved with audio records (snake_case JSON, newline
//!   delimited). The orchestrator parses these to drive auto-advance.
//! - [`ConsumerEvent`]: server-initiated messages delivered to consumers
//!   over the WebSocket (camelCase JSON, matching the client protocol).
//!
//! The [`EventEmitter`] trait decouples services from transport so tests
//! can capture emissions without a socket.

mod emitter;

pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::{Deserialize, Serialize};

use crate::orchestrator::queue::{QueueSnapshot, Track};
use crate::orchestrator::resolver::SearchCandidate;

/// Lifecycle events emitted by the engine on the streaming socket.
///
/// For a given session id, events are totally ordered with that session's
/// audio records: `ready` precedes the first record, `finished`/`error`
/// follow the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The pipeline produced its first audio frame.
    Ready {
        /// Engine session id.
        session_id: String,
    },
    /// The transcoder reached EOF with exit status 0.
    Finished {
        /// Engine session id.
        session_id: String,
        /// Total audio payload bytes sent for the session.
        #[serde(default)]
        bytes: u64,
    },
    /// The pipeline failed; the session has been torn down.
    Error {
        /// Engine session id.
        session_id: String,
        /// Human-readable cause.
        message: String,
    },
}

impl EngineEvent {
    /// Returns the session id the event belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Ready { session_id }
            | Self::Finished { session_id, .. }
            | Self::Error { session_id, .. } => session_id,
        }
    }
}

/// Server-initiated messages delivered to a consumer over the WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ConsumerEvent {
    /// Initial snapshot sent on connect: the persisted queue and playback
    /// bookkeeping.
    State {
        queue: QueueSnapshot,
        is_paused: bool,
        playback_offset_secs: f64,
    },
    /// The queue contents or index changed.
    QueueUpdated { queue: QueueSnapshot },
    /// A track transitioned to the front of playback.
    NowPlaying { track: Track },
    /// A new engine session was bound for this consumer.
    Session { session_id: String },
    /// The engine reported first audio for the active session.
    Ready { session_id: String },
    /// Periodic playback position report (throttled).
    Progress {
        playback_secs: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_secs: Option<f64>,
        bytes_sent: u64,
    },
    /// Playback paused.
    Paused,
    /// Playback resumed.
    Resumed,
    /// The active track finished naturally.
    Finished { bytes: u64 },
    /// Playback was stopped by request.
    Stopped,
    /// The queue ran out; playback is idle.
    QueueFinished,
    /// A command failed; `message` is user-visible.
    Error { message: String },
    /// Scored candidates for a search query.
    SearchResults { results: Vec<SearchCandidate> },
    /// The session and its persisted record were discarded.
    SessionReset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_event_wire_shape() {
        let event = EngineEvent::Finished {
            session_id: "guild-1".into(),
            bytes: 4096,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "finished");
        assert_eq!(json["session_id"], "guild-1");
        assert_eq!(json["bytes"], 4096);
    }

    #[test]
    fn engine_event_round_trips() {
        let event = EngineEvent::Error {
            session_id: "g".into(),
            message: "boom".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn finished_bytes_defaults_to_zero() {
        let parsed: EngineEvent =
            serde_json::from_str(r#"{"type":"finished","session_id":"s"}"#).unwrap();
        assert_eq!(
            parsed,
            EngineEvent::Finished {
                session_id: "s".into(),
                bytes: 0
            }
        );
    }

    #[test]
    fn session_id_accessor_covers_variants() {
        let ready = EngineEvent::Ready {
            session_id: "a".into(),
        };
        assert_eq!(ready.session_id(), "a");
    }

    #[test]
    fn consumer_event_uses_camel_case() {
        let event = ConsumerEvent::QueueFinished;
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "queueFinished");

        let event = ConsumerEvent::Progress {
            playback_secs: 12.5,
            duration_secs: None,
            bytes_sent: 100,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["playbackSecs"], 12.5);
        assert_eq!(json["bytesSent"], 100);
        assert!(json.get("durationSecs").is_none());
    }
}
