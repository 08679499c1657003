//! Core application state types.
//!
//! Provides configuration ([`Config`], [`StreamingConfig`]) shared by the
//! engine and orchestrator processes. Validation happens once at startup;
//! a bad configuration is the only fatal error class.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::utils::validate_session_id;

/// Which client adapter variant serves attached consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterMode {
    /// Container bytes written unchanged; the voice-chat library demuxes.
    #[default]
    Passthrough,
    /// Raw 20 ms frames through the jitter buffer, decoded to PCM.
    Jitter,
    /// Browser playback: container bytes paced by the scheduler over the
    /// consumer WebSocket.
    Browser,
}

/// Configuration for audio streaming behavior.
///
/// Groups related streaming parameters that control concurrency and
/// channel capacity.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamingConfig {
    /// Maximum number of concurrent engine sessions.
    pub max_concurrent_sessions: usize,

    /// Capacity of each per-session audio sink channel (records).
    pub sink_channel_capacity: usize,

    /// Capacity of the engine-event broadcast channel.
    pub event_channel_capacity: usize,
}

impl StreamingConfig {
    /// Creates a new `StreamingConfig` with validated values.
    ///
    /// # Errors
    ///
    /// Returns an error if any value would cause runtime issues.
    pub fn new(
        max_concurrent_sessions: usize,
        sink_channel_capacity: usize,
        event_channel_capacity: usize,
    ) -> Result<Self, String> {
        let config = Self {
            max_concurrent_sessions,
            sink_channel_capacity,
            event_channel_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_sessions == 0 {
            return Err("max_concurrent_sessions must be >= 1".to_string());
        }
        if self.sink_channel_capacity == 0 {
            return Err("sink_channel_capacity must be >= 1".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err(
                "event_channel_capacity must be >= 1 (broadcast::channel panics on 0)".to_string(),
            );
        }
        Ok(())
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 32,
            sink_channel_capacity: crate::protocol_constants::SINK_CHANNEL_CAPACITY,
            event_channel_capacity: crate::protocol_constants::EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Configuration shared by the Baton processes.
///
/// All fields have sensible defaults except `socket_path`, which has a
/// conventional default location but must be non-empty.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Filesystem path for the engine's streaming socket.
    pub socket_path: PathBuf,

    /// TCP port for the engine's HTTP control plane.
    pub control_port: u16,

    /// TCP port for the orchestrator's consumer WebSocket server.
    pub consumer_port: u16,

    /// Directory for the persisted session store.
    ///
    /// `None` disables persistence; queues live only in memory.
    pub data_dir: Option<PathBuf>,

    /// Client adapter variant for attached consumers.
    #[serde(default)]
    pub adapter: AdapterMode,

    /// Optional whitelist of consumer ids. Empty means all ids are accepted.
    #[serde(default)]
    pub allowed_ids: Vec<String>,

    /// Streaming configuration.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// WebSocket heartbeat timeout (seconds).
    pub ws_heartbeat_timeout_secs: u64,

    /// Interval between WebSocket heartbeat checks (seconds).
    pub ws_heartbeat_check_interval_secs: u64,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message describing the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.socket_path.as_os_str().is_empty() {
            return Err("socket_path must not be empty".to_string());
        }
        if self.control_port == 0 {
            return Err("control_port must be non-zero".to_string());
        }
        if self.consumer_port == 0 {
            return Err("consumer_port must be non-zero".to_string());
        }
        for id in &self.allowed_ids {
            validate_session_id(id).map_err(|e| format!("allowed_ids entry {id:?}: {e}"))?;
        }
        self.streaming.validate()
    }

    /// Returns true when `consumer_id` may drive a session.
    #[must_use]
    pub fn id_allowed(&self, consumer_id: &str) -> bool {
        self.allowed_ids.is_empty() || self.allowed_ids.iter().any(|id| id == consumer_id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/baton-stream.sock"),
            control_port: 49500,
            consumer_port: 49501,
            data_dir: None,
            adapter: AdapterMode::default(),
            allowed_ids: Vec::new(),
            streaming: StreamingConfig::default(),
            ws_heartbeat_timeout_secs: crate::protocol_constants::WS_HEARTBEAT_TIMEOUT_SECS,
            ws_heartbeat_check_interval_secs:
                crate::protocol_constants::WS_HEARTBEAT_CHECK_INTERVAL_SECS,
        }
    }
}
