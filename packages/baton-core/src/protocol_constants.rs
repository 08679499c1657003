//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the wire protocol shared between the engine
//! and the orchestrator, or by audio standards. Changing them breaks
//! interoperability between deployed processes.

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Socket Wire Layout
// ─────────────────────────────────────────────────────────────────────────────

/// Length of the big-endian record-length prefix on the streaming socket (bytes).
pub const RECORD_LEN_PREFIX: usize = 4;

/// Length of the ASCII session-id header inside every audio record (bytes).
///
/// Shorter ids are right-padded with spaces. Ids longer than this are
/// rejected at session creation.
pub const SESSION_ID_LEN: usize = 24;

/// Maximum accepted audio record length (bytes).
///
/// Anything larger is treated as a framing error and the reader resyncs.
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Audio Standards
// ─────────────────────────────────────────────────────────────────────────────

/// Output sample rate for every transcode (Hz).
///
/// 48kHz is the Opus native rate and the voice-chat consumer's expectation.
pub const SAMPLE_RATE: u32 = 48_000;

/// Output channel count (stereo).
pub const CHANNELS: u16 = 2;

/// Opus frame duration produced by the transcoder (milliseconds).
pub const FRAME_DURATION_MS: u64 = 20;

/// Opus bitrate requested from the transcoder.
pub const OPUS_BITRATE: &str = "128k";

/// Chunk size for the PCM read-encode-write loop (bytes).
///
/// ~4 KiB keeps records small enough that socket back-pressure engages
/// quickly on a slow consumer.
pub const PCM_CHUNK_SIZE: usize = 4096;

// ─────────────────────────────────────────────────────────────────────────────
// Subprocess Supervision
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded timeout for one extractor invocation (seconds).
pub const EXTRACT_TIMEOUT_SECS: u64 = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator Timing
// ─────────────────────────────────────────────────────────────────────────────

/// Transition debounce window (milliseconds).
///
/// Commands that initiate a new playback within this window coalesce into
/// a single engine transition.
pub const TRANSITION_DEBOUNCE_MS: u64 = 150;

/// Bounded wait for the client adapter to drain before auto-advance (milliseconds).
pub const ADVANCE_DRAIN_WAIT_MS: u64 = 500;

/// Coalescing window for persistence writes (milliseconds).
pub const PERSIST_THROTTLE_MS: u64 = 1000;

// ─────────────────────────────────────────────────────────────────────────────
// Client Adapter
// ─────────────────────────────────────────────────────────────────────────────

/// Frames buffered before the jitter buffer starts paced output.
///
/// 25 × 20 ms = 500 ms of audio, enough to absorb arrival-time variance
/// from the extraction pipeline.
pub const JITTER_PRIME_FRAMES: usize = 25;

/// Consecutive underruns before the jitter buffer logs once.
pub const SUSTAINED_UNDERRUN_FRAMES: u32 = 10;

/// Initial buffer the browser scheduler fills before starting (seconds).
pub const INITIAL_BUFFER_SECONDS: f64 = 0.5;

/// Scheduled-ahead target maintained by the browser scheduler (seconds).
pub const SCHEDULE_AHEAD_SECONDS: f64 = 0.4;

/// Hard cap on buffered audio in the browser scheduler (seconds).
///
/// Beyond this the oldest frames are dropped and the reported position
/// advances by the dropped duration.
pub const SCHEDULE_CAP_SECONDS: f64 = 2.0;

/// Minimum interval between UI progress reports (milliseconds), ≈ 4 Hz.
pub const PROGRESS_THROTTLE_MS: u64 = 250;

/// Time constant for the gain ramp (milliseconds).
pub const GAIN_RAMP_MS: f64 = 10.0;

// ─────────────────────────────────────────────────────────────────────────────
// Consumer WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket heartbeat timeout (seconds).
pub const WS_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Interval between WebSocket heartbeat checks (seconds).
pub const WS_HEARTBEAT_CHECK_INTERVAL_SECS: u64 = 1;

/// Capacity of the engine-event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of each per-session audio sink channel (records).
pub const SINK_CHANNEL_CAPACITY: usize = 64;

/// Maximum tracks appended from one playlist expansion.
pub const PLAYLIST_EXPANSION_CAP: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by the health endpoints.
///
/// The orchestrator probes the engine's `/health` and expects this exact
/// string before it starts routing playback.
pub const SERVICE_ID: &str = "baton";
