//! Framed streaming-socket transport shared by the engine and orchestrator.
//!
//! The engine writes two interleaved record kinds on one unix-domain
//! socket: length-prefixed audio records and newline-delimited JSON event
//! records. The orchestrator side parses that stream back apart and demuxes
//! audio to per-session sinks.
//!
//! The transport is stateless beyond its parse cursor and the sink
//! registry; session semantics live in the engine and orchestrator.

pub mod frame;
pub mod reader;

pub use frame::{pad_session_id, split_record, FrameError, FrameWriter};
pub use reader::{ParsedRecord, RecordParser, SinkRegistry, SocketReader};
