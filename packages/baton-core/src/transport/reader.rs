//! Streaming-socket reader: record parsing, demux, and per-session sinks.
//!
//! The parser is a pure state machine over an internal buffer so it can be
//! tested byte-at-a-time without a socket; [`SocketReader`] drives it from
//! an `AsyncRead` and dispatches the results.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc};

use crate::events::EngineEvent;
use crate::protocol_constants::{MAX_RECORD_LEN, RECORD_LEN_PREFIX, SESSION_ID_LEN};
use crate::transport::frame::split_record;

/// Read buffer size for one socket read.
const READ_CHUNK: usize = 16 * 1024;

/// One parsed record from the socket stream.
#[derive(Debug, PartialEq)]
pub enum ParsedRecord {
    /// Demuxed audio payload for a session.
    Audio {
        /// Engine session id from the record header.
        session_id: String,
        /// Audio payload (header stripped).
        payload: Bytes,
    },
    /// A lifecycle event.
    Event(EngineEvent),
}

/// Parser states. The reader alternates between waiting for a record
/// header (or event byte) and waiting for a known-length audio body.
enum ParseState {
    ExpectHeader,
    ExpectAudioBody { len: usize },
}

/// Incremental parser for the interleaved audio/event stream.
///
/// Malformed records (length outside bounds, unparseable JSON) are logged
/// once, dropped, and the parser resyncs on the following record.
pub struct RecordParser {
    buf: BytesMut,
    state: ParseState,
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            state: ParseState::ExpectHeader,
        }
    }

    /// Appends bytes and returns every record they complete, in order.
    pub fn push(&mut self, data: &[u8]) -> Vec<ParsedRecord> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(record) = self.advance() {
            out.push(record);
        }
        out
    }

    /// Attempts one state-machine step. Returns `None` when more bytes are
    /// needed (or a malformed record was dropped and the loop should retry
    /// via the outer `while`).
    fn advance(&mut self) -> Option<ParsedRecord> {
        loop {
            match self.state {
                ParseState::ExpectHeader => {
                    match self.buf.first().copied() {
                        None => return None,
                        Some(b'\n') => {
                            self.buf.advance(1);
                            continue;
                        }
                        Some(b'{') => {
                            let end = find_json_end(&self.buf)?;
                            let raw = self.buf.split_to(end + 1);
                            match serde_json::from_slice::<EngineEvent>(&raw) {
                                Ok(event) => return Some(ParsedRecord::Event(event)),
                                Err(err) => {
                                    log::warn!("[Transport] Dropping unparseable event: {err}");
                                    continue;
                                }
                            }
                        }
                        Some(_) => {
                            if self.buf.len() < RECORD_LEN_PREFIX {
                                return None;
                            }
                            let len = u32::from_be_bytes([
                                self.buf[0],
                                self.buf[1],
                                self.buf[2],
                                self.buf[3],
                            ]) as usize;
                            self.buf.advance(RECORD_LEN_PREFIX);

                            if len > MAX_RECORD_LEN {
                                log::warn!(
                                    "[Transport] Framing error: record length {len} exceeds cap, resyncing"
                                );
                                continue;
                            }
                            self.state = ParseState::ExpectAudioBody { len };
                        }
                    }
                }
                ParseState::ExpectAudioBody { len } => {
                    if self.buf.len() < len {
                        return None;
                    }
                    let body = self.buf.split_to(len).freeze();
                    self.state = ParseState::ExpectHeader;

                    if len < SESSION_ID_LEN {
                        log::warn!(
                            "[Transport] Framing error: {len}-byte record below id header, dropped"
                        );
                        continue;
                    }
                    // split_record cannot fail past the length check above
                    let (session_id, payload) = split_record(body).ok()?;
                    return Some(ParsedRecord::Audio {
                        session_id,
                        payload,
                    });
                }
            }
        }
    }
}

/// Finds the end index of a brace-matched JSON object starting at `buf[0]`.
///
/// Tracks string literals and escapes so braces inside values don't
/// terminate early. Returns `None` when the object is still incomplete.
fn find_json_end(buf: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in buf.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Per-session audio sinks on the consumer side.
///
/// Each sink is a bounded byte channel; sending awaits capacity, which is
/// how socket back-pressure propagates to the engine. A record for an
/// unregistered session is dropped with a debug log — late packets from a
/// stopped session are expected, not an error.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: DashMap<String, mpsc::Sender<Bytes>>,
}

impl SinkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh sink for a session, returning its receiving end.
    ///
    /// Any previous sink under the same id is replaced; its receiver sees
    /// a closed channel.
    pub fn register(&self, session_id: &str, capacity: usize) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(capacity);
        self.sinks.insert(session_id.to_string(), tx);
        rx
    }

    /// Removes the sink for a session.
    pub fn remove(&self, session_id: &str) {
        self.sinks.remove(session_id);
    }

    /// Returns true if a sink is registered for the session.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sinks.contains_key(session_id)
    }

    /// Delivers audio bytes to the session's sink, awaiting capacity.
    pub async fn deliver(&self, session_id: &str, payload: Bytes) {
        // Clone the sender out so the map guard is not held across await
        let sender = self.sinks.get(session_id).map(|s| s.value().clone());
        match sender {
            Some(tx) => {
                if tx.send(payload).await.is_err() {
                    log::debug!("[Transport] Sink for {session_id} closed, dropping record");
                    self.sinks
                        .remove_if(session_id, |_, stored| stored.is_closed());
                }
            }
            None => {
                log::debug!("[Transport] No sink for {session_id}, dropping record");
            }
        }
    }
}

/// Drives the [`RecordParser`] from the streaming socket and dispatches:
/// audio to the [`SinkRegistry`], events to a broadcast channel.
pub struct SocketReader {
    sinks: Arc<SinkRegistry>,
    events_tx: broadcast::Sender<EngineEvent>,
}

impl SocketReader {
    /// Creates a reader dispatching into the given registry and event channel.
    pub fn new(sinks: Arc<SinkRegistry>, events_tx: broadcast::Sender<EngineEvent>) -> Self {
        Self { sinks, events_tx }
    }

    /// Subscribes to the engine event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    /// Reads the socket until EOF or error, dispatching every record.
    ///
    /// Returns `Ok(())` on clean EOF (engine shut down).
    pub async fn run<R: AsyncRead + Unpin>(&self, mut reader: R) -> std::io::Result<()> {
        let mut parser = RecordParser::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                log::info!("[Transport] Streaming socket EOF");
                return Ok(());
            }
            for record in parser.push(&chunk[..n]) {
                match record {
                    ParsedRecord::Audio {
                        session_id,
                        payload,
                    } => {
                        self.sinks.deliver(&session_id, payload).await;
                    }
                    ParsedRecord::Event(event) => {
                        log::debug!(
                            "[Transport] Event {:?} for {}",
                            event,
                            event.session_id()
                        );
                        // No subscribers is fine during startup
                        let _ = self.events_tx.send(event);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::pad_session_id;

    fn audio_record(id: &str, payload: &[u8]) -> Vec<u8> {
        let body_len = SESSION_ID_LEN + payload.len();
        let mut rec = Vec::new();
        rec.extend_from_slice(&(body_len as u32).to_be_bytes());
        rec.extend_from_slice(&pad_session_id(id));
        rec.extend_from_slice(payload);
        rec
    }

    // ─────────────────────────────────────────────────────────────────────────
    // RecordParser
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn parses_audio_record() {
        let mut parser = RecordParser::new();
        let records = parser.push(&audio_record("s1", b"pcm"));
        assert_eq!(
            records,
            vec![ParsedRecord::Audio {
                session_id: "s1".into(),
                payload: Bytes::from_static(b"pcm"),
            }]
        );
    }

    #[test]
    fn parses_event_between_newlines() {
        let mut parser = RecordParser::new();
        let records = parser.push(b"\n\n{\"type\":\"ready\",\"session_id\":\"s1\"}\n");
        assert_eq!(
            records,
            vec![ParsedRecord::Event(EngineEvent::Ready {
                session_id: "s1".into()
            })]
        );
    }

    #[test]
    fn event_chunked_across_three_reads_assembles() {
        let mut parser = RecordParser::new();
        let event = b"{\"type\":\"finished\",\"session_id\":\"s1\",\"bytes\":77}";
        assert!(parser.push(&event[..10]).is_empty());
        assert!(parser.push(&event[10..30]).is_empty());
        let records = parser.push(&event[30..]);
        assert_eq!(
            records,
            vec![ParsedRecord::Event(EngineEvent::Finished {
                session_id: "s1".into(),
                bytes: 77,
            })]
        );
    }

    #[test]
    fn interleaved_audio_and_events_stay_ordered() {
        let mut parser = RecordParser::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(b"{\"type\":\"ready\",\"session_id\":\"s1\"}\n");
        stream.extend_from_slice(&audio_record("s1", b"frame-a"));
        stream.extend_from_slice(&audio_record("s1", b"frame-b"));
        stream.extend_from_slice(b"{\"type\":\"finished\",\"session_id\":\"s1\",\"bytes\":14}\n");

        let records = parser.push(&stream);
        assert_eq!(records.len(), 4);
        assert!(matches!(records[0], ParsedRecord::Event(EngineEvent::Ready { .. })));
        assert!(matches!(records[1], ParsedRecord::Audio { .. }));
        assert!(matches!(records[2], ParsedRecord::Audio { .. }));
        assert!(matches!(
            records[3],
            ParsedRecord::Event(EngineEvent::Finished { .. })
        ));
    }

    #[test]
    fn short_record_dropped_then_resyncs() {
        let mut parser = RecordParser::new();
        // 10-byte body: below the 24-byte id header
        let mut stream = Vec::new();
        stream.extend_from_slice(&10u32.to_be_bytes());
        stream.extend_from_slice(&[0xAA; 10]);
        stream.extend_from_slice(&audio_record("s2", b"good"));

        let records = parser.push(&stream);
        assert_eq!(
            records,
            vec![ParsedRecord::Audio {
                session_id: "s2".into(),
                payload: Bytes::from_static(b"good"),
            }]
        );
    }

    #[test]
    fn unparseable_event_dropped_then_resyncs() {
        let mut parser = RecordParser::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(b"{\"type\":\"bogus\"}\n");
        stream.extend_from_slice(b"{\"type\":\"ready\",\"session_id\":\"s3\"}\n");

        let records = parser.push(&stream);
        assert_eq!(
            records,
            vec![ParsedRecord::Event(EngineEvent::Ready {
                session_id: "s3".into()
            })]
        );
    }

    #[test]
    fn braces_inside_strings_do_not_terminate() {
        let mut parser = RecordParser::new();
        let records = parser.push(
            b"{\"type\":\"error\",\"session_id\":\"s\",\"message\":\"bad } \\\" {{\"}\n",
        );
        assert_eq!(
            records,
            vec![ParsedRecord::Event(EngineEvent::Error {
                session_id: "s".into(),
                message: "bad } \" {{".into(),
            })]
        );
    }

    #[test]
    fn byte_at_a_time_audio_assembles() {
        let mut parser = RecordParser::new();
        let record = audio_record("slow", b"x");
        let mut collected = Vec::new();
        for b in &record {
            collected.extend(parser.push(std::slice::from_ref(b)));
        }
        assert_eq!(collected.len(), 1);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // SinkRegistry
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn delivers_to_registered_sink() {
        let registry = SinkRegistry::new();
        let mut rx = registry.register("s1", 4);

        registry.deliver("s1", Bytes::from_static(b"audio")).await;
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"audio"));
    }

    #[tokio::test]
    async fn unknown_session_dropped_silently() {
        let registry = SinkRegistry::new();
        // Must not panic or block
        registry.deliver("ghost", Bytes::from_static(b"late")).await;
    }

    #[tokio::test]
    async fn re_register_replaces_sink() {
        let registry = SinkRegistry::new();
        let mut old_rx = registry.register("s1", 4);
        let mut new_rx = registry.register("s1", 4);

        registry.deliver("s1", Bytes::from_static(b"fresh")).await;
        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.recv().await.unwrap(), Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn closed_sink_is_pruned() {
        let registry = SinkRegistry::new();
        let rx = registry.register("s1", 4);
        drop(rx);

        registry.deliver("s1", Bytes::from_static(b"x")).await;
        assert!(!registry.contains("s1"));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // SocketReader end-to-end
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reader_dispatches_stream() {
        let sinks = Arc::new(SinkRegistry::new());
        let (events_tx, mut events_rx) = broadcast::channel(16);
        let reader = SocketReader::new(sinks.clone(), events_tx);
        let mut audio_rx = sinks.register("s1", 16);

        let mut stream = Vec::new();
        stream.extend_from_slice(b"{\"type\":\"ready\",\"session_id\":\"s1\"}\n");
        stream.extend_from_slice(&audio_record("s1", b"frame"));
        stream.extend_from_slice(b"{\"type\":\"finished\",\"session_id\":\"s1\",\"bytes\":5}\n");

        reader.run(&stream[..]).await.unwrap();

        assert_eq!(
            events_rx.recv().await.unwrap(),
            EngineEvent::Ready {
                session_id: "s1".into()
            }
        );
        assert_eq!(audio_rx.recv().await.unwrap(), Bytes::from_static(b"frame"));
        assert_eq!(
            events_rx.recv().await.unwrap(),
            EngineEvent::Finished {
                session_id: "s1".into(),
                bytes: 5,
            }
        );
    }
}
