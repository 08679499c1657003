//! The audio streaming engine: session lifecycle and control surface.
//!
//! The engine owns the `session id → handle` map and enforces at most one
//! extract+transcode pipeline per id. Control requests (play, stop, pause,
//! resume, status) operate on that map; audio and lifecycle events leave
//! through the shared [`FrameWriter`] on the streaming socket.

pub mod extractor;
pub mod session;
pub mod transcoder;

pub use extractor::{ExtractError, Extractor, MediaInfo, PlaylistEntry, PlaylistInfo};
pub use session::{PlayRequest, SessionHandle, SessionState};
pub use transcoder::{TranscodeFormat, Transcoder};

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::io::AsyncWrite;

use crate::error::{BatonError, BatonResult};
use crate::events::EventEmitter;
use crate::state::StreamingConfig;
use crate::transport::FrameWriter;
use crate::utils::validate_session_id;

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionStatus {
    /// Lifecycle state.
    pub state: SessionState,
    /// Audio payload bytes written so far.
    pub bytes_sent: u64,
    /// Whether the pause gate is closed.
    pub paused: bool,
}

/// The engine service.
///
/// Generic over the socket writer so tests can drive it against an
/// in-memory duplex stream.
pub struct Engine<W> {
    sessions: DashMap<String, Arc<SessionHandle>>,
    writer: Arc<FrameWriter<W>>,
    extractor: Extractor,
    transcoder: Transcoder,
    emitter: Arc<dyn EventEmitter>,
    config: StreamingConfig,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Engine<W> {
    /// Creates the engine around a connected streaming-socket writer.
    pub fn new(
        writer: Arc<FrameWriter<W>>,
        extractor: Extractor,
        transcoder: Transcoder,
        emitter: Arc<dyn EventEmitter>,
        config: StreamingConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            writer,
            extractor,
            transcoder,
            emitter,
            config,
        }
    }

    /// Starts playback for a session id.
    ///
    /// Any previous pipeline bound to the id is stopped and fully reaped
    /// first; its final events (if any) precede the new session's on the
    /// socket.
    pub async fn play(&self, id: &str, request: PlayRequest) -> BatonResult<()> {
        validate_session_id(id)?;

        if let Some((_, previous)) = self.sessions.remove(id) {
            previous.stop().await;
        }

        if self.sessions.len() >= self.config.max_concurrent_sessions {
            return Err(BatonError::InvalidRequest(format!(
                "session limit of {} reached",
                self.config.max_concurrent_sessions
            )));
        }

        log::info!(
            "[Engine] play {} url={} format={} start_at={}",
            id,
            request.url,
            request.format.as_str(),
            request.start_at_secs
        );

        let handle = session::spawn_session(
            id.to_string(),
            request,
            self.extractor.clone(),
            self.transcoder.clone(),
            self.writer.clone(),
            self.emitter.clone(),
        );
        self.sessions.insert(id.to_string(), handle);
        Ok(())
    }

    /// Stops a session. Ok regardless of current state; idempotent.
    pub async fn stop(&self, id: &str) {
        if let Some((_, handle)) = self.sessions.remove(id) {
            handle.stop().await;
        }
    }

    /// Closes the pause gate without touching subprocesses.
    pub fn pause(&self, id: &str) -> BatonResult<()> {
        let handle = self
            .sessions
            .get(id)
            .ok_or_else(|| BatonError::SessionNotFound(id.to_string()))?;
        handle.pause();
        Ok(())
    }

    /// Reopens the pause gate. Resume never re-extracts.
    pub fn resume(&self, id: &str) -> BatonResult<()> {
        let handle = self
            .sessions
            .get(id)
            .ok_or_else(|| BatonError::SessionNotFound(id.to_string()))?;
        handle.resume();
        Ok(())
    }

    /// Returns the state and byte counter for a session.
    pub fn status(&self, id: &str) -> BatonResult<SessionStatus> {
        let handle = self
            .sessions
            .get(id)
            .ok_or_else(|| BatonError::SessionNotFound(id.to_string()))?;
        Ok(SessionStatus {
            state: handle.state(),
            bytes_sent: handle.bytes_sent(),
            paused: handle.is_paused(),
        })
    }

    /// Best-effort metadata lookup for an opaque URL.
    pub async fn metadata(&self, url: &str) -> Result<MediaInfo, ExtractError> {
        self.extractor.metadata(url).await
    }

    /// Best-effort playlist listing.
    pub async fn playlist(&self, url: &str) -> Result<PlaylistInfo, ExtractError> {
        self.extractor.playlist(url).await
    }

    /// Best-effort search returning candidate entries.
    pub async fn search(&self, query: &str, count: usize) -> Result<Vec<PlaylistEntry>, ExtractError> {
        self.extractor.search(query, count).await
    }

    /// Number of sessions currently tracked (live or parked).
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stops every session. Used for graceful shutdown.
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let count = ids.len();
        for id in ids {
            self.stop(&id).await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EngineEvent, NoopEventEmitter};
    use crate::transport::{ParsedRecord, RecordParser};
    use tokio::io::AsyncReadExt;

    /// Engine wired to an in-memory duplex socket, plus the read side.
    fn test_engine(
        extractor_cmd: &str,
        transcoder_cmd: &str,
    ) -> (Engine<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (write_half, read_half) = tokio::io::duplex(1024 * 1024);
        let engine = Engine::new(
            Arc::new(FrameWriter::new(write_half)),
            Extractor::with_command(extractor_cmd),
            Transcoder::with_command(transcoder_cmd),
            Arc::new(NoopEventEmitter),
            StreamingConfig::default(),
        );
        (engine, read_half)
    }

    fn play_request() -> PlayRequest {
        PlayRequest {
            url: "https://example.com/watch?v=1".into(),
            format: TranscodeFormat::Pcm,
            start_at_secs: 0.0,
            // Hint present: the extractor takes the --get-url path, which
            // works against stub binaries that print anything at all
            duration_hint_secs: Some(120.0),
        }
    }

    /// Reads parsed records off the socket until `pred` matches one.
    async fn read_until<F>(read_half: &mut tokio::io::DuplexStream, mut pred: F) -> Vec<ParsedRecord>
    where
        F: FnMut(&ParsedRecord) -> bool,
    {
        let mut parser = RecordParser::new();
        let mut collected = Vec::new();
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let n = read_half.read(&mut chunk).await.unwrap();
            assert!(n > 0, "socket closed before expected record");
            for record in parser.push(&chunk[..n]) {
                let done = pred(&record);
                collected.push(record);
                if done {
                    return collected;
                }
            }
        }
    }

    #[tokio::test]
    async fn invalid_id_rejected_before_any_subprocess() {
        let (engine, _read) = test_engine("true", "true");
        let err = engine
            .play(&"x".repeat(64), play_request())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_session_id");
    }

    #[tokio::test]
    async fn extractor_failure_emits_error_event() {
        let (engine, mut read) = test_engine("false", "true");
        engine.play("s1", play_request()).await.unwrap();

        let records = read_until(&mut read, |r| {
            matches!(r, ParsedRecord::Event(EngineEvent::Error { .. }))
        })
        .await;
        let ParsedRecord::Event(EngineEvent::Error { session_id, .. }) = records.last().unwrap()
        else {
            panic!("expected error event");
        };
        assert_eq!(session_id, "s1");

        // Session parks in the Error state until the next play
        let status = engine.status("s1").unwrap();
        assert_eq!(status.state, SessionState::Error);
    }

    #[tokio::test]
    async fn empty_transcode_finishes_with_zero_bytes() {
        // `echo` resolves a fake URL; `true` produces EOF with exit 0
        let (engine, mut read) = test_engine("echo", "true");
        engine.play("s1", play_request()).await.unwrap();

        let records = read_until(&mut read, |r| {
            matches!(r, ParsedRecord::Event(EngineEvent::Finished { .. }))
        })
        .await;
        let ParsedRecord::Event(EngineEvent::Finished { session_id, bytes }) =
            records.last().unwrap()
        else {
            panic!("expected finished event");
        };
        assert_eq!(session_id, "s1");
        assert_eq!(*bytes, 0);
    }

    #[tokio::test]
    async fn streaming_pipeline_emits_ready_then_frames() {
        // `yes` floods stdout forever: a stand-in endless transcode
        let (engine, mut read) = test_engine("echo", "yes");
        engine.play("s1", play_request()).await.unwrap();

        let records = read_until(&mut read, |r| matches!(r, ParsedRecord::Audio { .. })).await;

        // ready strictly precedes the first audio record
        let ready_pos = records
            .iter()
            .position(|r| matches!(r, ParsedRecord::Event(EngineEvent::Ready { .. })))
            .expect("ready event");
        let audio_pos = records
            .iter()
            .position(|r| matches!(r, ParsedRecord::Audio { .. }))
            .expect("audio record");
        assert!(ready_pos < audio_pos);

        let ParsedRecord::Audio { session_id, payload } = &records[audio_pos] else {
            unreachable!()
        };
        assert_eq!(session_id, "s1");
        assert!(!payload.is_empty());

        assert_eq!(engine.status("s1").unwrap().state, SessionState::Streaming);
        assert!(engine.bytes_flowing("s1").await);

        engine.stop("s1").await;
        assert!(engine.status("s1").is_err());
    }

    #[tokio::test]
    async fn pause_withholds_reads_and_resume_restores() {
        let (engine, mut read) = test_engine("echo", "yes");
        engine.play("s1", play_request()).await.unwrap();

        // Wait for streaming to begin
        let _ = read_until(&mut read, |r| matches!(r, ParsedRecord::Audio { .. })).await;

        engine.pause("s1").unwrap();
        assert!(engine.status("s1").unwrap().paused);

        // Drain what was in flight, then the counter must hold still
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drain_available(&mut read).await;
        let frozen = engine.status("s1").unwrap().bytes_sent;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(engine.status("s1").unwrap().bytes_sent, frozen);

        engine.resume("s1").unwrap();
        assert!(!engine.status("s1").unwrap().paused);
        assert!(engine.bytes_flowing("s1").await);

        engine.stop("s1").await;
    }

    #[tokio::test]
    async fn play_replaces_previous_session() {
        let (engine, mut read) = test_engine("echo", "yes");
        engine.play("s1", play_request()).await.unwrap();
        let _ = read_until(&mut read, |r| matches!(r, ParsedRecord::Audio { .. })).await;

        // Rebind the same id; the old pipeline is reaped first
        engine.play("s1", play_request()).await.unwrap();
        assert_eq!(engine.session_count(), 1);

        engine.stop("s1").await;
    }

    #[tokio::test]
    async fn double_stop_is_idempotent() {
        let (engine, _read) = test_engine("echo", "true");
        engine.play("s1", play_request()).await.unwrap();
        engine.stop("s1").await;
        engine.stop("s1").await;
        assert_eq!(engine.session_count(), 0);
    }

    #[tokio::test]
    async fn stop_all_reaps_every_session() {
        let (engine, mut read) = test_engine("echo", "yes");
        engine.play("a", play_request()).await.unwrap();
        engine.play("b", play_request()).await.unwrap();

        // Keep the socket drained so neither session blocks on the writer
        let drain = tokio::spawn(async move {
            let mut chunk = vec![0u8; 16 * 1024];
            while read.read(&mut chunk).await.unwrap_or(0) > 0 {}
        });

        assert_eq!(engine.stop_all().await, 2);
        assert_eq!(engine.session_count(), 0);
        drain.abort();
    }

    /// Reads whatever is immediately available, without blocking long.
    async fn drain_available(read_half: &mut tokio::io::DuplexStream) {
        let mut chunk = vec![0u8; 64 * 1024];
        while let Ok(Ok(n)) = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            read_half.read(&mut chunk),
        )
        .await
        {
            if n == 0 {
                break;
            }
        }
    }

    impl<W: AsyncWrite + Unpin + Send + 'static> Engine<W> {
        /// True when the session's byte counter advances within 200 ms.
        async fn bytes_flowing(&self, id: &str) -> bool {
            let before = self.status(id).unwrap().bytes_sent;
            for _ in 0..20 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                if self.status(id).unwrap().bytes_sent > before {
                    return true;
                }
            }
            false
        }
    }
}
