//! Per-session playback pipeline: extract, transcode, frame, emit.
//!
//! Each live session runs one task owning both subprocesses. The session
//! state machine is a closed vocabulary:
//!
//! ```text
//! Idle ──play──▶ Extracting ──url ok──▶ Transcoding ──first frame──▶ Streaming
//!   ▲                │                    │                            │
//!   │                └─extract fail──▶ Error                           │
//!   │                                     └─transcode fail──▶ Error    │
//!   └─────────── stop / natural finish / error ◀───────────────────────┘
//! ```
//!
//! Stop is the universal cancel: subprocesses are killed and reaped on
//! every exit path, and a stopped session emits no further events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::extractor::Extractor;
use crate::engine::transcoder::{Transcoder, TranscodeFormat, TranscoderProcess};
use crate::events::{EngineEvent, EventEmitter};
use crate::ogg::{is_opus_header, OggPacketReader, OggPageSplitter};
use crate::protocol_constants::PCM_CHUNK_SIZE;
use crate::transport::FrameWriter;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No pipeline bound.
    Idle,
    /// Extractor resolving the opaque URL.
    Extracting,
    /// Transcoder spawned, no audio produced yet.
    Transcoding,
    /// Audio records flowing.
    Streaming,
    /// Pipeline failed; terminal until the next play.
    Error,
}

/// Parameters of one `play` request.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    /// Opaque media URL to materialize.
    pub url: String,
    /// Output variant.
    pub format: TranscodeFormat,
    /// Seconds to skip before encoding.
    pub start_at_secs: f64,
    /// Known duration; when present the metadata roundtrip is skipped.
    pub duration_hint_secs: Option<f64>,
}

/// State observable from outside the pipeline task.
pub(crate) struct SessionShared {
    state: Mutex<SessionState>,
    bytes_sent: AtomicU64,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            bytes_sent: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }
}

/// Handle to one live (or finished) session.
///
/// Owned by the engine's session map; commands flip the pause gate or
/// trigger the cancellation token, never touching the pipeline's internals.
pub struct SessionHandle {
    id: String,
    shared: Arc<SessionShared>,
    pause_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Audio payload bytes written so far.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    /// True while the pause gate is closed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Closes the pause gate: the loop stops reading transcoder stdout and
    /// pipe back-pressure stalls the subprocess. Nothing is torn down.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    /// Reopens the pause gate. No re-extraction happens.
    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    /// Stops the session: cancels the pipeline, kills subprocesses, waits
    /// for the task to fully wind down. Safe to call in any state; a second
    /// stop is a no-op.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Everything the pipeline task needs, owned for its lifetime.
pub(crate) struct PipelineContext<W> {
    pub id: String,
    pub request: PlayRequest,
    pub extractor: Extractor,
    pub transcoder: Transcoder,
    pub writer: Arc<FrameWriter<W>>,
    pub emitter: Arc<dyn EventEmitter>,
    pub shared: Arc<SessionShared>,
    pub pause_rx: watch::Receiver<bool>,
    pub cancel: CancellationToken,
}

/// Spawns the pipeline for one play request and returns its handle.
pub(crate) fn spawn_session<W>(
    id: String,
    request: PlayRequest,
    extractor: Extractor,
    transcoder: Transcoder,
    writer: Arc<FrameWriter<W>>,
    emitter: Arc<dyn EventEmitter>,
) -> Arc<SessionHandle>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let shared = Arc::new(SessionShared::new());
    let (pause_tx, pause_rx) = watch::channel(false);
    let cancel = CancellationToken::new();

    let ctx = PipelineContext {
        id: id.clone(),
        request,
        extractor,
        transcoder,
        writer,
        emitter,
        shared: shared.clone(),
        pause_rx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(run_pipeline(ctx));

    Arc::new(SessionHandle {
        id,
        shared,
        pause_tx,
        cancel,
        task: tokio::sync::Mutex::new(Some(task)),
    })
}

/// How one pipeline run ended.
enum Outcome {
    /// EOF with exit 0: emit `finished`.
    Finished,
    /// Any failure: emit `error` and park in the Error state.
    Errored(String),
    /// Cancelled by stop: emit nothing.
    Stopped,
}

async fn run_pipeline<W>(mut ctx: PipelineContext<W>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let outcome = drive(&mut ctx).await;
    let bytes = ctx.shared.bytes_sent.load(Ordering::Relaxed);

    let event = match outcome {
        Outcome::Finished => {
            ctx.shared.set_state(SessionState::Idle);
            log::info!("[Engine] Session {} finished ({} bytes)", ctx.id, bytes);
            Some(EngineEvent::Finished {
                session_id: ctx.id.clone(),
                bytes,
            })
        }
        Outcome::Errored(message) => {
            ctx.shared.set_state(SessionState::Error);
            log::warn!("[Engine] Session {} failed: {}", ctx.id, message);
            Some(EngineEvent::Error {
                session_id: ctx.id.clone(),
                message,
            })
        }
        Outcome::Stopped => {
            ctx.shared.set_state(SessionState::Idle);
            log::debug!("[Engine] Session {} stopped", ctx.id);
            None
        }
    };

    if let Some(event) = event {
        ctx.emitter.emit_engine(&event);
        // Best effort: the socket may already be gone on shutdown
        if let Err(err) = ctx.writer.write_event(&event).await {
            log::warn!("[Engine] Could not emit final event for {}: {}", ctx.id, err);
        }
    }
}

/// The extract → transcode → stream sequence. Every return path has had
/// its subprocesses reaped.
async fn drive<W>(ctx: &mut PipelineContext<W>) -> Outcome
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    // ── Extract ────────────────────────────────────────────────────────────
    ctx.shared.set_state(SessionState::Extracting);

    let resolve = async {
        if ctx.request.duration_hint_secs.is_some() {
            // Duration known: a single --get-url roundtrip suffices
            ctx.extractor.stream_url(&ctx.request.url).await
        } else {
            ctx.extractor
                .resolve(&ctx.request.url)
                .await
                .map(|info| info.url)
        }
    };

    let stream_url = tokio::select! {
        _ = ctx.cancel.cancelled() => return Outcome::Stopped,
        resolved = resolve => match resolved {
            Ok(url) => url,
            Err(err) => return Outcome::Errored(err.to_string()),
        },
    };

    // ── Transcode ──────────────────────────────────────────────────────────
    ctx.shared.set_state(SessionState::Transcoding);

    let TranscoderProcess { mut child, mut stdout } =
        match ctx
            .transcoder
            .spawn(&stream_url, ctx.request.format, ctx.request.start_at_secs)
        {
            Ok(proc) => proc,
            Err(err) => return Outcome::Errored(format!("transcoder spawn failed: {err}")),
        };

    // ── Stream ─────────────────────────────────────────────────────────────
    let cancel = ctx.cancel.clone();
    let mut chunker = Chunker::new(ctx.request.format);
    let mut chunk = vec![0u8; PCM_CHUNK_SIZE];
    let mut streaming = false;

    loop {
        // Pause gate: withhold reads so pipe back-pressure stalls the
        // transcoder. Stop must still win while paused.
        while *ctx.pause_rx.borrow() {
            let mut pause_rx = ctx.pause_rx.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Outcome::Stopped;
                }
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        let _ = child.kill().await;
                        return Outcome::Stopped;
                    }
                }
            }
        }

        let read = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Outcome::Stopped;
            }
            read = read_unless_paused(&mut stdout, &mut chunk, &mut ctx.pause_rx) => read,
        };

        match read {
            Some(Ok(0)) => {
                // EOF: the exit status decides finished vs error
                return match child.wait().await {
                    Ok(status) if status.success() => Outcome::Finished,
                    Ok(status) => Outcome::Errored(format!("transcoder exited with {status}")),
                    Err(err) => Outcome::Errored(format!("transcoder reap failed: {err}")),
                };
            }
            Some(Ok(n)) => {
                for payload in chunker.push(&chunk[..n]) {
                    if !streaming {
                        streaming = true;
                        ctx.shared.set_state(SessionState::Streaming);
                        let ready = EngineEvent::Ready {
                            session_id: ctx.id.clone(),
                        };
                        ctx.emitter.emit_engine(&ready);
                        if let Err(err) = ctx.writer.write_event(&ready).await {
                            let _ = child.kill().await;
                            return Outcome::Errored(format!("transport write failed: {err}"));
                        }
                    }
                    if let Err(err) = ctx.writer.write_audio(&ctx.id, &payload).await {
                        let _ = child.kill().await;
                        return Outcome::Errored(format!("transport write failed: {err}"));
                    }
                    ctx.shared
                        .bytes_sent
                        .fetch_add(payload.len() as u64, Ordering::Relaxed);
                }
            }
            Some(Err(err)) => {
                let _ = child.kill().await;
                return Outcome::Errored(format!("transcoder read failed: {err}"));
            }
            // Pause engaged mid-read; loop back to the gate
            None => {}
        }
    }
}

/// Reads stdout unless the pause gate closes first.
///
/// Returns `None` when pause engaged (nothing read), `Some(result)` for a
/// completed read.
async fn read_unless_paused<R: AsyncRead + Unpin>(
    stdout: &mut R,
    chunk: &mut [u8],
    pause_rx: &mut watch::Receiver<bool>,
) -> Option<std::io::Result<usize>> {
    tokio::select! {
        read = stdout.read(chunk) => Some(read),
        _ = wait_for_pause(pause_rx) => None,
    }
}

async fn wait_for_pause(pause_rx: &mut watch::Receiver<bool>) {
    loop {
        if *pause_rx.borrow() {
            return;
        }
        if pause_rx.changed().await.is_err() {
            // Sender gone; never resolves so the read side wins
            std::future::pending::<()>().await;
        }
    }
}

/// Splits the transcoder byte stream into transport payloads per format.
enum Chunker {
    /// Unframed PCM: forward read-sized chunks.
    Pcm,
    /// Ogg container: forward whole pages so no Opus frame is ever split
    /// across two transport writes.
    Pages(OggPageSplitter),
    /// Raw Opus: one packet per record, headers dropped.
    Packets(OggPacketReader),
}

impl Chunker {
    fn new(format: TranscodeFormat) -> Self {
        match format {
            TranscodeFormat::Pcm => Self::Pcm,
            TranscodeFormat::OpusContainer => Self::Pages(OggPageSplitter::new()),
            TranscodeFormat::RawOpus => Self::Packets(OggPacketReader::new()),
        }
    }

    fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        match self {
            Self::Pcm => vec![Bytes::copy_from_slice(data)],
            Self::Pages(splitter) => {
                splitter.push(data);
                let mut pages = Vec::new();
                while let Some(page) = splitter.next_page() {
                    pages.push(page.raw);
                }
                pages
            }
            Self::Packets(reader) => {
                reader.push(data);
                let mut packets = Vec::new();
                while let Some(packet) = reader.next_packet() {
                    if !is_opus_header(&packet) {
                        packets.push(packet);
                    }
                }
                packets
            }
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("bytes_sent", &self.bytes_sent())
            .finish()
    }
}
