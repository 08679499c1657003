//! Per-consumer session: queue ownership, transition serialization, and
//! engine event routing.
//!
//! Each consumer (a guild, a browser user) gets one owner task that reads
//! from a single command channel, so every mutation of the session is
//! serialized without locks. Commands that initiate a new playback pass
//! through the transition debouncer: rapid skip/previous/seek bursts
//! coalesce into a single engine transition, and stale engine events from
//! superseded pipelines are dropped by sequence and suppression checks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{
    JitterBuffer, OpusFrameDecoder, PassthroughAdapter, PlaybackScheduler, DECODED_FRAME_BYTES,
};
use crate::engine::TranscodeFormat;
use crate::events::{ConsumerEvent, EngineEvent, EventEmitter};
use crate::orchestrator::engine_client::EngineClient;
use crate::orchestrator::persistence::{record_from_state, PersistedSession, WriteCoalescer};
use crate::orchestrator::queue::{QueueError, Track, TrackPatch, TrackQueue};
use crate::orchestrator::resolver::pick_best;
use crate::orchestrator::ConsumerNotifier;
use crate::protocol_constants::{
    ADVANCE_DRAIN_WAIT_MS, FRAME_DURATION_MS, PLAYLIST_EXPANSION_CAP, SINK_CHANNEL_CAPACITY,
    TRANSITION_DEBOUNCE_MS,
};
use crate::state::AdapterMode;
use crate::transport::SinkRegistry;

/// Interval between progress reports outside browser mode.
const PROGRESS_INTERVAL_SECS: u64 = 1;

/// Commands accepted by a consumer session task.
#[derive(Debug)]
pub enum Command {
    /// A consumer transport attached; answer with the full state snapshot.
    Connected {
        /// Display name for persistence.
        username: String,
        /// Avatar URL for persistence.
        avatar: Option<String>,
    },
    /// The consumer transport detached.
    Disconnected,
    /// Resolve-or-defer the input, append it, start if idle.
    Play {
        /// Concrete URL or free-text query.
        input: String,
    },
    /// Append without disturbing playback; start if idle.
    AddToQueue {
        /// Concrete URL or free-text query.
        input: String,
    },
    /// Jump to a queued track.
    PlayFromQueue {
        /// Target index.
        index: usize,
    },
    /// Transition one track forward.
    Skip,
    /// Transition one track backward.
    Previous,
    /// Restart the current track at an offset.
    Seek {
        /// Offset in seconds.
        seconds: f64,
    },
    /// Close the engine pause gate.
    Pause,
    /// Reopen the engine pause gate.
    Resume,
    /// Remove a queued track.
    RemoveFromQueue {
        /// Target index.
        index: usize,
    },
    /// Stop playback and empty the queue.
    ClearQueue,
    /// Clear queue and delete the persisted record.
    ResetSession,
    /// Read-only candidate search.
    Search {
        /// Free-text query.
        query: String,
    },
    /// Engine lifecycle event routed by the dispatcher.
    Engine(EngineEvent),
    /// A debounce timer fired.
    ExecutePending {
        /// The sequence the timer was armed with.
        seq: u64,
    },
    /// Periodic progress tick while streaming.
    ProgressTick,
    /// Orchestrator shutdown.
    Shutdown,
}

/// Dependencies handed to every session task.
pub(crate) struct SessionDeps {
    pub consumer_id: String,
    pub engine: EngineClient,
    pub coalescer: WriteCoalescer,
    pub notifier: Arc<dyn ConsumerNotifier>,
    pub emitter: Arc<dyn EventEmitter>,
    pub sinks: Arc<SinkRegistry>,
    pub adapter_mode: AdapterMode,
    pub persisted: Option<PersistedSession>,
}

/// Spawns the owner task for one consumer, returning its command sender.
pub(crate) fn spawn_consumer_session(deps: SessionDeps) -> mpsc::Sender<Command> {
    let (tx, rx) = mpsc::channel(64);
    let task = SessionTask::new(deps, tx.clone());
    tokio::spawn(task.run(rx));
    tx
}

/// Live client adapter bound to the current engine session.
enum ActiveAdapter {
    Passthrough(Arc<PassthroughAdapter>),
    Jitter(Arc<JitterBuffer>),
    Browser {
        idle: Arc<AtomicBool>,
        finished: Arc<AtomicBool>,
    },
}

impl ActiveAdapter {
    fn is_idle(&self) -> bool {
        match self {
            Self::Passthrough(_) => true,
            Self::Jitter(buffer) => buffer.is_idle(),
            Self::Browser { idle, .. } => idle.load(Ordering::Relaxed),
        }
    }

    fn finish(&self) {
        match self {
            Self::Passthrough(_) => {}
            Self::Jitter(buffer) => buffer.finish(),
            Self::Browser { finished, .. } => finished.store(true, Ordering::Relaxed),
        }
    }
}

struct SessionTask {
    consumer_id: String,
    engine: EngineClient,
    coalescer: WriteCoalescer,
    notifier: Arc<dyn ConsumerNotifier>,
    emitter: Arc<dyn EventEmitter>,
    sinks: Arc<SinkRegistry>,
    adapter_mode: AdapterMode,
    self_tx: mpsc::Sender<Command>,

    queue: TrackQueue,
    username: String,
    avatar: Option<String>,
    now_playing: bool,
    is_paused: bool,
    is_stream_ready: bool,
    playback_start: Option<Instant>,
    playback_offset_secs: f64,

    play_request_seq: u64,
    active_play_request_seq: u64,
    pending_seq: Option<u64>,
    pending_start_at: f64,
    suppress_auto_advance: HashSet<String>,

    adapter: Option<ActiveAdapter>,
    playback_cancel: CancellationToken,
}

impl SessionTask {
    fn new(deps: SessionDeps, self_tx: mpsc::Sender<Command>) -> Self {
        let (queue, is_paused, playback_offset_secs, username, avatar) = match deps.persisted {
            Some(record) => (
                TrackQueue::from_parts(record.queue, record.current_index),
                record.is_paused,
                record.playback_offset_secs,
                record.username,
                record.avatar,
            ),
            None => (TrackQueue::new(), false, 0.0, String::new(), None),
        };

        Self {
            consumer_id: deps.consumer_id,
            engine: deps.engine,
            coalescer: deps.coalescer,
            notifier: deps.notifier,
            emitter: deps.emitter,
            sinks: deps.sinks,
            adapter_mode: deps.adapter_mode,
            self_tx,
            queue,
            username,
            avatar,
            now_playing: false,
            is_paused,
            is_stream_ready: false,
            playback_start: None,
            playback_offset_secs,
            play_request_seq: 0,
            active_play_request_seq: 0,
            pending_seq: None,
            pending_start_at: 0.0,
            suppress_auto_advance: HashSet::new(),
            adapter: None,
            playback_cancel: CancellationToken::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        log::debug!("[Session] Task started for {}", self.consumer_id);
        while let Some(command) = rx.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command).await;
        }
        // Wind down playback without emitting further consumer events
        self.teardown_playback().await;
        log::debug!("[Session] Task ended for {}", self.consumer_id);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connected { username, avatar } => {
                if !username.is_empty() {
                    self.username = username;
                }
                if avatar.is_some() {
                    self.avatar = avatar;
                }
                self.notify(ConsumerEvent::State {
                    queue: self.queue.snapshot(),
                    is_paused: self.is_paused,
                    playback_offset_secs: self.playback_time(),
                });
            }
            Command::Disconnected => {
                // Resource conservation: keep the pipeline warm but stop
                // pulling from the transcoder while nobody is listening.
                if self.now_playing && !self.is_paused {
                    self.do_pause(false).await;
                }
            }
            Command::Play { input } | Command::AddToQueue { input } => {
                self.handle_play(input).await;
            }
            Command::PlayFromQueue { index } => match self.queue.set_index(index) {
                Ok(()) => self.schedule_transition(0.0),
                Err(err) => self.notify_error(err),
            },
            Command::Skip => {
                if self.queue.skip().is_some() {
                    self.schedule_transition(0.0);
                } else {
                    self.notify_error("queue is empty");
                }
            }
            Command::Previous => {
                if self.queue.previous().is_some() {
                    self.schedule_transition(0.0);
                } else {
                    self.notify_error("queue is empty");
                }
            }
            Command::Seek { seconds } => {
                if self.queue.current().is_some() {
                    self.schedule_transition(seconds.max(0.0));
                } else {
                    self.notify_error("nothing playing to seek in");
                }
            }
            Command::Pause => {
                if self.now_playing && !self.is_paused {
                    self.do_pause(true).await;
                } else {
                    self.notify_error("nothing playing to pause");
                }
            }
            Command::Resume => {
                if self.now_playing && self.is_paused {
                    self.do_resume().await;
                } else {
                    self.notify_error("nothing paused to resume");
                }
            }
            Command::RemoveFromQueue { index } => {
                match self.queue.remove(index, self.now_playing) {
                    Ok(_) => {
                        self.persist().await;
                        self.notify_queue();
                    }
                    Err(err @ QueueError::RemoveCurrent) => self.notify_error(err),
                    Err(err @ QueueError::OutOfRange(_)) => self.notify_error(err),
                }
            }
            Command::ClearQueue => {
                self.stop_playback().await;
                self.queue.clear();
                self.persist().await;
                self.notify_queue();
                self.notify(ConsumerEvent::Stopped);
            }
            Command::ResetSession => {
                self.stop_playback().await;
                self.queue.clear();
                self.coalescer.delete(self.consumer_id.clone()).await;
                self.notify(ConsumerEvent::SessionReset);
            }
            Command::Search { query } => match self.engine.search(&query).await {
                Ok(results) => self.notify(ConsumerEvent::SearchResults { results }),
                Err(err) => self.notify_error(err),
            },
            Command::Engine(event) => self.handle_engine_event(event).await,
            Command::ExecutePending { seq } => {
                // The timer only acts if its sequence is still both the
                // pending one and the newest playback request.
                if self.pending_seq == Some(seq) && self.active_play_request_seq == seq {
                    self.pending_seq = None;
                    let start_at = self.pending_start_at;
                    self.execute_transition(start_at).await;
                }
            }
            Command::ProgressTick => {
                if self.now_playing && self.is_stream_ready && !self.is_paused {
                    let bytes_sent = match self.engine.status(&self.consumer_id).await {
                        Ok(status) => status.bytes_sent,
                        Err(_) => 0,
                    };
                    self.notify(ConsumerEvent::Progress {
                        playback_secs: self.playback_time(),
                        duration_secs: self.queue.current().and_then(|t| t.duration_secs),
                        bytes_sent,
                    });
                }
            }
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enqueue Paths
    // ─────────────────────────────────────────────────────────────────────────

    /// Shared by `play` and `addToQueue`: append (expanding playlists,
    /// deferring free text), then start at the new tail when idle.
    async fn handle_play(&mut self, input: String) {
        let appended_at = if looks_like_url(&input) {
            if looks_like_playlist(&input) {
                match self.expand_playlist(&input).await {
                    Ok(first_index) => first_index,
                    Err(err) => {
                        self.notify_error(err);
                        return;
                    }
                }
            } else {
                let mut track = Track::new(input.clone(), input.clone());
                // Best-effort title/duration; an unreachable lookup still queues
                if let Ok(info) = self.engine.metadata(&input).await {
                    track.title = if info.title.is_empty() {
                        input.clone()
                    } else {
                        info.title
                    };
                    track.duration_secs = info.duration_secs;
                    track.thumbnail = info.thumbnail;
                    if let Some(page) = info.webpage_url {
                        track.url = page;
                    }
                }
                self.queue.push(track)
            }
        } else {
            self.queue.push(Track::deferred(&input))
        };

        self.persist().await;
        self.notify_queue();

        // Idle means no live playback AND no transition already debouncing;
        // otherwise a burst of adds would keep re-targeting the new tail.
        if !self.now_playing && self.pending_seq.is_none() {
            let _ = self.queue.set_index(appended_at);
            self.schedule_transition(0.0);
        }
    }

    /// Expands a playlist URL into queued tracks. Returns the index of the
    /// first appended track.
    async fn expand_playlist(&mut self, url: &str) -> Result<usize, crate::error::BatonError> {
        let listing = self.engine.playlist(url).await?;
        if listing.entries.is_empty() {
            return Err(crate::error::BatonError::Resolution(
                "playlist has no entries".to_string(),
            ));
        }

        let total = listing.entries.len();
        let mut first_index = None;
        for entry in listing.entries.into_iter().take(PLAYLIST_EXPANSION_CAP) {
            let mut track = Track::new(entry.url, entry.title);
            track.duration_secs = entry.duration_secs;
            let index = self.queue.push(track);
            first_index.get_or_insert(index);
        }
        if total > PLAYLIST_EXPANSION_CAP {
            log::info!(
                "[Session] Playlist truncated to {PLAYLIST_EXPANSION_CAP} of {total} entries"
            );
        }
        Ok(first_index.unwrap_or(0))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transition Serializer
    // ─────────────────────────────────────────────────────────────────────────

    /// Arms the debounced transition for the current queue position.
    ///
    /// Every arm bumps `play_request_seq`; the timer that eventually fires
    /// checks its sequence against both counters, so only the newest of a
    /// burst executes.
    fn schedule_transition(&mut self, start_at: f64) {
        self.play_request_seq += 1;
        let seq = self.play_request_seq;
        self.active_play_request_seq = seq;
        self.pending_seq = Some(seq);
        self.pending_start_at = start_at;

        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(TRANSITION_DEBOUNCE_MS)).await;
            let _ = tx.send(Command::ExecutePending { seq }).await;
        });
    }

    /// Performs one engine transition to the current track.
    async fn execute_transition(&mut self, start_at: f64) {
        // 1. A stale finished from the outgoing pipeline must not advance
        if self.now_playing {
            self.suppress_auto_advance.insert(self.consumer_id.clone());
        }

        // 2. Tear down the previous pipeline
        if let Err(err) = self.engine.stop(&self.consumer_id).await {
            log::warn!("[Session] stop before transition failed: {err}");
        }
        self.detach_adapter();

        // 3. Reset local playback bookkeeping
        self.now_playing = false;
        self.is_stream_ready = false;
        self.is_paused = false;
        self.playback_start = None;
        self.playback_offset_secs = start_at;

        // 4–5. Resolve (deferred) and start, auto-skipping failures
        let mut start_at = start_at;
        loop {
            let Some(index) = usize::try_from(self.queue.current_index()).ok() else {
                // Queue ran out while skipping failures
                self.suppress_auto_advance.remove(&self.consumer_id);
                self.persist().await;
                self.notify(ConsumerEvent::QueueFinished);
                return;
            };

            match self.start_current_track(index, start_at).await {
                Ok(()) => break,
                Err(err) => {
                    self.notify_error(err);
                    // A seek offset applies only to the track it targeted
                    start_at = 0.0;
                    if self.queue.advance().is_none() {
                        self.suppress_auto_advance.remove(&self.consumer_id);
                        self.persist().await;
                        self.notify(ConsumerEvent::QueueFinished);
                        return;
                    }
                }
            }
        }

        self.now_playing = true;
        self.persist().await;
        self.notify(ConsumerEvent::Session {
            session_id: self.consumer_id.clone(),
        });
        if let Some(track) = self.queue.current() {
            self.notify(ConsumerEvent::NowPlaying {
                track: track.clone(),
            });
        }
        self.notify_queue();
    }

    /// Resolves a deferred track if needed and issues the engine play.
    async fn start_current_track(
        &mut self,
        index: usize,
        start_at: f64,
    ) -> Result<(), crate::error::BatonError> {
        let track = self
            .queue
            .get(index)
            .cloned()
            .ok_or_else(|| crate::error::BatonError::Internal("index vanished".into()))?;

        let track = if track.is_deferred() {
            let query = track.search_query().unwrap_or_default().to_string();
            let candidates = self.engine.search(&query).await?;
            let best = pick_best(&candidates, &query, track.duration_secs)
                .cloned()
                .ok_or_else(|| {
                    crate::error::BatonError::Resolution(format!(
                        "no results for {query:?}"
                    ))
                })?;

            // Rewrite so the lookup never repeats
            self.queue
                .update_track(
                    index,
                    TrackPatch {
                        url: Some(best.url.clone()),
                        title: Some(best.title.clone()),
                        duration_secs: best.duration_secs,
                        thumbnail: None,
                    },
                )
                .map_err(|e| crate::error::BatonError::Internal(e.to_string()))?;
            self.persist().await;
            self.queue.get(index).cloned().unwrap_or(track)
        } else {
            track
        };

        let format = match self.adapter_mode {
            AdapterMode::Passthrough | AdapterMode::Browser => TranscodeFormat::OpusContainer,
            AdapterMode::Jitter => TranscodeFormat::RawOpus,
        };

        self.engine
            .play(
                &self.consumer_id,
                &track.url,
                format,
                start_at,
                track.duration_secs,
            )
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Engine Events
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        if event.session_id() != self.consumer_id {
            log::debug!(
                "[Session] Dropping event for foreign session {}",
                event.session_id()
            );
            return;
        }

        match event {
            EngineEvent::Ready { session_id } => {
                if !self.now_playing {
                    log::debug!("[Session] Stale ready for {session_id}, dropping");
                    return;
                }
                // 5–6. Fresh sink for the new pipeline; the transition is
                // complete, so the stop-suppression entry is cleared.
                self.attach_adapter();
                self.suppress_auto_advance.remove(&session_id);
                self.is_stream_ready = true;
                self.playback_start = Some(Instant::now());
                self.spawn_progress_loop();
                self.notify(ConsumerEvent::Ready { session_id });
            }
            EngineEvent::Finished { session_id, bytes } => {
                if self.suppress_auto_advance.remove(&session_id) {
                    log::debug!("[Session] Suppressed auto-advance for {session_id}");
                    return;
                }
                // A transition command already moved the index; its debounce
                // timer will start the new track.
                if self.pending_seq.is_some() {
                    log::debug!("[Session] Finished superseded by pending transition");
                    return;
                }
                if !self.now_playing {
                    return;
                }

                self.notify(ConsumerEvent::Finished { bytes });
                self.finish_adapter_and_wait().await;
                self.detach_adapter();
                self.now_playing = false;
                self.is_stream_ready = false;
                self.playback_start = None;
                self.playback_offset_secs = 0.0;

                if self.queue.advance().is_some() {
                    self.execute_transition(0.0).await;
                } else {
                    self.persist().await;
                    self.notify_queue();
                    self.notify(ConsumerEvent::QueueFinished);
                }
            }
            EngineEvent::Error { session_id, message } => {
                if self.suppress_auto_advance.remove(&session_id) {
                    log::debug!("[Session] Dropping stale error for {session_id}");
                    return;
                }
                if self.pending_seq.is_some() {
                    log::debug!("[Session] Error superseded by pending transition");
                    return;
                }
                if !self.now_playing {
                    return;
                }

                self.notify(ConsumerEvent::Error { message });
                self.detach_adapter();
                self.now_playing = false;
                self.is_stream_ready = false;
                self.playback_start = None;
                self.playback_offset_secs = 0.0;

                // Auto-skip the broken track
                if self.queue.advance().is_some() {
                    self.execute_transition(0.0).await;
                } else {
                    self.persist().await;
                    self.notify_queue();
                    self.notify(ConsumerEvent::QueueFinished);
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pause / Resume / Stop
    // ─────────────────────────────────────────────────────────────────────────

    async fn do_pause(&mut self, announce: bool) {
        if let Err(err) = self.engine.pause(&self.consumer_id).await {
            self.notify_error(err);
            return;
        }
        // Fold elapsed time into the offset and drop the anchor
        self.playback_offset_secs = self.playback_time();
        self.playback_start = None;
        self.is_paused = true;
        self.persist().await;
        if announce {
            self.notify(ConsumerEvent::Paused);
        }
    }

    async fn do_resume(&mut self) {
        if let Err(err) = self.engine.resume(&self.consumer_id).await {
            self.notify_error(err);
            return;
        }
        self.playback_start = Some(Instant::now());
        self.is_paused = false;
        self.persist().await;
        self.notify(ConsumerEvent::Resumed);
    }

    async fn stop_playback(&mut self) {
        if self.now_playing {
            self.suppress_auto_advance.insert(self.consumer_id.clone());
        }
        if let Err(err) = self.engine.stop(&self.consumer_id).await {
            log::warn!("[Session] stop failed: {err}");
        }
        self.detach_adapter();
        self.now_playing = false;
        self.is_stream_ready = false;
        self.is_paused = false;
        self.playback_start = None;
        self.playback_offset_secs = 0.0;
    }

    async fn teardown_playback(&mut self) {
        let _ = self.engine.stop(&self.consumer_id).await;
        self.detach_adapter();
    }

    /// Derived playback time: offset plus the running monotonic span.
    fn playback_time(&self) -> f64 {
        match self.playback_start {
            Some(anchor) if !self.is_paused => {
                self.playback_offset_secs + anchor.elapsed().as_secs_f64()
            }
            _ => self.playback_offset_secs,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Client Adapter Wiring
    // ─────────────────────────────────────────────────────────────────────────

    /// Registers a fresh sink and spawns the relay for the adapter mode.
    fn attach_adapter(&mut self) {
        self.detach_adapter();
        let cancel = CancellationToken::new();
        self.playback_cancel = cancel.clone();

        let sink_rx = self
            .sinks
            .register(&self.consumer_id, SINK_CHANNEL_CAPACITY);
        let notifier = self.notifier.clone();
        let consumer_id = self.consumer_id.clone();

        let adapter = match self.adapter_mode {
            AdapterMode::Passthrough => {
                let (adapter, outputs_rx) = PassthroughAdapter::new(SINK_CHANNEL_CAPACITY);
                let adapter = Arc::new(adapter);
                tokio::spawn(run_passthrough_relay(
                    adapter.clone(),
                    sink_rx,
                    outputs_rx,
                    notifier,
                    consumer_id,
                    cancel,
                ));
                ActiveAdapter::Passthrough(adapter)
            }
            AdapterMode::Jitter => {
                let buffer = Arc::new(JitterBuffer::new(DECODED_FRAME_BYTES));
                tokio::spawn(run_jitter_relay(
                    buffer.clone(),
                    sink_rx,
                    notifier,
                    consumer_id,
                    cancel,
                ));
                ActiveAdapter::Jitter(buffer)
            }
            AdapterMode::Browser => {
                let idle = Arc::new(AtomicBool::new(false));
                let finished = Arc::new(AtomicBool::new(false));
                tokio::spawn(run_browser_relay(
                    sink_rx,
                    notifier,
                    consumer_id,
                    idle.clone(),
                    finished.clone(),
                    cancel,
                ));
                ActiveAdapter::Browser { idle, finished }
            }
        };
        self.adapter = Some(adapter);
    }

    /// Removes the sink and cancels the relay task.
    fn detach_adapter(&mut self) {
        self.sinks.remove(&self.consumer_id);
        self.playback_cancel.cancel();
        self.adapter = None;
    }

    /// Lets the adapter drain before auto-advance, bounded so a wedged
    /// client cannot stall the queue.
    async fn finish_adapter_and_wait(&self) {
        let Some(adapter) = &self.adapter else {
            return;
        };
        adapter.finish();

        let deadline = Instant::now() + Duration::from_millis(ADVANCE_DRAIN_WAIT_MS);
        while Instant::now() < deadline {
            if adapter.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        log::debug!("[Session] Advance drain wait timed out, advancing anyway");
    }

    fn spawn_progress_loop(&self) {
        if self.adapter_mode == AdapterMode::Browser {
            // Browser progress comes from the paced scheduler at ~4 Hz
            return;
        }
        let tx = self.self_tx.clone();
        let cancel = self.playback_cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(PROGRESS_INTERVAL_SECS));
            tick.tick().await; // immediate first tick consumed
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        if tx.send(Command::ProgressTick).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notification / Persistence Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn notify(&self, event: ConsumerEvent) {
        self.emitter.emit_consumer(&self.consumer_id, &event);
        self.notifier.notify(&self.consumer_id, &event);
    }

    fn notify_error(&self, err: impl std::fmt::Display) {
        self.notify(ConsumerEvent::Error {
            message: err.to_string(),
        });
    }

    fn notify_queue(&self) {
        self.notify(ConsumerEvent::QueueUpdated {
            queue: self.queue.snapshot(),
        });
    }

    async fn persist(&self) {
        let snapshot = self.queue.snapshot();
        self.coalescer
            .save(record_from_state(
                &self.consumer_id,
                &self.username,
                self.avatar.clone(),
                snapshot.tracks,
                snapshot.current_index,
                self.is_paused,
                self.playback_offset_secs,
            ))
            .await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay Tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn run_passthrough_relay(
    adapter: Arc<PassthroughAdapter>,
    mut sink_rx: mpsc::Receiver<Bytes>,
    mut outputs_rx: mpsc::UnboundedReceiver<mpsc::Receiver<Bytes>>,
    notifier: Arc<dyn ConsumerNotifier>,
    consumer_id: String,
    cancel: CancellationToken,
) {
    // Forward announced output streams to the consumer transport as binary
    let forward_notifier = notifier.clone();
    let forward_id = consumer_id.clone();
    let forward_cancel = cancel.clone();
    tokio::spawn(async move {
        while let Some(mut output) = tokio::select! {
            _ = forward_cancel.cancelled() => None,
            output = outputs_rx.recv() => output,
        } {
            loop {
                let frame = tokio::select! {
                    _ = forward_cancel.cancelled() => return,
                    frame = output.recv() => frame,
                };
                match frame {
                    Some(frame) => forward_notifier.notify_binary(&forward_id, frame),
                    None => break,
                }
            }
        }
    });

    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => return,
            record = sink_rx.recv() => record,
        };
        match record {
            Some(record) => adapter.deliver(record).await,
            None => return,
        }
    }
}

async fn run_jitter_relay(
    buffer: Arc<JitterBuffer>,
    mut sink_rx: mpsc::Receiver<Bytes>,
    notifier: Arc<dyn ConsumerNotifier>,
    consumer_id: String,
    cancel: CancellationToken,
) {
    let mut decoder = match OpusFrameDecoder::new() {
        Ok(decoder) => decoder,
        Err(err) => {
            log::error!("[Session] Opus decoder init failed: {err}");
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(SINK_CHANNEL_CAPACITY);
    let paced = {
        let buffer = buffer.clone();
        tokio::spawn(async move { buffer.run(out_tx).await })
    };

    let forward_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = forward_cancel.cancelled() => return,
                frame = out_rx.recv() => frame,
            };
            match frame {
                Some(frame) => notifier.notify_binary(&consumer_id, frame),
                None => return,
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = sink_rx.recv() => frame,
        };
        match frame {
            Some(frame) => match decoder.decode(&frame) {
                Ok(pcm) => buffer.push(pcm),
                Err(err) => log::debug!("[Session] Undecodable frame dropped: {err}"),
            },
            None => break,
        }
    }
    buffer.finish();
    let _ = paced.await;
}

async fn run_browser_relay(
    mut sink_rx: mpsc::Receiver<Bytes>,
    notifier: Arc<dyn ConsumerNotifier>,
    consumer_id: String,
    idle: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut scheduler = PlaybackScheduler::new();
    let origin = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_millis(FRAME_DURATION_MS));
    let mut sink_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            record = sink_rx.recv(), if sink_open => {
                match record {
                    Some(record) => {
                        // One container page may hold several 20 ms frames;
                        // the page granularity is close enough for pacing
                        scheduler.push_frame(record, FRAME_DURATION_MS as f64 / 1000.0);
                    }
                    None => {
                        sink_open = false;
                        finished.store(true, Ordering::Relaxed);
                    }
                }
            }
            _ = tick.tick() => {
                if finished.load(Ordering::Relaxed) {
                    scheduler.finish();
                }
                let out = scheduler.tick(origin.elapsed().as_secs_f64());
                for frame in out.frames {
                    notifier.notify_binary(&consumer_id, frame);
                }
                if let Some(position) = out.progress {
                    notifier.notify(
                        &consumer_id,
                        &ConsumerEvent::Progress {
                            playback_secs: position,
                            duration_secs: None,
                            bytes_sent: 0,
                        },
                    );
                }
                idle.store(scheduler.is_idle(), Ordering::Relaxed);
                if out.ended {
                    return;
                }
            }
        }
    }
}

/// Crude but sufficient: the consumer transport sends either a URL or
/// free text for deferred search.
fn looks_like_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

fn looks_like_playlist(input: &str) -> bool {
    input.contains("list=") || input.contains("/playlist") || input.contains("/album")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection() {
        assert!(looks_like_url("https://example.com/watch?v=1"));
        assert!(looks_like_url("http://example.com"));
        assert!(!looks_like_url("never gonna give you up"));
    }

    #[test]
    fn playlist_detection() {
        assert!(looks_like_playlist("https://e/watch?v=1&list=PL123"));
        assert!(looks_like_playlist("https://e/playlist/9"));
        assert!(looks_like_playlist("https://e/album/42"));
        assert!(!looks_like_playlist("https://e/watch?v=1"));
    }
}
