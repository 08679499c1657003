//! The session orchestrator: per-consumer queues, transition serialization,
//! deferred resolution, and persistence.
//!
//! The orchestrator owns one command task per consumer session plus a
//! single event-dispatch task that fans engine events out to the owning
//! sessions. Consumer-facing delivery goes through the [`ConsumerNotifier`]
//! seam so the WebSocket layer (or a test capture) stays pluggable.

pub mod engine_client;
pub mod persistence;
pub mod queue;
pub mod resolver;
pub mod session;

pub use engine_client::EngineClient;
pub use persistence::{JsonFileStore, MemoryStore, PersistedSession, SessionStore, WriteCoalescer};
pub use queue::{QueueError, QueueSnapshot, Track, TrackQueue};
pub use resolver::{pick_best, score_candidate, SearchCandidate};
pub use session::Command;

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{BatonError, BatonResult};
use crate::events::{ConsumerEvent, EngineEvent, EventEmitter};
use crate::state::Config;
use crate::transport::SinkRegistry;
use crate::utils::validate_session_id;

use session::{spawn_consumer_session, SessionDeps};

/// Delivery seam toward attached consumer transports.
///
/// Implemented by the WebSocket connection manager; tests substitute a
/// recording capture. Delivery is fire-and-forget: a consumer with no
/// attached transport simply misses the event (state is re-sent on
/// connect).
pub trait ConsumerNotifier: Send + Sync {
    /// Delivers a JSON event to the consumer's transport(s).
    fn notify(&self, consumer_id: &str, event: &ConsumerEvent);

    /// Delivers a binary audio frame to the consumer's transport(s).
    fn notify_binary(&self, consumer_id: &str, frame: Bytes);
}

/// Notifier that discards everything; used before any transport attaches.
pub struct NoopNotifier;

impl ConsumerNotifier for NoopNotifier {
    fn notify(&self, _consumer_id: &str, _event: &ConsumerEvent) {}
    fn notify_binary(&self, _consumer_id: &str, _frame: Bytes) {}
}

/// The orchestrator service.
pub struct Orchestrator {
    sessions: DashMap<String, mpsc::Sender<Command>>,
    engine: EngineClient,
    store: Arc<dyn SessionStore>,
    coalescer: WriteCoalescer,
    notifier: Arc<dyn ConsumerNotifier>,
    emitter: Arc<dyn EventEmitter>,
    sinks: Arc<SinkRegistry>,
    config: Config,
}

impl Orchestrator {
    /// Wires the orchestrator; the coalescer task starts immediately.
    pub fn new(
        engine: EngineClient,
        store: Arc<dyn SessionStore>,
        notifier: Arc<dyn ConsumerNotifier>,
        emitter: Arc<dyn EventEmitter>,
        sinks: Arc<SinkRegistry>,
        config: Config,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            engine,
            coalescer: WriteCoalescer::spawn(store.clone()),
            store,
            notifier,
            emitter,
            sinks,
            config,
        }
    }

    /// Routes one consumer command to its owning session task, creating
    /// (and rehydrating) the session on first contact.
    pub async fn command(&self, consumer_id: &str, command: Command) -> BatonResult<()> {
        validate_session_id(consumer_id)?;
        if !self.config.id_allowed(consumer_id) {
            return Err(BatonError::InvalidRequest(format!(
                "consumer {consumer_id} is not on the allow list"
            )));
        }

        let tx = self.session_sender(consumer_id).await;
        tx.send(command)
            .await
            .map_err(|_| BatonError::Internal("session task is gone".to_string()))
    }

    /// Returns the live sender for a consumer, spawning the owner task and
    /// loading its persisted record on first contact.
    async fn session_sender(&self, consumer_id: &str) -> mpsc::Sender<Command> {
        if let Some(tx) = self.sessions.get(consumer_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let persisted = match self.store.load(consumer_id).await {
            Ok(record) => record,
            Err(err) => {
                log::warn!("[Orchestrator] Persisted load failed for {consumer_id}: {err}");
                None
            }
        };

        // Entry API so a concurrent first contact cannot spawn two owner
        // tasks for the same consumer.
        match self.sessions.entry(consumer_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    let tx = self.spawn_session(consumer_id, persisted);
                    occupied.insert(tx.clone());
                    tx
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                let tx = self.spawn_session(consumer_id, persisted);
                vacant.insert(tx.clone());
                tx
            }
        }
    }

    fn spawn_session(
        &self,
        consumer_id: &str,
        persisted: Option<PersistedSession>,
    ) -> mpsc::Sender<Command> {
        spawn_consumer_session(SessionDeps {
            consumer_id: consumer_id.to_string(),
            engine: self.engine.clone(),
            coalescer: self.coalescer.clone(),
            notifier: self.notifier.clone(),
            emitter: self.emitter.clone(),
            sinks: self.sinks.clone(),
            adapter_mode: self.config.adapter,
            persisted,
        })
    }

    /// Spawns the single event-dispatch task that fans engine events out to
    /// their owning sessions. Events for unknown sessions are dropped.
    pub fn spawn_event_dispatch(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<EngineEvent>,
        cancel: CancellationToken,
    ) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let session_id = event.session_id().to_string();
                        let Some(tx) = orchestrator
                            .sessions
                            .get(&session_id)
                            .map(|e| e.value().clone())
                        else {
                            log::debug!(
                                "[Orchestrator] Event for unknown session {session_id}, dropped"
                            );
                            continue;
                        };
                        if tx.send(Command::Engine(event)).await.is_err() {
                            log::debug!("[Orchestrator] Session {session_id} gone, event dropped");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Orchestrator] Event dispatch lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Number of live consumer sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Graceful shutdown: stop session tasks, then flush pending writes.
    pub async fn shutdown(&self) {
        for entry in self.sessions.iter() {
            let _ = entry.value().send(Command::Shutdown).await;
        }
        self.coalescer.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::control::{ControlResponse, LookupResponse};
    use crate::engine::{MediaInfo, PlaylistEntry};
    use crate::events::NoopEventEmitter;
    use axum::extract::{Path, Query, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::time::Duration;

    // ─────────────────────────────────────────────────────────────────────────
    // Stub Control Plane
    // ─────────────────────────────────────────────────────────────────────────

    /// Records every control call and serves canned lookup results.
    #[derive(Default)]
    struct StubEngine {
        calls: Mutex<Vec<String>>,
        search_results: Mutex<Vec<PlaylistEntry>>,
    }

    impl StubEngine {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn clear_calls(&self) {
            self.calls.lock().clear();
        }

        fn plays(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with("play "))
                .collect()
        }

        fn stops(&self) -> usize {
            self.calls().iter().filter(|c| *c == "stop").count()
        }
    }

    #[derive(serde::Deserialize)]
    struct StubPlayBody {
        url: String,
        #[serde(default)]
        start_at: f64,
    }

    #[derive(serde::Deserialize)]
    struct StubUrlQuery {
        url: String,
    }

    async fn spawn_stub_engine() -> (String, Arc<StubEngine>) {
        let stub = Arc::new(StubEngine::default());

        let app = Router::new()
            .route(
                "/session/{id}/play",
                post(
                    |State(stub): State<Arc<StubEngine>>,
                     Path(id): Path<String>,
                     Json(body): Json<StubPlayBody>| async move {
                        stub.calls
                            .lock()
                            .push(format!("play {} {}", body.url, body.start_at));
                        Json(ControlResponse {
                            status: "playing".into(),
                            session_id: Some(id),
                            message: None,
                        })
                    },
                ),
            )
            .route(
                "/session/{id}/stop",
                post(
                    |State(stub): State<Arc<StubEngine>>, Path(id): Path<String>| async move {
                        stub.calls.lock().push("stop".into());
                        Json(ControlResponse {
                            status: "ok".into(),
                            session_id: Some(id),
                            message: None,
                        })
                    },
                ),
            )
            .route(
                "/session/{id}/pause",
                post(
                    |State(stub): State<Arc<StubEngine>>, Path(id): Path<String>| async move {
                        stub.calls.lock().push("pause".into());
                        Json(ControlResponse {
                            status: "ok".into(),
                            session_id: Some(id),
                            message: None,
                        })
                    },
                ),
            )
            .route(
                "/session/{id}/resume",
                post(
                    |State(stub): State<Arc<StubEngine>>, Path(id): Path<String>| async move {
                        stub.calls.lock().push("resume".into());
                        Json(ControlResponse {
                            status: "ok".into(),
                            session_id: Some(id),
                            message: None,
                        })
                    },
                ),
            )
            .route(
                "/session/{id}/status",
                get(|Path(id): Path<String>| async move {
                    Json(serde_json::json!({
                        "status": "ok",
                        "session_id": id,
                        "state": "streaming",
                        "bytes_sent": 4096,
                        "paused": false,
                    }))
                }),
            )
            .route(
                "/metadata",
                get(|Query(q): Query<StubUrlQuery>| async move {
                    Json(LookupResponse::<MediaInfo> {
                        status: "ok".into(),
                        result: Some(MediaInfo {
                            url: format!("{}#direct", q.url),
                            title: format!("Title of {}", q.url),
                            duration_secs: Some(100.0),
                            thumbnail: None,
                            webpage_url: Some(q.url),
                        }),
                        message: None,
                    })
                }),
            )
            .route(
                "/search",
                get(|State(stub): State<Arc<StubEngine>>| async move {
                    Json(LookupResponse::<Vec<PlaylistEntry>> {
                        status: "ok".into(),
                        result: Some(stub.search_results.lock().clone()),
                        message: None,
                    })
                }),
            )
            .with_state(stub.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), stub)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recording Notifier
    // ─────────────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<serde_json::Value>>,
    }

    impl ConsumerNotifier for RecordingNotifier {
        fn notify(&self, _consumer_id: &str, event: &ConsumerEvent) {
            self.events
                .lock()
                .push(serde_json::to_value(event).unwrap());
        }
        fn notify_binary(&self, _consumer_id: &str, _frame: Bytes) {}
    }

    impl RecordingNotifier {
        fn types(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .map(|e| e["type"].as_str().unwrap_or("?").to_string())
                .collect()
        }

        fn last_of(&self, event_type: &str) -> Option<serde_json::Value> {
            self.events
                .lock()
                .iter()
                .rev()
                .find(|e| e["type"] == event_type)
                .cloned()
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Harness
    // ─────────────────────────────────────────────────────────────────────────

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        stub: Arc<StubEngine>,
        notifier: Arc<RecordingNotifier>,
        events_tx: broadcast::Sender<EngineEvent>,
        store: Arc<MemoryStore>,
    }

    async fn harness() -> Harness {
        harness_with(Config::default(), Arc::new(MemoryStore::new())).await
    }

    async fn harness_with(config: Config, store: Arc<MemoryStore>) -> Harness {
        let (base_url, stub) = spawn_stub_engine().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = EngineClient::new(reqwest::Client::new(), base_url);
        let orchestrator = Arc::new(Orchestrator::new(
            engine,
            store.clone(),
            notifier.clone(),
            Arc::new(NoopEventEmitter),
            Arc::new(SinkRegistry::new()),
            config,
        ));

        let (events_tx, events_rx) = broadcast::channel(64);
        orchestrator.spawn_event_dispatch(events_rx, CancellationToken::new());

        Harness {
            orchestrator,
            stub,
            notifier,
            events_tx,
            store,
        }
    }

    /// Polls until `cond` holds or two seconds pass.
    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    const GUILD: &str = "guild-1";

    // ─────────────────────────────────────────────────────────────────────────
    // Scenarios
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn play_url_starts_engine_session() {
        let h = harness().await;
        h.orchestrator
            .command(
                GUILD,
                Command::Play {
                    input: "https://site/watch?v=1".into(),
                },
            )
            .await
            .unwrap();

        wait_until(|| !h.stub.plays().is_empty()).await;

        let types = h.notifier.types();
        assert!(types.contains(&"queueUpdated".to_string()));
        assert!(types.contains(&"session".to_string()));
        assert!(types.contains(&"nowPlaying".to_string()));

        // Metadata enriched the queued track
        let now_playing = h.notifier.last_of("nowPlaying").unwrap();
        assert_eq!(now_playing["track"]["title"], "Title of https://site/watch?v=1");

        // ready flows back to the consumer
        h.events_tx
            .send(EngineEvent::Ready {
                session_id: GUILD.into(),
            })
            .unwrap();
        wait_until(|| h.notifier.last_of("ready").is_some()).await;
    }

    #[tokio::test]
    async fn rapid_skips_coalesce_to_one_transition() {
        let h = harness().await;
        for i in 0..5 {
            h.orchestrator
                .command(
                    GUILD,
                    Command::AddToQueue {
                        input: format!("https://site/watch?v={i}"),
                    },
                )
                .await
                .unwrap();
        }
        // First track starts (index 0)
        wait_until(|| h.stub.plays().len() == 1).await;
        h.stub.clear_calls();

        // Four rapid presses inside one debounce window
        for _ in 0..4 {
            h.orchestrator.command(GUILD, Command::Skip).await.unwrap();
        }

        wait_until(|| !h.stub.plays().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(h.stub.stops(), 1, "exactly one stop for the prior session");
        let plays = h.stub.plays();
        assert_eq!(plays.len(), 1, "exactly one engine play, got {plays:?}");
        assert!(
            plays[0].contains("watch?v=4"),
            "skips collapse onto the final target: {plays:?}"
        );

        let queue = h.notifier.last_of("queueUpdated").unwrap();
        assert_eq!(queue["queue"]["currentIndex"], 4);
    }

    #[tokio::test]
    async fn seek_restarts_with_offset() {
        let h = harness().await;
        h.orchestrator
            .command(
                GUILD,
                Command::Play {
                    input: "https://site/watch?v=1".into(),
                },
            )
            .await
            .unwrap();
        wait_until(|| h.stub.plays().len() == 1).await;
        h.stub.clear_calls();

        h.orchestrator
            .command(GUILD, Command::Seek { seconds: 90.0 })
            .await
            .unwrap();

        wait_until(|| !h.stub.plays().is_empty()).await;
        assert_eq!(h.stub.stops(), 1);
        assert!(h.stub.plays()[0].ends_with(" 90"), "{:?}", h.stub.plays());
    }

    #[tokio::test]
    async fn deferred_resolution_failure_finishes_queue() {
        let h = harness().await;
        // Stub search returns no candidates
        h.orchestrator
            .command(
                GUILD,
                Command::Play {
                    input: "xxqq".into(),
                },
            )
            .await
            .unwrap();

        wait_until(|| h.notifier.last_of("queueFinished").is_some()).await;

        let types = h.notifier.types();
        assert_eq!(
            types.iter().filter(|t| *t == "error").count(),
            1,
            "exactly one error event: {types:?}"
        );
        assert!(h.stub.plays().is_empty(), "no engine play for a dead token");
    }

    #[tokio::test]
    async fn deferred_resolution_rewrites_track() {
        let h = harness().await;
        *h.stub.search_results.lock() = vec![
            PlaylistEntry {
                url: "https://site/cover".into(),
                title: "Song (Piano Cover)".into(),
                duration_secs: Some(100.0),
            },
            PlaylistEntry {
                url: "https://site/official".into(),
                title: "Song (Official Audio)".into(),
                duration_secs: Some(100.0),
            },
        ];

        h.orchestrator
            .command(
                GUILD,
                Command::Play {
                    input: "song".into(),
                },
            )
            .await
            .unwrap();

        wait_until(|| !h.stub.plays().is_empty()).await;
        assert!(h.stub.plays()[0].contains("https://site/official"));

        // The stored track no longer carries the search token
        let queue = h.notifier.last_of("queueUpdated").unwrap();
        assert_eq!(queue["queue"]["tracks"][0]["url"], "https://site/official");
    }

    #[tokio::test]
    async fn finished_advances_to_next_track() {
        let h = harness().await;
        for i in 0..2 {
            h.orchestrator
                .command(
                    GUILD,
                    Command::AddToQueue {
                        input: format!("https://site/watch?v={i}"),
                    },
                )
                .await
                .unwrap();
        }
        wait_until(|| h.stub.plays().len() == 1).await;
        h.stub.clear_calls();

        h.events_tx
            .send(EngineEvent::Finished {
                session_id: GUILD.into(),
                bytes: 4096,
            })
            .unwrap();

        wait_until(|| !h.stub.plays().is_empty()).await;
        assert!(h.stub.plays()[0].contains("watch?v=1"));

        let queue = h.notifier.last_of("queueUpdated").unwrap();
        assert_eq!(queue["queue"]["currentIndex"], 1);
    }

    #[tokio::test]
    async fn finished_on_last_track_goes_idle() {
        let h = harness().await;
        h.orchestrator
            .command(
                GUILD,
                Command::Play {
                    input: "https://site/watch?v=1".into(),
                },
            )
            .await
            .unwrap();
        wait_until(|| h.stub.plays().len() == 1).await;

        h.events_tx
            .send(EngineEvent::Finished {
                session_id: GUILD.into(),
                bytes: 10,
            })
            .unwrap();

        wait_until(|| h.notifier.last_of("queueFinished").is_some()).await;
        let queue = h.notifier.last_of("queueUpdated").unwrap();
        assert_eq!(queue["queue"]["currentIndex"], -1);
    }

    #[tokio::test]
    async fn finished_during_pending_skip_is_dropped() {
        let h = harness().await;
        for i in 0..3 {
            h.orchestrator
                .command(
                    GUILD,
                    Command::AddToQueue {
                        input: format!("https://site/watch?v={i}"),
                    },
                )
                .await
                .unwrap();
        }
        wait_until(|| h.stub.plays().len() == 1).await;
        h.stub.clear_calls();

        // Skip, then the old session's natural finish lands inside the
        // debounce window
        h.orchestrator.command(GUILD, Command::Skip).await.unwrap();
        h.events_tx
            .send(EngineEvent::Finished {
                session_id: GUILD.into(),
                bytes: 1,
            })
            .unwrap();

        wait_until(|| !h.stub.plays().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let plays = h.stub.plays();
        assert_eq!(plays.len(), 1, "exactly one new session: {plays:?}");
        assert!(plays[0].contains("watch?v=1"), "{plays:?}");

        let queue = h.notifier.last_of("queueUpdated").unwrap();
        assert_eq!(queue["queue"]["currentIndex"], 1, "no double advance");
    }

    #[tokio::test]
    async fn remove_current_while_playing_rejected() {
        let h = harness().await;
        h.orchestrator
            .command(
                GUILD,
                Command::Play {
                    input: "https://site/watch?v=1".into(),
                },
            )
            .await
            .unwrap();
        wait_until(|| h.stub.plays().len() == 1).await;

        h.orchestrator
            .command(GUILD, Command::RemoveFromQueue { index: 0 })
            .await
            .unwrap();

        wait_until(|| h.notifier.last_of("error").is_some()).await;
        let error = h.notifier.last_of("error").unwrap();
        assert!(error["message"]
            .as_str()
            .unwrap()
            .contains("currently playing"));
    }

    #[tokio::test]
    async fn pause_resume_round_trip() {
        let h = harness().await;
        h.orchestrator
            .command(
                GUILD,
                Command::Play {
                    input: "https://site/watch?v=1".into(),
                },
            )
            .await
            .unwrap();
        wait_until(|| h.stub.plays().len() == 1).await;

        h.orchestrator.command(GUILD, Command::Pause).await.unwrap();
        wait_until(|| h.notifier.last_of("paused").is_some()).await;

        h.orchestrator.command(GUILD, Command::Resume).await.unwrap();
        wait_until(|| h.notifier.last_of("resumed").is_some()).await;

        let calls = h.stub.calls();
        assert!(calls.contains(&"pause".to_string()));
        assert!(calls.contains(&"resume".to_string()));
        // Pause/resume never restarts the pipeline
        assert_eq!(h.stub.plays().len(), 1);
    }

    #[tokio::test]
    async fn pause_when_idle_is_protocol_misuse() {
        let h = harness().await;
        h.orchestrator.command(GUILD, Command::Pause).await.unwrap();
        wait_until(|| h.notifier.last_of("error").is_some()).await;
        assert!(h.stub.calls().is_empty(), "no engine interaction on misuse");
    }

    #[tokio::test]
    async fn persisted_queue_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        {
            let h = harness_with(Config::default(), store.clone()).await;
            for i in 0..2 {
                h.orchestrator
                    .command(
                        GUILD,
                        Command::AddToQueue {
                            input: format!("https://site/watch?v={i}"),
                        },
                    )
                    .await
                    .unwrap();
            }
            wait_until(|| h.stub.plays().len() == 1).await;
            h.orchestrator.shutdown().await;
        }

        let record = store.load(GUILD).await.unwrap().expect("persisted record");
        assert_eq!(record.queue.len(), 2);

        // A fresh orchestrator over the same store rehydrates the queue
        let h = harness_with(Config::default(), store.clone()).await;
        h.orchestrator
            .command(
                GUILD,
                Command::Connected {
                    username: "tester".into(),
                    avatar: None,
                },
            )
            .await
            .unwrap();

        wait_until(|| h.notifier.last_of("state").is_some()).await;
        let state = h.notifier.last_of("state").unwrap();
        assert_eq!(state["queue"]["tracks"].as_array().unwrap().len(), 2);
        assert_eq!(state["queue"]["currentIndex"], record.current_index);
    }

    #[tokio::test]
    async fn allow_list_rejects_unknown_consumer() {
        let config = Config {
            allowed_ids: vec!["guild-allowed".into()],
            ..Default::default()
        };
        let h = harness_with(config, Arc::new(MemoryStore::new())).await;

        let err = h
            .orchestrator
            .command(GUILD, Command::Skip)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        h.orchestrator
            .command("guild-allowed", Command::Skip)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reset_session_deletes_persisted_record() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(Config::default(), store.clone()).await;

        h.orchestrator
            .command(
                GUILD,
                Command::AddToQueue {
                    input: "https://site/watch?v=1".into(),
                },
            )
            .await
            .unwrap();
        wait_until(|| h.stub.plays().len() == 1).await;

        h.orchestrator
            .command(GUILD, Command::ResetSession)
            .await
            .unwrap();
        wait_until(|| h.notifier.last_of("sessionReset").is_some()).await;

        // Give the coalescer's delete a moment to land
        for _ in 0..200 {
            if store.load(GUILD).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("persisted record was not deleted");
    }
}
