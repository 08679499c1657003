//! Durable session store: queue state that survives disconnects.
//!
//! After every queue mutation or index change the owning session schedules
//! a write of `(queue, currentIndex, isPaused, playbackOffset)` keyed by
//! consumer id. Writes are coalesced through [`WriteCoalescer`] so a burst
//! of mutations costs one store write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::orchestrator::queue::Track;
use crate::protocol_constants::PERSIST_THROTTLE_MS;
use crate::utils::now_iso8601;

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failure.
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One persisted consumer session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    /// Owning consumer id (user or guild id).
    pub consumer_id: String,
    /// Display name of the owning consumer.
    #[serde(default)]
    pub username: String,
    /// Avatar URL, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Queue contents in order.
    pub queue: Vec<Track>,
    /// Current index, `-1` when idle.
    pub current_index: i64,
    /// Whether playback was paused at save time.
    pub is_paused: bool,
    /// Playback offset in seconds at save time.
    pub playback_offset_secs: f64,
    /// ISO-8601 timestamp of the last write.
    pub updated_at: String,
}

/// Abstract session store, keyed by consumer id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads a record, `None` when the consumer has never been persisted.
    async fn load(&self, consumer_id: &str) -> Result<Option<PersistedSession>, StoreError>;

    /// Writes (or overwrites) a record.
    async fn save(&self, record: &PersistedSession) -> Result<(), StoreError>;

    /// Deletes a record; deleting an absent record is not an error.
    async fn delete(&self, consumer_id: &str) -> Result<(), StoreError>;
}

/// JSON-file store: one file per consumer under the data directory.
///
/// Consumer ids are wire-validated ASCII without whitespace, so they are
/// safe as file stems. Writes go through a temp file and rename so a crash
/// never leaves a truncated record.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Creates the store, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, consumer_id: &str) -> PathBuf {
        self.dir.join(format!("{consumer_id}.json"))
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn load(&self, consumer_id: &str) -> Result<Option<PersistedSession>, StoreError> {
        let path = self.path_for(consumer_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, record: &PersistedSession) -> Result<(), StoreError> {
        let path = self.path_for(&record.consumer_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, consumer_id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(consumer_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store used when no data directory is configured, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    records: dashmap::DashMap<String, PersistedSession>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, consumer_id: &str) -> Result<Option<PersistedSession>, StoreError> {
        Ok(self.records.get(consumer_id).map(|r| r.value().clone()))
    }

    async fn save(&self, record: &PersistedSession) -> Result<(), StoreError> {
        self.records
            .insert(record.consumer_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, consumer_id: &str) -> Result<(), StoreError> {
        self.records.remove(consumer_id);
        Ok(())
    }
}

enum CoalescerCommand {
    Save(PersistedSession),
    Delete(String),
    Flush(oneshot::Sender<()>),
}

/// Coalesces store writes: a burst of saves for one consumer inside the
/// throttle window becomes a single write of the latest record.
#[derive(Clone)]
pub struct WriteCoalescer {
    tx: mpsc::Sender<CoalescerCommand>,
}

impl WriteCoalescer {
    /// Spawns the coalescing task over a store.
    pub fn spawn(store: Arc<dyn SessionStore>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_coalescer(store, rx));
        Self { tx }
    }

    /// Schedules a save; the write lands within the throttle window.
    pub async fn save(&self, record: PersistedSession) {
        if self.tx.send(CoalescerCommand::Save(record)).await.is_err() {
            log::warn!("[Persist] Coalescer gone, dropping save");
        }
    }

    /// Deletes immediately (reset is rare and must not resurrect).
    pub async fn delete(&self, consumer_id: String) {
        if self
            .tx
            .send(CoalescerCommand::Delete(consumer_id))
            .await
            .is_err()
        {
            log::warn!("[Persist] Coalescer gone, dropping delete");
        }
    }

    /// Flushes all pending writes; used during graceful shutdown.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(CoalescerCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_coalescer(store: Arc<dyn SessionStore>, mut rx: mpsc::Receiver<CoalescerCommand>) {
    let throttle = Duration::from_millis(PERSIST_THROTTLE_MS);
    let mut pending: HashMap<String, PersistedSession> = HashMap::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = rx.recv() => command,
                _ = tokio::time::sleep_until(at) => {
                    flush_pending(&*store, &mut pending).await;
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(CoalescerCommand::Save(record)) => {
                pending.insert(record.consumer_id.clone(), record);
                deadline.get_or_insert_with(|| Instant::now() + throttle);
            }
            Some(CoalescerCommand::Delete(consumer_id)) => {
                pending.remove(&consumer_id);
                if let Err(err) = store.delete(&consumer_id).await {
                    log::warn!("[Persist] Delete failed for {consumer_id}: {err}");
                }
            }
            Some(CoalescerCommand::Flush(done)) => {
                flush_pending(&*store, &mut pending).await;
                deadline = None;
                let _ = done.send(());
            }
            None => {
                flush_pending(&*store, &mut pending).await;
                return;
            }
        }
    }
}

async fn flush_pending(store: &dyn SessionStore, pending: &mut HashMap<String, PersistedSession>) {
    for (consumer_id, record) in pending.drain() {
        if let Err(err) = store.save(&record).await {
            log::warn!("[Persist] Save failed for {consumer_id}: {err}");
        }
    }
}

/// Builds a record from live session state, stamping `updated_at`.
#[must_use]
pub fn record_from_state(
    consumer_id: &str,
    username: &str,
    avatar: Option<String>,
    queue: Vec<Track>,
    current_index: i64,
    is_paused: bool,
    playback_offset_secs: f64,
) -> PersistedSession {
    PersistedSession {
        consumer_id: consumer_id.to_string(),
        username: username.to_string(),
        avatar,
        queue,
        current_index,
        is_paused,
        playback_offset_secs,
        updated_at: now_iso8601(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(consumer_id: &str, offset: f64) -> PersistedSession {
        record_from_state(
            consumer_id,
            "tester",
            None,
            vec![Track::new("https://example.com/a", "A")],
            0,
            false,
            offset,
        )
    }

    #[tokio::test]
    async fn json_store_round_trips_byte_equal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let original = record("guild-1", 42.5);
        store.save(&original).await.unwrap();
        let loaded = store.load("guild-1").await.unwrap().unwrap();
        assert_eq!(loaded, original);

        // Byte-for-byte stability of the serialized form
        assert_eq!(
            serde_json::to_vec(&loaded).unwrap(),
            serde_json::to_vec(&original).unwrap()
        );
    }

    #[tokio::test]
    async fn missing_record_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        assert!(store.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        store.save(&record("guild-1", 0.0)).await.unwrap();
        store.delete("guild-1").await.unwrap();
        store.delete("guild-1").await.unwrap();
        assert!(store.load("guild-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("guild-1.json"), b"{not json").unwrap();
        assert!(store.load("guild-1").await.is_err());
    }

    /// Store that counts writes, for coalescing assertions.
    struct CountingStore {
        inner: MemoryStore,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for CountingStore {
        async fn load(&self, id: &str) -> Result<Option<PersistedSession>, StoreError> {
            self.inner.load(id).await
        }
        async fn save(&self, record: &PersistedSession) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(record).await
        }
        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_saves_coalesces_to_one_write() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            saves: AtomicUsize::new(0),
        });
        let coalescer = WriteCoalescer::spawn(store.clone());

        for offset in 0..10 {
            coalescer.save(record("guild-1", offset as f64)).await;
        }
        tokio::time::sleep(Duration::from_millis(PERSIST_THROTTLE_MS + 100)).await;

        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        // The latest record wins
        let loaded = store.load("guild-1").await.unwrap().unwrap();
        assert_eq!(loaded.playback_offset_secs, 9.0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_lands_pending_writes_immediately() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            saves: AtomicUsize::new(0),
        });
        let coalescer = WriteCoalescer::spawn(store.clone());

        coalescer.save(record("guild-1", 1.0)).await;
        coalescer.flush().await;
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_discards_pending_save() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            saves: AtomicUsize::new(0),
        });
        let coalescer = WriteCoalescer::spawn(store.clone());

        coalescer.save(record("guild-1", 1.0)).await;
        coalescer.delete("guild-1".to_string()).await;
        coalescer.flush().await;

        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
        assert!(store.load("guild-1").await.unwrap().is_none());
    }
}
