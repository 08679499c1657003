//! Track queue: ordered tracks plus a current index with strict invariants.
//!
//! `current_index` is `-1` iff the queue is empty or playback has not
//! begun; otherwise it addresses a valid track. All mutation happens from
//! the owning consumer-session task, so the queue itself is plain data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::now_iso8601;

/// URL scheme marking a deferred search token.
pub const SEARCH_SCHEME: &str = "search:";

/// One queued track.
///
/// Immutable once placed except through [`TrackQueue::update_track`], which
/// rewrites url/thumbnail/duration after deferred resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Concrete media URL, or a `search:<query>` token resolved just
    /// before playback.
    pub url: String,
    /// Display title.
    pub title: String,
    /// Duration in seconds, when known.
    #[serde(default)]
    pub duration_secs: Option<f64>,
    /// Thumbnail URL, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// ISO-8601 timestamp of when the track entered the queue.
    pub added_at: String,
}

impl Track {
    /// Creates a track for a concrete URL.
    #[must_use]
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            duration_secs: None,
            thumbnail: None,
            added_at: now_iso8601(),
        }
    }

    /// Creates a deferred track carrying a search query.
    #[must_use]
    pub fn deferred(query: &str) -> Self {
        Self::new(format!("{SEARCH_SCHEME}{query}"), query.to_string())
    }

    /// True when the url is a deferred search token.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.url.starts_with(SEARCH_SCHEME)
    }

    /// The embedded query, for deferred tracks.
    #[must_use]
    pub fn search_query(&self) -> Option<&str> {
        self.url.strip_prefix(SEARCH_SCHEME)
    }
}

/// Patch applied after deferred resolution.
#[derive(Debug, Clone, Default)]
pub struct TrackPatch {
    /// Concrete URL replacing the search token.
    pub url: Option<String>,
    /// Resolved title.
    pub title: Option<String>,
    /// Resolved duration.
    pub duration_secs: Option<f64>,
    /// Resolved thumbnail.
    pub thumbnail: Option<String>,
}

/// Errors from queue mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Index outside `[0, len)`.
    #[error("index {0} is out of range")]
    OutOfRange(usize),

    /// Removing the currently playing track is rejected; stop or skip first.
    #[error("cannot remove the currently playing track")]
    RemoveCurrent,
}

/// Serializable snapshot sent to consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Tracks in order.
    pub tracks: Vec<Track>,
    /// Current index, `-1` when idle.
    pub current_index: i64,
}

/// Ordered track sequence with a current index in `[-1, len)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackQueue {
    tracks: Vec<Track>,
    current_index: i64,
}

impl TrackQueue {
    /// Creates an empty queue with index `-1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            current_index: -1,
        }
    }

    /// Rebuilds a queue from persisted parts, clamping a stale index.
    #[must_use]
    pub fn from_parts(tracks: Vec<Track>, current_index: i64) -> Self {
        let clamped = if tracks.is_empty() {
            -1
        } else {
            current_index.clamp(-1, tracks.len() as i64 - 1)
        };
        Self {
            tracks,
            current_index: clamped,
        }
    }

    /// Number of queued tracks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// True when no tracks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Current index, `-1` when idle.
    #[must_use]
    pub fn current_index(&self) -> i64 {
        self.current_index
    }

    /// The track at the current index.
    #[must_use]
    pub fn current(&self) -> Option<&Track> {
        usize::try_from(self.current_index)
            .ok()
            .and_then(|i| self.tracks.get(i))
    }

    /// Track at an arbitrary index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    /// Appends a track, returning its index.
    pub fn push(&mut self, track: Track) -> usize {
        self.tracks.push(track);
        self.tracks.len() - 1
    }

    /// Sets the current index to an existing position.
    pub fn set_index(&mut self, index: usize) -> Result<(), QueueError> {
        if index >= self.tracks.len() {
            return Err(QueueError::OutOfRange(index));
        }
        self.current_index = index as i64;
        Ok(())
    }

    /// Advances past a finished track. Returns the next track, or `None`
    /// (index reset to `-1`) when the queue ran out.
    pub fn advance(&mut self) -> Option<&Track> {
        let next = self.current_index + 1;
        if next >= self.tracks.len() as i64 {
            self.current_index = -1;
            return None;
        }
        self.current_index = next;
        self.current()
    }

    /// Moves one track forward, clamped to the last track.
    /// Returns the new current track.
    pub fn skip(&mut self) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        let last = self.tracks.len() as i64 - 1;
        self.current_index = (self.current_index + 1).min(last);
        self.current()
    }

    /// Moves one track backward, clamped to the first track.
    /// Returns the new current track.
    pub fn previous(&mut self) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        self.current_index = (self.current_index - 1).max(0);
        self.current()
    }

    /// Removes the track at `index`.
    ///
    /// `playing` guards the currently playing track: while true, removing
    /// the current index is rejected (the caller must stop or skip first).
    /// Removing below the current index shifts it down by one.
    pub fn remove(&mut self, index: usize, playing: bool) -> Result<Track, QueueError> {
        if index >= self.tracks.len() {
            return Err(QueueError::OutOfRange(index));
        }
        if playing && index as i64 == self.current_index {
            return Err(QueueError::RemoveCurrent);
        }

        let removed = self.tracks.remove(index);
        if (index as i64) < self.current_index {
            self.current_index -= 1;
        } else if self.current_index >= self.tracks.len() as i64 {
            // Removed at or past the tail while current pointed there
            self.current_index = if self.tracks.is_empty() {
                -1
            } else {
                self.tracks.len() as i64 - 1
            };
        }
        Ok(removed)
    }

    /// Empties the queue and resets the index to `-1`.
    pub fn clear(&mut self) {
        self.tracks.clear();
        self.current_index = -1;
    }

    /// Rewrites a track in place after deferred resolution.
    pub fn update_track(&mut self, index: usize, patch: TrackPatch) -> Result<(), QueueError> {
        let track = self
            .tracks
            .get_mut(index)
            .ok_or(QueueError::OutOfRange(index))?;
        if let Some(url) = patch.url {
            track.url = url;
        }
        if let Some(title) = patch.title {
            track.title = title;
        }
        if let Some(duration) = patch.duration_secs {
            track.duration_secs = Some(duration);
        }
        if let Some(thumbnail) = patch.thumbnail {
            track.thumbnail = Some(thumbnail);
        }
        Ok(())
    }

    /// Snapshot for consumer messages and persistence.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            tracks: self.tracks.clone(),
            current_index: self.current_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(n: usize) -> Track {
        Track::new(format!("https://example.com/{n}"), format!("Track {n}"))
    }

    fn queue_of(n: usize) -> TrackQueue {
        let mut queue = TrackQueue::new();
        for i in 0..n {
            queue.push(track(i));
        }
        queue
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Track
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn deferred_track_carries_query() {
        let track = Track::deferred("never gonna give you up");
        assert!(track.is_deferred());
        assert_eq!(track.search_query(), Some("never gonna give you up"));
    }

    #[test]
    fn concrete_track_is_not_deferred() {
        let track = Track::new("https://example.com/a", "A");
        assert!(!track.is_deferred());
        assert_eq!(track.search_query(), None);
    }

    #[test]
    fn track_serializes_camel_case() {
        let mut t = track(0);
        t.duration_secs = Some(180.0);
        let json = serde_json::to_value(&t).unwrap();
        assert!(json.get("durationSecs").is_some());
        assert!(json.get("addedAt").is_some());
        assert!(json.get("thumbnail").is_none());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Index Invariants
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn empty_queue_is_idle() {
        let queue = TrackQueue::new();
        assert_eq!(queue.current_index(), -1);
        assert!(queue.current().is_none());
    }

    #[test]
    fn push_does_not_begin_playback() {
        let queue = queue_of(3);
        assert_eq!(queue.current_index(), -1);
    }

    #[test]
    fn set_index_selects_track() {
        let mut queue = queue_of(3);
        queue.set_index(1).unwrap();
        assert_eq!(queue.current().unwrap().title, "Track 1");
    }

    #[test]
    fn set_index_out_of_range_rejected() {
        let mut queue = queue_of(3);
        assert_eq!(queue.set_index(3), Err(QueueError::OutOfRange(3)));
    }

    #[test]
    fn from_parts_clamps_stale_index() {
        let tracks = vec![track(0), track(1)];
        let queue = TrackQueue::from_parts(tracks, 7);
        assert_eq!(queue.current_index(), 1);

        let queue = TrackQueue::from_parts(Vec::new(), 3);
        assert_eq!(queue.current_index(), -1);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Advance / Skip / Previous
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn advance_walks_then_goes_idle() {
        let mut queue = queue_of(2);
        queue.set_index(0).unwrap();

        assert_eq!(queue.advance().unwrap().title, "Track 1");
        assert!(queue.advance().is_none());
        assert_eq!(queue.current_index(), -1);
    }

    #[test]
    fn skip_clamps_at_tail() {
        let mut queue = queue_of(2);
        queue.set_index(1).unwrap();
        assert_eq!(queue.skip().unwrap().title, "Track 1");
        assert_eq!(queue.current_index(), 1);
    }

    #[test]
    fn previous_clamps_at_head() {
        let mut queue = queue_of(2);
        queue.set_index(0).unwrap();
        assert_eq!(queue.previous().unwrap().title, "Track 0");
        assert_eq!(queue.current_index(), 0);
    }

    #[test]
    fn skip_from_idle_starts_at_head() {
        let mut queue = queue_of(3);
        assert_eq!(queue.skip().unwrap().title, "Track 0");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Remove
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn remove_current_while_playing_rejected() {
        let mut queue = queue_of(3);
        queue.set_index(1).unwrap();
        assert_eq!(queue.remove(1, true), Err(QueueError::RemoveCurrent));
    }

    #[test]
    fn remove_current_while_stopped_allowed() {
        let mut queue = queue_of(3);
        queue.set_index(1).unwrap();
        let removed = queue.remove(1, false).unwrap();
        assert_eq!(removed.title, "Track 1");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn remove_below_current_shifts_index() {
        let mut queue = queue_of(3);
        queue.set_index(2).unwrap();
        queue.remove(0, true).unwrap();
        assert_eq!(queue.current_index(), 1);
        assert_eq!(queue.current().unwrap().title, "Track 2");
    }

    #[test]
    fn remove_above_current_keeps_index() {
        let mut queue = queue_of(3);
        queue.set_index(0).unwrap();
        queue.remove(2, true).unwrap();
        assert_eq!(queue.current_index(), 0);
    }

    #[test]
    fn remove_last_track_goes_idle() {
        let mut queue = queue_of(1);
        let removed = queue.remove(0, false).unwrap();
        assert_eq!(removed.title, "Track 0");
        assert_eq!(queue.current_index(), -1);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_out_of_range_rejected() {
        let mut queue = queue_of(1);
        assert_eq!(queue.remove(5, false), Err(QueueError::OutOfRange(5)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Update / Clear / Snapshot
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn update_track_rewrites_resolution_fields() {
        let mut queue = TrackQueue::new();
        queue.push(Track::deferred("a song"));

        queue
            .update_track(
                0,
                TrackPatch {
                    url: Some("https://example.com/resolved".into()),
                    title: Some("A Song".into()),
                    duration_secs: Some(200.0),
                    thumbnail: Some("https://example.com/t.jpg".into()),
                },
            )
            .unwrap();

        let track = queue.get(0).unwrap();
        assert!(!track.is_deferred());
        assert_eq!(track.title, "A Song");
        assert_eq!(track.duration_secs, Some(200.0));
    }

    #[test]
    fn clear_resets_to_idle() {
        let mut queue = queue_of(3);
        queue.set_index(2).unwrap();
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.current_index(), -1);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut queue = queue_of(2);
        queue.set_index(1).unwrap();
        let json = serde_json::to_value(queue.snapshot()).unwrap();
        assert_eq!(json["currentIndex"], 1);
        assert_eq!(json["tracks"].as_array().unwrap().len(), 2);
    }
}
