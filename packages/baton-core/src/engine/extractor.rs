//! Media extraction: resolving opaque URLs to concrete streams and metadata.
//!
//! Extraction shells out to `yt-dlp`, supervised with a bounded timeout.
//! Cancellation kills the subprocess and discards partial output. All of
//! the engine's best-effort lookups (`metadata`, `playlist`, `search`)
//! funnel through the same runner.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::protocol_constants::EXTRACT_TIMEOUT_SECS;

/// Errors from one extractor invocation.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The subprocess could not be spawned (binary missing, permissions).
    #[error("failed to spawn extractor: {0}")]
    Spawn(#[from] std::io::Error),

    /// The subprocess exceeded the supervision timeout and was killed.
    #[error("extractor timed out after {EXTRACT_TIMEOUT_SECS}s")]
    Timeout,

    /// The subprocess exited non-zero.
    #[error("extractor failed: {stderr}")]
    Failed {
        /// Trimmed stderr tail for the error event.
        stderr: String,
    },

    /// The subprocess succeeded but produced nothing usable.
    #[error("extractor produced no output")]
    NoOutput,

    /// The subprocess output was not the expected JSON.
    #[error("extractor output unparseable: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Metadata for one resolved media item.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct MediaInfo {
    /// Direct media stream URL (bestaudio).
    pub url: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Duration in seconds, when the site reports one.
    #[serde(default, rename = "duration")]
    pub duration_secs: Option<f64>,
    /// Thumbnail URL, when available.
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// Original page URL, kept for queue display.
    #[serde(default)]
    pub webpage_url: Option<String>,
}

/// One entry of a flat playlist listing.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct PlaylistEntry {
    /// Page URL of the entry.
    pub url: String,
    /// Entry title.
    #[serde(default)]
    pub title: String,
    /// Duration in seconds, when reported.
    #[serde(default, rename = "duration")]
    pub duration_secs: Option<f64>,
}

/// Flat playlist listing as emitted by the extractor with `-J`.
#[derive(Debug, Deserialize)]
struct FlatListing {
    #[serde(default)]
    entries: Vec<PlaylistEntry>,
    #[serde(default)]
    title: Option<String>,
}

/// A resolved playlist: title plus entries.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct PlaylistInfo {
    /// Playlist title, when the site reports one.
    pub title: Option<String>,
    /// Entries in playlist order.
    pub entries: Vec<PlaylistEntry>,
}

/// Supervised `yt-dlp` runner.
///
/// The binary name is configurable so tests can substitute a stub and
/// deployments can pin a wrapper script.
#[derive(Debug, Clone)]
pub struct Extractor {
    command: String,
    timeout: Duration,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    /// Creates an extractor invoking `yt-dlp` with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            command: "yt-dlp".to_string(),
            timeout: Duration::from_secs(EXTRACT_TIMEOUT_SECS),
        }
    }

    /// Overrides the extractor binary (tests, wrapper scripts).
    #[must_use]
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::new()
        }
    }

    /// Overrides the supervision timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolves an opaque URL to its direct stream URL plus metadata.
    pub async fn resolve(&self, url: &str) -> Result<MediaInfo, ExtractError> {
        let output = self.run(&resolve_args(url)).await?;
        let info: MediaInfo = serde_json::from_str(output.trim())?;
        Ok(info)
    }

    /// Resolves only the direct stream URL, skipping the metadata roundtrip.
    ///
    /// Used when the caller already supplied a duration hint.
    pub async fn stream_url(&self, url: &str) -> Result<String, ExtractError> {
        let output = self.run(&stream_url_args(url)).await?;
        let line = output.lines().next().unwrap_or("").trim();
        if line.is_empty() {
            return Err(ExtractError::NoOutput);
        }
        Ok(line.to_string())
    }

    /// Fetches metadata without resolving a stream URL.
    pub async fn metadata(&self, url: &str) -> Result<MediaInfo, ExtractError> {
        self.resolve(url).await
    }

    /// Lists a playlist without resolving its entries.
    pub async fn playlist(&self, url: &str) -> Result<PlaylistInfo, ExtractError> {
        let output = self.run(&playlist_args(url)).await?;
        let listing: FlatListing = serde_json::from_str(output.trim())?;
        Ok(PlaylistInfo {
            title: listing.title,
            entries: listing.entries,
        })
    }

    /// Searches for candidates matching a free-text query.
    pub async fn search(&self, query: &str, count: usize) -> Result<Vec<PlaylistEntry>, ExtractError> {
        let output = self.run(&search_args(query, count)).await?;
        let listing: FlatListing = serde_json::from_str(output.trim())?;
        Ok(listing.entries)
    }

    /// Runs the extractor once under the timeout, returning stdout.
    async fn run(&self, args: &[String]) -> Result<String, ExtractError> {
        log::debug!("[Extractor] {} {}", self.command, args.join(" "));
        let mut child = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let result = tokio::time::timeout(self.timeout, async {
            let stdout = child.stdout.take().ok_or(ExtractError::NoOutput)?;
            let stderr = child.stderr.take().ok_or(ExtractError::NoOutput)?;
            let (out, err) = tokio::join!(read_to_string(stdout), read_to_string(stderr));
            let status = child.wait().await?;
            if !status.success() {
                return Err(ExtractError::Failed {
                    stderr: tail(&err, 512),
                });
            }
            if out.trim().is_empty() {
                return Err(ExtractError::NoOutput);
            }
            Ok(out)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => {
                // Partial output is discarded; kill_on_drop reaps the child
                log::warn!("[Extractor] Timed out, killing subprocess");
                let _ = child.kill().await;
                Err(ExtractError::Timeout)
            }
        }
    }
}

async fn read_to_string<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    let _ = reader.read_to_string(&mut buf).await;
    buf
}

/// Last `max` bytes of a stderr dump, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

fn resolve_args(url: &str) -> Vec<String> {
    vec![
        "-f".into(),
        "bestaudio/best".into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        "-j".into(),
        url.into(),
    ]
}

fn stream_url_args(url: &str) -> Vec<String> {
    vec![
        "-f".into(),
        "bestaudio/best".into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        "--get-url".into(),
        url.into(),
    ]
}

fn playlist_args(url: &str) -> Vec<String> {
    vec![
        "--flat-playlist".into(),
        "--no-warnings".into(),
        "-J".into(),
        url.into(),
    ]
}

fn search_args(query: &str, count: usize) -> Vec<String> {
    vec![
        "--flat-playlist".into(),
        "--no-warnings".into(),
        "-J".into(),
        format!("ytsearch{count}:{query}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_args_request_single_json() {
        let args = resolve_args("https://example.com/watch?v=1");
        assert!(args.contains(&"-j".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert_eq!(args.last().unwrap(), "https://example.com/watch?v=1");
    }

    #[test]
    fn search_args_embed_count_and_query() {
        let args = search_args("some song", 5);
        assert_eq!(args.last().unwrap(), "ytsearch5:some song");
    }

    #[test]
    fn media_info_parses_extractor_json() {
        let json = r#"{
            "url": "https://cdn.example/audio.webm",
            "title": "A Song (Official Audio)",
            "duration": 215.0,
            "thumbnail": "https://cdn.example/thumb.jpg",
            "webpage_url": "https://example.com/watch?v=1",
            "uploader": "ignored extra field"
        }"#;
        let info: MediaInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.url, "https://cdn.example/audio.webm");
        assert_eq!(info.duration_secs, Some(215.0));
        assert_eq!(info.webpage_url.as_deref(), Some("https://example.com/watch?v=1"));
    }

    #[test]
    fn media_info_tolerates_missing_optionals() {
        let info: MediaInfo =
            serde_json::from_str(r#"{"url": "https://cdn.example/a"}"#).unwrap();
        assert_eq!(info.title, "");
        assert_eq!(info.duration_secs, None);
        assert_eq!(info.thumbnail, None);
    }

    #[test]
    fn flat_listing_parses_entries() {
        let json = r#"{
            "title": "My Mix",
            "entries": [
                {"url": "https://e/1", "title": "One", "duration": 60.0},
                {"url": "https://e/2", "title": "Two"}
            ]
        }"#;
        let listing: FlatListing = serde_json::from_str(json).unwrap();
        assert_eq!(listing.title.as_deref(), Some("My Mix"));
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.entries[1].duration_secs, None);
    }

    #[test]
    fn tail_truncates_on_char_boundary() {
        let s = format!("{}é-tail", "x".repeat(600));
        let t = tail(&s, 10);
        assert!(t.len() <= 10);
        assert!(t.ends_with("-tail"));
    }

    #[tokio::test]
    async fn failed_subprocess_reports_stderr() {
        let extractor = Extractor::with_command("false");
        let err = extractor.resolve("https://example.com").await.unwrap_err();
        assert!(matches!(err, ExtractError::Failed { .. }));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_error() {
        let extractor = Extractor::with_command("definitely-not-a-binary-xyz");
        let err = extractor.resolve("https://example.com").await.unwrap_err();
        assert!(matches!(err, ExtractError::Spawn(_)));
    }

    #[tokio::test]
    async fn empty_output_reports_no_output() {
        let extractor = Extractor::with_command("true");
        let err = extractor.stream_url("https://example.com").await.unwrap_err();
        assert!(matches!(err, ExtractError::NoOutput));
    }
}
