//! Engine control-plane HTTP API.
//!
//! JSON request/response over a local TCP port, decoupling control latency
//! from the continuously streaming audio socket. Domain errors answer with
//! HTTP 200 and `status: "error"` (the message carries the cause);
//! transport-level 5xx means the engine process itself is unavailable.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::engine::{Engine, PlayRequest, SessionState, TranscodeFormat};
use crate::protocol_constants::SERVICE_ID;

/// Default number of search candidates requested from the extractor.
const SEARCH_RESULT_COUNT: usize = 5;

/// Body of `POST /session/{id}/play`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlayBody {
    /// Opaque media URL.
    pub url: String,
    /// Output variant.
    #[serde(default)]
    pub format: TranscodeFormat,
    /// Seconds to skip before encoding.
    #[serde(default)]
    pub start_at: f64,
    /// Known duration in seconds; skips the metadata roundtrip.
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Uniform control response: `{status, session_id, message?}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    /// `playing`, `ok`, or `error`.
    pub status: String,
    /// Echoed session id, when the request addressed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Cause, on `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlResponse {
    fn ok(status: &str, session_id: &str) -> Self {
        Self {
            status: status.to_string(),
            session_id: Some(session_id.to_string()),
            message: None,
        }
    }

    fn error(session_id: Option<&str>, message: impl std::fmt::Display) -> Self {
        Self {
            status: "error".to_string(),
            session_id: session_id.map(str::to_string),
            message: Some(message.to_string()),
        }
    }

    /// True when the engine accepted the request.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status != "error"
    }
}

/// Response of `GET /session/{id}/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// `ok` or `error`.
    pub status: String,
    /// Echoed session id.
    pub session_id: String,
    /// Lifecycle state, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    /// Audio payload bytes sent.
    #[serde(default)]
    pub bytes_sent: u64,
    /// Whether the pause gate is closed.
    #[serde(default)]
    pub paused: bool,
    /// Cause, on `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lookup responses wrap the result or an error message.
#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResponse<T> {
    /// `ok` or `error`.
    pub status: String,
    /// Lookup result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    /// Cause, on `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> LookupResponse<T> {
    fn ok(result: T) -> Self {
        Self {
            status: "ok".to_string(),
            result: Some(result),
            message: None,
        }
    }

    fn error(message: impl std::fmt::Display) -> Self {
        Self {
            status: "error".to_string(),
            result: None,
            message: Some(message.to_string()),
        }
    }
}

/// Health probe body.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok` when the process answers.
    pub status: String,
    /// Service identifier the orchestrator matches on.
    pub service: String,
    /// Crate version.
    pub version: String,
    /// Live session count.
    pub sessions: usize,
}

#[derive(Deserialize)]
struct UrlQuery {
    url: String,
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

/// Builds the control-plane router around an engine.
pub fn router<W>(engine: Arc<Engine<W>>) -> Router
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    Router::new()
        .route("/session/{id}/play", post(handle_play))
        .route("/session/{id}/stop", post(handle_stop))
        .route("/session/{id}/pause", post(handle_pause))
        .route("/session/{id}/resume", post(handle_resume))
        .route("/session/{id}/status", get(handle_status))
        .route("/metadata", get(handle_metadata))
        .route("/playlist", get(handle_playlist))
        .route("/search", get(handle_search))
        .route("/health", get(handle_health))
        .with_state(engine)
}

async fn handle_play<W>(
    State(engine): State<Arc<Engine<W>>>,
    Path(id): Path<String>,
    Json(body): Json<PlayBody>,
) -> Json<ControlResponse>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let request = PlayRequest {
        url: body.url,
        format: body.format,
        start_at_secs: body.start_at,
        duration_hint_secs: body.duration,
    };
    match engine.play(&id, request).await {
        Ok(()) => Json(ControlResponse::ok("playing", &id)),
        Err(err) => Json(ControlResponse::error(Some(&id), err)),
    }
}

async fn handle_stop<W>(
    State(engine): State<Arc<Engine<W>>>,
    Path(id): Path<String>,
) -> Json<ControlResponse>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    engine.stop(&id).await;
    Json(ControlResponse::ok("ok", &id))
}

async fn handle_pause<W>(
    State(engine): State<Arc<Engine<W>>>,
    Path(id): Path<String>,
) -> Json<ControlResponse>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match engine.pause(&id) {
        Ok(()) => Json(ControlResponse::ok("ok", &id)),
        Err(err) => Json(ControlResponse::error(Some(&id), err)),
    }
}

async fn handle_resume<W>(
    State(engine): State<Arc<Engine<W>>>,
    Path(id): Path<String>,
) -> Json<ControlResponse>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match engine.resume(&id) {
        Ok(()) => Json(ControlResponse::ok("ok", &id)),
        Err(err) => Json(ControlResponse::error(Some(&id), err)),
    }
}

async fn handle_status<W>(
    State(engine): State<Arc<Engine<W>>>,
    Path(id): Path<String>,
) -> Json<StatusResponse>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match engine.status(&id) {
        Ok(status) => Json(StatusResponse {
            status: "ok".to_string(),
            session_id: id,
            state: Some(status.state),
            bytes_sent: status.bytes_sent,
            paused: status.paused,
            message: None,
        }),
        Err(err) => Json(StatusResponse {
            status: "error".to_string(),
            session_id: id,
            state: None,
            bytes_sent: 0,
            paused: false,
            message: Some(err.to_string()),
        }),
    }
}

async fn handle_metadata<W>(
    State(engine): State<Arc<Engine<W>>>,
    Query(query): Query<UrlQuery>,
) -> Json<LookupResponse<crate::engine::MediaInfo>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match engine.metadata(&query.url).await {
        Ok(info) => Json(LookupResponse::ok(info)),
        Err(err) => Json(LookupResponse::error(err)),
    }
}

async fn handle_playlist<W>(
    State(engine): State<Arc<Engine<W>>>,
    Query(query): Query<UrlQuery>,
) -> Json<LookupResponse<crate::engine::PlaylistInfo>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match engine.playlist(&query.url).await {
        Ok(info) => Json(LookupResponse::ok(info)),
        Err(err) => Json(LookupResponse::error(err)),
    }
}

async fn handle_search<W>(
    State(engine): State<Arc<Engine<W>>>,
    Query(query): Query<SearchQuery>,
) -> Json<LookupResponse<Vec<crate::engine::PlaylistEntry>>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match engine.search(&query.q, SEARCH_RESULT_COUNT).await {
        Ok(entries) => Json(LookupResponse::ok(entries)),
        Err(err) => Json(LookupResponse::error(err)),
    }
}

async fn handle_health<W>(State(engine): State<Arc<Engine<W>>>) -> Json<HealthResponse>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_ID.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: engine.session_count(),
    })
}
