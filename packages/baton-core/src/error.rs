//! Centralized error types for the Baton core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses
//!
//! Domain errors that travel the control plane are NOT surfaced as HTTP
//! errors: the control plane answers 200 with a `status: "error"` body, and
//! transport-level failures (5xx) mean the engine process itself is down.
//! `IntoResponse` here covers the orchestrator-facing endpoints where
//! conventional status codes apply.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::engine::extractor::ExtractError;
use crate::orchestrator::persistence::StoreError;
use crate::transport::frame::FrameError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for ExtractError {
    fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "extractor_spawn_failed",
            Self::Timeout => "extractor_timeout",
            Self::Failed { .. } => "extractor_failed",
            Self::NoOutput => "extractor_no_output",
            Self::Parse(_) => "extractor_parse_error",
        }
    }
}

impl ErrorCode for FrameError {
    fn code(&self) -> &'static str {
        match self {
            Self::RecordTooShort(_) => "record_too_short",
            Self::RecordTooLong(_) => "record_too_long",
            Self::BadEvent(_) => "bad_event_json",
        }
    }
}

/// Application-wide error type for the Baton services.
#[derive(Debug, Error)]
pub enum BatonError {
    /// Media extraction failed (bad URL, site error, timeout).
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// Transcoder subprocess failed or produced a bad stream.
    #[error("Transcode failed: {0}")]
    Transcode(String),

    /// Requested engine session does not exist.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Session id cannot travel the wire protocol.
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    /// Deferred URL resolution produced no usable candidate.
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// Streaming socket failure (write error, disconnect).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persisted session store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// The engine control plane is unreachable.
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Service configuration error (missing required settings).
    ///
    /// The only error class that is fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BatonError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Extraction(_) => "extraction_failed",
            Self::Transcode(_) => "transcode_failed",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidSessionId(_) => "invalid_session_id",
            Self::Resolution(_) => "resolution_failed",
            Self::Transport(_) => "transport_error",
            Self::Store(_) => "store_error",
            Self::EngineUnavailable(_) => "engine_unavailable",
            Self::Internal(_) => "internal_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
            Self::EngineUnavailable(_) | Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type BatonResult<T> = Result<T, BatonError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for BatonError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ExtractError> for BatonError {
    fn from(err: ExtractError) -> Self {
        Self::Extraction(err.to_string())
    }
}

impl From<StoreError> for BatonError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<FrameError> for BatonError {
    fn from(err: FrameError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<crate::utils::IdValidationError> for BatonError {
    fn from(err: crate::utils::IdValidationError) -> Self {
        Self::InvalidSessionId(err.to_string())
    }
}

impl From<reqwest::Error> for BatonError {
    fn from(err: reqwest::Error) -> Self {
        Self::EngineUnavailable(err.to_string())
    }
}
