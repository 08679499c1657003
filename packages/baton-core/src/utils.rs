//! General utilities shared across the application.

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current wall-clock time as an ISO-8601 string (UTC).
///
/// This is the format used for all persisted dates.
#[must_use]
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Id Validation
// ─────────────────────────────────────────────────────────────────────────────

use crate::error::ErrorCode;
use crate::protocol_constants::SESSION_ID_LEN;

/// Error returned when a consumer/session id cannot travel the wire protocol.
///
/// Session ids are embedded verbatim in every audio record header, so they
/// must fit the fixed-width ASCII field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    /// Empty ids are not addressable.
    Empty,
    /// Id exceeds the fixed header width.
    TooLong(usize),
    /// Id contains non-ASCII or whitespace bytes (space is the pad byte).
    InvalidChar(char),
}

impl ErrorCode for IdValidationError {
    fn code(&self) -> &'static str {
        "invalid_session_id"
    }
}

impl std::fmt::Display for IdValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "session id is empty"),
            Self::TooLong(len) => write!(
                f,
                "session id is {len} bytes, maximum is {SESSION_ID_LEN}"
            ),
            Self::InvalidChar(c) => write!(f, "session id contains invalid character {c:?}"),
        }
    }
}

/// Validates a session id against the wire header constraints.
///
/// Accepts non-empty ASCII ids of at most [`SESSION_ID_LEN`] bytes with no
/// whitespace (the header pads with spaces, so embedded spaces would be
/// ambiguous on the read side).
pub fn validate_session_id(id: &str) -> Result<(), IdValidationError> {
    if id.is_empty() {
        return Err(IdValidationError::Empty);
    }
    if id.len() > SESSION_ID_LEN {
        return Err(IdValidationError::TooLong(id.len()));
    }
    if let Some(c) = id.chars().find(|c| !c.is_ascii() || c.is_ascii_whitespace()) {
        return Err(IdValidationError::InvalidChar(c));
    }
    Ok(())
}
