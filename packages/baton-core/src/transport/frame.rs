//! Audio record framing and the serialized socket writer.
//!
//! Wire layout of an audio record: a 4-byte big-endian length `N`
//! (1 ≤ N ≤ 1 MiB), then `N` bytes whose first 24 are the ASCII engine
//! session id (space-padded), remainder the audio payload. Event records are
//! newline-delimited JSON objects on the same socket.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::events::EngineEvent;
use crate::protocol_constants::{MAX_RECORD_LEN, RECORD_LEN_PREFIX, SESSION_ID_LEN};

/// Framing errors raised while encoding or decoding records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Record length below the 24-byte session-id header.
    #[error("record of {0} bytes is shorter than the session-id header")]
    RecordTooShort(usize),

    /// Record length above the 1 MiB cap.
    #[error("record of {0} bytes exceeds the maximum record length")]
    RecordTooLong(usize),

    /// Event bytes were not a valid JSON event object.
    #[error("unparseable event record: {0}")]
    BadEvent(String),
}

/// Pads a session id into the fixed-width ASCII header field.
///
/// Callers validate ids with [`crate::utils::validate_session_id`] before
/// they reach the wire, so truncation here cannot occur.
#[must_use]
pub fn pad_session_id(id: &str) -> [u8; SESSION_ID_LEN] {
    let mut padded = [b' '; SESSION_ID_LEN];
    let bytes = id.as_bytes();
    let len = bytes.len().min(SESSION_ID_LEN);
    padded[..len].copy_from_slice(&bytes[..len]);
    padded
}

/// Splits a decoded record body into `(session_id, payload)`.
///
/// The id is the first 24 bytes with trailing pad spaces removed.
pub fn split_record(body: Bytes) -> Result<(String, Bytes), FrameError> {
    if body.len() < SESSION_ID_LEN {
        return Err(FrameError::RecordTooShort(body.len()));
    }
    let id = String::from_utf8_lossy(&body[..SESSION_ID_LEN])
        .trim_end()
        .to_string();
    Ok((id, body.slice(SESSION_ID_LEN..)))
}

/// Serialized writer for the streaming socket.
///
/// One lock is held across a full record write so concurrent session loops
/// can never interleave partial records. Events go through the same lock,
/// which is what gives a single session's events and frames their total
/// order.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    /// Wraps a socket write half (or any async writer, in tests).
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Writes one audio record: length prefix, padded id, payload.
    ///
    /// The record is assembled into a single buffer first so the socket
    /// sees exactly one contiguous write per record.
    pub async fn write_audio(&self, session_id: &str, payload: &[u8]) -> io::Result<()> {
        let body_len = SESSION_ID_LEN + payload.len();
        if body_len > MAX_RECORD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                FrameError::RecordTooLong(body_len).to_string(),
            ));
        }

        let mut record = BytesMut::with_capacity(RECORD_LEN_PREFIX + body_len);
        record.put_u32(body_len as u32);
        record.put_slice(&pad_session_id(session_id));
        record.put_slice(payload);

        let mut writer = self.inner.lock().await;
        writer.write_all(&record).await?;
        writer.flush().await
    }

    /// Writes one newline-delimited JSON event record.
    pub async fn write_event(&self, event: &EngineEvent) -> io::Result<()> {
        // serde_json cannot fail on these closed enum shapes
        let mut line = serde_json::to_vec(event).map_err(io::Error::other)?;
        line.push(b'\n');

        let mut writer = self.inner.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_fills_with_spaces() {
        let padded = pad_session_id("abc");
        assert_eq!(&padded[..3], b"abc");
        assert!(padded[3..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn pad_exact_width_untouched() {
        let id = "x".repeat(SESSION_ID_LEN);
        let padded = pad_session_id(&id);
        assert_eq!(&padded[..], id.as_bytes());
    }

    #[test]
    fn split_recovers_id_and_payload() {
        let mut body = BytesMut::new();
        body.put_slice(&pad_session_id("guild-9"));
        body.put_slice(b"audio-bytes");

        let (id, payload) = split_record(body.freeze()).unwrap();
        assert_eq!(id, "guild-9");
        assert_eq!(&payload[..], b"audio-bytes");
    }

    #[test]
    fn split_rejects_short_body() {
        let body = Bytes::from_static(b"too short");
        assert_eq!(
            split_record(body),
            Err(FrameError::RecordTooShort(9))
        );
    }

    #[tokio::test]
    async fn write_audio_produces_exact_layout() {
        let writer = FrameWriter::new(Vec::new());
        writer.write_audio("s1", b"payload").await.unwrap();

        let buf = writer.inner.into_inner();
        let expected_body = SESSION_ID_LEN + 7;
        assert_eq!(
            &buf[..RECORD_LEN_PREFIX],
            (expected_body as u32).to_be_bytes()
        );
        assert_eq!(&buf[RECORD_LEN_PREFIX..RECORD_LEN_PREFIX + 2], b"s1");
        assert_eq!(&buf[RECORD_LEN_PREFIX + SESSION_ID_LEN..], b"payload");
    }

    #[tokio::test]
    async fn write_event_is_newline_terminated_json() {
        let writer = FrameWriter::new(Vec::new());
        writer
            .write_event(&EngineEvent::Ready {
                session_id: "s1".into(),
            })
            .await
            .unwrap();

        let buf = writer.inner.into_inner();
        assert_eq!(*buf.last().unwrap(), b'\n');
        let parsed: EngineEvent = serde_json::from_slice(&buf[..buf.len() - 1]).unwrap();
        assert_eq!(
            parsed,
            EngineEvent::Ready {
                session_id: "s1".into()
            }
        );
    }

    #[tokio::test]
    async fn oversized_record_rejected() {
        let writer = FrameWriter::new(Vec::new());
        let payload = vec![0u8; MAX_RECORD_LEN];
        let err = writer.write_audio("s1", &payload).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
