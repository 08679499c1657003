//! Transcoder subprocess: resolved stream in, framed audio on stdout.
//!
//! The transcoder is `ffmpeg` reading the extracted media URL and writing
//! 48 kHz stereo audio to stdout in the session's output variant. Seeking
//! is an input option (`-ss` before `-i`) so ffmpeg skips without decoding.
//! Pause is NOT a subprocess concern: the session loop simply stops reading
//! stdout and OS pipe back-pressure stalls the encoder.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStdout, Command};

use crate::protocol_constants::{CHANNELS, OPUS_BITRATE, SAMPLE_RATE};

/// Output variant for a session, chosen by the consumer at `play`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TranscodeFormat {
    /// Signed 16-bit little-endian interleaved stereo, unframed.
    Pcm,
    /// Opus frames in an Ogg container, demuxed by the voice-chat library.
    #[default]
    OpusContainer,
    /// 20 ms Opus frames without a container; the client jitter-buffers.
    RawOpus,
}

impl TranscodeFormat {
    /// Wire name used in control-plane requests.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::OpusContainer => "opus-container",
            Self::RawOpus => "raw-opus",
        }
    }
}

/// A running transcoder: the child for reaping, stdout for the read loop.
pub struct TranscoderProcess {
    /// The child process; killed on stop, waited on EOF.
    pub child: Child,
    /// Piped stdout carrying the transcoded stream.
    pub stdout: ChildStdout,
}

/// Builder/spawner for the transcoder subprocess.
#[derive(Debug, Clone)]
pub struct Transcoder {
    command: String,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder {
    /// Creates a transcoder invoking `ffmpeg`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            command: "ffmpeg".to_string(),
        }
    }

    /// Overrides the transcoder binary (tests, wrapper scripts).
    #[must_use]
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Spawns the transcoder for one session.
    pub fn spawn(
        &self,
        input_url: &str,
        format: TranscodeFormat,
        start_at_secs: f64,
    ) -> std::io::Result<TranscoderProcess> {
        let args = transcode_args(input_url, format, start_at_secs);
        log::debug!("[Transcoder] {} {}", self.command, args.join(" "));

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("transcoder stdout was not piped")
        })?;

        Ok(TranscoderProcess { child, stdout })
    }
}

/// Builds the full ffmpeg argument list for one session.
fn transcode_args(input_url: &str, format: TranscodeFormat, start_at_secs: f64) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

    if start_at_secs > 0.0 {
        args.push("-ss".into());
        args.push(format!("{start_at_secs}"));
    }

    args.push("-i".into());
    args.push(input_url.into());
    args.push("-vn".into());
    args.push("-ar".into());
    args.push(SAMPLE_RATE.to_string());
    args.push("-ac".into());
    args.push(CHANNELS.to_string());

    match format {
        TranscodeFormat::Pcm => {
            args.push("-f".into());
            args.push("s16le".into());
            args.push("-acodec".into());
            args.push("pcm_s16le".into());
        }
        // Both Opus variants transcode into Ogg; the raw variant's packets
        // are extracted from the container by the session loop.
        TranscodeFormat::OpusContainer | TranscodeFormat::RawOpus => {
            args.push("-acodec".into());
            args.push("libopus".into());
            args.push("-b:a".into());
            args.push(OPUS_BITRATE.into());
            args.push("-frame_duration".into());
            args.push("20".into());
            args.push("-f".into());
            args.push("ogg".into());
        }
    }

    args.push("pipe:1".into());
    args
}
