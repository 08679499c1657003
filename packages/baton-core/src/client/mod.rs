//! Client-side adapters for one session's frame stream.
//!
//! Three variants, picked per sink by [`crate::state::AdapterMode`]:
//!
//! - [`PassthroughAdapter`]: container bytes written unchanged; the
//!   voice-chat library demuxes frames itself.
//! - [`JitterBuffer`]: raw 20 ms Opus frames, decoded to PCM through
//!   [`OpusFrameDecoder`] and stabilized before paced output.
//! - [`PlaybackScheduler`]: browser playback paced against real time.

pub mod jitter;
pub mod passthrough;
pub mod scheduler;

pub use jitter::{JitterBuffer, JitterStats};
pub use passthrough::PassthroughAdapter;
pub use scheduler::{PlaybackScheduler, SchedulerState, TickOutput};

use audiopus::coder::Decoder;
use audiopus::packet::Packet;
use audiopus::{Channels, MutSignals, SampleRate};
use bytes::Bytes;

use crate::protocol_constants::{CHANNELS, FRAME_DURATION_MS, SAMPLE_RATE};

/// Decoded size of one 20 ms stereo frame (bytes of interleaved i16 PCM).
pub const DECODED_FRAME_BYTES: usize =
    (SAMPLE_RATE as usize / 1000) * FRAME_DURATION_MS as usize * CHANNELS as usize * 2;

/// Largest decode buffer Opus can require (120 ms at 48 kHz stereo).
const MAX_DECODE_SAMPLES: usize = 5760 * CHANNELS as usize;

/// Opus decoder for the voice-chat path: one 20 ms packet in, interleaved
/// 16-bit little-endian stereo PCM out.
pub struct OpusFrameDecoder {
    decoder: Decoder,
    pcm: Vec<i16>,
}

impl OpusFrameDecoder {
    /// Creates a 48 kHz stereo decoder.
    pub fn new() -> Result<Self, audiopus::Error> {
        Ok(Self {
            decoder: Decoder::new(SampleRate::Hz48000, Channels::Stereo)?,
            pcm: vec![0i16; MAX_DECODE_SAMPLES],
        })
    }

    /// Decodes one Opus packet to PCM bytes.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Bytes, audiopus::Error> {
        let packet = Packet::try_from(frame)?;
        let signals = MutSignals::try_from(&mut self.pcm[..])?;
        let samples_per_channel = self.decoder.decode(Some(packet), signals, false)?;

        let total = samples_per_channel * CHANNELS as usize;
        let mut out = Vec::with_capacity(total * 2);
        for &sample in &self.pcm[..total] {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(Bytes::from(out))
    }
}
