//! Jitter buffer for raw 20 ms frame sessions.
//!
//! Frames are pushed into a FIFO as they arrive from the session sink;
//! once the FIFO holds [`JITTER_PRIME_FRAMES`] a paced loop pops one frame
//! every 20 ms into the output. A single missing frame is papered over with
//! silence (no logging); sustained underruns log exactly once and recovery
//! is logged when frames return.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::protocol_constants::{
    FRAME_DURATION_MS, JITTER_PRIME_FRAMES, SUSTAINED_UNDERRUN_FRAMES,
};

/// Totals reported when the paced loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    /// Frames emitted from real data.
    pub real_frames: u64,
    /// Ticks with no frame available (silence emitted).
    pub underruns: u64,
    /// Times the sustained-underrun threshold was crossed.
    pub sustained_events: u64,
}

struct Shared {
    fifo: Mutex<VecDeque<Bytes>>,
    finished: AtomicBool,
}

/// FIFO jitter buffer with a 20 ms paced output loop.
pub struct JitterBuffer {
    shared: Arc<Shared>,
    /// Pre-built silence frame matching the decoded frame size.
    silence: Bytes,
}

impl JitterBuffer {
    /// Creates a buffer whose underrun filler is `frame_bytes` of silence.
    #[must_use]
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                fifo: Mutex::new(VecDeque::new()),
                finished: AtomicBool::new(false),
            }),
            silence: Bytes::from(vec![0u8; frame_bytes]),
        }
    }

    /// Pushes one arrived frame.
    pub fn push(&self, frame: Bytes) {
        self.shared.fifo.lock().push_back(frame);
    }

    /// Signals that no more frames will arrive; the loop drains and stops.
    pub fn finish(&self) {
        self.shared.finished.store(true, Ordering::SeqCst);
    }

    /// Returns true when every buffered frame has been emitted.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.fifo.lock().is_empty()
    }

    /// Runs the paced output loop until the session finishes (and the FIFO
    /// drains) or the output closes. Returns totals; the caller logs them
    /// only when underruns exceed 1% of frames.
    pub async fn run(&self, output: mpsc::Sender<Bytes>) -> JitterStats {
        let mut stats = JitterStats::default();
        let mut consecutive_underruns: u32 = 0;
        let mut last_frame: Option<Bytes> = None;

        // Prime: wait for enough buffered audio to absorb arrival jitter.
        // A finished session skips straight to draining what it has.
        let mut prime_tick = interval(Duration::from_millis(FRAME_DURATION_MS));
        loop {
            if self.shared.fifo.lock().len() >= JITTER_PRIME_FRAMES
                || self.shared.finished.load(Ordering::SeqCst)
            {
                break;
            }
            prime_tick.tick().await;
        }

        let mut tick = interval(Duration::from_millis(FRAME_DURATION_MS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            let frame = self.shared.fifo.lock().pop_front();
            match frame {
                Some(frame) => {
                    if consecutive_underruns >= SUSTAINED_UNDERRUN_FRAMES {
                        log::info!(
                            "[Jitter] Recovered after {consecutive_underruns} missed frames"
                        );
                    }
                    consecutive_underruns = 0;
                    stats.real_frames += 1;
                    last_frame = Some(frame.clone());
                    if output.send(frame).await.is_err() {
                        break;
                    }
                }
                None => {
                    if self.shared.finished.load(Ordering::SeqCst) {
                        break;
                    }
                    consecutive_underruns += 1;
                    stats.underruns += 1;
                    if consecutive_underruns == SUSTAINED_UNDERRUN_FRAMES {
                        stats.sustained_events += 1;
                        log::warn!("[Jitter] sustained underrun");
                    }
                    let filler = last_frame.clone().unwrap_or_else(|| self.silence.clone());
                    if output.send(filler).await.is_err() {
                        break;
                    }
                }
            }
        }

        if stats.underruns * 100 > stats.real_frames {
            log::info!(
                "[Jitter] Session ended: {} frames, {} underruns",
                stats.real_frames,
                stats.underruns
            );
        }
        stats
    }
}
