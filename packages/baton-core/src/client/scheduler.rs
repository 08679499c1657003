//! Paced playback scheduler for browser-mode sessions.
//!
//! The browser cannot be trusted to pace itself: frames arrive in bursts
//! from the extraction pipeline, while playback consumes them at exactly
//! real time. This scheduler sits between the session sink and the consumer
//! WebSocket, feeding frames ahead of the playback position by a bounded
//! margin.
//!
//! States: `Filling` until half a second is buffered, `Playing` while
//! maintaining the schedule-ahead target (which grows to 1.5× while the
//! buffer stays healthy, capped at two seconds of buffered audio with
//! drop-oldest), `Draining` once the source finishes. Reported position
//! stays truthful across drops, progress reports are throttled to ~4 Hz,
//! and volume changes ramp with a ~10 ms time constant to avoid clicks.
//!
//! Time is injected (seconds since an arbitrary origin) so the whole state
//! machine is testable without a runtime.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::protocol_constants::{
    GAIN_RAMP_MS, INITIAL_BUFFER_SECONDS, PROGRESS_THROTTLE_MS, SCHEDULE_AHEAD_SECONDS,
    SCHEDULE_CAP_SECONDS,
};

/// Growth factor applied to the schedule-ahead target while healthy.
const HEALTHY_TARGET_GROWTH: f64 = 1.5;

/// Consecutive healthy ticks before the target grows.
const HEALTHY_STREAK_TICKS: u32 = 50;

/// Scheduler lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Accumulating the initial buffer; nothing emitted yet.
    Filling,
    /// Emitting frames to maintain the schedule-ahead target.
    Playing,
    /// Source finished; emitting what remains.
    Draining,
}

/// Output of one scheduler tick.
#[derive(Debug, Default)]
pub struct TickOutput {
    /// Frames to send to the consumer, in order.
    pub frames: Vec<Bytes>,
    /// Throttled position report (seconds), when due.
    pub progress: Option<f64>,
    /// True once everything scheduled has played out.
    pub ended: bool,
}

/// Paced scheduler over buffered frames with known durations.
pub struct PlaybackScheduler {
    state: SchedulerState,
    queue: VecDeque<(Bytes, f64)>,
    buffered_secs: f64,
    /// Timeline point (absolute clock) up to which audio has been handed out.
    scheduled_until: f64,
    /// Total track seconds handed to the consumer or dropped at the cap.
    emitted_secs: f64,
    /// Reported playback position; advances with the clock and with drops.
    position: f64,
    target_ahead: f64,
    healthy_streak: u32,
    gain: f64,
    gain_target: f64,
    last_tick: Option<f64>,
    last_progress: Option<f64>,
    finished: bool,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackScheduler {
    /// Creates an empty scheduler in `Filling`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Filling,
            queue: VecDeque::new(),
            buffered_secs: 0.0,
            scheduled_until: 0.0,
            emitted_secs: 0.0,
            position: 0.0,
            target_ahead: SCHEDULE_AHEAD_SECONDS,
            healthy_streak: 0,
            gain: 1.0,
            gain_target: 1.0,
            last_tick: None,
            last_progress: None,
            finished: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Reported playback position in seconds.
    #[must_use]
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Current ramped gain in `[0, 1]`.
    #[must_use]
    pub fn gain(&self) -> f64 {
        self.gain
    }

    /// Seconds of audio currently buffered (not yet handed out).
    #[must_use]
    pub fn buffered_secs(&self) -> f64 {
        self.buffered_secs
    }

    /// True when nothing remains buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Sets the target volume; the ramp happens across subsequent ticks.
    pub fn set_volume(&mut self, volume: f64) {
        self.gain_target = volume.clamp(0.0, 1.0);
    }

    /// Buffers one frame of `duration_secs` of audio.
    ///
    /// If the buffer exceeds the cap, the oldest frames are dropped and the
    /// reported position advances by the dropped duration.
    pub fn push_frame(&mut self, frame: Bytes, duration_secs: f64) {
        self.queue.push_back((frame, duration_secs));
        self.buffered_secs += duration_secs;

        let mut dropped = 0.0;
        while self.buffered_secs > SCHEDULE_CAP_SECONDS {
            let Some((_, dur)) = self.queue.pop_front() else {
                break;
            };
            self.buffered_secs -= dur;
            dropped += dur;
        }
        if dropped > 0.0 {
            log::debug!("[Scheduler] Buffer over cap, dropped {dropped:.2}s of audio");
            self.position += dropped;
            self.emitted_secs += dropped;
        }
    }

    /// Signals that no more frames will arrive.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Advances the scheduler to `now` (seconds), returning frames to emit
    /// and a throttled progress report.
    pub fn tick(&mut self, now: f64) -> TickOutput {
        let dt = self
            .last_tick
            .map(|last| (now - last).max(0.0))
            .unwrap_or(0.0);
        self.last_tick = Some(now);
        self.ramp_gain(dt);

        let mut out = TickOutput::default();

        match self.state {
            SchedulerState::Filling => {
                if self.buffered_secs >= INITIAL_BUFFER_SECONDS
                    || (self.finished && !self.queue.is_empty())
                {
                    self.state = SchedulerState::Playing;
                    self.scheduled_until = now;
                } else {
                    return out;
                }
            }
            SchedulerState::Playing | SchedulerState::Draining => {
                // Clock advances the reported position, clamped to what has
                // actually been handed out.
                self.position = (self.position + dt).min(self.emitted_secs);
            }
        }

        // Feed frames until the schedule-ahead target is met.
        while self.scheduled_until - now < self.target_ahead {
            let Some((frame, dur)) = self.queue.pop_front() else {
                break;
            };
            self.buffered_secs -= dur;
            self.scheduled_until += dur;
            self.emitted_secs += dur;
            out.frames.push(frame);
        }

        // A healthy buffer (frames still waiting after the feed) grows the
        // target; starvation resets it.
        if self.queue.is_empty() {
            self.healthy_streak = 0;
            self.target_ahead = SCHEDULE_AHEAD_SECONDS;
        } else {
            self.healthy_streak = self.healthy_streak.saturating_add(1);
            if self.healthy_streak >= HEALTHY_STREAK_TICKS {
                self.target_ahead = SCHEDULE_AHEAD_SECONDS * HEALTHY_TARGET_GROWTH;
            }
        }

        if self.finished && self.queue.is_empty() && self.state == SchedulerState::Playing {
            self.state = SchedulerState::Draining;
        }
        if self.state == SchedulerState::Draining && now >= self.scheduled_until {
            out.ended = true;
        }

        // Progress reports at ~4 Hz regardless of the 50 Hz frame cadence.
        let due = self
            .last_progress
            .map_or(true, |last| (now - last) * 1000.0 >= PROGRESS_THROTTLE_MS as f64);
        if due && self.state != SchedulerState::Filling {
            self.last_progress = Some(now);
            out.progress = Some(self.position);
        }

        out
    }

    /// Exponential approach of gain toward its target (~10 ms time constant).
    fn ramp_gain(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let tau = GAIN_RAMP_MS / 1000.0;
        let alpha = 1.0 - (-dt / tau).exp();
        self.gain += (self.gain_target - self.gain) * alpha;
        if (self.gain - self.gain_target).abs() < 1e-4 {
            self.gain = self.gain_target;
        }
    }
}
