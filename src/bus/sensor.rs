//! Passive bus activity detection via a hardware edge counter.
//!
//! The counter accumulates in hardware, so no activity edge is lost even
//! while the control loop is blocked inside a long synchronous transfer;
//! software only samples and classifies.

use std::time::{Duration, Instant};

use crate::ring::SlotRing;
use crate::store::UnixTs;

/// Sampling cadence for the main-loop `update`.
pub const SAMPLE_INTERVAL_MS: u64 = 100;

/// History depth: 20 minutes of 1-second buckets.
const MAX_SAMPLES: usize = 1200;

/// Hardware edge counter on the bus command/sense line.
///
/// `begin` configures the peripheral including a glitch filter that rejects
/// sub-microsecond noise; `read_and_clear` is the only per-sample cost.
pub trait PulseCounter {
    fn begin(&mut self);
    fn read_and_clear(&mut self) -> u32;
}

/// One completed 1-second observation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySample {
    pub timestamp: UnixTs,
    pub pulses: u16,
    pub active: bool,
}

pub struct BusActivitySensor<C> {
    counter: C,
    started: bool,
    last_sample_at: Instant,
    last_pulses: u16,
    last_active: bool,
    consecutive_idle: Duration,
    bucket_start: Instant,
    bucket_pulses: u32,
    samples: SlotRing<ActivitySample>,
    longest_idle: Duration,
    total_active_samples: u64,
    total_idle_samples: u64,
}

impl<C: PulseCounter> BusActivitySensor<C> {
    pub fn new(counter: C) -> Self {
        Self {
            counter,
            started: false,
            last_sample_at: Instant::now(),
            last_pulses: 0,
            last_active: false,
            consecutive_idle: Duration::ZERO,
            bucket_start: Instant::now(),
            bucket_pulses: 0,
            samples: SlotRing::new(MAX_SAMPLES),
            longest_idle: Duration::ZERO,
            total_active_samples: 0,
            total_idle_samples: 0,
        }
    }

    pub fn begin_at(&mut self, now: Instant) {
        self.counter.begin();
        self.last_sample_at = now;
        self.bucket_start = now;
        self.started = true;
    }

    pub fn begin(&mut self) {
        self.begin_at(Instant::now());
    }

    /// Main-loop hook. No-op until 100 ms have passed since the last
    /// sample; each sample reads and clears the hardware counter.
    pub fn update_at(&mut self, now: Instant, wall: UnixTs) {
        if !self.started {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_sample_at);
        if elapsed < Duration::from_millis(SAMPLE_INTERVAL_MS) {
            return;
        }
        self.last_sample_at = now;

        let pulses = self.counter.read_and_clear();
        self.last_pulses = pulses.min(u16::MAX as u32) as u16;
        self.last_active = pulses > 0;

        if self.last_active {
            self.consecutive_idle = Duration::ZERO;
        } else {
            self.consecutive_idle += elapsed;
            if self.consecutive_idle > self.longest_idle {
                self.longest_idle = self.consecutive_idle;
            }
        }

        // Aggregate into 1-second buckets for the diagnostic history.
        self.bucket_pulses = self.bucket_pulses.saturating_add(pulses);
        if now.saturating_duration_since(self.bucket_start) >= Duration::from_secs(1) {
            let pulses = self.bucket_pulses.min(u16::MAX as u32) as u16;
            self.samples.push(ActivitySample {
                timestamp: wall,
                pulses,
                active: pulses > 0,
            });
            if pulses > 0 {
                self.total_active_samples += 1;
            } else {
                self.total_idle_samples += 1;
            }
            self.bucket_pulses = 0;
            self.bucket_start = now;
        }
    }

    pub fn update(&mut self, wall: UnixTs) {
        self.update_at(Instant::now(), wall);
    }

    pub fn is_busy(&self) -> bool {
        self.last_active
    }

    pub fn is_idle_for(&self, duration: Duration) -> bool {
        self.consecutive_idle >= duration
    }

    pub fn consecutive_idle(&self) -> Duration {
        self.consecutive_idle
    }

    /// Called on state transitions so idle time is measured relative to the
    /// current decision point, not accumulated across unrelated phases.
    pub fn reset_idle_tracking(&mut self) {
        self.consecutive_idle = Duration::ZERO;
    }

    // ── diagnostics ─────────────────────────────────────────────────────

    pub fn samples(&self) -> impl Iterator<Item = &ActivitySample> {
        self.samples.iter()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn last_pulse_count(&self) -> u16 {
        self.last_pulses
    }

    pub fn longest_idle(&self) -> Duration {
        self.longest_idle
    }

    pub fn total_active_samples(&self) -> u64 {
        self.total_active_samples
    }

    pub fn total_idle_samples(&self) -> u64 {
        self.total_idle_samples
    }

    pub fn reset_statistics_at(&mut self, now: Instant) {
        self.longest_idle = Duration::ZERO;
        self.total_active_samples = 0;
        self.total_idle_samples = 0;
        self.bucket_pulses = 0;
        self.bucket_start = now;
        self.samples.clear();
    }

    pub fn reset_statistics(&mut self) {
        self.reset_statistics_at(Instant::now());
    }
}
