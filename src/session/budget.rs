//! Throughput-budgeted session time accounting.
//!
//! The budget is charged against *active* time only: when the orchestrator
//! voluntarily yields the bus back to the host mid-session, the clock is
//! paused so the yield window costs nothing. Upload-time estimates scale
//! with a rolling average of measured throughput rather than a fixed
//! per-file assumption.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::ring::SlotRing;

/// Conservative seed rate before any samples exist: 40 KiB/s.
const DEFAULT_RATE_BYTES_PER_SEC: u64 = 40 * 1024;

/// Rolling window of (bytes, elapsed) derived rate samples.
const RATE_HISTORY: usize = 5;

/// Fixed inter-session cooldown so the host is never denied access
/// indefinitely, independent of how the previous session ended.
const INTER_SESSION_WAIT: Duration = Duration::from_secs(5 * 60);

pub struct SessionBudget {
    budget: Duration,
    /// Active time accrued before the most recent resume.
    active_accum: Duration,
    /// Set while the clock is running; `None` while paused or idle.
    active_since: Option<Instant>,
    rate_bytes_per_sec: u64,
    rate_history: SlotRing<u64>,
}

impl Default for SessionBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBudget {
    pub fn new() -> Self {
        Self {
            budget: Duration::ZERO,
            active_accum: Duration::ZERO,
            active_since: None,
            rate_bytes_per_sec: DEFAULT_RATE_BYTES_PER_SEC,
            rate_history: SlotRing::new(RATE_HISTORY),
        }
    }

    /// Begin a session of `duration_secs × retry_multiplier`. The
    /// multiplier gives a folder that has failed repeatedly a longer
    /// allotment on later attempts.
    pub fn start_session_at(&mut self, now: Instant, duration_secs: u64, retry_multiplier: u32) {
        let multiplier = retry_multiplier.max(1) as u64;
        self.budget = Duration::from_secs(duration_secs.saturating_mul(multiplier));
        self.active_accum = Duration::ZERO;
        self.active_since = Some(now);
        debug!(
            budget_secs = self.budget.as_secs(),
            multiplier, "session budget started"
        );
    }

    pub fn start_session(&mut self, duration_secs: u64, retry_multiplier: u32) {
        self.start_session_at(Instant::now(), duration_secs, retry_multiplier);
    }

    fn active_elapsed_at(&self, now: Instant) -> Duration {
        let running = self
            .active_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or(Duration::ZERO);
        self.active_accum + running
    }

    pub fn remaining_budget_at(&self, now: Instant) -> Duration {
        self.budget.saturating_sub(self.active_elapsed_at(now))
    }

    pub fn remaining_budget(&self) -> Duration {
        self.remaining_budget_at(Instant::now())
    }

    pub fn has_budget_at(&self, now: Instant) -> bool {
        !self.remaining_budget_at(now).is_zero()
    }

    pub fn has_budget(&self) -> bool {
        self.has_budget_at(Instant::now())
    }

    /// Stop charging the budget clock. Idempotent; used around voluntary
    /// bus yields.
    pub fn pause_active_time_at(&mut self, now: Instant) {
        if let Some(since) = self.active_since.take() {
            self.active_accum += now.saturating_duration_since(since);
        }
    }

    pub fn pause_active_time(&mut self) {
        self.pause_active_time_at(Instant::now());
    }

    /// Resume the budget clock. Idempotent.
    pub fn resume_active_time_at(&mut self, now: Instant) {
        if self.active_since.is_none() {
            self.active_since = Some(now);
        }
    }

    pub fn resume_active_time(&mut self) {
        self.resume_active_time_at(Instant::now());
    }

    /// `size / rate`, using the rolling-average throughput.
    pub fn estimate_upload_time(&self, file_size: u64) -> Duration {
        let rate = self.rate_bytes_per_sec.max(1);
        let millis = file_size.saturating_mul(1000) / rate;
        Duration::from_millis(millis)
    }

    /// Pre-flight gate: may this file be started within the remaining
    /// budget? Not a mid-transfer timeout; a started transfer may run
    /// slightly over and the session simply cannot start the next file.
    pub fn can_upload_file_at(&self, now: Instant, file_size: u64) -> bool {
        let remaining = self.remaining_budget_at(now);
        !remaining.is_zero() && self.estimate_upload_time(file_size) <= remaining
    }

    pub fn can_upload_file(&self, file_size: u64) -> bool {
        self.can_upload_file_at(Instant::now(), file_size)
    }

    /// Feed the rate estimator with a completed transfer. Zero elapsed is
    /// ignored to avoid divide-by-zero skew.
    pub fn record_upload(&mut self, bytes_transferred: u64, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed_ms == 0 {
            return;
        }
        let sample = bytes_transferred.saturating_mul(1000) / elapsed_ms;
        self.rate_history.push(sample);
        let (sum, n) = self
            .rate_history
            .iter()
            .fold((0u64, 0u64), |(sum, n), &r| (sum.saturating_add(r), n + 1));
        if n > 0 {
            self.rate_bytes_per_sec = (sum / n).max(1);
        }
        debug!(
            sample_bps = sample,
            avg_bps = self.rate_bytes_per_sec,
            "throughput sample recorded"
        );
    }

    pub fn transmission_rate(&self) -> u64 {
        self.rate_bytes_per_sec
    }

    /// Fixed cooldown enforced between sessions.
    pub fn wait_time(&self) -> Duration {
        INTER_SESSION_WAIT
    }
}
