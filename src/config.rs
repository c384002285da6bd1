//! Scalar configuration consumed at orchestrator construction time.
//!
//! The core never parses a config file itself; the host glue deserializes
//! whatever format it likes into this struct and hands it over.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base budget for one upload sitting, in seconds.
    pub session_duration_secs: u64,
    /// Cap on the retry multiplier applied to the session budget.
    pub max_retry_attempts: u32,
    /// Seconds an observed-empty dated folder stays pending before it is
    /// auto-promoted to completed.
    pub pending_timeout_secs: u64,
    /// Consecutive bus silence required before an acquisition attempt.
    pub bus_silence_ms: u64,
    /// How long the uploader may hold the bus before voluntarily yielding.
    pub yield_interval_ms: u64,
    /// Bounded wait served to the host during a voluntary yield.
    pub yield_window_ms: u64,
    /// Mux settle time after flipping bus ownership.
    pub settle_ms: u64,
    /// Journal compaction trigger: buffered + on-disk event lines.
    pub journal_max_lines: usize,
    /// Journal compaction trigger: on-disk journal size in bytes.
    pub journal_max_bytes: u64,
    /// Byte quota for the staging directory on internal flash.
    pub staging_quota_bytes: u64,
    /// Free space kept in reserve below the staging quota.
    pub staging_margin_bytes: u64,
    /// Stage card files into internal flash before the network transfer.
    pub staging_enabled: bool,
    /// Only look at dated folders younger than this many days (0 = all).
    pub max_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_duration_secs: 300,
            max_retry_attempts: 5,
            pending_timeout_secs: 7 * 24 * 60 * 60,
            bus_silence_ms: 10_000,
            yield_interval_ms: 30_000,
            yield_window_ms: 2_000,
            settle_ms: 500,
            journal_max_lines: 256,
            journal_max_bytes: 8 * 1024,
            staging_quota_bytes: 1024 * 1024,
            staging_margin_bytes: 50 * 1024,
            staging_enabled: true,
            max_days: 0,
        }
    }
}
