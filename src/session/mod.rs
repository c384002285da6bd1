//! Session orchestration: state machine, time budget, collaborator traits.
//!
//! The orchestrator owns the bus sensor and switch, the state store, the
//! budget tracker, and an upload backend, and advances one explicit state
//! machine per `tick`. Everything outward-facing (network backend, upload
//! scheduler, watchdog) is a trait so the whole machine runs under test
//! against in-memory fakes.

mod budget;
mod orchestrator;

pub use budget::SessionBudget;
pub use orchestrator::{Orchestrator, SessionOutcome};

use thiserror::Error;

use crate::store::UnixTs;
use std::path::Path;

/// Session state machine. Transitions only happen inside
/// [`Orchestrator::tick`]; external callers observe, never drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Outside the scheduler window; nothing happens.
    Idle,
    /// Inside the window, watching for sustained bus silence.
    Listening,
    /// Silence observed; attempting to take bus ownership.
    Acquiring,
    /// Holding the bus, walking folders and transferring files.
    Uploading,
    /// Handing the bus back to the host.
    Releasing,
    /// Post-session wait before re-listening or finishing.
    Cooldown,
    /// All eligible folders uploaded for this window.
    Complete,
    /// Diagnostics-only mode: sensing runs, acquisition never does.
    Monitoring,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Acquiring => "acquiring",
            SessionState::Uploading => "uploading",
            SessionState::Releasing => "releasing",
            SessionState::Cooldown => "cooldown",
            SessionState::Complete => "complete",
            SessionState::Monitoring => "monitoring",
        }
    }
}

/// Failure from the upload backend. The message is backend-specific; the
/// orchestrator only cares that the transfer did not finish.
#[derive(Debug, Error)]
#[error("upload backend: {0}")]
pub struct BackendError(pub String);

/// Destination for uploaded files (network share, cloud API, ...).
pub trait UploadBackend {
    /// (Re)establish the connection. Called lazily before the first
    /// transfer of a session and again after a connection loss.
    fn connect(&mut self) -> Result<(), BackendError>;

    fn is_connected(&self) -> bool;

    /// Ensure `remote_dir` exists on the destination.
    fn create_directory(&mut self, remote_dir: &str) -> Result<(), BackendError>;

    /// Transfer one file; returns the bytes written on success.
    fn upload(&mut self, local: &Path, remote: &str, size: u64) -> Result<u64, BackendError>;
}

/// Decides when upload sessions are allowed at all (time-of-day windows,
/// user opt-out, and so on). The core only consumes the answers; it never
/// computes wall-clock schedule logic itself.
pub trait Scheduler {
    fn window_open(&self, now: UnixTs) -> bool;

    /// Seconds until the next window opens; 0 when one is open now.
    fn secs_until_window(&self, now: UnixTs) -> u64;
}

/// Hardware watchdog feed point. The upload pass runs long synchronous
/// stretches and must keep the watchdog alive from inside them.
pub trait Watchdog {
    fn feed(&mut self);
}
