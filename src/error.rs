use thiserror::Error;

use crate::bus::BusError;
use crate::session::BackendError;
use crate::staging::StagingError;
use crate::store::StoreError;

/// Whether retrying this operation in a later session may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (bus contention, network outage, exhausted budget).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the per-subsystem errors.
/// The orchestrator itself never propagates these upward; the worst outcome
/// of any failure is "nothing uploaded this session".
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Store(e) => e.transience(),
            Error::Bus(e) => e.transience(),
            Error::Staging(e) => e.transience(),
            Error::Backend(_) => Transience::Retryable,
        }
    }
}
