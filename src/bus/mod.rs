//! Bus arbitration: activity sensing and physical ownership switching.
//!
//! Hardware access (pulse counter, mux GPIO, card mount) lives behind
//! traits so the arbitration logic never depends on register-level detail
//! and can be driven by mock peripherals in tests.

mod sensor;
mod switch;

pub use sensor::{ActivitySample, BusActivitySensor, PulseCounter, SAMPLE_INTERVAL_MS};
pub use switch::{BusMux, BusSwitch, CardFilesystem, HoldStats};

use thiserror::Error;

use crate::Transience;

#[derive(Debug, Error)]
pub enum BusError {
    /// The sense line reports the host driving the bus. Ownership is never
    /// forced away from an active host.
    #[error("host is actively driving the bus")]
    HostActive,

    #[error("card filesystem mount failed: {0}")]
    MountFailed(#[source] std::io::Error),

    #[error("no card present after mount")]
    NoCard,
}

impl BusError {
    pub fn transience(&self) -> Transience {
        match self {
            BusError::HostActive | BusError::MountFailed(_) => Transience::Retryable,
            BusError::NoCard => Transience::Unknown,
        }
    }
}
