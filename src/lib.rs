#![forbid(unsafe_code)]

pub mod bus;
pub mod config;
pub mod error;
pub mod ring;
pub mod session;
pub mod staging;
pub mod store;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main surface at crate root for convenience
pub use crate::bus::{BusActivitySensor, BusMux, BusSwitch, CardFilesystem, PulseCounter};
pub use crate::config::Config;
pub use crate::session::{
    Orchestrator, Scheduler, SessionBudget, SessionOutcome, SessionState, UploadBackend, Watchdog,
};
pub use crate::staging::{StagedCopy, StagingBuffer};
pub use crate::store::{DayKey, StateStore, UnixTs};
