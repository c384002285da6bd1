//! Physical bus ownership switch and card mount lifecycle.
//!
//! Exactly one of {host device, uploader} drives the shared card at a
//! time. `has_control` is the single source of truth other components
//! must check before touching the card filesystem.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::BusError;

/// Mux line granting the bus to host or uploader, plus the sense input.
pub trait BusMux {
    fn grant_uploader(&mut self);
    fn grant_host(&mut self);
    /// Whether the sense line shows the host actively driving the bus.
    fn host_active(&self) -> bool;
}

/// Mount lifecycle for the shared card, one concrete impl per platform.
pub trait CardFilesystem {
    fn mount(&mut self) -> std::io::Result<()>;
    fn unmount(&mut self);
    /// Whether a card is physically present after mount.
    fn card_present(&self) -> bool;
    /// Mount point to scan once control is held.
    fn root(&self) -> &Path;
}

/// Diagnostic hold/release accounting. Never consulted for arbitration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HoldStats {
    pub holds: u64,
    pub releases: u64,
    pub refused: u64,
    pub total_held: Duration,
    pub longest_hold: Duration,
    pub shortest_hold: Option<Duration>,
}

pub struct BusSwitch<M, F> {
    mux: M,
    card: F,
    has_control: bool,
    settle: Duration,
    held_since: Option<Instant>,
    stats: HoldStats,
}

impl<M: BusMux, F: CardFilesystem> BusSwitch<M, F> {
    pub fn new(mux: M, card: F, settle: Duration) -> Self {
        Self {
            mux,
            card,
            has_control: false,
            settle,
            held_since: None,
            stats: HoldStats::default(),
        }
    }

    /// Override the settle time (configuration).
    pub fn set_settle(&mut self, settle: Duration) {
        self.settle = settle;
    }

    /// Explicitly hand the bus to the host on startup so it has card
    /// access immediately.
    pub fn begin(&mut self) {
        self.mux.grant_host();
        self.has_control = false;
    }

    /// Attempt to take bus ownership.
    ///
    /// Refuses immediately, without blocking, if the sense line shows the
    /// host driving the bus: ownership is never forced away from an active
    /// host. Any mount/verify failure flips ownership straight back.
    pub fn take_control_at(&mut self, now: Instant) -> Result<(), BusError> {
        if self.has_control {
            return Ok(());
        }
        if self.mux.host_active() {
            self.stats.refused += 1;
            return Err(BusError::HostActive);
        }

        self.mux.grant_uploader();
        if !self.settle.is_zero() {
            // The mux and the card's internal init both need time after
            // the ownership flip.
            std::thread::sleep(self.settle);
        }

        if let Err(err) = self.card.mount() {
            warn!(%err, "card mount failed, returning bus to host");
            self.give_back();
            return Err(BusError::MountFailed(err));
        }
        if !self.card.card_present() {
            warn!("no card detected after mount, returning bus to host");
            self.card.unmount();
            self.give_back();
            return Err(BusError::NoCard);
        }

        self.has_control = true;
        self.held_since = Some(now);
        self.stats.holds += 1;
        info!("bus ownership acquired, card mounted");
        Ok(())
    }

    pub fn take_control(&mut self) -> Result<(), BusError> {
        self.take_control_at(Instant::now())
    }

    /// Unmount and return the bus to the host. Idempotent: a no-op when
    /// control is not held.
    pub fn release_control_at(&mut self, now: Instant) {
        if !self.has_control {
            return;
        }
        self.card.unmount();
        self.give_back();
        self.has_control = false;
        self.stats.releases += 1;
        if let Some(since) = self.held_since.take() {
            let held = now.saturating_duration_since(since);
            self.stats.total_held += held;
            if held > self.stats.longest_hold {
                self.stats.longest_hold = held;
            }
            match self.stats.shortest_hold {
                Some(shortest) if held >= shortest => {}
                _ => self.stats.shortest_hold = Some(held),
            }
        }
        info!("bus ownership released to host");
    }

    pub fn release_control(&mut self) {
        self.release_control_at(Instant::now());
    }

    fn give_back(&mut self) {
        self.mux.grant_host();
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
    }

    pub fn has_control(&self) -> bool {
        self.has_control
    }

    /// Sense-line passthrough for callers that only need the safety gate.
    pub fn host_active(&self) -> bool {
        self.mux.host_active()
    }

    pub fn card_root(&self) -> &Path {
        self.card.root()
    }

    pub fn stats(&self) -> HoldStats {
        self.stats
    }
}
