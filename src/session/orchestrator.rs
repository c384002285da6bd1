//! Tick-driven session state machine.
//!
//! One `tick` call advances at most one state transition, except that the
//! `Uploading` state runs the whole synchronous folder pass before handing
//! back. The pass is the only long-running stretch, and it checkpoints the
//! abort flag, the watchdog, the time budget, and the voluntary-yield
//! timer between files.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bus::{BusActivitySensor, BusMux, BusSwitch, CardFilesystem, PulseCounter};
use crate::config::Config;
use crate::session::{BackendError, Scheduler, SessionBudget, SessionState, UploadBackend, Watchdog};
use crate::staging::StagingBuffer;
use crate::store::{md5_file, DayKey, StateStore, UnixTs};

/// Sub-directory on the card holding dated recording folders.
const DATALOG_DIR: &str = "DATALOG";
/// Sub-directory on the card holding fingerprint-tracked device files.
const SETTINGS_DIR: &str = "SETTINGS";

/// How a finished upload pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every eligible folder is uploaded or pending.
    Completed,
    /// The time budget ran out with work remaining.
    BudgetExhausted,
    /// A transfer or card read failed; the folder keeps its retry count.
    Failed,
    /// The abort flag was raised mid-pass.
    Aborted,
    /// The bus could not be reacquired after a voluntary yield.
    YieldLost,
}

/// How one folder's processing ended (pass-internal).
enum FolderEnd {
    Done,
    Pending,
    BudgetOut,
    Failed,
    Aborted,
    YieldLost,
}

enum YieldCheck {
    NotDue,
    Kept,
    Lost,
}

pub struct Orchestrator<C, M, F, B, S, W> {
    config: Config,
    sensor: BusActivitySensor<C>,
    switch: BusSwitch<M, F>,
    store: StateStore,
    budget: SessionBudget,
    staging: Option<StagingBuffer>,
    backend: B,
    scheduler: S,
    watchdog: W,
    state: SessionState,
    cooldown_until: Option<Instant>,
    last_yield: Instant,
    abort: Arc<AtomicBool>,
    last_outcome: Option<SessionOutcome>,
}

impl<C, M, F, B, S, W> Orchestrator<C, M, F, B, S, W>
where
    C: PulseCounter,
    M: BusMux,
    F: CardFilesystem,
    B: UploadBackend,
    S: Scheduler,
    W: Watchdog,
{
    /// Builds the orchestrator and applies the configuration to the
    /// collaborators it owns: store compaction/timeout limits, mux settle
    /// time, staging quota and margin.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        sensor: BusActivitySensor<C>,
        mut switch: BusSwitch<M, F>,
        store: StateStore,
        staging: Option<StagingBuffer>,
        backend: B,
        scheduler: S,
        watchdog: W,
    ) -> Self {
        let store = store.with_limits(
            config.journal_max_lines,
            config.journal_max_bytes,
            config.pending_timeout_secs,
        );
        switch.set_settle(Duration::from_millis(config.settle_ms));
        let staging = staging
            .map(|s| s.with_limits(config.staging_quota_bytes, config.staging_margin_bytes));
        Self {
            config,
            sensor,
            switch,
            store,
            budget: SessionBudget::new(),
            staging,
            backend,
            scheduler,
            watchdog,
            state: SessionState::Idle,
            cooldown_until: None,
            last_yield: Instant::now(),
            abort: Arc::new(AtomicBool::new(false)),
            last_outcome: None,
        }
    }

    /// Start the sensor and hand the bus to the host.
    pub fn begin(&mut self) {
        self.sensor.begin();
        self.switch.begin();
        self.state = SessionState::Idle;
        info!("orchestrator started, bus granted to host");
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_outcome(&self) -> Option<SessionOutcome> {
        self.last_outcome
    }

    /// Cloneable flag that cancels the in-flight session at the next file
    /// boundary. Raised from another thread (user request, shutdown).
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn sensor(&self) -> &BusActivitySensor<C> {
        &self.sensor
    }

    pub fn budget(&self) -> &SessionBudget {
        &self.budget
    }

    /// Enter diagnostics-only mode: sensing keeps running, acquisition never
    /// happens. Refused while the bus is held.
    pub fn enter_monitoring(&mut self) -> bool {
        if self.switch.has_control() {
            return false;
        }
        self.transition(SessionState::Monitoring);
        true
    }

    pub fn leave_monitoring(&mut self) {
        if self.state == SessionState::Monitoring {
            self.transition(SessionState::Idle);
        }
    }

    /// Main-loop hook. `now` is the monotonic clock, `wall` the wall clock
    /// in unix seconds (only wall time is ever persisted).
    pub fn tick_at(&mut self, now: Instant, wall: UnixTs) {
        self.sensor.update_at(now, wall);

        match self.state {
            SessionState::Monitoring => {}

            SessionState::Idle => {
                if self.scheduler.window_open(wall) {
                    self.sensor.reset_idle_tracking();
                    self.transition(SessionState::Listening);
                }
            }

            SessionState::Listening => {
                if !self.scheduler.window_open(wall) {
                    debug!(
                        next_window_secs = self.scheduler.secs_until_window(wall),
                        "upload window closed"
                    );
                    self.transition(SessionState::Idle);
                } else if self
                    .sensor
                    .is_idle_for(Duration::from_millis(self.config.bus_silence_ms))
                {
                    self.transition(SessionState::Acquiring);
                }
            }

            SessionState::Acquiring => match self.switch.take_control_at(now) {
                Ok(()) => {
                    let multiplier = (self.store.current_retry_count() + 1)
                        .min(self.config.max_retry_attempts.max(1));
                    self.budget
                        .start_session_at(now, self.config.session_duration_secs, multiplier);
                    self.last_yield = now;
                    self.transition(SessionState::Uploading);
                }
                Err(err) => {
                    debug!(%err, "bus acquisition failed, back to listening");
                    self.sensor.reset_idle_tracking();
                    self.transition(SessionState::Listening);
                }
            },

            SessionState::Uploading => {
                let outcome = self.run_upload_pass(wall);
                info!(outcome = ?outcome, "upload pass finished");
                self.last_outcome = Some(outcome);
                self.transition(SessionState::Releasing);
            }

            SessionState::Releasing => {
                // Unconditional: the host regains the card no matter how the
                // pass ended.
                self.switch.release_control_at(now);
                self.abort.store(false, Ordering::Relaxed);
                self.cooldown_until = Some(now + self.budget.wait_time());
                self.transition(SessionState::Cooldown);
            }

            SessionState::Cooldown => {
                let elapsed = self.cooldown_until.is_none_or(|until| now >= until);
                if elapsed {
                    self.cooldown_until = None;
                    if self.last_outcome == Some(SessionOutcome::Completed) {
                        self.transition(SessionState::Complete);
                    } else {
                        self.sensor.reset_idle_tracking();
                        self.transition(SessionState::Listening);
                    }
                }
            }

            SessionState::Complete => {
                if !self.scheduler.window_open(wall) {
                    self.transition(SessionState::Idle);
                }
            }
        }
    }

    pub fn tick(&mut self, wall: UnixTs) {
        self.tick_at(Instant::now(), wall);
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            info!(from = self.state.as_str(), to = to.as_str(), "state transition");
            self.state = to;
        }
    }

    // ── upload pass ─────────────────────────────────────────────────────

    fn run_upload_pass(&mut self, wall: UnixTs) -> SessionOutcome {
        let root = self.switch.card_root().to_path_buf();
        let datalog = root.join(DATALOG_DIR);

        let mut folders = match scan_day_folders(&datalog) {
            Ok(folders) => folders,
            Err(err) => {
                warn!(%err, "cannot scan card datalog");
                return SessionOutcome::Failed;
            }
        };
        if self.config.max_days > 0 {
            let cutoff =
                day_key_from_unix(wall.saturating_sub(self.config.max_days as u64 * 86_400));
            folders.retain(|&day| day >= cutoff);
        }
        // Newest first: recent nights are the ones clinicians look at.
        folders.sort_unstable_by(|a, b| b.cmp(a));
        self.store.set_total_folders_count(folders.len());

        for day in folders {
            if self.store.is_folder_completed(day) {
                continue;
            }
            match self.process_folder(&datalog, day, wall) {
                FolderEnd::Done | FolderEnd::Pending => {}
                FolderEnd::BudgetOut => return SessionOutcome::BudgetExhausted,
                FolderEnd::Failed => return SessionOutcome::Failed,
                FolderEnd::Aborted => return SessionOutcome::Aborted,
                FolderEnd::YieldLost => return SessionOutcome::YieldLost,
            }
        }

        // Folders the host deleted while pending never come back through
        // the scan above; their timeout still applies.
        for day in self.store.pending_due(wall) {
            self.store.promote_pending_to_completed(day);
        }

        if let Some(outcome) = self.upload_changed_settings(&root) {
            return outcome;
        }

        self.store.clear_current_retry();
        self.store.set_last_upload_timestamp(wall);
        self.persist_state();
        SessionOutcome::Completed
    }

    fn process_folder(&mut self, datalog: &Path, day: DayKey, wall: UnixTs) -> FolderEnd {
        let dir = datalog.join(format!("{day:08}"));
        let files = match list_recording_files(&dir) {
            // Dated folders hold EDF recordings; anything else in there is
            // host-side bookkeeping and stays on the card.
            Ok(mut files) => {
                files.retain(|(name, _)| has_edf_extension(name));
                files
            }
            Err(err) => {
                warn!(day, %err, "cannot list folder");
                self.register_failure(day);
                return FolderEnd::Failed;
            }
        };

        if files.is_empty() {
            // The device creates the day's folder before writing into it,
            // so empty means "not yet" rather than "never". Track it and
            // only give up after the timeout.
            if self.store.is_pending_folder(day) {
                if self.store.should_promote_pending_to_completed(day, wall) {
                    self.store.promote_pending_to_completed(day);
                }
            } else {
                self.store.mark_folder_pending(day, wall);
            }
            self.persist_state();
            return FolderEnd::Pending;
        }
        if self.store.is_pending_folder(day) {
            self.store.remove_folder_from_pending(day);
        }
        self.store.set_current_retry_folder(day);

        let remote_dir = format!("/{DATALOG_DIR}/{day:08}");
        if let Err(err) = self.ensure_remote_dir(&remote_dir) {
            warn!(day, %err, "cannot prepare remote folder");
            self.register_failure(day);
            return FolderEnd::Failed;
        }

        for (name, size) in &files {
            self.watchdog.feed();
            if self.abort.load(Ordering::Relaxed) {
                self.persist_state();
                return FolderEnd::Aborted;
            }
            match self.maybe_yield() {
                YieldCheck::Lost => return FolderEnd::YieldLost,
                YieldCheck::NotDue | YieldCheck::Kept => {}
            }
            if *size == 0 {
                debug!(day, file = %name, "skipping zero-length file");
                continue;
            }
            if !self.budget.can_upload_file(*size) {
                debug!(
                    day,
                    file = %name,
                    size,
                    remaining_ms = self.budget.remaining_budget().as_millis() as u64,
                    "budget gate refused file"
                );
                self.persist_state();
                return FolderEnd::BudgetOut;
            }
            if let Err(err) = self.upload_one(&dir.join(name), &format!("{remote_dir}/{name}"), *size)
            {
                warn!(day, file = %name, %err, "upload failed");
                self.register_failure(day);
                return FolderEnd::Failed;
            }
        }

        self.store.mark_folder_completed(day);
        self.persist_state();
        info!(day, files = files.len(), "folder uploaded");
        FolderEnd::Done
    }

    /// Fingerprint-tracked device files (settings, identification). Only
    /// re-uploaded when size or checksum changed since the last upload.
    fn upload_changed_settings(&mut self, root: &Path) -> Option<SessionOutcome> {
        let dir = root.join(SETTINGS_DIR);
        let files = match list_recording_files(&dir) {
            Ok(files) => files,
            // No settings directory on this card is fine.
            Err(_) => return None,
        };

        for (name, size) in &files {
            self.watchdog.feed();
            if self.abort.load(Ordering::Relaxed) {
                self.persist_state();
                return Some(SessionOutcome::Aborted);
            }
            let local = dir.join(name);
            if *size == 0 || !self.store.has_file_changed(&local) {
                continue;
            }
            if !self.budget.can_upload_file(*size) {
                self.persist_state();
                return Some(SessionOutcome::BudgetExhausted);
            }
            let remote = format!("/{SETTINGS_DIR}/{name}");
            if let Err(err) = self
                .ensure_remote_dir(&format!("/{SETTINGS_DIR}"))
                .and_then(|_| self.upload_one(&local, &remote, *size))
            {
                warn!(file = %name, %err, "settings upload failed");
                return Some(SessionOutcome::Failed);
            }
            match md5_file(&local) {
                Ok(digest) => {
                    self.store.mark_file_uploaded(&local, Some(digest), *size, true);
                }
                Err(err) => warn!(file = %name, %err, "fingerprint checksum failed"),
            }
            self.persist_state();
        }
        None
    }

    /// One file transfer, optionally staged through internal flash first so
    /// the card read and the network write do not overlap on the slow path.
    fn upload_one(&mut self, local: &Path, remote: &str, size: u64) -> Result<(), BackendError> {
        self.ensure_connected()?;
        let started = Instant::now();

        let staged = match (&self.staging, self.config.staging_enabled) {
            (Some(staging), true) if staging.has_space_for(size) => match staging.stage(local) {
                Ok(copy) => Some(copy),
                Err(err) => {
                    // Staging is an optimization; fall back to the card.
                    warn!(file = %local.display(), %err, "staging failed, uploading direct");
                    None
                }
            },
            _ => None,
        };

        let source: &Path = staged.as_ref().map_or(local, |s| s.buffer_path.as_path());
        let result = self.backend.upload(source, remote, size);
        if let (Some(staging), Some(copy)) = (&self.staging, &staged) {
            staging.remove(copy);
        }

        let bytes = result?;
        self.budget.record_upload(bytes, started.elapsed());
        debug!(remote, bytes, "file uploaded");
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<(), BackendError> {
        if self.backend.is_connected() {
            return Ok(());
        }
        self.backend.connect()
    }

    fn ensure_remote_dir(&mut self, remote_dir: &str) -> Result<(), BackendError> {
        self.ensure_connected()?;
        self.backend.create_directory(remote_dir)
    }

    /// Voluntary mid-session yield: pause the budget clock, give the bus
    /// back for a bounded window, then try to take it again. Losing the
    /// reacquisition ends the session; the host wins ties.
    fn maybe_yield(&mut self) -> YieldCheck {
        let now = Instant::now();
        let interval = Duration::from_millis(self.config.yield_interval_ms);
        if interval.is_zero() || now.saturating_duration_since(self.last_yield) < interval {
            return YieldCheck::NotDue;
        }

        info!("voluntary yield: returning bus to host");
        self.budget.pause_active_time_at(now);
        self.switch.release_control_at(now);

        let window = Duration::from_millis(self.config.yield_window_ms);
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            self.watchdog.feed();
            std::thread::sleep(Duration::from_millis(100).min(window));
        }

        match self.switch.take_control() {
            Ok(()) => {
                let resumed = Instant::now();
                self.budget.resume_active_time_at(resumed);
                self.last_yield = resumed;
                YieldCheck::Kept
            }
            Err(err) => {
                info!(%err, "bus not reacquired after yield, ending session");
                YieldCheck::Lost
            }
        }
    }

    fn register_failure(&mut self, day: DayKey) {
        self.store.set_current_retry_folder(day);
        self.store.increment_current_retry_count();
        self.persist_state();
    }

    fn persist_state(&mut self) {
        if let Err(err) = self.store.save() {
            warn!(%err, "state save failed");
        }
    }
}

fn has_edf_extension(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("edf"))
}

/// Dated folder names are exactly eight ASCII digits (YYYYMMDD).
fn parse_day_key(name: &str) -> Option<DayKey> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

fn scan_day_folders(datalog: &Path) -> std::io::Result<Vec<DayKey>> {
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(datalog)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(day) = entry.file_name().to_str().and_then(parse_day_key) {
            folders.push(day);
        }
    }
    Ok(folders)
}

/// Regular files in `dir` with their sizes, name-sorted for a stable
/// upload order.
fn list_recording_files(dir: &Path) -> std::io::Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push((name.to_string(), meta.len()));
        }
    }
    files.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// YYYYMMDD day key for a unix timestamp (UTC civil date).
fn day_key_from_unix(ts: UnixTs) -> DayKey {
    let z = (ts / 86_400) as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let mut year = yoe as i64 + era * 400;
    if month <= 2 {
        year += 1;
    }
    (year as u64 * 10_000 + month * 100 + day) as DayKey
}
