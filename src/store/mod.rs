//! Durable upload state: snapshot + append-only journal.
//!
//! The store tracks which dated folders have been uploaded, a small set of
//! per-file fingerprints, and the single current retry context. Every
//! mutation is expressed as a [`JournalEvent`], applied to memory at once
//! and queued for the next [`StateStore::save`], which appends it to the
//! journal fsync-first. Compaction periodically folds the journal into a
//! fresh snapshot, bounding both replay time and flash write amplification.

mod event;
mod journal;
mod snapshot;
mod state;

pub use event::{
    path_hash, DayKey, FileFingerprint, FingerprintFlags, JournalEvent, PathHash, RetryContext,
    UnixTs,
};
pub use journal::{Journal, ReplayStats};
pub use snapshot::Snapshot;
pub use state::{
    ApplyRejection, UploadState, MAX_COMPLETED_FOLDERS, MAX_PENDING_FOLDERS, MAX_TRACKED_FILES,
};

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::Transience;

/// Default pending-folder timeout: seven days.
pub const PENDING_FOLDER_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Compaction trigger: journal line count.
const DEFAULT_MAX_JOURNAL_LINES: usize = 256;
/// Compaction trigger: journal byte size.
const DEFAULT_MAX_JOURNAL_BYTES: u64 = 8 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("short write: expected {expected} bytes, file has {got}")]
    ShortWrite { expected: u64, got: u64 },
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Io(_) | StoreError::ShortWrite { .. } => Transience::Retryable,
            StoreError::Json(_) => Transience::Permanent,
        }
    }
}

/// Durable upload state store.
///
/// Owned and mutated by exactly one logical owner (the orchestrator loop);
/// no internal locking.
pub struct StateStore {
    state: UploadState,
    journal: Journal,
    snapshot_path: PathBuf,
    queued: Vec<JournalEvent>,
    journal_lines: usize,
    max_journal_lines: usize,
    max_journal_bytes: u64,
    pending_timeout_secs: u64,
    /// Eligible folder count from the last scan, for diagnostics.
    total_folders: usize,
    /// Set once any bounded collection rejects an insert this run.
    degraded: bool,
}

impl StateStore {
    /// Load the snapshot (if any) and replay the journal on top of it.
    ///
    /// Missing files start the store empty: every item is treated as new,
    /// which at worst re-uploads data, never loses it. Corruption in either
    /// file is skipped with a warning and never aborts startup.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let snapshot_path = dir.join("upload_state.snapshot");
        let journal = Journal::new(dir.join("upload_state.journal"));

        let mut state = snapshot::load(&snapshot_path)
            .map(Snapshot::into_state)
            .unwrap_or_else(|| {
                info!("no usable snapshot, starting with empty upload state");
                UploadState::new()
            });

        let stats = journal.replay(|event| {
            if let Err(rejection) = state.apply(&event) {
                warn!(%rejection, "journal event rejected during replay");
            }
        })?;
        if stats.decoded > 0 || stats.skipped > 0 {
            debug!(
                decoded = stats.decoded,
                skipped = stats.skipped,
                torn_tail = stats.torn_tail,
                "journal replayed"
            );
        }

        let journal_lines = journal.line_count();
        info!(
            completed = state.completed_count(),
            pending = state.pending_count(),
            tracked_files = state.tracked_file_count(),
            journal_lines,
            "upload state loaded"
        );

        Ok(Self {
            state,
            journal,
            snapshot_path,
            queued: Vec::new(),
            journal_lines,
            max_journal_lines: DEFAULT_MAX_JOURNAL_LINES,
            max_journal_bytes: DEFAULT_MAX_JOURNAL_BYTES,
            pending_timeout_secs: PENDING_FOLDER_TIMEOUT_SECS,
            total_folders: 0,
            degraded: false,
        })
    }

    /// Override compaction thresholds and pending timeout (configuration).
    pub fn with_limits(
        mut self,
        max_journal_lines: usize,
        max_journal_bytes: u64,
        pending_timeout_secs: u64,
    ) -> Self {
        self.max_journal_lines = max_journal_lines;
        self.max_journal_bytes = max_journal_bytes;
        self.pending_timeout_secs = pending_timeout_secs;
        self
    }

    /// Apply a mutation to memory and queue it for the next `save()`.
    fn commit(&mut self, event: JournalEvent) -> bool {
        match self.state.apply(&event) {
            Ok(()) => {
                self.queued.push(event);
                true
            }
            Err(rejection) => {
                // Degraded mode: the new item simply is not tracked.
                self.degraded = true;
                warn!(%rejection, "state mutation rejected");
                false
            }
        }
    }

    // ── folder completion ───────────────────────────────────────────────

    pub fn is_folder_completed(&self, day: DayKey) -> bool {
        self.state.is_completed(day)
    }

    pub fn mark_folder_completed(&mut self, day: DayKey) -> bool {
        self.commit(JournalEvent::AddCompleted { day })
    }

    /// Forced re-upload support.
    pub fn remove_folder_from_completed(&mut self, day: DayKey) -> bool {
        self.commit(JournalEvent::RemoveCompleted { day })
    }

    // ── pending (observed-empty) folders ────────────────────────────────

    pub fn is_pending_folder(&self, day: DayKey) -> bool {
        self.state.is_pending(day)
    }

    pub fn mark_folder_pending(&mut self, day: DayKey, first_seen: UnixTs) -> bool {
        self.commit(JournalEvent::AddPending { day, first_seen })
    }

    pub fn remove_folder_from_pending(&mut self, day: DayKey) -> bool {
        self.commit(JournalEvent::RemovePending { day })
    }

    /// True iff `now >= first_seen + timeout`. A folder the host never
    /// populates must not block forward progress forever.
    pub fn should_promote_pending_to_completed(&self, day: DayKey, now: UnixTs) -> bool {
        match self.state.pending_first_seen(day) {
            Some(first_seen) => now >= first_seen + self.pending_timeout_secs,
            None => false,
        }
    }

    pub fn promote_pending_to_completed(&mut self, day: DayKey) -> bool {
        if !self.state.is_pending(day) {
            return false;
        }
        info!(day, "promoting pending folder to completed (empty past timeout)");
        self.commit(JournalEvent::AddCompleted { day })
    }

    /// Pending folders whose timeout has elapsed.
    pub fn pending_due(&self, now: UnixTs) -> Vec<DayKey> {
        self.state.pending_due(now, self.pending_timeout_secs)
    }

    // ── fingerprinted files ─────────────────────────────────────────────

    /// Whether the file differs from the recorded fingerprint.
    ///
    /// A file with no recorded fingerprint counts as changed; an unreadable
    /// file does not (nothing to upload).
    pub fn has_file_changed(&self, path: &Path) -> bool {
        let key = path_hash(&path.to_string_lossy());
        let Some(recorded) = self.state.fingerprint(key) else {
            return true;
        };
        let Ok(size) = std::fs::metadata(path).map(|m| m.len()) else {
            return false;
        };
        if size != recorded.size {
            return true;
        }
        if !recorded.flags.contains(FingerprintFlags::HAS_MD5) {
            // Size-only tracking; same size means unchanged.
            return false;
        }
        match md5_file(path) {
            Ok(digest) => digest != recorded.md5,
            Err(err) => {
                warn!(path = %path.display(), %err, "checksum failed, treating as unchanged");
                false
            }
        }
    }

    pub fn mark_file_uploaded(
        &mut self,
        path: &Path,
        md5: Option<[u8; 16]>,
        size: u64,
        persistent: bool,
    ) -> bool {
        let key = path_hash(&path.to_string_lossy());
        let mut fingerprint = FileFingerprint::new(key, size, md5);
        if persistent {
            fingerprint = fingerprint.persistent();
        }
        self.commit(JournalEvent::SetFile { file: fingerprint })
    }

    pub fn remove_file(&mut self, path: &Path) -> bool {
        let key = path_hash(&path.to_string_lossy());
        self.commit(JournalEvent::RemoveFile { path_hash: key })
    }

    // ── retry context ───────────────────────────────────────────────────

    pub fn current_retry_count(&self) -> u32 {
        self.state.retry().map(|r| r.count).unwrap_or(0)
    }

    pub fn current_retry_folder(&self) -> Option<DayKey> {
        self.state.retry().map(|r| r.day)
    }

    /// Resets the count to zero when the folder differs from the stored one.
    pub fn set_current_retry_folder(&mut self, day: DayKey) {
        match self.state.retry() {
            Some(retry) if retry.day == day => {}
            _ => {
                self.commit(JournalEvent::SetRetry { day, count: 0 });
            }
        }
    }

    pub fn increment_current_retry_count(&mut self) {
        if let Some(retry) = self.state.retry() {
            self.commit(JournalEvent::SetRetry {
                day: retry.day,
                count: retry.count + 1,
            });
        }
    }

    pub fn clear_current_retry(&mut self) {
        if self.state.retry().is_some() {
            self.commit(JournalEvent::ClearRetry);
        }
    }

    // ── timestamps and counters ─────────────────────────────────────────

    pub fn last_upload_timestamp(&self) -> UnixTs {
        self.state.last_upload_ts()
    }

    pub fn set_last_upload_timestamp(&mut self, ts: UnixTs) {
        self.commit(JournalEvent::SetTimestamp { ts });
    }

    pub fn completed_folders_count(&self) -> usize {
        self.state.completed_count()
    }

    pub fn pending_folders_count(&self) -> usize {
        self.state.pending_count()
    }

    pub fn set_total_folders_count(&mut self, count: usize) {
        self.total_folders = count;
    }

    /// Folders seen by the last scan that are neither completed nor pending.
    pub fn incomplete_folders_count(&self) -> usize {
        self.total_folders
            .saturating_sub(self.state.completed_count() + self.state.pending_count())
    }

    /// Whether any bounded collection has rejected an insert this run.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    // ── durability ──────────────────────────────────────────────────────

    /// Flush queued events to the journal, fsynced before returning
    /// success, then compact if the journal has grown past its bounds.
    pub fn save(&mut self) -> Result<(), StoreError> {
        if !self.queued.is_empty() {
            self.journal.append(&self.queued)?;
            self.journal_lines += self.queued.len();
            self.queued.clear();
        }
        self.compact_if_needed();
        Ok(())
    }

    fn compact_if_needed(&mut self) {
        if self.journal_lines < self.max_journal_lines
            && self.journal.size_bytes() < self.max_journal_bytes
        {
            return;
        }
        // A failed compaction leaves the valid snapshot+journal pair alone.
        match self.compact() {
            Ok(()) => debug!("journal compacted into snapshot"),
            Err(err) => warn!(%err, "compaction failed, keeping existing snapshot+journal"),
        }
    }

    fn compact(&mut self) -> Result<(), StoreError> {
        snapshot::write_atomic(&self.snapshot_path, &Snapshot::from_state(&self.state))?;
        self.journal.truncate()?;
        self.journal_lines = 0;
        Ok(())
    }

    /// Test/diagnostic view of the in-memory state.
    pub fn state(&self) -> &UploadState {
        &self.state
    }
}

/// Streaming MD5 of a file, 512-byte chunks (the device format records a
/// 16-byte digest per tracked file).
pub fn md5_file(path: &Path) -> Result<[u8; 16], StoreError> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 512];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore {
        StateStore::open(dir.path()).unwrap()
    }

    #[test]
    fn open_on_empty_dir_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert_eq!(store.completed_folders_count(), 0);
        assert_eq!(store.pending_folders_count(), 0);
        assert_eq!(store.current_retry_count(), 0);
    }

    #[test]
    fn mutations_survive_reopen_after_save() {
        let tmp = TempDir::new().unwrap();
        {
            let mut store = store(&tmp);
            store.mark_folder_completed(20240101);
            store.mark_folder_pending(20240102, 1000);
            store.set_current_retry_folder(20240103);
            store.increment_current_retry_count();
            store.set_last_upload_timestamp(5000);
            store.save().unwrap();
        }
        let store = store(&tmp);
        assert!(store.is_folder_completed(20240101));
        assert!(store.is_pending_folder(20240102));
        assert_eq!(store.current_retry_folder(), Some(20240103));
        assert_eq!(store.current_retry_count(), 1);
        assert_eq!(store.last_upload_timestamp(), 5000);
    }

    #[test]
    fn unsaved_mutations_are_lost_on_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let mut store = store(&tmp);
            store.mark_folder_completed(20240101);
            store.save().unwrap();
            store.mark_folder_completed(20240102);
            // No save: 20240102 was never durable.
        }
        let store = store(&tmp);
        assert!(store.is_folder_completed(20240101));
        assert!(!store.is_folder_completed(20240102));
    }

    #[test]
    fn retry_folder_switch_resets_count() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        store.set_current_retry_folder(20240101);
        store.increment_current_retry_count();
        store.increment_current_retry_count();
        assert_eq!(store.current_retry_count(), 2);

        store.set_current_retry_folder(20240101);
        assert_eq!(store.current_retry_count(), 2);

        store.set_current_retry_folder(20240102);
        assert_eq!(store.current_retry_count(), 0);
    }

    #[test]
    fn pending_promotion_boundary_is_exact() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        store.mark_folder_pending(20240101, 1000);
        let timeout = PENDING_FOLDER_TIMEOUT_SECS;
        assert!(!store.should_promote_pending_to_completed(20240101, 1000 + timeout - 1));
        assert!(store.should_promote_pending_to_completed(20240101, 1000 + timeout));

        assert!(store.promote_pending_to_completed(20240101));
        assert!(store.is_folder_completed(20240101));
        assert!(!store.is_pending_folder(20240101));
    }

    #[test]
    fn completing_folder_clears_pending_and_retry() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        store.mark_folder_pending(20240101, 1000);
        store.set_current_retry_folder(20240101);
        store.increment_current_retry_count();

        store.mark_folder_completed(20240101);
        assert!(!store.is_pending_folder(20240101));
        assert_eq!(store.current_retry_folder(), None);
    }

    #[test]
    fn compaction_preserves_query_equivalence() {
        let tmp = TempDir::new().unwrap();
        let mut store = StateStore::open(tmp.path())
            .unwrap()
            .with_limits(4, 64, PENDING_FOLDER_TIMEOUT_SECS);

        for day in 0..10u32 {
            store.mark_folder_completed(20240100 + day);
            store.save().unwrap();
        }
        // Thresholds are tiny, so compaction must have run at least once.
        assert!(store.state().completed_count() == 10);

        let reopened = StateStore::open(tmp.path()).unwrap();
        for day in 0..10u32 {
            assert!(reopened.is_folder_completed(20240100 + day));
        }
    }

    #[test]
    fn fingerprint_change_detection() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        let file = tmp.path().join("settings.json");
        std::fs::write(&file, b"v1 contents").unwrap();

        // Never seen: changed.
        assert!(store.has_file_changed(&file));

        let digest = md5_file(&file).unwrap();
        store.mark_file_uploaded(&file, Some(digest), 11, true);
        assert!(!store.has_file_changed(&file));

        std::fs::write(&file, b"v2 content!").unwrap();
        assert!(store.has_file_changed(&file));
    }

    #[test]
    fn degraded_mode_reports_capacity() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        for i in 0..MAX_PENDING_FOLDERS as u32 {
            assert!(store.mark_folder_pending(20000000 + i, 1));
        }
        assert!(!store.is_degraded());
        assert!(!store.mark_folder_pending(21000000, 1));
        assert!(store.is_degraded());
    }
}
