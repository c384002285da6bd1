//! Snapshot file: the replay base, rewritten during compaction.
//!
//! Written atomically via tmp + fsync + verify + remove-then-rename so a
//! half-written snapshot is never the active one. A corrupt or missing
//! snapshot degrades to empty state, never to a startup failure.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::event::{DayKey, FileFingerprint, RetryContext, UnixTs};
use super::state::UploadState;
use super::StoreError;

/// Snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version for future compatibility.
    pub version: u32,
    pub last_upload_ts: UnixTs,
    pub retry: Option<RetryContext>,
    pub completed: Vec<DayKey>,
    pub pending: Vec<(DayKey, UnixTs)>,
    pub files: Vec<FileFingerprint>,
}

impl Snapshot {
    pub fn from_state(state: &UploadState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            last_upload_ts: state.last_upload_ts,
            retry: state.retry,
            completed: state.completed.iter().copied().collect(),
            pending: state.pending.iter().map(|(d, t)| (*d, *t)).collect(),
            files: state.files.values().cloned().collect(),
        }
    }

    pub fn into_state(self) -> UploadState {
        let mut state = UploadState::new();
        state.last_upload_ts = self.last_upload_ts;
        state.retry = self.retry;
        state.completed = self.completed.into_iter().collect();
        state.pending = self.pending.into_iter().collect();
        state.files = self
            .files
            .into_iter()
            .map(|fp| (fp.path_hash, fp))
            .collect();
        state
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Load the snapshot if present and well-formed.
///
/// Returns `None` both for "no snapshot yet" and for a corrupt file; the
/// latter is logged and left in place so the next compaction replaces it.
pub fn load(path: &Path) -> Option<Snapshot> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), %err, "snapshot unreadable, starting empty");
            return None;
        }
    };
    match serde_json::from_slice::<Snapshot>(&data) {
        Ok(snapshot) => {
            if snapshot.version != SNAPSHOT_VERSION {
                warn!(
                    got = snapshot.version,
                    expected = SNAPSHOT_VERSION,
                    "unknown snapshot version, loading anyway"
                );
            }
            Some(snapshot)
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "snapshot corrupt, starting empty");
            None
        }
    }
}

/// Write the snapshot atomically.
///
/// Failure at any step leaves the previous snapshot untouched (the tmp file
/// is cleaned up best-effort).
pub fn write_atomic(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    let data = serde_json::to_vec(snapshot)?;

    let result = (|| -> Result<(), StoreError> {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;

        // Verify the bytes actually landed before retiring the old snapshot.
        let written = fs::metadata(&tmp)?.len();
        if written != data.len() as u64 {
            return Err(StoreError::ShortWrite {
                expected: data.len() as u64,
                got: written,
            });
        }

        // Remove-then-rename: the active name never points at partial data.
        if path.exists() {
            fs::remove_file(path)?;
        }
        fs::rename(&tmp, path)?;

        if let Some(dir) = path.parent() {
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::event::JournalEvent;
    use tempfile::TempDir;

    fn sample_state() -> UploadState {
        let mut state = UploadState::new();
        state
            .apply(&JournalEvent::AddCompleted { day: 20240101 })
            .unwrap();
        state
            .apply(&JournalEvent::AddPending {
                day: 20240102,
                first_seen: 1_700_000_000,
            })
            .unwrap();
        state
            .apply(&JournalEvent::SetTimestamp { ts: 1_700_000_500 })
            .unwrap();
        state
    }

    #[test]
    fn write_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.snapshot");
        let state = sample_state();

        write_atomic(&path, &Snapshot::from_state(&state)).unwrap();
        let loaded = load(&path).unwrap().into_state();
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(load(&tmp.path().join("nope")).is_none());
    }

    #[test]
    fn corrupt_snapshot_is_none_not_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.snapshot");
        fs::write(&path, b"{ not json").unwrap();
        assert!(load(&path).is_none());
    }

    #[test]
    fn rewrite_replaces_previous_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.snapshot");
        let mut state = sample_state();
        write_atomic(&path, &Snapshot::from_state(&state)).unwrap();

        state
            .apply(&JournalEvent::AddCompleted { day: 20240103 })
            .unwrap();
        write_atomic(&path, &Snapshot::from_state(&state)).unwrap();

        let loaded = load(&path).unwrap().into_state();
        assert!(loaded.is_completed(20240103));
        assert!(!tmp_path(&path).exists());
    }
}
