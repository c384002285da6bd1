//! In-memory upload state and deterministic event application.
//!
//! Collections are fixed-capacity: insertion past capacity is rejected and
//! reported, never silently evicting entries that are already tracked.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use super::event::{DayKey, FileFingerprint, JournalEvent, PathHash, RetryContext, UnixTs};

/// Completed-folder capacity, roughly eleven years of daily folders.
pub const MAX_COMPLETED_FOLDERS: usize = 4096;
/// Pending (observed-empty) folder capacity.
pub const MAX_PENDING_FOLDERS: usize = 128;
/// Individually-fingerprinted file capacity.
pub const MAX_TRACKED_FILES: usize = 64;

/// Why an event was not applied. Rejections are reported conditions, not
/// data loss: existing entries are never displaced.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyRejection {
    #[error("completed-folder set is full ({0} entries)")]
    CompletedFull(usize),
    #[error("pending-folder set is full ({0} entries)")]
    PendingFull(usize),
    #[error("tracked-file set is full ({0} entries)")]
    FilesFull(usize),
    #[error("day {0} is already completed, cannot mark pending")]
    AlreadyCompleted(DayKey),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadState {
    pub(crate) last_upload_ts: UnixTs,
    pub(crate) retry: Option<RetryContext>,
    pub(crate) completed: BTreeSet<DayKey>,
    pub(crate) pending: BTreeMap<DayKey, UnixTs>,
    pub(crate) files: BTreeMap<PathHash, FileFingerprint>,
}

impl UploadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Mutations preserve the invariant that a day is in
    /// at most one of {pending, completed}.
    pub fn apply(&mut self, event: &JournalEvent) -> Result<(), ApplyRejection> {
        match event {
            JournalEvent::SetTimestamp { ts } => {
                self.last_upload_ts = *ts;
            }
            JournalEvent::SetRetry { day, count } => {
                self.retry = Some(RetryContext {
                    day: *day,
                    count: *count,
                });
            }
            JournalEvent::ClearRetry => {
                self.retry = None;
            }
            JournalEvent::AddCompleted { day } => {
                if !self.completed.contains(day) && self.completed.len() >= MAX_COMPLETED_FOLDERS {
                    return Err(ApplyRejection::CompletedFull(self.completed.len()));
                }
                self.completed.insert(*day);
                self.pending.remove(day);
                if self.retry.is_some_and(|r| r.day == *day) {
                    self.retry = None;
                }
            }
            JournalEvent::RemoveCompleted { day } => {
                self.completed.remove(day);
            }
            JournalEvent::AddPending { day, first_seen } => {
                if self.completed.contains(day) {
                    return Err(ApplyRejection::AlreadyCompleted(*day));
                }
                if !self.pending.contains_key(day) && self.pending.len() >= MAX_PENDING_FOLDERS {
                    return Err(ApplyRejection::PendingFull(self.pending.len()));
                }
                self.pending.insert(*day, *first_seen);
            }
            JournalEvent::RemovePending { day } => {
                self.pending.remove(day);
            }
            JournalEvent::SetFile { file } => {
                if !self.files.contains_key(&file.path_hash)
                    && self.files.len() >= MAX_TRACKED_FILES
                {
                    return Err(ApplyRejection::FilesFull(self.files.len()));
                }
                self.files.insert(file.path_hash, file.clone());
            }
            JournalEvent::RemoveFile { path_hash } => {
                self.files.remove(path_hash);
            }
        }
        Ok(())
    }

    pub fn last_upload_ts(&self) -> UnixTs {
        self.last_upload_ts
    }

    pub fn retry(&self) -> Option<RetryContext> {
        self.retry
    }

    pub fn is_completed(&self, day: DayKey) -> bool {
        self.completed.contains(&day)
    }

    pub fn is_pending(&self, day: DayKey) -> bool {
        self.pending.contains_key(&day)
    }

    pub fn pending_first_seen(&self, day: DayKey) -> Option<UnixTs> {
        self.pending.get(&day).copied()
    }

    pub fn fingerprint(&self, path_hash: PathHash) -> Option<&FileFingerprint> {
        self.files.get(&path_hash)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn tracked_file_count(&self) -> usize {
        self.files.len()
    }

    /// Pending folders whose timeout has elapsed at `now`.
    pub fn pending_due(&self, now: UnixTs, timeout_secs: u64) -> Vec<DayKey> {
        self.pending
            .iter()
            .filter(|(_, first_seen)| now >= *first_seen + timeout_secs)
            .map(|(day, _)| *day)
            .collect()
    }
}
