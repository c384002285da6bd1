//! Append-only journal file.
//!
//! Each committed event is one newline-terminated JSON line. Appends are
//! O(1) and fsynced, which is what makes the store safe to persist from
//! inside the latency-critical upload loop; rewriting the full snapshot is
//! deferred to compaction.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::event::JournalEvent;
use super::StoreError;

pub struct Journal {
    path: PathBuf,
}

/// Outcome of a replay pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Complete, well-formed lines decoded.
    pub decoded: usize,
    /// Complete lines that failed to parse (corruption) and were skipped.
    pub skipped: usize,
    /// Whether a partial trailing line (torn write) was discarded.
    pub torn_tail: bool,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Append events, confirming the byte count written matches the
    /// encoding and fsyncing before reporting success. Only after this
    /// returns may the events be considered durable.
    pub fn append(&self, events: &[JournalEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut encoded = String::new();
        for event in events {
            encoded.push_str(&event.encode_line()?);
        }

        let before = self.size_bytes();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;

        let after = fs::metadata(&self.path)?.len();
        let expected = before + encoded.len() as u64;
        if after != expected {
            return Err(StoreError::ShortWrite {
                expected,
                got: after,
            });
        }
        debug!(events = events.len(), bytes = encoded.len(), "journal append");
        Ok(())
    }

    /// Decode every complete line, applying `apply` to each well-formed
    /// event in order. Corrupt lines are skipped with a warning; a partial
    /// trailing line is ignored entirely. Replay never fails on content,
    /// only on I/O.
    pub fn replay(
        &self,
        mut apply: impl FnMut(JournalEvent),
    ) -> Result<ReplayStats, StoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReplayStats::default())
            }
            Err(err) => return Err(err.into()),
        };

        let mut stats = ReplayStats::default();
        let mut rest: &[u8] = &data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];
            if line.is_empty() {
                continue;
            }
            match std::str::from_utf8(line)
                .ok()
                .and_then(|text| JournalEvent::decode_line(text).ok())
            {
                Some(event) => {
                    apply(event);
                    stats.decoded += 1;
                }
                None => {
                    stats.skipped += 1;
                    warn!("skipping corrupt journal line");
                }
            }
        }
        if !rest.is_empty() {
            // Torn write from a power loss mid-append: drop it, the event
            // was never confirmed durable.
            stats.torn_tail = true;
            warn!(bytes = rest.len(), "ignoring partial trailing journal line");
        }
        Ok(stats)
    }

    /// Count of complete lines currently on disk.
    pub fn line_count(&self) -> usize {
        match fs::read(&self.path) {
            Ok(data) => data.iter().filter(|&&b| b == b'\n').count(),
            Err(_) => 0,
        }
    }

    /// Truncate to empty (after a successful compaction).
    pub fn truncate(&self) -> Result<(), StoreError> {
        let file = File::create(&self.path)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn events() -> Vec<JournalEvent> {
        vec![
            JournalEvent::AddCompleted { day: 20240101 },
            JournalEvent::AddPending {
                day: 20240102,
                first_seen: 1000,
            },
            JournalEvent::SetTimestamp { ts: 2000 },
        ]
    }

    #[test]
    fn append_then_replay_in_order() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::new(tmp.path().join("journal"));
        journal.append(&events()).unwrap();

        let mut replayed = Vec::new();
        let stats = journal.replay(|e| replayed.push(e)).unwrap();
        assert_eq!(replayed, events());
        assert_eq!(stats.decoded, 3);
        assert_eq!(stats.skipped, 0);
        assert!(!stats.torn_tail);
    }

    #[test]
    fn missing_journal_replays_empty() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::new(tmp.path().join("journal"));
        let stats = journal.replay(|_| panic!("no events expected")).unwrap();
        assert_eq!(stats, ReplayStats::default());
    }

    #[test]
    fn torn_tail_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal");
        let journal = Journal::new(&path);
        journal.append(&events()).unwrap();

        // Simulate power loss mid-write of a fourth event.
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(b"{\"op\":\"add_comp");
        fs::write(&path, &data).unwrap();

        let mut replayed = Vec::new();
        let stats = journal.replay(|e| replayed.push(e)).unwrap();
        assert_eq!(replayed, events());
        assert!(stats.torn_tail);
    }

    #[test]
    fn corrupt_middle_line_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal");
        let journal = Journal::new(&path);
        journal
            .append(&[JournalEvent::AddCompleted { day: 1 }])
            .unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"garbage line\n").unwrap();
        }
        journal
            .append(&[JournalEvent::AddCompleted { day: 2 }])
            .unwrap();

        let mut replayed = Vec::new();
        let stats = journal.replay(|e| replayed.push(e)).unwrap();
        assert_eq!(
            replayed,
            vec![
                JournalEvent::AddCompleted { day: 1 },
                JournalEvent::AddCompleted { day: 2 },
            ]
        );
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn truncate_empties_the_file() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::new(tmp.path().join("journal"));
        journal.append(&events()).unwrap();
        assert!(journal.size_bytes() > 0);
        journal.truncate().unwrap();
        assert_eq!(journal.size_bytes(), 0);
        assert_eq!(journal.line_count(), 0);
    }
}
