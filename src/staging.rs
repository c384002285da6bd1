//! Internal-flash staging buffer for card files.
//!
//! Copying a file off the card before the network transfer shortens bus
//! hold time: the slow half of the pipeline (the network) runs after the
//! card is already back with the host. The buffer lives under a byte
//! quota with a reserve margin so staging can never fill the flash that
//! also holds the state store.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::Transience;

const COPY_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("staging quota exceeded: need {needed} bytes, {available} available")]
    NoSpace { needed: u64, available: u64 },

    #[error("staged copy size mismatch: expected {expected} bytes, wrote {got}")]
    SizeMismatch { expected: u64, got: u64 },
}

impl StagingError {
    pub fn transience(&self) -> Transience {
        match self {
            StagingError::Io(_) | StagingError::SizeMismatch { .. } => Transience::Retryable,
            // Quota pressure clears once staged files are removed.
            StagingError::NoSpace { .. } => Transience::Retryable,
        }
    }
}

/// A file copied into the staging buffer, with its verified size and
/// content checksum.
#[derive(Debug, Clone)]
pub struct StagedCopy {
    pub source_path: PathBuf,
    pub buffer_path: PathBuf,
    pub size: u64,
    pub checksum: [u8; 32],
}

pub struct StagingBuffer {
    dir: PathBuf,
    quota_bytes: u64,
    margin_bytes: u64,
}

impl StagingBuffer {
    /// Open (creating if needed) the staging directory and drop any copies
    /// left behind by a previous run.
    pub fn open(
        dir: impl Into<PathBuf>,
        quota_bytes: u64,
        margin_bytes: u64,
    ) -> Result<Self, StagingError> {
        let buffer = Self {
            dir: dir.into(),
            quota_bytes,
            margin_bytes,
        };
        std::fs::create_dir_all(&buffer.dir)?;
        buffer.purge()?;
        Ok(buffer)
    }

    /// Override the quota and reserve margin (configuration).
    pub fn with_limits(mut self, quota_bytes: u64, margin_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self.margin_bytes = margin_bytes;
        self
    }

    /// Remove every staged file. Stale copies are never reused across runs;
    /// the card is always the source of truth.
    pub fn purge(&self) -> Result<(), StagingError> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    warn!(path = %entry.path().display(), %err, "failed to purge staged file");
                }
            }
        }
        Ok(())
    }

    pub fn used_bytes(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }

    /// Whether `size` more bytes fit under the quota with the reserve
    /// margin intact.
    pub fn has_space_for(&self, size: u64) -> bool {
        let committed = self.used_bytes().saturating_add(self.margin_bytes);
        size <= self.quota_bytes.saturating_sub(committed)
    }

    /// Copy `source` into the buffer, streaming a SHA-256 over the bytes as
    /// they move, and verify the byte count matches the source size. A
    /// failed or short copy is removed before the error is returned.
    pub fn stage(&self, source: &Path) -> Result<StagedCopy, StagingError> {
        let expected = std::fs::metadata(source)?.len();
        if !self.has_space_for(expected) {
            let committed = self.used_bytes().saturating_add(self.margin_bytes);
            return Err(StagingError::NoSpace {
                needed: expected,
                available: self.quota_bytes.saturating_sub(committed),
            });
        }

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "staged.bin".to_string());
        let buffer_path = self.dir.join(name);

        match self.copy_verified(source, &buffer_path, expected) {
            Ok(checksum) => {
                debug!(
                    source = %source.display(),
                    size = expected,
                    "file staged to internal flash"
                );
                Ok(StagedCopy {
                    source_path: source.to_path_buf(),
                    buffer_path,
                    size: expected,
                    checksum,
                })
            }
            Err(err) => {
                let _ = std::fs::remove_file(&buffer_path);
                Err(err)
            }
        }
    }

    fn copy_verified(
        &self,
        source: &Path,
        dest: &Path,
        expected: u64,
    ) -> Result<[u8; 32], StagingError> {
        let mut input = File::open(source)?;
        let mut output = File::create(dest)?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut buf = [0u8; COPY_CHUNK];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            output.write_all(&buf[..n])?;
            written += n as u64;
        }
        output.sync_all()?;
        if written != expected {
            return Err(StagingError::SizeMismatch {
                expected,
                got: written,
            });
        }
        Ok(hasher.finalize().into())
    }

    /// Delete a staged copy once the transfer is done with it.
    pub fn remove(&self, staged: &StagedCopy) {
        if let Err(err) = std::fs::remove_file(&staged.buffer_path) {
            warn!(path = %staged.buffer_path.display(), %err, "failed to remove staged copy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn buffer(tmp: &TempDir, quota: u64, margin: u64) -> StagingBuffer {
        StagingBuffer::open(tmp.path().join("staging"), quota, margin).unwrap()
    }

    #[test]
    fn stage_copies_and_checksums() {
        let tmp = TempDir::new().unwrap();
        let buf = buffer(&tmp, 10_000, 0);
        let source = tmp.path().join("a.edf");
        std::fs::write(&source, b"hello staging").unwrap();

        let staged = buf.stage(&source).unwrap();
        assert_eq!(staged.size, 13);
        assert_eq!(std::fs::read(&staged.buffer_path).unwrap(), b"hello staging");

        let expected: [u8; 32] = Sha256::digest(b"hello staging").into();
        assert_eq!(staged.checksum, expected);

        buf.remove(&staged);
        assert!(!staged.buffer_path.exists());
    }

    #[test]
    fn margin_is_held_in_reserve() {
        let tmp = TempDir::new().unwrap();
        let buf = buffer(&tmp, 100, 40);
        assert!(buf.has_space_for(60));
        assert!(!buf.has_space_for(61));
    }

    #[test]
    fn with_limits_replaces_quota_and_margin() {
        let tmp = TempDir::new().unwrap();
        let buf = buffer(&tmp, 1000, 0).with_limits(100, 40);
        assert!(buf.has_space_for(60));
        assert!(!buf.has_space_for(61));
    }

    #[test]
    fn used_bytes_count_against_quota() {
        let tmp = TempDir::new().unwrap();
        let buf = buffer(&tmp, 100, 0);
        let source = tmp.path().join("a.edf");
        std::fs::write(&source, vec![0u8; 70]).unwrap();
        let staged = buf.stage(&source).unwrap();

        assert!(buf.has_space_for(30));
        assert!(!buf.has_space_for(31));
        let source_b = tmp.path().join("b.edf");
        std::fs::write(&source_b, vec![0u8; 31]).unwrap();
        assert!(matches!(
            buf.stage(&source_b),
            Err(StagingError::NoSpace { .. })
        ));

        buf.remove(&staged);
        assert!(buf.has_space_for(100));
    }

    #[test]
    fn open_purges_leftovers() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("staging");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stale.edf"), b"leftover").unwrap();

        let buf = StagingBuffer::open(&dir, 100, 0).unwrap();
        assert_eq!(buf.used_bytes(), 0);
    }
}
