//! Journal event model: the atomic unit of state mutation.
//!
//! Every change to the upload state is expressed as one `JournalEvent`,
//! applied to memory immediately and appended to the on-disk journal as one
//! self-contained JSON line. Lines are independently parseable so a partial
//! trailing line (power loss mid-write) can be dropped without touching the
//! events before it.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Integer date key (YYYYMMDD) identifying one dated data folder.
pub type DayKey = u32;

/// Seconds since the Unix epoch.
pub type UnixTs = u64;

/// 64-bit stable key for an individually-tracked file path.
pub type PathHash = u64;

/// First 8 bytes of SHA-256 of the path, little-endian.
pub fn path_hash(path: &str) -> PathHash {
    let digest = Sha256::digest(path.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(buf)
}

bitflags! {
    /// Per-fingerprint flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FingerprintFlags: u8 {
        /// Slot is in use.
        const ACTIVE = 0b0000_0001;
        /// The md5 field holds a real digest (empty files have none).
        const HAS_MD5 = 0b0000_0010;
        /// Survives compaction even if the source folder is long completed
        /// (device identification and settings files).
        const PERSISTENT = 0b0000_0100;
    }
}

/// Checksum-based change tracking for one individually-significant file.
///
/// This is a small bounded set (settings, identification files), distinct
/// from bulk per-folder completion tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path_hash: PathHash,
    pub size: u64,
    #[serde(with = "hex")]
    pub md5: [u8; 16],
    pub flags: FingerprintFlags,
}

impl FileFingerprint {
    pub fn new(path_hash: PathHash, size: u64, md5: Option<[u8; 16]>) -> Self {
        let mut flags = FingerprintFlags::ACTIVE;
        if md5.is_some() {
            flags |= FingerprintFlags::HAS_MD5;
        }
        Self {
            path_hash,
            size,
            md5: md5.unwrap_or([0; 16]),
            flags,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.flags |= FingerprintFlags::PERSISTENT;
        self
    }
}

/// At most one retry context exists: the folder currently being reattempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryContext {
    pub day: DayKey,
    pub count: u32,
}

/// One state mutation, encoded as a single journal line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEvent {
    SetTimestamp { ts: UnixTs },
    SetRetry { day: DayKey, count: u32 },
    ClearRetry,
    AddCompleted { day: DayKey },
    RemoveCompleted { day: DayKey },
    AddPending { day: DayKey, first_seen: UnixTs },
    RemovePending { day: DayKey },
    SetFile { file: FileFingerprint },
    RemoveFile { path_hash: PathHash },
}

impl JournalEvent {
    /// Encode as one newline-terminated journal line.
    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one journal line (without its trailing newline).
    pub fn decode_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
