//! The `Backup` record: identity, mode, status and lifecycle.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::lsn::Lsn;
use crate::page::CompressAlgorithm;

/// A backup's identifier is the base-36 encoding of its start time (seconds
/// since epoch). Stored internally as the raw seconds value so arithmetic and
/// ordering stay trivial; `to_string`/`FromStr` do the base-36 conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackupId(pub u64);

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

impl BackupId {
    #[must_use]
    pub fn from_start_time(epoch_secs: u64) -> Self {
        Self(epoch_secs)
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "0");
        }
        let mut digits = [0u8; 16];
        let mut n = self.0;
        let mut i = digits.len();
        while n > 0 {
            i -= 1;
            digits[i] = BASE36_ALPHABET[(n % 36) as usize];
            n /= 36;
        }
        // SAFETY: the alphabet is all ASCII.
        let s = std::str::from_utf8(&digits[i..]).unwrap_or("0");
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("invalid backup id literal")]
pub struct ParseBackupIdError;

impl FromStr for BackupId {
    type Err = ParseBackupIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ParseBackupIdError);
        }
        let mut n: u64 = 0;
        for b in s.bytes() {
            let digit = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'z' => b - b'a' + 10,
                b'A'..=b'Z' => b - b'A' + 10,
                _ => return Err(ParseBackupIdError),
            };
            n = n.checked_mul(36).ok_or(ParseBackupIdError)?.checked_add(u64::from(digit)).ok_or(ParseBackupIdError)?;
        }
        Ok(Self(n))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupMode {
    Full,
    Page,
    Ptrack,
    Delta,
}

impl BackupMode {
    #[must_use]
    pub const fn is_incremental(self) -> bool {
        !matches!(self, Self::Full)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Page => "page",
            Self::Ptrack => "ptrack",
            Self::Delta => "delta",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "page" => Some(Self::Page),
            "ptrack" => Some(Self::Ptrack),
            "delta" => Some(Self::Delta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    Ok,
    Done,
    Running,
    Merging,
    Merged,
    Deleting,
    Deleted,
    Error,
    Orphan,
    Corrupt,
}

impl BackupStatus {
    #[must_use]
    pub const fn is_valid_ancestor(self) -> bool {
        matches!(self, Self::Ok | Self::Done)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Done => "DONE",
            Self::Running => "RUNNING",
            Self::Merging => "MERGING",
            Self::Merged => "MERGED",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
            Self::Orphan => "ORPHAN",
            Self::Corrupt => "CORRUPT",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(Self::Ok),
            "DONE" => Some(Self::Done),
            "RUNNING" => Some(Self::Running),
            "MERGING" => Some(Self::Merging),
            "MERGED" => Some(Self::Merged),
            "DELETING" => Some(Self::Deleting),
            "DELETED" => Some(Self::Deleted),
            "ERROR" => Some(Self::Error),
            "ORPHAN" => Some(Self::Orphan),
            "CORRUPT" => Some(Self::Corrupt),
            _ => None,
        }
    }
}

/// One backup object: everything that lives in its control file plus the
/// identity/lifecycle fields that frame it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: BackupId,
    pub parent_backup: Option<BackupId>,
    pub merge_dest_id: Option<BackupId>,
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub timeline_id: u32,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub merge_time: Option<u64>,
    pub recovery_xid: Option<u64>,
    pub recovery_time: Option<u64>,
    pub expire_time: Option<u64>,
    pub content_crc: u32,
    pub program_version: String,
    pub server_version: String,
    pub block_size: u32,
    pub xlog_block_size: u32,
    pub checksum_version: u32,
    pub compress_alg: CompressAlgorithm,
    pub compress_level: i32,
    pub stream: bool,
    pub from_replica: bool,
    pub data_bytes: i64,
    pub wal_bytes: i64,
    pub uncompressed_bytes: i64,
    pub pgdata_bytes: i64,
    pub primary_conninfo: Option<String>,
    pub external_dirs: Vec<String>,
    pub note: Option<String>,
}

impl Backup {
    #[must_use]
    pub const fn is_full(&self) -> bool {
        matches!(self.mode, BackupMode::Full)
    }

    #[must_use]
    pub const fn is_pinned(&self, now_secs: u64) -> bool {
        matches!(self.expire_time, Some(t) if t > now_secs)
    }
}
