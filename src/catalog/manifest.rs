//! The file-list manifest (`backup_content.control`): one JSON record per
//! line, CRC-32C over the whole payload.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{BackupError, Result};
use crate::fsutil;
use crate::walker::Fork;

pub const BYTES_INVALID: i64 = -1;
pub const FILE_NOT_FOUND: i64 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Unknown,
}

fn fork_name(fork: Fork) -> Option<&'static str> {
    match fork {
        Fork::None => None,
        Fork::Vm => Some("vm"),
        Fork::Fsm => Some("fsm"),
        Fork::Cfm => Some("cfm"),
        Fork::Ptrack => Some("ptrack"),
        Fork::Init => Some("init"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: i64,
    pub kind: FileKind,
    pub mode: u32,
    pub is_datafile: bool,
    pub is_cfs: bool,
    pub crc: u32,
    pub compress_alg: String,
    pub external_dir_num: u32,
    #[serde(rename = "dbOid")]
    pub db_oid: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_blocks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_headers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdr_crc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdr_off: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdr_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork: Option<String>,
}

impl FileRecord {
    /// `write_size` is `size` when unset, mirroring the manifest field that
    /// doubles as both the byte count and a sentinel (`BYTES_INVALID`,
    /// `FILE_NOT_FOUND`).
    #[must_use]
    pub fn write_size(&self) -> i64 {
        self.size
    }

    #[must_use]
    pub fn set_fork(&mut self, fork: Fork) {
        self.fork = fork_name(fork).map(str::to_string);
    }
}

/// Render the manifest body (all records, newline-terminated) and its CRC-32C.
#[must_use]
pub fn render(records: &[FileRecord]) -> (String, u32) {
    let mut body = String::new();
    for record in records {
        let line = serde_json::to_string(record).unwrap_or_default();
        body.push_str(&line);
        body.push('\n');
    }
    let crc = crc32c::crc32c(body.as_bytes());
    (body, crc)
}

/// Write the manifest to `path`, returning the CRC-32C to store in the
/// owning backup's control file.
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write(path: &Path, records: &[FileRecord]) -> Result<u32> {
    let (body, crc) = render(records);
    fsutil::atomic_write(path, body.as_bytes())?;
    Ok(crc)
}

/// Read and parse a manifest file, verifying its CRC-32C against
/// `expected_crc` (the control file's `content-crc`).
/// # Errors
/// Returns an error on I/O failure, a CRC mismatch, or a malformed record.
pub fn read(path: &Path, expected_crc: u32) -> Result<Vec<FileRecord>> {
    let body = std::fs::read_to_string(path)?;
    let crc = crc32c::crc32c(body.as_bytes());
    if crc != expected_crc {
        return Err(BackupError::Validation(format!(
            "file-list manifest CRC mismatch: control file says {expected_crc:#x}, computed {crc:#x}"
        )));
    }
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(BackupError::Json))
        .collect()
}
