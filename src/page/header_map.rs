//! Per-backup header-map file: a compact index of per-page metadata for every
//! datafile in one backup, so restore never has to re-scan a datafile's own bytes
//! to find page boundaries.
//!
//! One physical file per backup, opened lazily and appended to under a single
//! mutex since many file-engine worker threads share it; reads are positioned and
//! need no lock since each reader opens its own file handle.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bincode::config::standard;
use bincode::serde::{decode_from_slice, encode_to_vec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub block_no: u32,
    pub offset_in_file: i64,
    pub page_lsn: u64,
    pub checksum: u16,
}

impl HeaderEntry {
    /// Build the dummy terminator entry whose `offset_in_file` is the total payload size,
    /// so the last real entry's length can be derived as `terminator.offset - entry.offset`.
    #[must_use]
    pub const fn terminator(total_payload_bytes: i64) -> Self {
        Self { block_no: u32::MAX, offset_in_file: total_payload_bytes, page_lsn: 0, checksum: 0 }
    }
}

/// The single instance-wide (really: per-backup) header-map file. One file, many
/// writers serialized by `mutex`, arbitrarily many readers (readers open their own
/// file handle since reads are positioned, not appended).
pub struct HeaderMapWriter {
    inner: Mutex<Option<File>>,
    path: std::path::PathBuf,
}

impl HeaderMapWriter {
    #[must_use]
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { inner: Mutex::new(None), path: path.into() }
    }

    /// Append `entries` (without the terminator — it is added here) for one file and
    /// return `(hdr_off, hdr_size, hdr_crc, n_headers)` for that file's manifest record.
    /// # Errors
    /// Returns an error if the map file cannot be opened/appended to, or if encoding fails.
    pub fn append_file_headers(&self, entries: &[HeaderEntry], total_payload_bytes: i64) -> Result<(u64, u64, u32, u32)> {
        let mut all = entries.to_vec();
        all.push(HeaderEntry::terminator(total_payload_bytes));
        let raw = encode_to_vec(&all, standard()).map_err(BackupError::Codec)?;
        let crc = crc32c::crc32c(&raw);
        let compressed = {
            use flate2::Compression;
            use flate2::write::ZlibEncoder;
            let mut enc = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::new(1));
            enc.write_all(&raw)?;
            enc.finish()?
        };

        let mut guard = self.inner.lock();
        if guard.is_none() {
            std::fs::create_dir_all(self.path.parent().unwrap_or_else(|| Path::new(".")))?;
            *guard = Some(
                std::fs::OpenOptions::new().create(true).append(true).read(true).open(&self.path)?,
            );
        }
        let file = guard.as_mut().expect("header map file opened above");
        let hdr_off = file.seek(SeekFrom::End(0))?;
        file.write_all(&compressed)?;
        file.flush()?;
        drop(guard);

        let n_headers = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        let hdr_size = u64::try_from(compressed.len()).unwrap_or(u64::MAX);
        Ok((hdr_off, hdr_size, crc, n_headers))
    }
}

/// Read one file's header array (including the terminator) out of a header-map file.
/// # Errors
/// Returns an error on I/O failure, CRC mismatch, or malformed data.
pub fn read_file_headers(map_path: &Path, hdr_off: u64, hdr_size: u64, hdr_crc: u32, n_headers: u32) -> Result<Vec<HeaderEntry>> {
    let mut file = File::open(map_path)?;
    file.seek(SeekFrom::Start(hdr_off))?;
    let mut compressed = vec![0u8; usize::try_from(hdr_size).unwrap_or(usize::MAX)];
    file.read_exact(&mut compressed)?;

    let raw = {
        use flate2::read::ZlibDecoder;
        let mut dec = ZlibDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        dec.read_to_end(&mut out)?;
        out
    };
    let crc = crc32c::crc32c(&raw);
    if crc != hdr_crc {
        return Err(BackupError::Validation(format!(
            "header-map CRC mismatch at offset {hdr_off}: expected {hdr_crc:#x}, got {crc:#x}"
        )));
    }
    let (entries, _): (Vec<HeaderEntry>, usize) = decode_from_slice(&raw, standard()).map_err(BackupError::Decode)?;
    // n_headers from the manifest counts real entries only; the map also carries the terminator.
    if entries.len() != n_headers as usize + 1 {
        return Err(BackupError::Validation(format!(
            "header-map entry count mismatch: manifest says {n_headers}, map has {}",
            entries.len().saturating_sub(1)
        )));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back_preserves_entries_and_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("page_header_map");
        let writer = HeaderMapWriter::new(&map_path);

        let entries = vec![
            HeaderEntry { block_no: 0, offset_in_file: 0, page_lsn: 0x100, checksum: 11 },
            HeaderEntry { block_no: 2, offset_in_file: 512, page_lsn: 0x300, checksum: 22 },
        ];
        let (hdr_off, hdr_size, hdr_crc, n_headers) = writer.append_file_headers(&entries, 1024).unwrap();
        assert_eq!(hdr_off, 0);
        assert_eq!(n_headers, 2);

        let read_back = read_file_headers(&map_path, hdr_off, hdr_size, hdr_crc, n_headers).unwrap();
        assert_eq!(read_back.len(), 3);
        assert_eq!(read_back[0], entries[0]);
        assert_eq!(read_back[1], entries[1]);
        assert_eq!(read_back[2].offset_in_file, 1024);
    }

    #[test]
    fn second_file_is_appended_after_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("page_header_map");
        let writer = HeaderMapWriter::new(&map_path);

        let e1 = vec![HeaderEntry { block_no: 0, offset_in_file: 0, page_lsn: 1, checksum: 1 }];
        let (off1, size1, _, _) = writer.append_file_headers(&e1, 8192).unwrap();
        let e2 = vec![HeaderEntry { block_no: 0, offset_in_file: 0, page_lsn: 2, checksum: 2 }];
        let (off2, _, _, _) = writer.append_file_headers(&e2, 8192).unwrap();
        assert_eq!(off1, 0);
        assert_eq!(off2, off1 + size1);
    }

    #[test]
    fn corrupted_map_bytes_fail_crc_check() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("page_header_map");
        let writer = HeaderMapWriter::new(&map_path);
        let entries = vec![HeaderEntry { block_no: 0, offset_in_file: 0, page_lsn: 1, checksum: 1 }];
        let (hdr_off, hdr_size, hdr_crc, n_headers) = writer.append_file_headers(&entries, 8192).unwrap();

        // Corrupt a byte in the stored compressed slab.
        let mut bytes = std::fs::read(&map_path).unwrap();
        let idx = bytes.len() - 1;
        bytes[idx] ^= 0xFF;
        std::fs::write(&map_path, bytes).unwrap();

        let err = read_file_headers(&map_path, hdr_off, hdr_size, hdr_crc, n_headers).unwrap_err();
        assert!(matches!(err, BackupError::Validation(_) | BackupError::Decode(_) | BackupError::Io(_)));
    }
}
