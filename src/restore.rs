//! Restore engine (C6): replays one file's copies across a chain of backups
//! (oldest FULL to the newest incremental) into a single reconstructed file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::catalog::backup::BackupId;
use crate::catalog::manifest::{BYTES_INVALID, FILE_NOT_FOUND, FileRecord};
use crate::errors::{BackupError, Result};
use crate::lsn::Lsn;
use crate::page::CompressAlgorithm;
use crate::page::codec;
use crate::page::header_map::{self, HeaderEntry};
use crate::page::pagemap::Pagemap;

/// One backup's copy of a single file, as it participates in a restore chain.
/// `backup_id` orders the chain; `record` is that backup's manifest entry for
/// this path.
pub struct ChainEntry<'a> {
    pub backup_id: BackupId,
    pub record: &'a FileRecord,
    pub datafile_path: PathBuf,
    pub header_map_path: PathBuf,
    pub compress_algorithm: CompressAlgorithm,
}

/// Whether the destination datafile already has some blocks worth trusting,
/// and how to tell (§4.6's checksum/LSN incremental optimisations).
pub enum Precheck {
    /// No optimisation: every block in the chain is written.
    None,
    /// Trust a destination block if its stored checksum matches the chain
    /// entry's header checksum for that block.
    Checksum,
    /// Trust a destination block if its page LSN is at or below `shift_lsn`
    /// (the target backup's own start LSN, typically).
    Lsn(Lsn),
}

/// Restore one datafile from `chain` (given oldest → newest; entries with
/// `write_size` of `BYTES_INVALID`/`FILE_NOT_FOUND` carry no page data for
/// this file and are skipped) into `dest_path`, truncating to the final
/// `n_blocks` once the chain is exhausted.
///
/// `use_bitmap` selects the two algorithms from §4.6: with a bitmap, the
/// chain is replayed newest → oldest and the first writer for a block wins;
/// without one (legacy chains with unknown `n_blocks`), it is replayed
/// oldest → newest and the last writer wins.
///
/// # Errors
/// Returns an error if a backup's header map or datafile copy cannot be read,
/// or if the destination cannot be written.
pub fn restore_datafile(
    chain: &[ChainEntry<'_>],
    dest_path: &Path,
    block_size: usize,
    use_bitmap: bool,
    precheck: &Precheck,
) -> Result<()> {
    let contributing: Vec<&ChainEntry<'_>> =
        chain.iter().filter(|e| e.record.size != BYTES_INVALID && e.record.size != FILE_NOT_FOUND).collect();

    let mut dest = std::fs::OpenOptions::new().read(true).write(true).create(true).truncate(false).open(dest_path)?;

    let mut bitmap = Pagemap::new();
    if use_bitmap {
        if let Some(newest) = contributing.last() {
            apply_precheck(&mut dest, &mut bitmap, newest, block_size, precheck)?;
        }
        for entry in contributing.iter().rev() {
            replay_entry(entry, &mut dest, block_size, Some(&mut bitmap))?;
        }
    } else {
        for entry in &contributing {
            replay_entry(entry, &mut dest, block_size, None)?;
        }
    }

    if let Some(newest) = contributing.last() {
        if let Some(n_blocks) = newest.record.n_blocks {
            if n_blocks > 0 {
                dest.set_len(u64::from(n_blocks) * block_size as u64)?;
            }
        }
    }
    Ok(())
}

/// Pre-mark blocks the destination file already has right, per the checksum
/// or LSN incremental optimisation, so the bitmap replay below skips reading
/// them from any backup copy at all.
fn apply_precheck(dest: &mut File, bitmap: &mut Pagemap, newest: &ChainEntry<'_>, block_size: usize, precheck: &Precheck) -> Result<()> {
    if matches!(precheck, Precheck::None) {
        return Ok(());
    }
    let Some(n_blocks) = newest.record.n_blocks else { return Ok(()) };
    let dest_len = dest.metadata()?.len();
    if dest_len == 0 {
        return Ok(());
    }

    let entries = header_entries(newest)?;
    for block_no in 0..n_blocks {
        let pos = u64::from(block_no) * block_size as u64;
        if pos + block_size as u64 > dest_len {
            break;
        }
        let mut buf = vec![0u8; block_size];
        dest.seek(SeekFrom::Start(pos))?;
        dest.read_exact(&mut buf)?;

        let trusted = match precheck {
            Precheck::None => false,
            Precheck::Checksum => {
                let Some(entry) = entries.iter().find(|e| e.block_no == block_no) else { continue };
                codec::header_checksum_field(&buf) == entry.checksum
            }
            Precheck::Lsn(shift_lsn) => {
                let header = codec::validate_block(buf.clone(), block_size, false, 0);
                header.page_lsn <= shift_lsn.0
            }
        };
        if trusted {
            bitmap.set(block_no);
        }
    }
    Ok(())
}

fn header_entries(entry: &ChainEntry<'_>) -> Result<Vec<HeaderEntry>> {
    let record = entry.record;
    let (Some(hdr_off), Some(hdr_size), Some(hdr_crc), Some(n_headers)) =
        (record.hdr_off, record.hdr_size, record.hdr_crc, record.n_headers)
    else {
        return Err(BackupError::Catalog(format!("{}: backup {} has no header-map entry for this file", record.path, entry.backup_id)));
    };
    header_map::read_file_headers(&entry.header_map_path, hdr_off, hdr_size, hdr_crc, n_headers)
}

/// Replay one backup's header entries for this file into `dest`. With a
/// bitmap, entries whose block is already set are skipped and newly-written
/// blocks are marked; without one, every entry overwrites unconditionally
/// (the caller visits backups oldest → newest so last-write-wins naturally).
fn replay_entry(entry: &ChainEntry<'_>, dest: &mut File, block_size: usize, mut bitmap: Option<&mut Pagemap>) -> Result<()> {
    let entries = header_entries(entry)?;
    // The terminator's offset is the total payload length; pairing each real
    // entry with its successor gives that entry's stored byte length.
    let mut source = File::open(&entry.datafile_path)?;
    let mut current_pos: u64 = 0;

    for window in entries.windows(2) {
        let [current, next] = window else { unreachable!() };
        if current.block_no == u32::MAX {
            continue; // terminator only ever appears last
        }
        if let Some(bmp) = bitmap.as_deref() {
            if bmp.contains(current.block_no) {
                continue;
            }
        }

        let start = u64::try_from(current.offset_in_file).unwrap_or(0);
        let len = usize::try_from(next.offset_in_file - current.offset_in_file).unwrap_or(0);
        if start != current_pos {
            source.seek(SeekFrom::Start(start))?;
        }
        let mut payload = vec![0u8; len];
        source.read_exact(&mut payload)?;
        current_pos = start + len as u64;

        let compressed = len != block_size;
        let block = codec::decode_page(&payload, compressed, entry.compress_algorithm, block_size)?;

        dest.seek(SeekFrom::Start(u64::from(current.block_no) * block_size as u64))?;
        dest.write_all(&block)?;

        if let Some(bmp) = bitmap.as_deref_mut() {
            bmp.set(current.block_no);
        }
    }
    Ok(())
}

/// Non-data file restore (§4.6): walk the chain newest → oldest until a copy
/// with positive `write_size` turns up, then copy it verbatim. If the
/// destination already exists with a matching CRC, nothing is written.
///
/// # Errors
/// Returns an error if no backup in the chain ever wrote this file, or if
/// the winning copy cannot be read/written.
pub fn restore_nondatafile(chain: &[ChainEntry<'_>], dest_path: &Path) -> Result<()> {
    let Some(winner) = chain.iter().rev().find(|e| e.record.size > 0) else {
        return Err(BackupError::Catalog(format!("no backup in the chain ever wrote {}", dest_path.display())));
    };

    if dest_path.exists() {
        let existing = std::fs::read(dest_path)?;
        if crc32fast::hash(&existing) == winner.record.crc {
            return Ok(());
        }
    }

    let body = std::fs::read(&winner.datafile_path)?;
    crate::fsutil::atomic_write(dest_path, &body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::manifest::FileKind;
    use crate::page::codec::{DEFAULT_BLOCK_SIZE, PAGE_HEADER_SIZE, RawPageHeader, compute_page_checksum};
    use crate::page::header_map::HeaderMapWriter;

    fn page(fill: u8, lsn: u64, absolute_block_no: u64) -> Vec<u8> {
        let mut block = vec![fill; DEFAULT_BLOCK_SIZE];
        let mut header = RawPageHeader {
            page_lsn: lsn,
            checksum: 0,
            flags: 0,
            pd_lower: PAGE_HEADER_SIZE as u16,
            pd_upper: 100,
            pd_special: DEFAULT_BLOCK_SIZE as u16,
        };
        header.write_into(&mut block);
        header.checksum = compute_page_checksum(&block, absolute_block_no);
        header.write_into(&mut block);
        block
    }

    fn write_backup_copy(dir: &Path, name: &str, pages: &[(u32, Vec<u8>)]) -> (PathBuf, PathBuf, FileRecord) {
        let datafile_path = dir.join(format!("{name}.data"));
        let header_map_path = dir.join(format!("{name}.hdrmap"));
        let writer = HeaderMapWriter::new(&header_map_path);

        let mut file = std::fs::File::create(&datafile_path).unwrap();
        let mut headers = Vec::new();
        let mut offset = 0i64;
        for (block_no, block) in pages {
            file.write_all(block).unwrap();
            let checksum = codec::header_checksum_field(block);
            headers.push(HeaderEntry { block_no: *block_no, offset_in_file: offset, page_lsn: 0, checksum });
            offset += block.len() as i64;
        }
        let (hdr_off, hdr_size, hdr_crc, n_headers) = writer.append_file_headers(&headers, offset).unwrap();

        let record = FileRecord {
            path: name.to_string(),
            size: offset,
            kind: FileKind::Regular,
            mode: 0o600,
            is_datafile: true,
            is_cfs: false,
            crc: 0,
            compress_alg: "none".into(),
            external_dir_num: 0,
            db_oid: 1,
            full_size: Some(offset),
            segno: Some(0),
            linked: None,
            n_blocks: Some(pages.iter().map(|(b, _)| b + 1).max().unwrap_or(0)),
            n_headers: Some(n_headers),
            hdr_crc: Some(hdr_crc),
            hdr_off: Some(hdr_off),
            hdr_size: Some(hdr_size),
            fork: None,
        };
        (datafile_path, header_map_path, record)
    }

    #[test]
    fn bitmap_mode_prefers_newest_writer_for_each_block() {
        let dir = tempfile::tempdir().unwrap();
        let (full_data, full_hdr, full_record) =
            write_backup_copy(dir.path(), "full", &[(0, page(1, 10, 0)), (1, page(1, 10, 1))]);
        let (delta_data, delta_hdr, delta_record) = write_backup_copy(dir.path(), "delta", &[(1, page(2, 20, 1))]);

        let chain = vec![
            ChainEntry {
                backup_id: BackupId(1),
                record: &full_record,
                datafile_path: full_data,
                header_map_path: full_hdr,
                compress_algorithm: CompressAlgorithm::None,
            },
            ChainEntry {
                backup_id: BackupId(2),
                record: &delta_record,
                datafile_path: delta_data,
                header_map_path: delta_hdr,
                compress_algorithm: CompressAlgorithm::None,
            },
        ];

        let dest = dir.path().join("restored");
        restore_datafile(&chain, &dest, DEFAULT_BLOCK_SIZE, true, &Precheck::None).unwrap();

        let result = std::fs::read(&dest).unwrap();
        assert_eq!(result.len(), 2 * DEFAULT_BLOCK_SIZE);
        assert_eq!(result[0], 1); // block 0 only ever written by full
        assert_eq!(result[DEFAULT_BLOCK_SIZE], 2); // block 1 overridden by delta
    }

    #[test]
    fn no_bitmap_mode_lets_last_writer_win() {
        let dir = tempfile::tempdir().unwrap();
        let (full_data, full_hdr, full_record) = write_backup_copy(dir.path(), "full", &[(0, page(1, 10, 0))]);
        let (delta_data, delta_hdr, delta_record) = write_backup_copy(dir.path(), "delta", &[(0, page(9, 20, 0))]);

        let chain = vec![
            ChainEntry {
                backup_id: BackupId(1),
                record: &full_record,
                datafile_path: full_data,
                header_map_path: full_hdr,
                compress_algorithm: CompressAlgorithm::None,
            },
            ChainEntry {
                backup_id: BackupId(2),
                record: &delta_record,
                datafile_path: delta_data,
                header_map_path: delta_hdr,
                compress_algorithm: CompressAlgorithm::None,
            },
        ];

        let dest = dir.path().join("restored");
        restore_datafile(&chain, &dest, DEFAULT_BLOCK_SIZE, false, &Precheck::None).unwrap();

        let result = std::fs::read(&dest).unwrap();
        assert_eq!(result[0], 9);
    }

    #[test]
    fn unchanged_entries_are_skipped_when_searching_for_data() {
        let dir = tempfile::tempdir().unwrap();
        let (full_data, full_hdr, full_record) = write_backup_copy(dir.path(), "full", &[(0, page(1, 10, 0))]);
        let mut unchanged_record = full_record.clone();
        unchanged_record.size = BYTES_INVALID;

        let chain = vec![
            ChainEntry {
                backup_id: BackupId(1),
                record: &full_record,
                datafile_path: full_data.clone(),
                header_map_path: full_hdr.clone(),
                compress_algorithm: CompressAlgorithm::None,
            },
            ChainEntry {
                backup_id: BackupId(2),
                record: &unchanged_record,
                datafile_path: full_data,
                header_map_path: full_hdr,
                compress_algorithm: CompressAlgorithm::None,
            },
        ];

        let dest = dir.path().join("restored");
        restore_datafile(&chain, &dest, DEFAULT_BLOCK_SIZE, true, &Precheck::None).unwrap();
        let result = std::fs::read(&dest).unwrap();
        assert_eq!(result[0], 1);
    }

    #[test]
    fn precheck_checksum_skips_blocks_dest_already_has_right() {
        let dir = tempfile::tempdir().unwrap();
        let good_block = page(1, 10, 0);
        let (full_data, full_hdr, full_record) = write_backup_copy(dir.path(), "full", &[(0, good_block.clone())]);

        // Corrupt the backup's own stored copy after the header map is built, so a
        // precheck that fails to trust the destination would replay garbage.
        std::fs::write(&full_data, vec![9u8; DEFAULT_BLOCK_SIZE]).unwrap();

        let chain = vec![ChainEntry {
            backup_id: BackupId(1),
            record: &full_record,
            datafile_path: full_data,
            header_map_path: full_hdr,
            compress_algorithm: CompressAlgorithm::None,
        }];

        let dest = dir.path().join("restored");
        std::fs::write(&dest, &good_block).unwrap();

        restore_datafile(&chain, &dest, DEFAULT_BLOCK_SIZE, true, &Precheck::Checksum).unwrap();

        let result = std::fs::read(&dest).unwrap();
        assert_eq!(result, good_block, "block trusted via matching checksum must not be overwritten");
    }

    #[test]
    fn precheck_lsn_skips_blocks_at_or_below_shift_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let good_block = page(1, 10, 0); // page_lsn = 10
        let (full_data, full_hdr, full_record) = write_backup_copy(dir.path(), "full", &[(0, good_block.clone())]);
        std::fs::write(&full_data, vec![9u8; DEFAULT_BLOCK_SIZE]).unwrap();

        let chain = vec![ChainEntry {
            backup_id: BackupId(1),
            record: &full_record,
            datafile_path: full_data,
            header_map_path: full_hdr,
            compress_algorithm: CompressAlgorithm::None,
        }];

        let dest = dir.path().join("restored");
        std::fs::write(&dest, &good_block).unwrap();

        restore_datafile(&chain, &dest, DEFAULT_BLOCK_SIZE, true, &Precheck::Lsn(Lsn(20))).unwrap();

        let result = std::fs::read(&dest).unwrap();
        assert_eq!(result, good_block, "block at or below the shift LSN must not be overwritten");
    }

    #[test]
    fn precheck_lsn_does_not_trust_blocks_above_shift_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let good_block = page(1, 10, 0); // page_lsn = 10
        let replacement = page(2, 10, 0);
        let (full_data, full_hdr, full_record) = write_backup_copy(dir.path(), "full", &[(0, replacement.clone())]);

        let chain = vec![ChainEntry {
            backup_id: BackupId(1),
            record: &full_record,
            datafile_path: full_data,
            header_map_path: full_hdr,
            compress_algorithm: CompressAlgorithm::None,
        }];

        let dest = dir.path().join("restored");
        std::fs::write(&dest, &good_block).unwrap();

        // shift_lsn below the destination's own page LSN: not trusted, gets overwritten.
        restore_datafile(&chain, &dest, DEFAULT_BLOCK_SIZE, true, &Precheck::Lsn(Lsn(5))).unwrap();

        let result = std::fs::read(&dest).unwrap();
        assert_eq!(result, replacement);
    }
}
