//! File engine (C5): for every classified source file, decide whether a copy
//! is needed at all, then drive either the per-page path (datafiles, through
//! the page iterator and header map) or the whole-file CRC path (everything
//! else).

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::catalog::backup::BackupMode;
use crate::catalog::manifest::{BYTES_INVALID, FILE_NOT_FOUND, FileKind, FileRecord};
use crate::errors::Result;
use crate::fsutil;
use crate::lsn::Lsn;
use crate::page::CompressAlgorithm;
use crate::page::codec::DEFAULT_BLOCK_SIZE;
use crate::page::header_map::{HeaderEntry, HeaderMapWriter};
use crate::page::iterator::{EmittedPageState, PageEvent, PageIterParams, PageIterator};
use crate::page::pagemap::Pagemap;
use crate::walker::{ClassifiedFile, Fork};

#[derive(Debug, Clone, Copy)]
pub struct EngineParams {
    pub block_size: usize,
    pub checksums_enabled: bool,
    pub compress_algorithm: CompressAlgorithm,
    pub compress_level: i32,
    pub start_lsn: Lsn,
    pub backup_mode: BackupMode,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            checksums_enabled: true,
            compress_algorithm: CompressAlgorithm::None,
            compress_level: 1,
            start_lsn: Lsn::INVALID,
            backup_mode: BackupMode::Full,
        }
    }
}

/// What the caller already knows about this file from the parent backup's
/// manifest, when the current backup is incremental. `None` for a FULL backup
/// or a file with no entry in the parent.
pub struct PrevFileInfo<'a> {
    pub existed: bool,
    pub crc: u32,
    pub mtime: Option<std::time::SystemTime>,
    pub n_blocks: Option<u32>,
    pub pagemap: Option<&'a Pagemap>,
}

/// A file named in the parent's manifest but missing from the source tree:
/// recorded as `FILE_NOT_FOUND` and not treated as fatal (§4.5).
#[must_use]
pub fn record_missing(file: &ClassifiedFile) -> FileRecord {
    base_record(file, FILE_NOT_FOUND, 0)
}

fn base_record(file: &ClassifiedFile, size: i64, crc: u32) -> FileRecord {
    let mut record = FileRecord {
        path: file.rel_path.to_string_lossy().into_owned(),
        size,
        kind: FileKind::Regular,
        mode: 0o600,
        is_datafile: file.is_datafile,
        is_cfs: file.is_cfs,
        crc,
        compress_alg: "none".into(),
        external_dir_num: 0,
        db_oid: file.db_oid.unwrap_or(0),
        full_size: None,
        segno: file.segno,
        linked: None,
        n_blocks: None,
        n_headers: None,
        hdr_crc: None,
        hdr_off: None,
        hdr_size: None,
        fork: None,
    };
    record.set_fork(file.fork);
    record
}

/// Copy one classified file, choosing the datafile or whole-file path.
/// `source_path`/`dest_path` are the fully resolved file paths (already joined
/// onto the source root / this backup's `database/` root).
///
/// # Errors
/// Returns an error if the source cannot be read, the destination cannot be
/// written, or a datafile is found to contain a corrupted page.
pub fn copy_file(
    source_path: &Path,
    dest_path: &Path,
    header_map: &HeaderMapWriter,
    file: &ClassifiedFile,
    params: &EngineParams,
    prev: Option<&PrevFileInfo<'_>>,
) -> Result<FileRecord> {
    if !source_path.exists() {
        return Ok(record_missing(file));
    }
    if file.is_datafile {
        copy_datafile(source_path, dest_path, header_map, file, params, prev)
    } else {
        copy_nondatafile(source_path, dest_path, file, prev)
    }
}

/// Datafile path: unchanged fast-path, or stream pages via the iterator.
fn copy_datafile(
    source_path: &Path,
    dest_path: &Path,
    header_map: &HeaderMapWriter,
    file: &ClassifiedFile,
    params: &EngineParams,
    prev: Option<&PrevFileInfo<'_>>,
) -> Result<FileRecord> {
    // Unchanged fast-path (incremental modes only): a PAGE/PTRACK pagemap that
    // came back empty means the provider found nothing changed in this file.
    if let Some(p) = prev {
        if p.existed {
            if let Some(pagemap) = p.pagemap {
                if pagemap.is_empty() {
                    let mut record = base_record(file, BYTES_INVALID, p.crc);
                    record.n_blocks = p.n_blocks;
                    return Ok(record);
                }
            }
        }
    }

    let src = File::open(source_path)?;
    let absolute_block_base = u64::from(file.segno.unwrap_or(0)) * crate::page::codec::RELSEG_SIZE;
    let iter_params = PageIterParams {
        block_size: params.block_size,
        checksums_enabled: params.checksums_enabled,
        absolute_block_base,
        start_lsn: params.start_lsn,
        backup_mode: params.backup_mode,
        pagemap: prev.and_then(|p| p.pagemap),
        file_existed_in_prev: prev.is_some_and(|p| p.existed),
        prev_n_blocks: prev.and_then(|p| p.n_blocks),
        compress_algorithm: params.compress_algorithm,
        compress_level: params.compress_level,
    };

    let mut out = fsutil::create_secure(dest_path)?;
    let mut crc_hasher = crc32fast::Hasher::new();
    let mut headers = Vec::new();
    let mut write_offset: i64 = 0;

    let mut iter = PageIterator::new(src, iter_params);
    for event in &mut iter {
        match event {
            PageEvent::Page { block_no, state: EmittedPageState::Corrupted, .. } => {
                return Err(crate::errors::BackupError::Validation(format!(
                    "{}: page at block {block_no} failed validation",
                    file.rel_path.display()
                )));
            }
            PageEvent::Page { block_no, state, payload, page_lsn, checksum, .. } => {
                out.write_all(&payload)?;
                crc_hasher.update(&payload);
                headers.push(HeaderEntry { block_no, offset_in_file: write_offset, page_lsn, checksum });
                write_offset += i64::try_from(payload.len()).unwrap_or(i64::MAX);
                let _ = state; // ZEROED and VALID both get a header entry; only CORRUPTED aborts above.
            }
            PageEvent::Truncated { .. } => break,
        }
    }
    out.flush()?;
    // `blocks_read` counts every block the iterator read off the source, including
    // ones it skipped (pagemap/start-LSN filtering never emit an event), so it is the
    // true block count of the file at copy time — not just the highest emitted block.
    let n_blocks = iter.blocks_read;

    let (hdr_off, hdr_size, hdr_crc, n_headers) = header_map.append_file_headers(&headers, write_offset)?;

    let uncompressed_total = i64::from(n_blocks) * i64::try_from(params.block_size).unwrap_or(i64::MAX);
    let mut record = base_record(file, write_offset, crc_hasher.finalize());
    record.full_size = Some(uncompressed_total);
    record.n_blocks = Some(n_blocks);
    record.n_headers = Some(n_headers);
    record.hdr_crc = Some(hdr_crc);
    record.hdr_off = Some(hdr_off);
    record.hdr_size = Some(hdr_size);
    record.compress_alg = params.compress_algorithm.as_str().to_string();
    Ok(record)
}

/// Whole-file path: stream through a CRC (trimming a `cfm` fork's zero tail),
/// and skip the copy when the parent already has an identical, not-newer copy.
fn copy_nondatafile(source_path: &Path, dest_path: &Path, file: &ClassifiedFile, prev: Option<&PrevFileInfo<'_>>) -> Result<FileRecord> {
    let metadata = std::fs::metadata(source_path)?;
    let mtime = metadata.modified().ok();

    let mut src = File::open(source_path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut body = Vec::with_capacity(usize::try_from(metadata.len()).unwrap_or(0));
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    if file.fork == Fork::Cfm {
        let trimmed = body.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        body.truncate(trimmed);
    }
    let crc = crc32fast::hash(&body);

    if let Some(p) = prev {
        let unchanged = p.existed && p.crc == crc && mtime.is_some_and(|m| p.mtime.is_none_or(|pm| m <= pm));
        if unchanged {
            return Ok(base_record(file, BYTES_INVALID, crc));
        }
    }

    fsutil::atomic_write(dest_path, &body)?;
    let mut record = base_record(file, i64::try_from(body.len()).unwrap_or(i64::MAX), crc);
    record.full_size = Some(i64::try_from(body.len()).unwrap_or(i64::MAX));
    Ok(record)
}
