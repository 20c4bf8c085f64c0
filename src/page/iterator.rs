//! Source-side page iterator (§4.4): given a datafile and a start LSN, lazily
//! produce only the pages the file engine actually needs to copy.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::catalog::backup::BackupMode;
use crate::lsn::Lsn;

use super::codec::{self, PageState};
use super::compression::CompressAlgorithm;
use super::pagemap::Pagemap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmittedPageState {
    Valid,
    Zeroed,
    Corrupted,
}

/// One event out of the iterator: either a page to record, or the truncation
/// sentinel that ends the sequence early.
#[derive(Debug)]
pub enum PageEvent {
    Page {
        block_no: u32,
        state: EmittedPageState,
        payload: Vec<u8>,
        compressed: bool,
        page_lsn: u64,
        /// The page's own header checksum field (§4.1), carried through so the
        /// header map can store it for the §4.6 checksum-incremental restore.
        checksum: u16,
    },
    /// The file is shorter than a previous backup reported it to be; nothing
    /// past `at_block` exists anymore.
    Truncated { at_block: u32 },
}

pub struct PageIterParams<'a> {
    pub block_size: usize,
    pub checksums_enabled: bool,
    /// `segno * RELSEG_SIZE`: the absolute block-number base for this segment,
    /// used as the checksum's position salt.
    pub absolute_block_base: u64,
    pub start_lsn: Lsn,
    pub backup_mode: BackupMode,
    pub pagemap: Option<&'a Pagemap>,
    pub file_existed_in_prev: bool,
    /// Blocks the previous backup reported for this file; `None` for FULL or
    /// for a file with no prior copy, in which case truncation can't be
    /// detected (there is nothing to compare against).
    pub prev_n_blocks: Option<u32>,
    pub compress_algorithm: CompressAlgorithm,
    pub compress_level: i32,
}

/// Lazily walks one open datafile block by block, applying the §4.4 selection
/// table. Skipped blocks never surface as an event; only emitted pages and the
/// final truncation sentinel do.
pub struct PageIterator<'a> {
    file: File,
    params: PageIterParams<'a>,
    next_block: u32,
    done: bool,
    pub blocks_read: u32,
}

impl<'a> PageIterator<'a> {
    #[must_use]
    pub fn new(file: File, params: PageIterParams<'a>) -> Self {
        Self { file, params, next_block: 0, done: false, blocks_read: 0 }
    }

    fn read_block(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.params.block_size];
        let pos = self.next_block as u64 * self.params.block_size as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        let mut total = 0;
        loop {
            match self.file.read(&mut buf[total..])? {
                0 => break,
                n => total += n,
            }
        }
        if total == 0 {
            return Ok(None);
        }
        buf.truncate(total);
        Ok(Some(buf))
    }

    fn pagemap_says_skip(&self, block_no: u32) -> bool {
        let incremental_with_map = matches!(self.params.backup_mode, BackupMode::Page | BackupMode::Ptrack);
        match self.params.pagemap {
            Some(map) if incremental_with_map && !map.is_empty() && self.params.file_existed_in_prev => {
                !map.contains(block_no)
            }
            _ => false,
        }
    }
}

impl Iterator for PageIterator<'_> {
    type Item = PageEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let block_no = self.next_block;
            let block = match self.read_block() {
                Ok(Some(b)) => b,
                Ok(None) => {
                    self.done = true;
                    if let Some(prev) = self.params.prev_n_blocks {
                        if block_no < prev {
                            return Some(PageEvent::Truncated { at_block: block_no });
                        }
                    }
                    return None;
                }
                Err(_) => {
                    self.done = true;
                    return None;
                }
            };
            self.next_block += 1;
            self.blocks_read = self.next_block;

            if self.pagemap_says_skip(block_no) {
                continue;
            }

            let absolute_block_no = self.params.absolute_block_base + u64::from(block_no);
            let validated = codec::validate_block(block, self.params.block_size, self.params.checksums_enabled, absolute_block_no);

            let (state, page_lsn, raw) = match validated.state {
                PageState::Zeroed => (EmittedPageState::Zeroed, 0u64, validated.raw),
                PageState::HeaderInvalid | PageState::ChecksumMismatch => {
                    let checksum = codec::header_checksum_field(&validated.raw);
                    return Some(PageEvent::Page {
                        block_no,
                        state: EmittedPageState::Corrupted,
                        payload: validated.raw,
                        compressed: false,
                        page_lsn: validated.page_lsn,
                        checksum,
                    });
                }
                PageState::Valid | PageState::NotFound | PageState::LsnFromFuture => {
                    (EmittedPageState::Valid, validated.page_lsn, validated.raw)
                }
            };

            if state == EmittedPageState::Valid && self.params.start_lsn.is_valid() && page_lsn < self.params.start_lsn.0 {
                continue;
            }

            let checksum = codec::header_checksum_field(&raw);
            let (payload, compressed) = match state {
                EmittedPageState::Zeroed => (vec![0u8; self.params.block_size], false),
                _ => codec::encode_page(&raw, self.params.compress_algorithm, self.params.compress_level),
            };

            return Some(PageEvent::Page { block_no, state, payload, compressed, page_lsn, checksum });
        }
    }
}
