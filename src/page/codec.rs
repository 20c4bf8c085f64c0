//! Per-block validate/compress/decompress codec.
//!
//! Shares its header/CRC/`verify_crc`-style validation shape with a segment page's
//! own header-and-checksum pair, except the header being validated here is the
//! *source* page's own header (the thing a live database wrote), not one we control:
//! the layout is fixed and the checksum is the source page's 16-bit checksum rather
//! than our own CRC-32.

use super::compression::CompressAlgorithm;
use crate::utils::num::u16_to_usize;

/// Default block size for a heap page, matching the common 8 KiB page size.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;
/// Size, in blocks, of one relation segment (1 GiB at the default block size).
pub const RELSEG_SIZE: u64 = 1024 * 1024 * 1024 / DEFAULT_BLOCK_SIZE as u64;
/// Size of the fixed page header read off the front of every block.
pub const PAGE_HEADER_SIZE: usize = 24;
/// Alignment `pd_special` must respect (the platform's "maximum alignment").
const MAXIMUM_ALIGNOF: u16 = 8;
/// Bits in `pd_flags` that are recognized; any other bit set makes the header invalid.
const KNOWN_FLAGS_MASK: u16 = 0x0007;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Valid,
    Zeroed,
    NotFound,
    HeaderInvalid,
    ChecksumMismatch,
    LsnFromFuture,
}

/// The fixed fields of a source page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPageHeader {
    pub page_lsn: u64,
    pub checksum: u16,
    pub flags: u16,
    pub pd_lower: u16,
    pub pd_upper: u16,
    pub pd_special: u16,
}

impl RawPageHeader {
    fn parse(block: &[u8]) -> Option<Self> {
        if block.len() < PAGE_HEADER_SIZE {
            return None;
        }
        let page_lsn = u64::from_le_bytes(block[0..8].try_into().ok()?);
        let checksum = u16::from_le_bytes(block[8..10].try_into().ok()?);
        let flags = u16::from_le_bytes(block[10..12].try_into().ok()?);
        let pd_lower = u16::from_le_bytes(block[12..14].try_into().ok()?);
        let pd_upper = u16::from_le_bytes(block[14..16].try_into().ok()?);
        let pd_special = u16::from_le_bytes(block[16..18].try_into().ok()?);
        Some(Self { page_lsn, checksum, flags, pd_lower, pd_upper, pd_special })
    }

    /// Write this header's fields into the front of `block` (test/encode helper).
    pub fn write_into(&self, block: &mut [u8]) {
        block[0..8].copy_from_slice(&self.page_lsn.to_le_bytes());
        block[8..10].copy_from_slice(&self.checksum.to_le_bytes());
        block[10..12].copy_from_slice(&self.flags.to_le_bytes());
        block[12..14].copy_from_slice(&self.pd_lower.to_le_bytes());
        block[14..16].copy_from_slice(&self.pd_upper.to_le_bytes());
        block[16..18].copy_from_slice(&self.pd_special.to_le_bytes());
    }

    fn is_structurally_valid(&self, block_size: usize) -> bool {
        let block_size = block_size as u16;
        self.flags & !KNOWN_FLAGS_MASK == 0
            && self.pd_lower >= PAGE_HEADER_SIZE as u16
            && self.pd_lower <= self.pd_upper
            && self.pd_upper <= self.pd_special
            && self.pd_special <= block_size
            && self.pd_special % MAXIMUM_ALIGNOF == 0
    }
}

/// Result of reading and validating one block.
pub struct ValidatedBlock {
    pub state: PageState,
    pub page_lsn: u64,
    pub raw: Vec<u8>,
}

/// Validate a freshly-read block. `checksums_enabled` gates step 4; `absolute_block_no`
/// is `segno * RELSEG_SIZE + block_no` as required for the checksum's block-position salt.
#[must_use]
pub fn validate_block(block: Vec<u8>, block_size: usize, checksums_enabled: bool, absolute_block_no: u64) -> ValidatedBlock {
    if block.len() != block_size {
        return ValidatedBlock { state: PageState::HeaderInvalid, page_lsn: 0, raw: block };
    }
    let header = match RawPageHeader::parse(&block) {
        Some(h) if h.is_structurally_valid(block_size) => h,
        _ => {
            let state = if block.iter().all(|&b| b == 0) { PageState::Zeroed } else { PageState::HeaderInvalid };
            return ValidatedBlock { state, page_lsn: 0, raw: block };
        }
    };
    if checksums_enabled {
        let computed = compute_page_checksum(&block, absolute_block_no);
        if computed != header.checksum {
            return ValidatedBlock { state: PageState::ChecksumMismatch, page_lsn: header.page_lsn, raw: block };
        }
    }
    ValidatedBlock { state: PageState::Valid, page_lsn: header.page_lsn, raw: block }
}

/// 16-bit page checksum over the block contents and its position in the relation.
/// This is a from-scratch FNV-1a-derived checksum (not bit-identical to any particular
/// database's on-disk algorithm); what matters for this engine is that `compute` and
/// `validate` agree, and that a single flipped bit anywhere in the block changes the
/// result.
#[must_use]
pub fn compute_page_checksum(block: &[u8], absolute_block_no: u64) -> u16 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ absolute_block_no;
    for chunk in block.chunks(8) {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u64::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    ((hash >> 48) ^ (hash & 0xFFFF)) as u16
}

/// Stamp `checksum` and `page_lsn` into `block`'s header in place (test helper mirroring
/// what a live database would have already done before the codec ever sees the page).
pub fn stamp_checksum(block: &mut [u8], page_lsn: u64, absolute_block_no: u64) {
    let mut header = RawPageHeader::parse(block).unwrap_or(RawPageHeader {
        page_lsn,
        checksum: 0,
        flags: 0,
        pd_lower: PAGE_HEADER_SIZE as u16,
        pd_upper: PAGE_HEADER_SIZE as u16,
        pd_special: crate::utils::num::u32_to_usize(u32::try_from(block.len()).unwrap_or(u32::MAX)) as u16,
    });
    header.page_lsn = page_lsn;
    header.checksum = 0;
    header.write_into(block);
    header.checksum = compute_page_checksum(block, absolute_block_no);
    header.write_into(block);
}

/// Encode a validated, in-range page for storage: compress if it shrinks the payload,
/// otherwise store the raw block verbatim.
#[must_use]
pub fn encode_page(raw: &[u8], algorithm: CompressAlgorithm, level: i32) -> (Vec<u8>, bool) {
    match algorithm.compress(raw, level) {
        Some(compressed) if compressed.len() < raw.len() => (compressed, true),
        _ => (raw.to_vec(), false),
    }
}

/// Decode a stored page payload back into exactly one block.
///
/// A decompression whose output length doesn't match `block_size` is an error *unless*
/// the *input* length already equals `block_size`, in which case the legacy
/// "stored uncompressed but unflagged" convention applies and the input is returned
/// verbatim.
/// # Errors
/// Returns an error if decompression fails and the input isn't a verbatim block.
pub fn decode_page(
    payload: &[u8],
    compressed: bool,
    algorithm: CompressAlgorithm,
    block_size: usize,
) -> std::io::Result<Vec<u8>> {
    if !compressed || payload.len() == block_size {
        if payload.len() != block_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "uncompressed payload length does not match block size",
            ));
        }
        return Ok(payload.to_vec());
    }
    algorithm.decompress(payload, block_size)
}

#[must_use]
pub fn is_all_zero(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

#[must_use]
pub fn header_checksum_field(block: &[u8]) -> u16 {
    RawPageHeader::parse(block).map_or(0, |h| h.checksum)
}

#[must_use]
pub fn header_size() -> usize {
    u16_to_usize(PAGE_HEADER_SIZE as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_block(lsn: u64, absolute_block_no: u64) -> Vec<u8> {
        let mut block = vec![0u8; DEFAULT_BLOCK_SIZE];
        // Populate some body bytes so the block isn't all-zero.
        for (i, b) in block.iter_mut().enumerate().skip(PAGE_HEADER_SIZE) {
            *b = (i % 251) as u8;
        }
        let mut header = RawPageHeader {
            page_lsn: lsn,
            checksum: 0,
            flags: 0,
            pd_lower: PAGE_HEADER_SIZE as u16,
            pd_upper: 100,
            pd_special: DEFAULT_BLOCK_SIZE as u16,
        };
        header.write_into(&mut block);
        let checksum = compute_page_checksum(&block, absolute_block_no);
        header.checksum = checksum;
        header.write_into(&mut block);
        block
    }

    #[test]
    fn valid_page_round_trips_through_encode_decode() {
        let block = valid_block(0x100, 0);
        let validated = validate_block(block.clone(), DEFAULT_BLOCK_SIZE, true, 0);
        assert_eq!(validated.state, PageState::Valid);
        for algo in [CompressAlgorithm::None, CompressAlgorithm::Zlib, CompressAlgorithm::Zstd] {
            let (payload, compressed) = encode_page(&block, algo, 3);
            let back = decode_page(&payload, compressed, algo, DEFAULT_BLOCK_SIZE).unwrap();
            assert_eq!(back, block);
        }
    }

    #[test]
    fn corrupted_header_but_all_zero_is_zeroed_not_corrupted() {
        let block = vec![0u8; DEFAULT_BLOCK_SIZE];
        let validated = validate_block(block, DEFAULT_BLOCK_SIZE, true, 0);
        assert_eq!(validated.state, PageState::Zeroed);
    }

    #[test]
    fn corrupted_header_with_content_is_header_invalid() {
        let mut block = valid_block(0x100, 0);
        // Break the structural invariant: pd_upper > pd_special.
        block[14..16].copy_from_slice(&(DEFAULT_BLOCK_SIZE as u16 + 10).to_le_bytes());
        let validated = validate_block(block, DEFAULT_BLOCK_SIZE, true, 0);
        assert_eq!(validated.state, PageState::HeaderInvalid);
    }

    #[test]
    fn flipped_checksum_bit_is_detected() {
        let mut block = valid_block(0x200, 7);
        block[8] ^= 0x01;
        let validated = validate_block(block, DEFAULT_BLOCK_SIZE, true, 7);
        assert_eq!(validated.state, PageState::ChecksumMismatch);
    }

    #[test]
    fn checksum_disabled_skips_mismatch_detection() {
        let mut block = valid_block(0x200, 7);
        block[8] ^= 0x01;
        let validated = validate_block(block, DEFAULT_BLOCK_SIZE, false, 7);
        assert_eq!(validated.state, PageState::Valid);
    }

    #[test]
    fn encode_stores_uncompressible_page_verbatim() {
        // Random-looking, incompressible body: zstd/zlib should not shrink it below the
        // block size, so encode_page should fall back to verbatim storage.
        let mut block = vec![0u8; DEFAULT_BLOCK_SIZE];
        let mut x: u64 = 0x1234_5678_9abc_def0;
        for b in block.iter_mut().skip(PAGE_HEADER_SIZE) {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            *b = x as u8;
        }
        for algo in [CompressAlgorithm::Zlib, CompressAlgorithm::Zstd] {
            let (payload, compressed) = encode_page(&block, algo, 1);
            if !compressed {
                assert_eq!(payload.len(), DEFAULT_BLOCK_SIZE);
                let back = decode_page(&payload, compressed, algo, DEFAULT_BLOCK_SIZE).unwrap();
                assert_eq!(back, block);
            }
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::test_runner::Config { cases: 64, .. proptest::test_runner::Config::default() })]

        /// §8 "Page codec — round trip": for any page body and any supported
        /// algorithm/level, `decode(encode(page)) == page` byte-for-byte.
        #[test]
        fn prop_encode_decode_round_trips(
            body in proptest::collection::vec(proptest::prelude::any::<u8>(), DEFAULT_BLOCK_SIZE - PAGE_HEADER_SIZE),
            lsn in proptest::prelude::any::<u64>(),
            absolute_block_no in 0u64..RELSEG_SIZE,
            level in 1i32..9,
        ) {
            let mut block = vec![0u8; DEFAULT_BLOCK_SIZE];
            block[PAGE_HEADER_SIZE..].copy_from_slice(&body);
            let mut header = RawPageHeader {
                page_lsn: lsn,
                checksum: 0,
                flags: 0,
                pd_lower: PAGE_HEADER_SIZE as u16,
                pd_upper: DEFAULT_BLOCK_SIZE as u16 / 2,
                pd_special: DEFAULT_BLOCK_SIZE as u16,
            };
            header.write_into(&mut block);
            header.checksum = compute_page_checksum(&block, absolute_block_no);
            header.write_into(&mut block);

            for algo in [CompressAlgorithm::None, CompressAlgorithm::Zlib, CompressAlgorithm::Zstd] {
                let (payload, compressed) = encode_page(&block, algo, level);
                proptest::prop_assert!(payload.len() < DEFAULT_BLOCK_SIZE || !compressed);
                let back = decode_page(&payload, compressed, algo, DEFAULT_BLOCK_SIZE).unwrap();
                proptest::prop_assert_eq!(back, block.clone());
            }
        }
    }
}
