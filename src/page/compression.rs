//! Per-file page compression, selectable independently for each backed-up file.
//!
//! Mirrors a manifest page's own zlib compression in spirit, extended with an
//! optional zstd path for callers that want a higher compression ratio at the
//! cost of CPU.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressAlgorithm {
    None,
    Zlib,
    Zstd,
}

impl CompressAlgorithm {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "zlib" => Some(Self::Zlib),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Compress `data` at `level`. Returns `None` if the compressor errored or produced
    /// output no smaller than the input (the caller then stores the page uncompressed).
    #[must_use]
    pub fn compress(self, data: &[u8], level: i32) -> Option<Vec<u8>> {
        match self {
            Self::None => None,
            Self::Zlib => {
                use flate2::Compression;
                use flate2::write::ZlibEncoder;
                use std::io::Write;
                let level = Compression::new(level.clamp(0, 9) as u32);
                let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len()), level);
                if enc.write_all(data).is_err() {
                    return None;
                }
                enc.finish().ok()
            }
            Self::Zstd => zstd::bulk::compress(data, level.clamp(1, 22)).ok(),
        }
    }

    /// Decompress `data`, which is expected to inflate to exactly `expected_len` bytes.
    /// # Errors
    /// Returns an error if decompression fails or the inflated length does not match.
    pub fn decompress(self, data: &[u8], expected_len: usize) -> std::io::Result<Vec<u8>> {
        let out = match self {
            Self::None => data.to_vec(),
            Self::Zlib => {
                use flate2::read::ZlibDecoder;
                use std::io::Read;
                let mut dec = ZlibDecoder::new(data);
                let mut out = Vec::with_capacity(expected_len);
                dec.read_to_end(&mut out)?;
                out
            }
            Self::Zstd => zstd::bulk::decompress(data, expected_len)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        };
        if out.len() != expected_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("decompressed length {} != expected {}", out.len(), expected_len),
            ));
        }
        Ok(out)
    }
}

impl Default for CompressAlgorithm {
    fn default() -> Self {
        Self::None
    }
}
