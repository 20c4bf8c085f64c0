//! Log sequence numbers: a 64-bit WAL position formatted as `%X/%X` (high/low
//! 32-bit halves), matching the textual form used throughout control files and manifests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("invalid LSN literal")]
pub struct ParseLsnError;

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or(ParseLsnError)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError)?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError)?;
        Ok(Self((u64::from(hi) << 32) | u64::from(lo)))
    }
}
