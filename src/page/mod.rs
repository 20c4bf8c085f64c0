//! Page-level codec, compression, the per-backup header-map index, and the
//! source-side page iterator that drives both.

pub mod codec;
pub mod compression;
pub mod header_map;
pub mod iterator;
pub mod pagemap;

pub use codec::{PageState, RawPageHeader, ValidatedBlock};
pub use compression::CompressAlgorithm;
pub use header_map::{HeaderEntry, HeaderMapWriter};
pub use iterator::{EmittedPageState, PageEvent, PageIterParams, PageIterator};
pub use pagemap::Pagemap;
