//! Per-file bitmap of block numbers known to have changed since a previous
//! backup (PAGE/PTRACK modes) or already written during restore (bitmap mode).

use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct Pagemap {
    blocks: BTreeSet<u32>,
}

impl Pagemap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_blocks(blocks: impl IntoIterator<Item = u32>) -> Self {
        Self { blocks: blocks.into_iter().collect() }
    }

    pub fn set(&mut self, block_no: u32) {
        self.blocks.insert(block_no);
    }

    #[must_use]
    pub fn contains(&self, block_no: u32) -> bool {
        self.blocks.contains(&block_no)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}
