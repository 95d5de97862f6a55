//! Chunk: the grow/shrink unit of the block arena.
//!
//! A chunk allocates its control blocks (and their frames) upfront when
//! the pool grows and releases them as one unit when it shrinks. Block
//! handles are `base + index`; bases are assigned monotonically and never
//! reused, so a handle from a freed chunk can never alias a block of a
//! later one.

use std::sync::Arc;

use crate::buffer::block::{BlockState, ControlBlock};
use crate::common::BlockId;

pub struct Chunk {
    base: u32,
    blocks: Vec<Arc<ControlBlock>>,
}

impl Chunk {
    /// Build a chunk of `capacity` blocks starting at handle `base`.
    pub fn new(base: u32, capacity: usize) -> Self {
        let blocks = (0..capacity)
            .map(|i| Arc::new(ControlBlock::new(BlockId::new(base + i as u32))))
            .collect();
        Self { base, blocks }
    }

    #[inline]
    pub fn base(&self) -> u32 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: BlockId) -> bool {
        id.0 >= self.base && (id.0 - self.base) < self.blocks.len() as u32
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> Option<&Arc<ControlBlock>> {
        if self.contains(id) {
            self.blocks.get((id.0 - self.base) as usize)
        } else {
            None
        }
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Arc<ControlBlock>> {
        self.blocks.iter()
    }

    /// Whether every block is `NotUsed` and unreferenced, i.e. the chunk
    /// can be unlinked and dropped.
    pub fn is_idle(&self) -> bool {
        self.blocks.iter().all(|b| {
            let meta = b.meta();
            meta.state == BlockState::NotUsed && meta.pin_count == 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_handles() {
        let chunk = Chunk::new(100, 4);
        assert_eq!(chunk.len(), 4);
        assert!(chunk.contains(BlockId::new(100)));
        assert!(chunk.contains(BlockId::new(103)));
        assert!(!chunk.contains(BlockId::new(104)));
        assert!(!chunk.contains(BlockId::new(99)));

        let block = chunk.block(BlockId::new(102)).unwrap();
        assert_eq!(block.id(), BlockId::new(102));
        assert!(chunk.block(BlockId::new(42)).is_none());
    }

    #[test]
    fn test_chunk_idle_tracking() {
        let chunk = Chunk::new(0, 2);
        assert!(chunk.is_idle());

        let block = chunk.block(BlockId::new(1)).unwrap();
        block.meta().state = BlockState::FilePage;
        assert!(!chunk.is_idle());

        block.meta().state = BlockState::NotUsed;
        block.meta().pin_count = 1;
        assert!(!chunk.is_idle());

        block.meta().pin_count = 0;
        assert!(chunk.is_idle());
    }
}
