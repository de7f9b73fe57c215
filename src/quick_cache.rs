//! The quick cache: small, bounded, per-size LIFO stacks.
//!
//! Released blocks of the twelve smallest size classes are parked here
//! instead of being coalesced, so a following request of the same size is a
//! pop. Parked blocks keep their allocated flag (so the coalescer leaves them
//! alone) and additionally carry the in-cache flag.

use crate::block::{Block, Header, ALIGNMENT, MIN_BLOCK_SIZE};
use crate::coalesce::coalesce;
use crate::free_list::FreeLists;

/// The number of quick-cache stacks, one per size class.
pub(crate) const NUM_QUICK_LISTS: usize = 12;

/// The most blocks a single stack may hold.
pub(crate) const QUICK_LIST_MAX: usize = 5;

/// The largest block size the quick cache holds.
pub(crate) const MAX_QUICK_SIZE: usize = MIN_BLOCK_SIZE + (NUM_QUICK_LISTS - 1) * ALIGNMENT;

#[derive(Clone, Copy, Debug)]
struct Stack {
    len: usize,
    top: Option<Block>,
}

#[derive(Debug)]
pub(crate) struct QuickCache {
    stacks: [Stack; NUM_QUICK_LISTS],
}

impl QuickCache {
    pub(crate) const fn new() -> Self {
        QuickCache {
            stacks: [Stack { len: 0, top: None }; NUM_QUICK_LISTS],
        }
    }

    /// The stack holding blocks of exactly `size` bytes, if there is one.
    #[inline]
    pub(crate) fn index(size: usize) -> Option<usize> {
        let covered = (MIN_BLOCK_SIZE..=MAX_QUICK_SIZE).contains(&size) && size % ALIGNMENT == 0;
        covered.then(|| (size - MIN_BLOCK_SIZE) / ALIGNMENT)
    }

    /// The block size held by stack `index`.
    #[inline]
    pub(crate) fn size_of_class(index: usize) -> usize {
        MIN_BLOCK_SIZE + index * ALIGNMENT
    }

    /// Pop a block of exactly `size` bytes.
    ///
    /// The block's in-cache flag is cleared on both tags; it is otherwise
    /// left for the caller to stamp.
    pub(crate) unsafe fn try_take(&mut self, size: usize) -> Option<Block> {
        let stack = &mut self.stacks[Self::index(size)?];
        let block = stack.top?;
        stack.top = block.quick_next();
        stack.len -= 1;
        block.set_tags(block.header().without_quick_cache());
        Some(block)
    }

    /// Park `block` on the stack for its size.
    ///
    /// If that stack is already full, every block on it is first demoted to a
    /// plain free block, coalesced, and inserted into `lists`, leaving
    /// `block` alone on the stack.
    ///
    /// ### Safety
    ///
    /// `block` must be allocated, of a size the cache covers, and not already
    /// in the cache. `lists` must be the free lists of the same region.
    pub(crate) unsafe fn put(&mut self, block: Block, lists: &mut FreeLists) {
        let header = block.header();
        let Some(index) = Self::index(header.size()) else {
            debug_assert!(false, "block of {} bytes is not quick-cacheable", header.size());
            return;
        };

        if self.stacks[index].len == QUICK_LIST_MAX {
            self.flush(index, lists);
        }

        let stack = &mut self.stacks[index];
        block.set_tags(header.with_quick_cache());
        block.set_quick_next(stack.top);
        stack.top = Some(block);
        stack.len += 1;
    }

    unsafe fn flush(&mut self, index: usize, lists: &mut FreeLists) {
        let stack = &mut self.stacks[index];
        log::trace!(
            "flushing {} blocks of {} bytes from the quick cache",
            stack.len,
            Self::size_of_class(index)
        );

        let mut cursor = stack.top.take();
        stack.len = 0;
        while let Some(block) = cursor {
            cursor = block.quick_next();
            block.set_tags(Header::free(block.size()));
            let merged = coalesce(lists, block);
            lists.insert(merged);
        }
    }

    pub(crate) fn len(&self, index: usize) -> usize {
        self.stacks[index].len
    }

    /// Iterate stack `index` from top to bottom.
    ///
    /// ### Safety
    ///
    /// The stack must not be modified while the iterator is live.
    pub(crate) unsafe fn members(&self, index: usize) -> Members {
        Members {
            cursor: self.stacks[index].top,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.stacks.iter().all(|s| s.len == 0)
    }
}

/// Iterator over one quick-cache stack.
pub(crate) struct Members {
    cursor: Option<Block>,
}

impl Iterator for Members {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.cursor?;
        // Safety: upheld by the contract of `QuickCache::members`.
        self.cursor = unsafe { block.quick_next() };
        Some(block)
    }
}
