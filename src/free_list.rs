//! Segregated free lists.
//!
//! Free blocks are bucketed by size into [`NUM_BUCKETS`] circular doubly
//! linked lists threaded through the blocks' own bodies. Bucket 0 holds only
//! minimum-size blocks; bucket `i > 0` holds blocks whose size in
//! minimum-block units, rounded up, is in `(2^(i-1), 2^i]`, with the last
//! bucket catching everything larger.
//!
//! Each bucket head points at one member of its ring, so inserting at the head
//! and unlinking an arbitrary member are both O(1).

use crate::block::{Block, MIN_BLOCK_SIZE};

/// The number of size-class buckets.
pub(crate) const NUM_BUCKETS: usize = 12;

/// The bucket that holds free blocks of `size` bytes.
///
/// Monotonic non-decreasing in `size`.
#[inline]
pub(crate) fn bucket_index(size: usize) -> usize {
    debug_assert!(size >= MIN_BLOCK_SIZE);
    if size == MIN_BLOCK_SIZE {
        return 0;
    }
    let units = size.div_ceil(MIN_BLOCK_SIZE) - 1;
    let bits = (usize::BITS - units.leading_zeros()) as usize;
    bits.min(NUM_BUCKETS - 1)
}

#[derive(Debug)]
pub(crate) struct FreeLists {
    heads: [Option<Block>; NUM_BUCKETS],
}

impl FreeLists {
    pub(crate) const fn new() -> Self {
        FreeLists {
            heads: [None; NUM_BUCKETS],
        }
    }

    /// Push `block` at the head of its bucket.
    ///
    /// ### Safety
    ///
    /// `block` must be a free block, tagged with its final size, and not
    /// currently a member of any bucket.
    pub(crate) unsafe fn insert(&mut self, block: Block) {
        let head = &mut self.heads[bucket_index(block.size())];
        match *head {
            None => {
                block.set_free_next(block);
                block.set_free_prev(block);
            }
            Some(first) => {
                let last = first.free_prev();
                block.set_free_next(first);
                block.set_free_prev(last);
                last.set_free_next(block);
                first.set_free_prev(block);
            }
        }
        *head = Some(block);
    }

    /// Unlink `block` from its bucket.
    ///
    /// ### Safety
    ///
    /// `block` must be a member of the bucket for its current tagged size.
    pub(crate) unsafe fn remove(&mut self, block: Block) {
        let head = &mut self.heads[bucket_index(block.size())];
        let next = block.free_next();
        if next == block {
            debug_assert_eq!(*head, Some(block));
            *head = None;
        } else {
            let prev = block.free_prev();
            prev.set_free_next(next);
            next.set_free_prev(prev);
            if *head == Some(block) {
                *head = Some(next);
            }
        }
        block.clear_free_links();
    }

    /// Find a free block of at least `size` bytes.
    ///
    /// Starts at `size`'s own bucket and moves to larger ones, taking the
    /// first fitting block in each. The block is left in its bucket.
    pub(crate) unsafe fn find_fit(&self, size: usize) -> Option<Block> {
        (bucket_index(size)..NUM_BUCKETS)
            .flat_map(|index| self.bucket(index))
            .find(|block| block.size() >= size)
    }

    /// Iterate the members of bucket `index`, starting from its head.
    ///
    /// ### Safety
    ///
    /// The bucket's links must not be modified while the iterator is live.
    pub(crate) unsafe fn bucket(&self, index: usize) -> Bucket {
        let head = self.heads[index];
        Bucket { head, cursor: head }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }
}

/// Iterator over one bucket's ring.
pub(crate) struct Bucket {
    head: Option<Block>,
    cursor: Option<Block>,
}

impl Iterator for Bucket {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let current = self.cursor?;
        // Safety: upheld by the contract of `FreeLists::bucket`.
        let next = unsafe { current.free_next() };
        self.cursor = if Some(next) == self.head {
            None
        } else {
            Some(next)
        };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::testing::Scratch;
    use std::vec::Vec;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(bucket_index(32), 0);
        assert_eq!(bucket_index(48), 1);
        assert_eq!(bucket_index(64), 1);
        assert_eq!(bucket_index(80), 2);
        assert_eq!(bucket_index(128), 2);
        assert_eq!(bucket_index(144), 3);
        assert_eq!(bucket_index(256), 3);
        assert_eq!(bucket_index(272), 4);
        assert_eq!(bucket_index(32 << 10), 10);
        assert_eq!(bucket_index((32 << 10) + 16), 11);
        assert_eq!(bucket_index(1 << 30), NUM_BUCKETS - 1);
    }

    #[test]
    fn bucket_index_is_monotonic() {
        let mut last = 0;
        for size in (MIN_BLOCK_SIZE..(1 << 20)).step_by(16) {
            let index = bucket_index(size);
            assert!(index >= last, "bucket_index({size}) = {index} < {last}");
            assert!(index < NUM_BUCKETS);
            last = index;
        }
    }

    #[test]
    fn insert_remove_and_iterate() {
        let mut scratch = Scratch::new(1024);
        let blocks = scratch.tile(&[
            (64, false),
            (32, true),
            (48, false),
            (32, true),
            (64, false),
        ]);
        let mut lists = FreeLists::new();
        assert!(lists.is_empty());

        unsafe {
            lists.insert(blocks[0]);
            lists.insert(blocks[2]);
            lists.insert(blocks[4]);

            // All three land in bucket 1, most recent first.
            let members: Vec<_> = lists.bucket(1).collect();
            assert_eq!(members, [blocks[4], blocks[2], blocks[0]]);

            // Unlink from the middle.
            lists.remove(blocks[2]);
            let members: Vec<_> = lists.bucket(1).collect();
            assert_eq!(members, [blocks[4], blocks[0]]);

            // Unlink the head.
            lists.remove(blocks[4]);
            let members: Vec<_> = lists.bucket(1).collect();
            assert_eq!(members, [blocks[0]]);

            lists.remove(blocks[0]);
            assert!(lists.is_empty());
            assert_eq!(lists.bucket(1).count(), 0);
        }
    }

    #[test]
    fn find_fit_walks_larger_buckets() {
        let mut scratch = Scratch::new(2048);
        let blocks = scratch.tile(&[
            (32, false),
            (32, true),
            (80, false),
            (32, true),
            (112, false),
            (32, true),
            (512, false),
        ]);
        let mut lists = FreeLists::new();

        unsafe {
            lists.insert(blocks[0]);
            lists.insert(blocks[2]);
            lists.insert(blocks[4]);
            lists.insert(blocks[6]);

            assert_eq!(lists.find_fit(32), Some(blocks[0]));
            // 80 and 112 share bucket 2; 112 was pushed last so it is seen
            // first, and it fits.
            assert_eq!(lists.find_fit(96), Some(blocks[4]));
            assert_eq!(lists.find_fit(112), Some(blocks[4]));
            // Nothing in buckets 2 or 3 holds 128 bytes.
            assert_eq!(lists.find_fit(128), Some(blocks[6]));
            assert_eq!(lists.find_fit(512), Some(blocks[6]));
            assert_eq!(lists.find_fit(528), None);

            lists.remove(blocks[4]);
            assert_eq!(lists.find_fit(96), Some(blocks[6]));
            assert_eq!(lists.find_fit(80), Some(blocks[2]));
        }
    }
}
