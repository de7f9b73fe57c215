//! Walking the region and checking the heap's invariants.

use super::Heap;
use crate::block::{Block, Header, ALIGNMENT, MIN_BLOCK_SIZE};
use crate::error::IntegrityError;
use crate::free_list::{bucket_index, NUM_BUCKETS};
use crate::quick_cache::{QuickCache, NUM_QUICK_LISTS, QUICK_LIST_MAX};
use core::marker::PhantomData;
use core::ptr::NonNull;

/// What a block is currently used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Free and linked into the segregated free lists.
    Free,
    /// Handed out to a caller.
    Allocated {
        /// The payload length the caller asked for.
        payload_len: usize,
    },
    /// Released, but parked in the quick cache.
    QuickCached,
}

/// One block of the region, as seen by [`Heap::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    addr: NonNull<u8>,
    size: usize,
    state: BlockState,
}

impl BlockInfo {
    /// The address of the block's header.
    pub fn address(&self) -> NonNull<u8> {
        self.addr
    }

    /// The address of the block's payload.
    pub fn payload(&self) -> NonNull<u8> {
        // Safety: every block is at least `MIN_BLOCK_SIZE` bytes long.
        unsafe { Block::from_header(self.addr).payload() }
    }

    /// The block's size in bytes, tags included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The block's state.
    pub fn state(&self) -> BlockState {
        self.state
    }
}

/// Iterator over the blocks of a heap's region, in address order.
///
/// Stops early at a block whose size would take the walk out of the region.
pub struct Blocks<'a> {
    cursor: Option<Block>,
    end: usize,
    _heap: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.cursor.take()?;
        if block.addr() >= self.end {
            return None;
        }

        // Safety: `block` lies before the epilogue, and the heap is borrowed
        // for as long as this iterator lives.
        let header = unsafe { block.header() };
        let size = header.size();
        if size < MIN_BLOCK_SIZE || size > self.end - block.addr() {
            return None;
        }

        let state = match (header.is_allocated(), header.in_quick_cache()) {
            (false, _) => BlockState::Free,
            (true, true) => BlockState::QuickCached,
            (true, false) => BlockState::Allocated {
                payload_len: header.payload_len(),
            },
        };
        // Safety: checked above that this stays in the region.
        self.cursor = Some(unsafe { block.offset(size) });
        Some(BlockInfo {
            addr: block.as_non_null(),
            size,
            state,
        })
    }
}

impl<S, F> Heap<S, F> {
    /// Walk every block between the prologue and the epilogue.
    ///
    /// Empty before the first allocation.
    pub fn blocks(&self) -> Blocks<'_> {
        let bounds = self.region.bounds();
        Blocks {
            cursor: bounds.map(|b| b.first_block()),
            end: bounds.map_or(0, |b| b.epilogue().addr()),
            _heap: PhantomData,
        }
    }

    /// Check every structural invariant of the heap.
    ///
    /// This walks the whole region and every free structure, so it is meant
    /// for tests and debugging rather than hot paths.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        let Some(bounds) = self.region.bounds() else {
            return self.check_accounting(0);
        };

        // Safety: the region is initialized, so the sentinels are in bounds.
        unsafe {
            let prologue = bounds.prologue();
            let expected = Header::allocated(MIN_BLOCK_SIZE, 0);
            if prologue.header() != expected || prologue.footer() != expected {
                return Err(IntegrityError::Prologue);
            }
        }

        let epilogue = bounds.epilogue().addr();
        let mut cursor = bounds.first_block();
        let mut prev_free = false;
        let mut free_blocks = 0;
        let mut cached_blocks = 0;
        let mut allocated_payload = 0;

        while cursor.addr() < epilogue {
            let addr = cursor.addr();
            // Safety: `cursor` lies before the epilogue, and its footer is
            // checked to as well before being read.
            let header = unsafe { cursor.header() };
            let size = header.size_field();
            if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 || size > epilogue - addr {
                return Err(IntegrityError::BlockSize { addr, size });
            }
            if unsafe { cursor.footer() } != header {
                return Err(IntegrityError::TagMismatch { addr });
            }

            let free = !header.is_allocated();
            if free && prev_free {
                return Err(IntegrityError::AdjacentFree { addr });
            }
            if free {
                free_blocks += 1;
            } else if header.in_quick_cache() {
                cached_blocks += 1;
            } else {
                allocated_payload += header.payload_len();
            }

            prev_free = free;
            cursor = unsafe { cursor.offset(size) };
        }

        if cursor.addr() != epilogue
            || unsafe { cursor.header() } != Header::allocated(0, 0)
        {
            return Err(IntegrityError::Epilogue {
                reached: cursor.addr(),
            });
        }

        self.check_free_lists(free_blocks)?;
        self.check_quick_cache(cached_blocks)?;
        self.check_accounting(allocated_payload)
    }

    fn check_free_lists(&self, free_blocks: usize) -> Result<(), IntegrityError> {
        let mut linked = 0;
        for bucket in 0..NUM_BUCKETS {
            // Bound the walk so that a corrupted ring cannot loop forever.
            // Safety: `&self` keeps the lists unmodified.
            for block in unsafe { self.free_lists.bucket(bucket) }.take(free_blocks + 1) {
                let header = unsafe { block.header() };
                if header.is_allocated() || bucket_index(header.size()) != bucket {
                    return Err(IntegrityError::Bucket {
                        addr: block.addr(),
                        bucket,
                    });
                }
                linked += 1;
            }
        }
        if linked != free_blocks {
            return Err(IntegrityError::FreeCount {
                walked: free_blocks,
                linked,
            });
        }
        Ok(())
    }

    fn check_quick_cache(&self, cached_blocks: usize) -> Result<(), IntegrityError> {
        let mut linked = 0;
        for stack in 0..NUM_QUICK_LISTS {
            let len = self.quick_cache.len(stack);
            let mut found = 0;
            // Safety: `&self` keeps the stacks unmodified.
            for block in unsafe { self.quick_cache.members(stack) }.take(QUICK_LIST_MAX + 1) {
                let header = unsafe { block.header() };
                if !header.is_allocated()
                    || !header.in_quick_cache()
                    || header.size() != QuickCache::size_of_class(stack)
                {
                    return Err(IntegrityError::QuickCacheMember {
                        addr: block.addr(),
                        stack,
                    });
                }
                found += 1;
            }
            if found != len || len > QUICK_LIST_MAX {
                return Err(IntegrityError::QuickCacheLength { stack, len, found });
            }
            linked += found;
        }
        if linked != cached_blocks {
            return Err(IntegrityError::QuickCacheCount {
                walked: cached_blocks,
                linked,
            });
        }
        Ok(())
    }

    fn check_accounting(&self, allocated_payload: usize) -> Result<(), IntegrityError> {
        if allocated_payload != self.current_payload || self.current_payload > self.max_payload {
            return Err(IntegrityError::Accounting {
                walked: allocated_payload,
                current: self.current_payload,
                max: self.max_payload,
            });
        }
        Ok(())
    }
}
