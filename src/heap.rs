//! The allocator core.
//!
//! Allocation tries, in order:
//!
//! 1. The quick cache, for an exact-size hit in O(1).
//! 2. The segregated free lists, first fit from the request's size class
//!    upwards.
//! 3. Growing the region.
//!
//! A block found in step 2 or 3 is split when the leftover would itself be a
//! valid block; the leftover goes back into the free lists.
//!
//! Release parks small blocks in the quick cache and coalesces everything
//! else into the free lists straight away. Every pointer handed to release or
//! resize is validated against the region bounds and the block's boundary tags
//! before anything is modified.

use crate::block::{block_size_for, Block, Header, ALIGNMENT, MIN_BLOCK_SIZE, WORD_SIZE};
use crate::coalesce::coalesce;
use crate::error::{HeapError, InvalidPointer};
use crate::fatal::{Abort, FatalHandler};
use crate::free_list::FreeLists;
use crate::quick_cache::QuickCache;
use crate::region::{Region, RegionSource};
use core::fmt;
use core::ptr::{self, NonNull};

mod check;
pub use check::{BlockInfo, BlockState, Blocks};

/// A heap allocator managing one contiguous, growable region.
///
/// The region is obtained from `S` lazily, on the first allocation, and never
/// shrinks. Releasing a pointer that fails validation invokes `F`.
///
/// A `Heap` is not internally synchronized; wrap it in a
/// [`LockedHeap`](crate::LockedHeap) to share it.
pub struct Heap<S, F = Abort> {
    region: Region<S>,
    free_lists: FreeLists,
    quick_cache: QuickCache,
    current_payload: usize,
    max_payload: usize,
    fatal: F,
}

// Safety: the heap exclusively owns its region and every block in it.
unsafe impl<S: Send, F: Send> Send for Heap<S, F> {}

impl<S> Heap<S, Abort> {
    /// Create a heap over `source` that aborts on an invalid release.
    ///
    /// ```
    /// use segheap::{Arena, Heap};
    ///
    /// let mut memory = vec![0u8; 8192];
    /// let mut heap = Heap::with_source(Arena::new(&mut memory));
    /// let ptr = heap.allocate(10).unwrap().unwrap();
    /// assert_eq!(heap.payload_len(ptr), Ok(10));
    /// unsafe { heap.release(ptr) };
    /// assert_eq!(heap.current_payload(), 0);
    /// ```
    pub const fn with_source(source: S) -> Self {
        Heap::new(source, Abort)
    }
}

impl<S, F> Heap<S, F> {
    /// Create a heap over `source`, with `fatal` handling invalid releases.
    ///
    /// No memory is requested from `source` until the first allocation.
    pub const fn new(source: S, fatal: F) -> Self {
        Heap {
            region: Region::new(source),
            free_lists: FreeLists::new(),
            quick_cache: QuickCache::new(),
            current_payload: 0,
            max_payload: 0,
            fatal,
        }
    }

    /// Total payload bytes currently allocated.
    pub fn current_payload(&self) -> usize {
        self.current_payload
    }

    /// The highest value [`current_payload`](Heap::current_payload) has
    /// reached.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// The region's current length in bytes, sentinels included. Zero before
    /// the first allocation.
    pub fn region_len(&self) -> usize {
        self.region.bounds().map_or(0, |b| b.len())
    }

    /// The region source.
    ///
    /// ```
    /// use segheap::{Arena, Heap, Panic};
    ///
    /// let mut memory = vec![0u8; 8192];
    /// let mut heap = Heap::new(Arena::new(&mut memory), Panic);
    /// let untouched = heap.source().remaining();
    ///
    /// heap.allocate(10).unwrap();
    /// assert_eq!(heap.source().remaining(), untouched - heap.region_len());
    /// ```
    pub fn source(&self) -> &S {
        self.region.source()
    }

    fn record_allocation(&mut self, payload_len: usize) {
        self.current_payload += payload_len;
        self.max_payload = self.max_payload.max(self.current_payload);
    }

    /// Check `ptr` against the region bounds and its block's tags, returning
    /// the block on success. Reads memory but never writes it.
    fn validate_block(&self, ptr: NonNull<u8>) -> Result<Block, InvalidPointer> {
        let bounds = self.region.bounds().ok_or(InvalidPointer::OutOfBounds)?;
        let addr = ptr.as_ptr() as usize;
        let epilogue = bounds.epilogue().addr();

        // Safety: every region holds at least the first block's header.
        let first_payload = unsafe { bounds.first_block().payload() }.as_ptr() as usize;
        if addr < first_payload || addr >= epilogue {
            return Err(InvalidPointer::OutOfBounds);
        }
        if addr % ALIGNMENT != 0 {
            return Err(InvalidPointer::Misaligned);
        }

        // Safety: `ptr` is at or past the first payload, so its header word is
        // inside the region.
        let block = unsafe { Block::from_payload(ptr) };
        let header = unsafe { block.header() };
        if !header.is_allocated() {
            return Err(InvalidPointer::AlreadyFree);
        }
        if header.in_quick_cache() {
            return Err(InvalidPointer::InQuickCache);
        }

        let size = header.size_field();
        if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
            return Err(InvalidPointer::BadSize);
        }
        match block.addr().checked_add(size - WORD_SIZE) {
            Some(footer) if footer < epilogue => {}
            _ => return Err(InvalidPointer::PastEpilogue),
        }
        // Safety: the footer was just checked to lie before the epilogue.
        if unsafe { block.footer() } != header {
            return Err(InvalidPointer::TagMismatch);
        }
        if block.addr() <= bounds.prologue().addr() {
            return Err(InvalidPointer::BeforePrologue);
        }
        Ok(block)
    }

    /// Check whether `ptr` is a live allocation of this heap that could be
    /// released or resized.
    pub fn validate(&self, ptr: NonNull<u8>) -> Result<(), InvalidPointer> {
        self.validate_block(ptr).map(|_| ())
    }

    /// The payload length recorded for the live allocation at `ptr`.
    pub fn payload_len(&self, ptr: NonNull<u8>) -> Result<usize, InvalidPointer> {
        let block = self.validate_block(ptr)?;
        // Safety: validated.
        Ok(unsafe { block.header() }.payload_len())
    }

    /// The size of the block backing the live allocation at `ptr`, tags
    /// included.
    pub fn block_size(&self, ptr: NonNull<u8>) -> Result<usize, InvalidPointer> {
        let block = self.validate_block(ptr)?;
        // Safety: validated.
        Ok(unsafe { block.size() })
    }

    /// Stamp `block` as holding `payload_len` bytes in a block of
    /// `block_size`, splitting off the tail as a new free block when it is
    /// large enough to stand alone.
    ///
    /// ### Safety
    ///
    /// `block` must not be linked into any free list or the quick cache, and
    /// must be at least `block_size` bytes.
    unsafe fn place(&mut self, block: Block, block_size: usize, payload_len: usize) {
        let total = block.size();
        debug_assert!(total >= block_size);

        if total - block_size >= MIN_BLOCK_SIZE {
            block.set_tags(Header::allocated(block_size, payload_len));
            let rest = block.offset(block_size);
            rest.set_tags(Header::free(total - block_size));
            self.free_lists.insert(rest);
        } else {
            block.set_tags(Header::allocated(total, payload_len));
        }
    }

    /// Return a validated, allocated block to the free structures.
    unsafe fn free_block(&mut self, block: Block) {
        let header = block.header();
        self.current_payload -= header.payload_len();

        let size = header.size();
        if QuickCache::index(size).is_some() {
            self.quick_cache.put(block, &mut self.free_lists);
        } else {
            block.set_tags(Header::free(size));
            let merged = coalesce(&mut self.free_lists, block);
            self.free_lists.insert(merged);
        }
    }
}

impl<S, F> Heap<S, F>
where
    S: RegionSource,
    F: FatalHandler,
{
    /// Allocate `size` bytes.
    ///
    /// Returns `Ok(None)` for a zero-size request. The returned pointer is
    /// 16-byte aligned and valid for `size` bytes until it is released.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
        if size == 0 {
            return Ok(None);
        }
        self.allocate_nonzero(size).map(Some)
    }

    fn allocate_nonzero(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        debug_assert_ne!(size, 0);
        let block_size = block_size_for(size).ok_or(HeapError::OutOfMemory)?;
        self.region.ensure_init(&mut self.free_lists)?;

        // Safety: every block handed out by the free structures or the region
        // lies inside the region and is not linked anywhere once removed.
        let block = unsafe {
            if let Some(block) = self.quick_cache.try_take(block_size) {
                block.set_tags(Header::allocated(block_size, size));
                block
            } else {
                let block = match self.free_lists.find_fit(block_size) {
                    Some(block) => block,
                    None => self.grow_for(block_size)?,
                };
                self.free_lists.remove(block);
                self.place(block, block_size, size);
                block
            }
        };

        self.record_allocation(size);
        // Safety: `block` is a block header inside the region.
        Ok(unsafe { block.payload() })
    }

    /// Grow the region until its trailing free block holds `block_size`
    /// bytes. The returned block is still linked into the free lists.
    fn grow_for(&mut self, block_size: usize) -> Result<Block, HeapError> {
        loop {
            let block = self.region.grow(&mut self.free_lists, block_size)?;
            // Safety: just tagged by the grower.
            if unsafe { block.size() } >= block_size {
                return Ok(block);
            }
        }
    }

    /// Release the allocation at `ptr`.
    ///
    /// If `ptr` fails validation (it was never allocated here, was already
    /// released, or its block's tags have been overwritten) the heap's
    /// [`FatalHandler`] is invoked before anything is modified.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call. Validation catches most misuse
    /// but cannot tell a stale pointer from a live one once its block has been
    /// handed out again.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        match self.validate_block(ptr) {
            Ok(block) => self.free_block(block),
            Err(reason) => self.fatal.invalid_release(ptr, reason),
        }
    }

    /// Resize the allocation at `ptr` to `size` bytes.
    ///
    /// * A `size` of zero releases the allocation and returns `Ok(None)`.
    /// * Shrinking happens in place; a large enough tail is split off and
    ///   freed.
    /// * Growing allocates a new block, copies the old payload over, and
    ///   releases the old block. On failure the old allocation is untouched.
    ///
    /// An invalid `ptr` is reported as [`HeapError::InvalidPointer`] rather
    /// than being fatal.
    ///
    /// # Safety
    ///
    /// On success the old pointer must no longer be used (unless it was
    /// returned again). The same caveat about stale pointers as for
    /// [`release`](Heap::release) applies.
    pub unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let block = self.validate_block(ptr)?;
        if size == 0 {
            self.free_block(block);
            return Ok(None);
        }

        let header = block.header();
        let payload_len = header.payload_len();
        if size == payload_len {
            return Ok(Some(ptr));
        }

        if size > payload_len {
            // The old and new payloads are only both live for the copy below;
            // don't let that count towards the high-water mark.
            let high_water = self.max_payload;
            let new = self.allocate_nonzero(size)?;
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), payload_len);
            self.free_block(block);
            self.max_payload = high_water.max(self.current_payload);
            return Ok(Some(new));
        }

        let total = header.size();
        let block_size = block_size_for(size).ok_or(HeapError::OutOfMemory)?;
        debug_assert!(block_size <= total);
        self.current_payload -= payload_len - size;

        if total - block_size < MIN_BLOCK_SIZE {
            block.set_tags(Header::allocated(total, size));
        } else {
            block.set_tags(Header::allocated(block_size, size));
            let rest = block.offset(block_size);
            rest.set_tags(Header::free(total - block_size));
            let merged = coalesce(&mut self.free_lists, rest);
            self.free_lists.insert(merged);
        }
        Ok(Some(ptr))
    }
}

impl<S, F> fmt::Debug for Heap<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("region", &self.region.bounds())
            .field("current_payload", &self.current_payload)
            .field("max_payload", &self.max_payload)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
