//! The heap region and the host primitive that grows it.
//!
//! ```text
//!  base                                                             end
//!   | pad |  prologue (32) | block | block | ... | block | epilogue |
//!   |  8  | hdr ...... ftr |                             |   hdr 8  |
//! ```
//!
//! The prologue is an allocated block that is never released and the
//! epilogue is a zero-size allocated header, so every real block has
//! allocated-looking neighbors at the ends of the region and the coalescer
//! never needs a bounds check. Growing the region turns the old epilogue into
//! the header of a new free block and writes a fresh epilogue at the new end.

use crate::block::{Block, Header, ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, PAGE_SIZE, WORD_SIZE};
use crate::coalesce::coalesce;
use crate::error::HeapError;
use crate::free_list::FreeLists;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// The host capability that extends the heap's address range.
///
/// # Safety
///
/// Implementations must uphold the following:
///
/// * The first successful call returns a 16-byte aligned address.
///
/// * Each later successful call returns the end of the range handed out so
///   far, so that all returned memory forms one contiguous range. (The heap
///   checks this and treats a discontiguous result as exhaustion, leaking it.)
///
/// * Returned memory is valid for reads and writes, and is not accessed by
///   anything else, for as long as the implementation is alive.
pub unsafe trait RegionSource {
    /// Extend the range by exactly `bytes` bytes and return the start of the
    /// new memory, or `None` if the range cannot grow.
    fn extend_region(&mut self, bytes: usize) -> Option<NonNull<u8>>;
}

/// A fixed-capacity [`RegionSource`] carved out of a borrowed byte slice.
///
/// The start of the slice is rounded up to 16 bytes; the rest is handed out
/// in order until it runs out.
#[derive(Debug)]
pub struct Arena<'a> {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
    _memory: PhantomData<&'a mut [u8]>,
}

// Safety: an `Arena` is the exclusive owner of the borrowed slice.
unsafe impl Send for Arena<'_> {}

impl<'a> Arena<'a> {
    /// Create an arena over `memory`.
    pub fn new(memory: &'a mut [u8]) -> Self {
        let offset = memory.as_ptr().align_offset(ALIGNMENT).min(memory.len());
        let capacity = memory.len() - offset;
        // Safety: `offset <= memory.len()`, so this stays within (or one past
        // the end of) the slice.
        let base = unsafe { NonNull::new_unchecked(memory.as_mut_ptr().add(offset)) };
        Arena {
            base,
            capacity,
            used: 0,
            _memory: PhantomData,
        }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

unsafe impl RegionSource for Arena<'_> {
    fn extend_region(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes > self.remaining() {
            return None;
        }
        // Safety: `used + bytes <= capacity`.
        let start = unsafe { self.base.add(self.used) };
        self.used += bytes;
        Some(start)
    }
}

/// A [`RegionSource`] backed by the process's data segment, grown with
/// `sbrk(2)`.
///
/// Only one heap should use `Sbrk` at a time, and nothing else in the process
/// should move the program break while it does, otherwise growth will fail.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct Sbrk {
    aligned: bool,
}

#[cfg(unix)]
impl Sbrk {
    /// Create a new `Sbrk` source.
    pub const fn new() -> Self {
        Sbrk { aligned: false }
    }
}

#[cfg(unix)]
unsafe impl RegionSource for Sbrk {
    fn extend_region(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        const FAILED: *mut libc::c_void = usize::MAX as *mut libc::c_void;

        let increment = libc::intptr_t::try_from(bytes).ok()?;
        unsafe {
            if !self.aligned {
                let brk = libc::sbrk(0);
                if brk == FAILED {
                    return None;
                }
                let pad = brk.cast::<u8>().align_offset(ALIGNMENT);
                if pad != 0 && libc::sbrk(pad as libc::intptr_t) == FAILED {
                    return None;
                }
                self.aligned = true;
            }
            let start = libc::sbrk(increment);
            if start == FAILED {
                return None;
            }
            NonNull::new(start.cast())
        }
    }
}

/// Bytes of the initial page taken by the pad, prologue and epilogue.
const SENTINEL_OVERHEAD: usize = WORD_SIZE + MIN_BLOCK_SIZE + WORD_SIZE;

/// The region may not grow past this many bytes, so that any free block in
/// it fits in a header's size field.
const MAX_REGION_LEN: usize = MAX_BLOCK_SIZE - MAX_BLOCK_SIZE % PAGE_SIZE;

/// The current extent of an initialized region.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Bounds {
    base: NonNull<u8>,
    end: NonNull<u8>,
}

impl Bounds {
    pub(crate) fn len(self) -> usize {
        self.end.as_ptr() as usize - self.base.as_ptr() as usize
    }

    pub(crate) fn prologue(self) -> Block {
        // Safety: every region is at least a page long.
        Block::from_header(unsafe { self.base.add(WORD_SIZE) })
    }

    pub(crate) fn first_block(self) -> Block {
        // Safety: as above.
        Block::from_header(unsafe { self.base.add(WORD_SIZE + MIN_BLOCK_SIZE) })
    }

    pub(crate) fn epilogue(self) -> Block {
        // Safety: as above.
        Block::from_header(unsafe { self.end.sub(WORD_SIZE) })
    }
}

/// The heap region: its source and, once created, its bounds.
#[derive(Debug)]
pub(crate) struct Region<S> {
    source: S,
    bounds: Option<Bounds>,
}

impl<S> Region<S> {
    pub(crate) const fn new(source: S) -> Self {
        Region {
            source,
            bounds: None,
        }
    }

    pub(crate) fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub(crate) fn source(&self) -> &S {
        &self.source
    }
}

impl<S: RegionSource> Region<S> {
    /// Create the region on first use: one page holding the sentinels and a
    /// single free block, which is linked into `lists`.
    pub(crate) fn ensure_init(&mut self, lists: &mut FreeLists) -> Result<Bounds, HeapError> {
        if let Some(bounds) = self.bounds {
            return Ok(bounds);
        }

        let base = self
            .source
            .extend_region(PAGE_SIZE)
            .ok_or(HeapError::OutOfMemory)?;
        if base.as_ptr() as usize % ALIGNMENT != 0 {
            log::warn!("region source returned misaligned base {base:p}");
            return Err(HeapError::OutOfMemory);
        }

        // Safety: the source handed us `PAGE_SIZE` bytes at `base`.
        let bounds = Bounds {
            base,
            end: unsafe { base.add(PAGE_SIZE) },
        };
        let first = bounds.first_block();
        unsafe {
            bounds
                .prologue()
                .set_tags(Header::allocated(MIN_BLOCK_SIZE, 0));
            bounds.epilogue().set_header(Header::allocated(0, 0));
            first.set_tags(Header::free(PAGE_SIZE - SENTINEL_OVERHEAD));
            lists.insert(first);
        }
        self.bounds = Some(bounds);

        log::debug!(
            "created heap region at {base:p} with a {} byte free block",
            PAGE_SIZE - SENTINEL_OVERHEAD
        );
        Ok(bounds)
    }

    /// Grow the region by `min_size` rounded up to whole pages.
    ///
    /// The new space becomes a free block starting at the old epilogue,
    /// coalesced with the region's last block if that was free, and linked
    /// into `lists`. Returns that block.
    pub(crate) fn grow(
        &mut self,
        lists: &mut FreeLists,
        min_size: usize,
    ) -> Result<Block, HeapError> {
        let bounds = self.ensure_init(lists)?;

        let increment = min_size
            .checked_next_multiple_of(PAGE_SIZE)
            .filter(|&inc| inc != 0 && inc <= MAX_REGION_LEN - bounds.len())
            .ok_or(HeapError::OutOfMemory)?;

        let start = self
            .source
            .extend_region(increment)
            .ok_or(HeapError::OutOfMemory)?;
        if start != bounds.end {
            log::warn!(
                "region source returned {start:p}, not contiguous with the heap end {:p}",
                bounds.end
            );
            return Err(HeapError::OutOfMemory);
        }

        let block = bounds.epilogue();
        // Safety: the source extended the region by `increment` bytes past
        // `bounds.end`.
        let grown = Bounds {
            base: bounds.base,
            end: unsafe { bounds.end.add(increment) },
        };
        let merged = unsafe {
            block.set_tags(Header::free(increment));
            grown.epilogue().set_header(Header::allocated(0, 0));
            let merged = coalesce(lists, block);
            lists.insert(merged);
            merged
        };
        self.bounds = Some(grown);

        log::debug!(
            "grew heap region by {increment} bytes to {}; free block at {:p} is {} bytes",
            grown.len(),
            merged.as_non_null(),
            // Safety: `merged` was just tagged.
            unsafe { merged.size() }
        );
        Ok(merged)
    }
}
