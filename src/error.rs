use core::fmt;

/// Why a pointer passed to [`Heap::release`](crate::Heap::release) or
/// [`Heap::resize`](crate::Heap::resize) was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidPointer {
    /// The pointer is not inside the heap region's payload area, or the
    /// region has not been created yet.
    OutOfBounds,
    /// The pointer is not 16-byte aligned.
    Misaligned,
    /// The block is not marked allocated.
    AlreadyFree,
    /// The block is parked in the quick cache, i.e. it was already released.
    InQuickCache,
    /// The header's size is below the minimum block size or not a multiple
    /// of 16.
    BadSize,
    /// The header's size places the block's footer on or past the epilogue.
    PastEpilogue,
    /// The block's header and footer disagree.
    TagMismatch,
    /// The block lies on or before the prologue.
    BeforePrologue,
}

impl fmt::Display for InvalidPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvalidPointer::OutOfBounds => "pointer is outside the heap",
            InvalidPointer::Misaligned => "pointer is not 16-byte aligned",
            InvalidPointer::AlreadyFree => "block has already been released",
            InvalidPointer::InQuickCache => "block is in the quick cache",
            InvalidPointer::BadSize => "block size is invalid",
            InvalidPointer::PastEpilogue => "block extends past the end of the heap",
            InvalidPointer::TagMismatch => "block header and footer do not match",
            InvalidPointer::BeforePrologue => "block lies before the start of the heap",
        })
    }
}

impl core::error::Error for InvalidPointer {}

/// An error from a heap operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// The heap region could not be grown to satisfy the request.
    OutOfMemory,
    /// The pointer argument was rejected.
    InvalidPointer(InvalidPointer),
}

impl From<InvalidPointer> for HeapError {
    fn from(e: InvalidPointer) -> Self {
        HeapError::InvalidPointer(e)
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => f.write_str("out of memory"),
            HeapError::InvalidPointer(e) => write!(f, "invalid pointer: {e}"),
        }
    }
}

impl core::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            HeapError::OutOfMemory => None,
            HeapError::InvalidPointer(e) => Some(e),
        }
    }
}

/// A broken heap invariant found by
/// [`Heap::check_integrity`](crate::Heap::check_integrity).
///
/// Addresses are block header addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrityError {
    /// The prologue sentinel has been overwritten.
    Prologue,
    /// The epilogue sentinel has been overwritten, or the blocks do not end
    /// exactly at it.
    Epilogue {
        /// Where the block walk stopped.
        reached: usize,
    },
    /// A block's size is below the minimum or not a multiple of 16.
    BlockSize {
        /// The offending block.
        addr: usize,
        /// Its raw size field.
        size: usize,
    },
    /// A block's header and footer differ.
    TagMismatch {
        /// The offending block.
        addr: usize,
    },
    /// Two physically adjacent blocks are both free.
    AdjacentFree {
        /// The second of the two blocks.
        addr: usize,
    },
    /// A free block is linked into a bucket other than its size's, or a
    /// bucket links a block that is not free.
    Bucket {
        /// The offending block.
        addr: usize,
        /// The bucket it was found in.
        bucket: usize,
    },
    /// The buckets do not hold exactly the free blocks of the region.
    FreeCount {
        /// Free blocks found by walking the region.
        walked: usize,
        /// Blocks linked into the buckets.
        linked: usize,
    },
    /// A quick-cache stack holds a block of the wrong size or state.
    QuickCacheMember {
        /// The offending block.
        addr: usize,
        /// The stack it was found on.
        stack: usize,
    },
    /// A quick-cache stack's recorded length is wrong or over the bound.
    QuickCacheLength {
        /// The stack.
        stack: usize,
        /// Its recorded length.
        len: usize,
        /// Blocks actually found on it.
        found: usize,
    },
    /// The quick cache does not hold exactly the cached blocks of the region.
    QuickCacheCount {
        /// Cached blocks found by walking the region.
        walked: usize,
        /// Blocks found on the stacks.
        linked: usize,
    },
    /// `current_payload` disagrees with the allocated blocks, or exceeds
    /// `max_payload`.
    Accounting {
        /// The sum of the allocated blocks' payload lengths.
        walked: usize,
        /// The current payload counter.
        current: usize,
        /// The maximum payload counter.
        max: usize,
    },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IntegrityError::Prologue => f.write_str("prologue has been overwritten"),
            IntegrityError::Epilogue { reached } => {
                write!(f, "block walk ended at {reached:#x}, not at the epilogue")
            }
            IntegrityError::BlockSize { addr, size } => {
                write!(f, "block at {addr:#x} has invalid size {size}")
            }
            IntegrityError::TagMismatch { addr } => {
                write!(f, "block at {addr:#x} has mismatched header and footer")
            }
            IntegrityError::AdjacentFree { addr } => {
                write!(f, "free block at {addr:#x} follows another free block")
            }
            IntegrityError::Bucket { addr, bucket } => {
                write!(f, "block at {addr:#x} does not belong in bucket {bucket}")
            }
            IntegrityError::FreeCount { walked, linked } => write!(
                f,
                "{walked} free blocks in the region but {linked} in the buckets"
            ),
            IntegrityError::QuickCacheMember { addr, stack } => {
                write!(f, "block at {addr:#x} does not belong on quick stack {stack}")
            }
            IntegrityError::QuickCacheLength { stack, len, found } => write!(
                f,
                "quick stack {stack} records {len} blocks but holds {found}"
            ),
            IntegrityError::QuickCacheCount { walked, linked } => write!(
                f,
                "{walked} cached blocks in the region but {linked} on the quick stacks"
            ),
            IntegrityError::Accounting {
                walked,
                current,
                max,
            } => write!(
                f,
                "allocated payload is {walked} bytes, counters say current {current} / max {max}"
            ),
        }
    }
}

impl core::error::Error for IntegrityError {}
