//! The in-memory encoding of a heap block.
//!
//! Every block starts with an 8-byte header and ends with an 8-byte footer
//! that mirrors it:
//!
//! ```text
//!   63            32 31                 4   3   2   1   0
//!  +----------------+--------------------+---+---+---+---+
//!  |  payload len   |   block size / 16  | 0 | 0 | Q | A |
//!  +----------------+--------------------+---+---+---+---+
//! ```
//!
//! * `A` is set while the block is allocated (or parked in the quick cache).
//! * `Q` is set while the block is parked in the quick cache.
//! * The block size is always a multiple of 16, so its low four bits are free
//!   to carry the flags above.
//! * The payload length is only meaningful while the block is allocated.
//!
//! The body between the tags holds the user's payload, a pair of free-list
//! links, or a single quick-cache link, depending on the block's state. All of
//! the offset arithmetic for these lives in this module.

use core::ptr::NonNull;

/// The alignment of every payload pointer and every block size.
pub const ALIGNMENT: usize = 16;

/// The size of a header or footer word.
pub(crate) const WORD_SIZE: usize = 8;

/// The smallest block: header, two free-list links, and footer.
pub const MIN_BLOCK_SIZE: usize = 32;

/// The granularity at which the heap region is grown.
pub const PAGE_SIZE: usize = 4096;

/// Bytes of every block taken up by its header and footer.
pub(crate) const TAG_OVERHEAD: usize = 2 * WORD_SIZE;

const ALLOCATED: u64 = 0x1;
const IN_QUICK_CACHE: u64 = 0x2;
const FLAG_MASK: u64 = ALLOCATED | IN_QUICK_CACHE;
const SIZE_MASK: u64 = 0xFFFF_FFF0;
const SIZE_FIELD_MASK: u64 = 0xFFFF_FFFF & !FLAG_MASK;
const PAYLOAD_SHIFT: u32 = 32;

/// The largest block size the header's size field can represent.
pub(crate) const MAX_BLOCK_SIZE: usize = SIZE_MASK as usize;

/// Round `n` up to the next multiple of [`ALIGNMENT`], but never below
/// [`MIN_BLOCK_SIZE`].
///
/// Returns `None` on overflow.
///
/// ```
/// assert_eq!(segheap::round_to_alignment(1), Some(32));
/// assert_eq!(segheap::round_to_alignment(33), Some(48));
/// assert_eq!(segheap::round_to_alignment(64), Some(64));
/// ```
#[inline]
pub const fn round_to_alignment(n: usize) -> Option<usize> {
    match n.checked_next_multiple_of(ALIGNMENT) {
        Some(rounded) if rounded < MIN_BLOCK_SIZE => Some(MIN_BLOCK_SIZE),
        rounded => rounded,
    }
}

/// The block size needed to hold a payload of `payload` bytes, or `None` if
/// it cannot be encoded in a header.
#[inline]
pub(crate) fn block_size_for(payload: usize) -> Option<usize> {
    let size = round_to_alignment(payload.checked_add(TAG_OVERHEAD)?)?;
    (size <= MAX_BLOCK_SIZE).then_some(size)
}

/// A header or footer word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Header(u64);

impl Header {
    #[inline]
    pub(crate) const fn free(size: usize) -> Self {
        debug_assert!(size % ALIGNMENT == 0);
        Header(size as u64)
    }

    #[inline]
    pub(crate) const fn allocated(size: usize, payload_len: usize) -> Self {
        debug_assert!(size % ALIGNMENT == 0);
        debug_assert!(payload_len <= u32::MAX as usize);
        Header(((payload_len as u64) << PAYLOAD_SHIFT) | size as u64 | ALLOCATED)
    }

    /// The block's size in bytes, with the flag bits masked off.
    #[inline]
    pub(crate) const fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    /// The raw size field, including the two spare bits below the flags.
    ///
    /// Only differs from `size` in a corrupted header.
    #[inline]
    pub(crate) const fn size_field(self) -> usize {
        (self.0 & SIZE_FIELD_MASK) as usize
    }

    #[inline]
    pub(crate) const fn payload_len(self) -> usize {
        (self.0 >> PAYLOAD_SHIFT) as usize
    }

    #[inline]
    pub(crate) const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    #[inline]
    pub(crate) const fn in_quick_cache(self) -> bool {
        self.0 & IN_QUICK_CACHE != 0
    }

    #[inline]
    pub(crate) const fn with_quick_cache(self) -> Self {
        Header(self.0 | IN_QUICK_CACHE)
    }

    #[inline]
    pub(crate) const fn without_quick_cache(self) -> Self {
        Header(self.0 & !IN_QUICK_CACHE)
    }
}

/// A pointer to the header of a block inside the heap region.
///
/// `Block` is a plain address: it is `Copy` and carries no lifetime. Every
/// accessor is `unsafe` because it dereferences the region's memory; callers
/// must ensure the address is a block header inside a live region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block(NonNull<u8>);

const LINK_NEXT: usize = WORD_SIZE;
const LINK_PREV: usize = 2 * WORD_SIZE;

impl Block {
    #[inline]
    pub(crate) const fn from_header(header: NonNull<u8>) -> Self {
        Block(header)
    }

    /// ### Safety
    ///
    /// `payload` must point at least one word past the start of the region.
    #[inline]
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Block(payload.sub(WORD_SIZE))
    }

    #[inline]
    pub(crate) fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) unsafe fn payload(self) -> NonNull<u8> {
        self.0.add(WORD_SIZE)
    }

    /// The block starting `offset` bytes past this one.
    #[inline]
    pub(crate) unsafe fn offset(self, offset: usize) -> Block {
        Block(self.0.add(offset))
    }

    #[inline]
    pub(crate) unsafe fn header(self) -> Header {
        self.0.as_ptr().cast::<Header>().read()
    }

    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        self.header().size()
    }

    #[inline]
    pub(crate) unsafe fn footer_addr(self) -> NonNull<u8> {
        self.0.add(self.size() - WORD_SIZE)
    }

    #[inline]
    pub(crate) unsafe fn footer(self) -> Header {
        self.footer_addr().as_ptr().cast::<Header>().read()
    }

    /// Write only the header word. Used for the zero-size epilogue, which has
    /// no footer.
    #[inline]
    pub(crate) unsafe fn set_header(self, header: Header) {
        self.0.as_ptr().cast::<Header>().write(header);
    }

    /// Write `header` at both ends of the block it describes.
    #[inline]
    pub(crate) unsafe fn set_tags(self, header: Header) {
        debug_assert!(header.size() >= MIN_BLOCK_SIZE);
        self.set_header(header);
        self.0
            .add(header.size() - WORD_SIZE)
            .as_ptr()
            .cast::<Header>()
            .write(header);
    }

    /// The physically following block.
    #[inline]
    pub(crate) unsafe fn next_physical(self) -> Block {
        self.offset(self.size())
    }

    /// The footer of the physically preceding block.
    #[inline]
    pub(crate) unsafe fn prev_footer(self) -> Header {
        self.0.sub(WORD_SIZE).as_ptr().cast::<Header>().read()
    }

    /// The physically preceding block, located through its footer.
    #[inline]
    pub(crate) unsafe fn prev_physical(self) -> Block {
        Block(self.0.sub(self.prev_footer().size()))
    }

    #[inline]
    unsafe fn link(self, offset: usize) -> *mut u8 {
        self.0.add(offset).as_ptr().cast::<*mut u8>().read()
    }

    #[inline]
    unsafe fn set_link(self, offset: usize, to: *mut u8) {
        self.0.add(offset).as_ptr().cast::<*mut u8>().write(to);
    }

    /// The next block in this block's free-list bucket.
    ///
    /// ### Safety
    ///
    /// The block must currently be linked into a bucket; bucket lists are
    /// circular, so the link is never null.
    #[inline]
    pub(crate) unsafe fn free_next(self) -> Block {
        Block(NonNull::new_unchecked(self.link(LINK_NEXT)))
    }

    /// The previous block in this block's free-list bucket.
    ///
    /// ### Safety
    ///
    /// Same as [`Block::free_next`].
    #[inline]
    pub(crate) unsafe fn free_prev(self) -> Block {
        Block(NonNull::new_unchecked(self.link(LINK_PREV)))
    }

    #[inline]
    pub(crate) unsafe fn set_free_next(self, next: Block) {
        self.set_link(LINK_NEXT, next.0.as_ptr());
    }

    #[inline]
    pub(crate) unsafe fn set_free_prev(self, prev: Block) {
        self.set_link(LINK_PREV, prev.0.as_ptr());
    }

    #[inline]
    pub(crate) unsafe fn clear_free_links(self) {
        self.set_link(LINK_NEXT, core::ptr::null_mut());
        self.set_link(LINK_PREV, core::ptr::null_mut());
    }

    /// The block below this one on its quick-cache stack.
    #[inline]
    pub(crate) unsafe fn quick_next(self) -> Option<Block> {
        NonNull::new(self.link(LINK_NEXT)).map(Block)
    }

    #[inline]
    pub(crate) unsafe fn set_quick_next(self, next: Option<Block>) {
        let next = next.map_or(core::ptr::null_mut(), |b| b.0.as_ptr());
        self.set_link(LINK_NEXT, next);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Scratch;
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_to_alignment(0), Some(MIN_BLOCK_SIZE));
        assert_eq!(round_to_alignment(17), Some(32));
        assert_eq!(round_to_alignment(32), Some(32));
        assert_eq!(round_to_alignment(33), Some(48));
        assert_eq!(round_to_alignment(usize::MAX), None);

        for n in 0..1000 {
            let rounded = round_to_alignment(n).unwrap();
            assert_eq!(rounded % ALIGNMENT, 0);
            assert!(rounded >= MIN_BLOCK_SIZE);
            assert!(rounded >= n);
            assert!(rounded - n < ALIGNMENT || n < MIN_BLOCK_SIZE);
        }
    }

    #[test]
    fn block_sizes_include_tags() {
        assert_eq!(block_size_for(1), Some(32));
        assert_eq!(block_size_for(16), Some(32));
        assert_eq!(block_size_for(17), Some(48));
        assert_eq!(block_size_for(100), Some(128));
        assert_eq!(block_size_for(16284), Some(16304));
        assert_eq!(block_size_for(MAX_BLOCK_SIZE), None);
        assert_eq!(block_size_for(usize::MAX), None);

        for n in 1..2000 {
            let size = block_size_for(n).unwrap();
            assert!(size - TAG_OVERHEAD >= n);
        }
    }

    #[test]
    fn header_packing() {
        let h = Header::allocated(4048, 4000);
        assert!(h.is_allocated());
        assert!(!h.in_quick_cache());
        assert_eq!(h.size(), 4048);
        assert_eq!(h.payload_len(), 4000);

        let q = h.with_quick_cache();
        assert!(q.in_quick_cache());
        assert!(q.is_allocated());
        assert_eq!(q.size(), 4048);
        assert_eq!(q.without_quick_cache(), h);

        let f = Header::free(MAX_BLOCK_SIZE);
        assert!(!f.is_allocated());
        assert_eq!(f.size(), MAX_BLOCK_SIZE);
        assert_eq!(f.payload_len(), 0);

        let big = Header::allocated(64, u32::MAX as usize);
        assert_eq!(big.payload_len(), u32::MAX as usize);
        assert_eq!(big.size(), 64);
    }

    #[test]
    fn boundary_tags_locate_neighbors() {
        let mut scratch = Scratch::new(512);
        let blocks = scratch.tile(&[(64, true), (32, false), (128, true)]);

        unsafe {
            for &b in &blocks {
                assert_eq!(b.header(), b.footer());
            }
            assert_eq!(blocks[0].next_physical(), blocks[1]);
            assert_eq!(blocks[1].next_physical(), blocks[2]);
            assert_eq!(blocks[2].prev_physical(), blocks[1]);
            assert_eq!(blocks[1].prev_physical(), blocks[0]);
            assert!(!blocks[2].prev_footer().is_allocated());
            assert!(blocks[0].prev_footer().is_allocated());

            let end = blocks[2].next_physical();
            assert!(end.header().is_allocated());
            assert_eq!(end.size(), 0);

            let payload = blocks[0].payload();
            assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);
            assert_eq!(Block::from_payload(payload), blocks[0]);
        }
    }

    #[test]
    fn links_share_the_body() {
        let mut scratch = Scratch::new(256);
        let blocks = scratch.tile(&[(32, false), (32, false)]);
        let (a, b) = (blocks[0], blocks[1]);

        unsafe {
            a.set_free_next(b);
            a.set_free_prev(b);
            assert_eq!(a.free_next(), b);
            assert_eq!(a.free_prev(), b);
            assert_eq!(a.quick_next(), Some(b));

            a.set_quick_next(None);
            assert_eq!(a.quick_next(), None);

            // Tags are untouched by link writes.
            assert_eq!(a.header(), a.footer());
            a.clear_free_links();
            assert_eq!(a.header(), a.footer());
        }
    }
}
