//! Boundary-tag coalescing.

use crate::block::{Block, Header};
use crate::free_list::FreeLists;

/// Merge the free `block` with whichever of its physical neighbors are free.
///
/// Free neighbors are unlinked from `lists` before merging. Blocks parked in
/// the quick cache carry the allocated flag and are never merged. The returned
/// block (which starts at the predecessor when that was merged) is not linked
/// into any bucket.
///
/// ### Safety
///
/// `block` must be tagged free and not linked into any bucket, it must lie
/// between the region's allocated prologue and epilogue, and every free
/// neighbor must be a member of `lists`.
pub(crate) unsafe fn coalesce(lists: &mut FreeLists, block: Block) -> Block {
    debug_assert!(!block.header().is_allocated());

    let prev_free = !block.prev_footer().is_allocated();
    let next = block.next_physical();
    let next_free = !next.header().is_allocated();

    let (start, size) = match (prev_free, next_free) {
        (false, false) => return block,
        (false, true) => {
            lists.remove(next);
            (block, block.size() + next.size())
        }
        (true, false) => {
            let prev = block.prev_physical();
            lists.remove(prev);
            (prev, prev.size() + block.size())
        }
        (true, true) => {
            let prev = block.prev_physical();
            lists.remove(prev);
            lists.remove(next);
            (prev, prev.size() + block.size() + next.size())
        }
    };

    start.set_tags(Header::free(size));
    start
}
