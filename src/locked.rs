//! Sharing a [`Heap`] behind a lock, and the standard allocator interfaces.
//!
//! Because this crate is `no_std` and does not assume the presence of an
//! operating system, you must provide your own locking mechanism via the `L`
//! type parameter. See the [`Lock`] trait for details.

use crate::block::ALIGNMENT;
use crate::fatal::{Abort, FatalHandler};
use crate::region::RegionSource;
use crate::{AllocError, Allocator, Heap};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

mod mutex;
pub use mutex::{Lock, MutexGuard, SingleThreadedLock};
use mutex::Mutex;

/// A [`Heap`] behind a lock, usable as an [`Allocator`] or, with a `Sync`
/// lock, as the `#[global_allocator]`.
///
/// Layouts aligned to more than 16 bytes are refused. Zero-size allocations
/// are served with a dangling pointer and never reach the heap.
///
/// ```
/// use segheap::{Arena, Heap, LockedHeap, Panic, SingleThreadedLock};
/// use core::alloc::GlobalAlloc;
/// use core::alloc::Layout;
///
/// let mut memory = vec![0u8; 64 * 1024];
/// let heap = LockedHeap::new(
///     Heap::new(Arena::new(&mut memory), Panic),
///     SingleThreadedLock::new(),
/// );
///
/// let layout = Layout::from_size_align(48, 8).unwrap();
/// let ptr = unsafe { heap.alloc(layout) };
/// assert!(!ptr.is_null());
/// assert_eq!(heap.lock().current_payload(), 48);
/// unsafe { heap.dealloc(ptr, layout) };
/// ```
pub struct LockedHeap<S, F = Abort, L = SingleThreadedLock> {
    heap: Mutex<Heap<S, F>, L>,
}

impl<S, F, L> LockedHeap<S, F, L> {
    /// Wrap `heap`, guarding it with `lock`.
    #[inline]
    pub const fn new(heap: Heap<S, F>, lock: L) -> Self {
        LockedHeap {
            heap: Mutex::new(heap, lock),
        }
    }

    /// Unwrap the heap.
    pub fn into_inner(self) -> Heap<S, F> {
        self.heap.into_inner()
    }

    /// Get an exclusive reference to the heap without locking.
    pub fn get_mut(&mut self) -> &mut Heap<S, F> {
        self.heap.get_mut()
    }
}

impl<S, F, L> LockedHeap<S, F, L>
where
    L: Lock,
{
    /// Lock the heap for direct use, or to inspect its counters.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, Heap<S, F>, L> {
        self.heap.lock()
    }
}

/// A well-aligned, non-null pointer for a zero-size allocation.
fn dangling(layout: Layout) -> NonNull<[u8]> {
    // An alignment is never zero.
    let ptr = NonNull::new(layout.align() as *mut u8).unwrap_or(NonNull::dangling());
    NonNull::slice_from_raw_parts(ptr, 0)
}

impl<S, F, L> LockedHeap<S, F, L>
where
    S: RegionSource,
    F: FatalHandler,
    L: Lock,
{
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }
        if new_layout.size() == 0 {
            self.deallocate(ptr, old_layout);
            return Ok(dangling(new_layout));
        }
        if new_layout.align() > ALIGNMENT {
            return Err(AllocError);
        }

        match self.lock().resize(ptr, new_layout.size()) {
            Ok(Some(new)) => Ok(NonNull::slice_from_raw_parts(new, new_layout.size())),
            Ok(None) => Err(AllocError),
            Err(e) => {
                log::trace!("resize of {ptr:p} to {} failed: {e}", new_layout.size());
                Err(AllocError)
            }
        }
    }
}

unsafe impl<S, F, L> Allocator for LockedHeap<S, F, L>
where
    S: RegionSource,
    F: FatalHandler,
    L: Lock,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(dangling(layout));
        }
        if layout.align() > ALIGNMENT {
            return Err(AllocError);
        }
        match self.lock().allocate(layout.size()) {
            Ok(Some(ptr)) => Ok(NonNull::slice_from_raw_parts(ptr, layout.size())),
            Ok(None) | Err(_) => Err(AllocError),
        }
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.lock().release(ptr);
        }
    }

    #[inline]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        self.reallocate(ptr, old_layout, new_layout)
    }

    #[inline]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        self.reallocate(ptr, old_layout, new_layout)
    }
}

unsafe impl<S, F, L> GlobalAlloc for LockedHeap<S, F, L>
where
    S: RegionSource,
    F: FatalHandler,
    L: Lock,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        match self.lock().allocate(layout.size()) {
            Ok(Some(ptr)) => ptr.as_ptr(),
            Ok(None) | Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.lock().release(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        match self.lock().resize(ptr, new_size) {
            Ok(Some(new)) => new.as_ptr(),
            Ok(None) | Err(_) => ptr::null_mut(),
        }
    }
}
