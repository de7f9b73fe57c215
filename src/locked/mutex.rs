//! The lock that [`LockedHeap`](crate::LockedHeap) keeps its [`Heap`](crate::Heap)
//! behind. Every allocator entry point takes it for the duration of one heap
//! operation, so the free lists, quick cache and payload counters are never
//! seen half-updated.

use core::{
    cell::{Cell, UnsafeCell},
    fmt,
    ops::{Deref, DerefMut},
};

/// Serializes access to the heap inside a [`LockedHeap`](crate::LockedHeap).
///
/// A heap operation relinks free blocks in place, so a second operation that
/// starts before the first has finished corrupts the region.
///
/// # Safety
///
/// * A `Sync` lock makes the `LockedHeap` `Sync`. `lock` must then block other
///   threads until `unlock` is called.
///
/// * `lock` must never succeed while the lock is held, even on the thread that
///   holds it. A global allocator is re-entered whenever code running under
///   the lock allocates, and that call has to panic, abort or spin instead.
pub unsafe trait Lock {
    /// Take the lock before a heap operation.
    fn lock(&self);

    /// Release the lock after a heap operation.
    fn unlock(&self);
}

/// A [`Lock`] for a heap that never leaves one thread. It is not `Sync`.
///
/// Re-entering the heap while it is locked, for example from a `log`
/// implementation that allocates out of the same heap, panics.
#[derive(Debug, Default)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get(), "heap lock is already held");
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl SingleThreadedLock {
    /// An unlocked `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

pub(crate) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: moving the heap and its lock together to another thread moves
// every block pointer with them. Nothing outside the `UnsafeCell` aliases it.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: a `Sync` lock excludes concurrent heap operations. The heap must be
// `Send` since any thread holding the guard can swap it out.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L> {
    pub(crate) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(crate) fn into_inner(self) -> T {
        self.value.into_inner()
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }
}

/// Exclusive access to a locked heap. The lock is released on drop.
pub struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: the lock is held for as long as the guard lives.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: as above, and `&mut self` makes this the only reference.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T, L> fmt::Debug for MutexGuard<'_, T, L>
where
    T: fmt::Debug,
    L: Lock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
