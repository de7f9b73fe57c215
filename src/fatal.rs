//! What happens when a release is handed a pointer that fails validation.
//!
//! A heap that is asked to release a bad pointer is either being misused or
//! already corrupted, and its free lists cannot be trusted afterwards, so the
//! handler never returns.

use crate::error::InvalidPointer;
use core::ptr::NonNull;

/// The action taken when [`Heap::release`](crate::Heap::release) rejects its
/// argument.
pub trait FatalHandler {
    /// Handle the invalid release of `ptr`. Must not return.
    fn invalid_release(&mut self, ptr: NonNull<u8>, reason: InvalidPointer) -> !;
}

/// Log the failure and abort the process.
#[derive(Clone, Copy, Debug, Default)]
pub struct Abort;

impl FatalHandler for Abort {
    fn invalid_release(&mut self, ptr: NonNull<u8>, reason: InvalidPointer) -> ! {
        log::error!("invalid release of {ptr:p}: {reason}; aborting");
        // Safety: `abort` has no preconditions.
        unsafe { libc::abort() }
    }
}

/// Panic instead of aborting.
///
/// Useful in tests, where a panic can be observed without taking down the
/// test harness.
#[derive(Clone, Copy, Debug, Default)]
pub struct Panic;

impl FatalHandler for Panic {
    fn invalid_release(&mut self, ptr: NonNull<u8>, reason: InvalidPointer) -> ! {
        panic!("invalid release of {ptr:p}: {reason}")
    }
}
