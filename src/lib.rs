#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;

mod block;
mod coalesce;
mod error;
mod fatal;
mod free_list;
mod heap;
mod locked;
mod quick_cache;
mod region;

pub use block::{round_to_alignment, ALIGNMENT, MIN_BLOCK_SIZE, PAGE_SIZE};
pub use error::{HeapError, IntegrityError, InvalidPointer};
pub use fatal::{Abort, FatalHandler, Panic};
pub use heap::{BlockInfo, BlockState, Blocks, Heap};
pub use locked::{Lock, LockedHeap, MutexGuard, SingleThreadedLock};
pub use region::{Arena, RegionSource};

#[cfg(unix)]
pub use region::Sbrk;

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
