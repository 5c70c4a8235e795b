//! Layered memory allocators for a game-engine style runtime.
//!
//! Everything in here is built on one reservation/commit discipline: a
//! [`VirtualMemoryRegion`] owns a large range of reserved address space and
//! the allocators commit pages out of it on demand.
//!
//! From a high level the most interesting types are:
//!  * The [`PageAllocator`]: one reserved region subdivided into fixed-size
//!    pages, with a two-level bitmap tracking committed pages and a LIFO
//!    free-page list threaded through the free pages themselves.
//!  * The [`FixedSizeAllocator`]: a slab pool for one allocation size,
//!    with free-block headers embedded in the free blocks.
//!  * The [`TlsfAllocator`]: two-level segregated fit for variable sizes,
//!    with eager physical coalescing.
//!  * The [`StackAllocator`]: a per-thread bump allocator with savepoints.
//!  * The [`TieredAllocator`]: routes a request to one of four strategies
//!    by size class (tiny / bucketed slabs / TLSF / direct mappings).
//!  * The [`GlobalAllocator`]: a bootstrap-safe `core::alloc::GlobalAlloc`
//!    that lazily constructs the tiered allocator on first use.

#[macro_use]
extern crate static_assertions;

pub mod error;
pub mod global;
pub mod memory;
pub mod sync;

pub use crate::error::AllocationError;
pub use crate::global::GlobalAllocator;
pub use crate::memory::page::PageAllocator;
pub use crate::memory::stack::{LinearAllocator, StackAllocator};
pub use crate::memory::strategies::tiered::TieredAllocator;
pub use crate::memory::tlsf::TlsfAllocator;
pub use crate::memory::vmem::{VirtualMemory, VirtualMemoryRegion};
pub use crate::memory::MemoryRange;
pub use crate::memory::fsa::FixedSizeAllocator;

#[macro_export]
macro_rules! round_up {
    ($num:expr, $s:expr) => {
        (($num + $s - 1) / $s) * $s
    };
}

pub trait PowersOf2 {
    fn log2(self) -> u8;
}

impl PowersOf2 for usize {
    #[cfg(target_pointer_width = "64")]
    fn log2(self) -> u8 {
        63 - self.leading_zeros() as u8
    }

    #[cfg(target_pointer_width = "32")]
    fn log2(self) -> u8 {
        31 - self.leading_zeros() as u8
    }
}
