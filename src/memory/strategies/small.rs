//! Fine-grained slab strategy: one [`FixedSizeAllocator`] per 8-byte step.
//!
//! All the slabs share one [`PageAllocator`]; a free recovers the owning
//! slab by reading the allocation size from the page header.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use std::sync::Arc;

use crate::error::AllocationError;
use crate::memory::fsa::{FixedSizeAllocator, FsaPage, MIN_ALLOCATION_SIZE};
use crate::memory::page::PageAllocator;
use crate::memory::{align_up, MemoryRange};
use crate::sync::CriticalSection;

const STEP: usize = MIN_ALLOCATION_SIZE;

struct SmallInner {
    pool: Arc<PageAllocator>,
    allocators: Vec<FixedSizeAllocator>,
    allocated_bytes: usize,
}

unsafe impl Send for SmallInner {}

/// Slab router with an allocator for every multiple of 8 bytes up to the
/// configured maximum.
pub struct SmallStrategy {
    section: CriticalSection,
    inner: UnsafeCell<SmallInner>,
    range: MemoryRange,
}

unsafe impl Send for SmallStrategy {}
unsafe impl Sync for SmallStrategy {}

impl SmallStrategy {
    pub fn new(pool: Arc<PageAllocator>, max_allocation_size: usize) -> SmallStrategy {
        assert!(max_allocation_size >= STEP);

        let count = align_up(max_allocation_size, STEP) / STEP;
        let mut allocators = Vec::with_capacity(count);
        for index in 0..count {
            allocators.push(FixedSizeAllocator::new(STEP * (index + 1), Arc::clone(&pool)));
        }

        SmallStrategy {
            section: CriticalSection::new(),
            range: pool.range(),
            inner: UnsafeCell::new(SmallInner {
                pool,
                allocators,
                allocated_bytes: 0,
            }),
        }
    }

    pub fn max_allocation_size(&self) -> usize {
        // SAFETY: the allocator list never changes after construction.
        unsafe { (*self.inner.get()).allocators.len() * STEP }
    }

    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocationError> {
        let internal_alignment = alignment.max(STEP);
        let allocation_size = align_up(size.max(1), internal_alignment);
        assert!(allocation_size <= self.max_allocation_size());

        let index = allocation_size / STEP - 1;

        let _guard = self.section.enter();
        // SAFETY: inner is only touched under the critical section.
        let inner = unsafe { &mut *self.inner.get() };

        let block = inner.allocators[index].allocate()?;
        inner.allocated_bytes += inner.allocators[index].allocation_size();
        Ok(block)
    }

    /// Returns false when the pointer is outside the backing pool.
    pub fn free(&self, address: *mut u8) -> bool {
        if !self.range.contains(address) {
            return false;
        }

        let _guard = self.section.enter();
        // SAFETY: inner is only touched under the critical section.
        let inner = unsafe { &mut *self.inner.get() };

        assert!(
            inner.pool.is_allocated(address),
            "free of {:p} which is not on a live slab page",
            address
        );

        // SAFETY: the address lies on a live page of the pool.
        let page = unsafe { FsaPage::from_address(address, &inner.pool) }
            .expect("contained address has a page");
        let allocation_size = unsafe { (*page).allocation_size() };
        let index = allocation_size / STEP - 1;
        assert!(index < inner.allocators.len());

        inner.allocators[index].free(address);
        inner.allocated_bytes -= allocation_size;
        true
    }

    pub fn owns(&self, address: *const u8) -> bool {
        self.range.contains(address)
    }

    pub fn range(&self) -> MemoryRange {
        self.range
    }

    pub fn allocated_memory(&self) -> usize {
        let _guard = self.section.enter();
        unsafe { (*self.inner.get()).allocated_bytes }
    }

    pub fn committed_memory(&self) -> usize {
        let _guard = self.section.enter();
        unsafe { (*self.inner.get()).pool.committed_memory() }
    }

    /// Bytes committed for slab pages but not handed out in blocks.
    pub fn wasted_memory(&self) -> usize {
        let _guard = self.section.enter();
        let inner = unsafe { &*self.inner.get() };

        let used: usize = inner
            .allocators
            .iter()
            .map(|allocator| allocator.allocated_memory())
            .sum();

        inner.pool.used_memory() - used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(max: usize) -> SmallStrategy {
        let pool = Arc::new(PageAllocator::new(64 * 1024 * 1024, 4096).unwrap());
        SmallStrategy::new(pool, max)
    }

    #[test]
    fn sizes_route_to_the_matching_slab() {
        let small = strategy(1024);

        let a = small.allocate(1, 8).unwrap().as_ptr();
        let b = small.allocate(9, 8).unwrap().as_ptr();
        assert_eq!(small.allocated_memory(), 8 + 16);

        assert!(small.free(a));
        assert!(small.free(b));
        assert_eq!(small.allocated_memory(), 0);
    }

    #[test]
    fn free_routes_through_the_page_header() {
        let small = strategy(1024);

        // Same page allocator, different slabs; each free must find its own
        // slab from the page it lands on.
        let blocks: Vec<*mut u8> = (1..=8)
            .map(|i| small.allocate(i * 100, 8).unwrap().as_ptr())
            .collect();

        for block in blocks.into_iter().rev() {
            assert!(small.free(block));
        }
        assert_eq!(small.allocated_memory(), 0);
    }

    #[test]
    fn alignment_rounds_the_size_up() {
        let small = strategy(1024);

        let a = small.allocate(20, 32).unwrap().as_ptr();
        assert_eq!(a as usize % 32, 0);
        // 20 aligned to 32 lands in the 32-byte slab.
        assert_eq!(small.allocated_memory(), 32);
        small.free(a);
    }

    #[test]
    fn foreign_pointer_is_refused() {
        let small = strategy(256);
        assert!(!small.free(0x8000 as *mut u8));
    }

    #[test]
    fn wasted_memory_counts_slack() {
        let small = strategy(256);

        // One 8-byte block commits a whole page; nearly all of it is slack.
        let a = small.allocate(8, 8).unwrap().as_ptr();
        let wasted = small.wasted_memory();
        assert!(wasted > 0 && wasted < 4096);

        small.free(a);
        assert_eq!(small.wasted_memory(), 0);
    }
}
