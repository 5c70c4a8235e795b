//! Coarse slab strategy: one [`FixedSizeAllocator`] per `step`-sized bucket.
//!
//! The bucketed sibling of [`super::small::SmallStrategy`]: fewer, wider
//! size classes keep the slab count manageable for the 256 B .. 8 KiB band.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use std::sync::Arc;

use crate::error::AllocationError;
use crate::memory::fsa::{FixedSizeAllocator, FsaPage, MIN_ALLOCATION_SIZE};
use crate::memory::page::PageAllocator;
use crate::memory::{align_up, MemoryRange};
use crate::sync::CriticalSection;

/// Default distance between bucket sizes.
pub const DEFAULT_STEP: usize = 256;

struct BucketsInner {
    pool: Arc<PageAllocator>,
    buckets: Vec<FixedSizeAllocator>,
    allocated_bytes: usize,
}

unsafe impl Send for BucketsInner {}

/// Slab router over `max_allocation_size / step` buckets sharing one pool.
pub struct BucketsStrategy {
    section: CriticalSection,
    inner: UnsafeCell<BucketsInner>,
    range: MemoryRange,
    step: usize,
}

unsafe impl Send for BucketsStrategy {}
unsafe impl Sync for BucketsStrategy {}

impl BucketsStrategy {
    pub fn new(
        pool: Arc<PageAllocator>,
        max_allocation_size: usize,
        step: usize,
    ) -> BucketsStrategy {
        assert!(step >= MIN_ALLOCATION_SIZE);
        assert!(max_allocation_size >= step);

        let step = align_up(step, MIN_ALLOCATION_SIZE);
        let count = align_up(max_allocation_size, step) / step;

        let mut buckets = Vec::with_capacity(count);
        for index in 0..count {
            buckets.push(FixedSizeAllocator::new(step * (index + 1), Arc::clone(&pool)));
        }

        BucketsStrategy {
            section: CriticalSection::new(),
            range: pool.range(),
            step,
            inner: UnsafeCell::new(BucketsInner {
                pool,
                buckets,
                allocated_bytes: 0,
            }),
        }
    }

    pub fn max_allocation_size(&self) -> usize {
        // SAFETY: the bucket list never changes after construction.
        unsafe { (*self.inner.get()).buckets.len() * self.step }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocationError> {
        debug_assert!(
            alignment <= self.step && self.step % alignment.max(1) == 0,
            "bucket blocks are aligned to multiples of the step only"
        );

        let allocation_size = align_up(size.max(1), alignment.max(MIN_ALLOCATION_SIZE));
        assert!(allocation_size <= self.max_allocation_size());

        let index = (allocation_size + self.step - 1) / self.step - 1;

        let _guard = self.section.enter();
        // SAFETY: inner is only touched under the critical section.
        let inner = unsafe { &mut *self.inner.get() };

        let block = inner.buckets[index].allocate()?;
        inner.allocated_bytes += inner.buckets[index].allocation_size();
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
        let index = allocation_size / self.step - 1;
        assert!(index < inner.buckets.len());

        inner.buckets[index].free(address);
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
            .buckets
            .iter()
            .map(|bucket| bucket.allocated_memory())
            .sum();

        inner.pool.used_memory() - used
    }
}
