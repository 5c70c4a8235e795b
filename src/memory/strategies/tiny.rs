//! Strategy for the smallest requests (up to 255 bytes).
//!
//! Sixteen free lists, one per 16-byte size class. Each class owns a chain
//! of pages from the backing page allocator; the first slot of every page
//! stores its class index so a free recovers the class in O(1). Free slots
//! hold a [`FreeSlot`] header: either a link to the next free slot, or a
//! count of untouched slots at the page frontier (so fresh pages need no
//! up-front list threading).

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use std::sync::Arc;

use crate::error::AllocationError;
use crate::memory::page::PageAllocator;
use crate::memory::vmem::{VirtualMemory, VirtualMemoryRegion};
use crate::memory::{mark_free, mark_uninitialized, MemoryRange};
use crate::sync::CriticalSection;

/// Largest request the tiny strategy serves.
pub const MAX_ALLOCATION_SIZE: usize = 255;

/// Number of 16-byte size classes.
const CLASS_COUNT: usize = 16;

/// In-place header of a free slot.
///
/// `untouched_slots` is non-zero only on the frontier slot of a page whose
/// tail has never been allocated: it counts the frontier slot itself plus
/// everything after it.
#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
    untouched_slots: usize,
}

const_assert!(core::mem::size_of::<FreeSlot>() <= 16);

struct TinyInner {
    pool: PageAllocator,
    free_lists: [*mut FreeSlot; CLASS_COUNT],
    /// Usable slots per page, per class (the header slot is excluded).
    slots_per_page: [usize; CLASS_COUNT],
    allocated_bytes: usize,
}

unsafe impl Send for TinyInner {}

fn class_of(size: usize) -> usize {
    debug_assert!(size <= MAX_ALLOCATION_SIZE);
    size >> 4
}

fn slot_size(class: usize) -> usize {
    16 * (class + 1)
}

impl TinyInner {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocationError> {
        let class = class_of(size);
        let slot = slot_size(class);

        if self.free_lists[class].is_null() {
            self.grow_class(class)?;
        }

        let allocation = self.free_lists[class] as *mut u8;

        // SAFETY: list members are free slots inside live pages.
        unsafe {
            let head = self.free_lists[class].read();

            self.free_lists[class] = if !head.next.is_null() {
                head.next
            } else if head.untouched_slots > 1 {
                // Advance the frontier within the page.
                let frontier = allocation.add(slot) as *mut FreeSlot;
                frontier.write(FreeSlot {
                    next: core::ptr::null_mut(),
                    untouched_slots: head.untouched_slots - 1,
                });
                frontier
            } else {
                core::ptr::null_mut()
            };

            mark_uninitialized(allocation, allocation.add(slot));
        }

        self.allocated_bytes += slot;
        // SAFETY: slots are never at address zero.
        Ok(unsafe { NonNull::new_unchecked(allocation) })
    }

    fn grow_class(&mut self, class: usize) -> Result<(), AllocationError> {
        let page = self.pool.allocate()?.as_ptr();
        let slot = slot_size(class);

        // SAFETY: a freshly committed page, exclusively ours. The first
        // slot becomes the class tag, the second the frontier.
        unsafe {
            (page as *mut usize).write(class);

            let frontier = page.add(slot) as *mut FreeSlot;
            frontier.write(FreeSlot {
                next: core::ptr::null_mut(),
                untouched_slots: self.slots_per_page[class],
            });

            self.free_lists[class] = frontier;
        }

        Ok(())
    }

    fn free(&mut self, address: *mut u8) -> bool {
        if !self.pool.is_allocated(address) {
            return false;
        }

        let page = self
            .pool
            .page_address(address)
            .expect("is_allocated implies a page address");

        // SAFETY: live tiny pages carry their class in the first slot.
        let class = unsafe { (page as *const usize).read() };
        assert!(class < CLASS_COUNT, "corrupt tiny page tag {} at {:p}", class, page);

        let slot = slot_size(class);

        // SAFETY: the slot lies inside a live page of our pool.
        unsafe {
            mark_free(address, address.add(slot));

            let freed = address as *mut FreeSlot;
            freed.write(FreeSlot {
                next: self.free_lists[class],
                untouched_slots: 0,
            });
            self.free_lists[class] = freed;
        }

        self.allocated_bytes -= slot;
        true
    }
}

/// Per-16-byte size-class allocator for requests of at most 255 bytes.
pub struct TinyStrategy {
    section: CriticalSection,
    inner: UnsafeCell<TinyInner>,
    range: MemoryRange,
}

// All inner access happens under the critical section.
unsafe impl Send for TinyStrategy {}
unsafe impl Sync for TinyStrategy {}

impl TinyStrategy {
    /// Serve tiny allocations out of `sub_range` of a shared region.
    pub fn shared(region: Arc<VirtualMemoryRegion>, sub_range: MemoryRange) -> TinyStrategy {
        Self::with_pool(PageAllocator::shared(region, sub_range, VirtualMemory::page_size()))
    }

    /// A standalone strategy with its own reservation.
    pub fn new(capacity: usize) -> Result<TinyStrategy, AllocationError> {
        Ok(Self::with_pool(PageAllocator::new(capacity, VirtualMemory::page_size())?))
    }

    fn with_pool(pool: PageAllocator) -> TinyStrategy {
        let range = pool.range();
        let page_size = pool.page_size();

        let mut slots_per_page = [0usize; CLASS_COUNT];
        for (class, slots) in slots_per_page.iter_mut().enumerate() {
            *slots = page_size / slot_size(class) - 1;
        }

        TinyStrategy {
            section: CriticalSection::new(),
            inner: UnsafeCell::new(TinyInner {
                pool,
                free_lists: [core::ptr::null_mut(); CLASS_COUNT],
                slots_per_page,
                allocated_bytes: 0,
            }),
            range,
        }
    }

    pub fn max_allocation_size(&self) -> usize {
        MAX_ALLOCATION_SIZE
    }

    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocationError> {
        debug_assert!(size <= MAX_ALLOCATION_SIZE);
        debug_assert!(alignment <= 16, "tiny slots are only 16-byte aligned");

        let _guard = self.section.enter();
        // SAFETY: inner is only touched under the critical section.
        unsafe { (*self.inner.get()).allocate(size) }
    }

    /// Returns false when the pointer is not a live slot of this strategy.
    pub fn free(&self, address: *mut u8) -> bool {
        let _guard = self.section.enter();
        // SAFETY: inner is only touched under the critical section.
        unsafe { (*self.inner.get()).free(address) }
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
}
