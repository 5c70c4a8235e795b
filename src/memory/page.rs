//! One reserved region subdivided into fixed-size pages.
//!
//! Committed pages are mirrored in a two-level bitmap so "find the next
//! uncommitted page" scans words, not pages. Freed pages form a LIFO list
//! threaded through the pages themselves: the first bytes of a free page
//! hold a [`FreePage`] header with a validation token and the next link.
//! When utilization falls below [`START_DECOMMIT_THRESHOLD`] the allocator
//! walks that list decommitting pages until it climbs back above
//! [`END_DECOMMIT_THRESHOLD`].

use core::ptr::NonNull;
use std::sync::Arc;

use bit_field::BitField;
use log::trace;
use spin::Mutex;

use crate::error::AllocationError;
use crate::memory::vmem::{VirtualMemory, VirtualMemoryRegion};
use crate::memory::{is_aligned, mark_free, mark_uninitialized, AllocatorStatistics, MemoryRange};
use crate::PowersOf2;

/// Validation token written into the first word of every free page.
pub const FREE_PAGE_PATTERN: u64 = 0xfb;

/// Utilization below which a free starts decommitting list pages.
pub const START_DECOMMIT_THRESHOLD: f32 = 0.4;

/// Utilization at which the decommit walk stops.
pub const END_DECOMMIT_THRESHOLD: f32 = 0.8;

/// In-place header of a page on the free list.
#[repr(C)]
#[derive(Clone, Copy)]
struct FreePage {
    pattern: u64,
    next: *mut u8,
}

const_assert!(core::mem::size_of::<FreePage>() == 16);

impl FreePage {
    /// # Safety
    /// `address` must point at a committed page owned by this allocator.
    unsafe fn write(address: *mut u8, next: *mut u8) {
        (address as *mut FreePage).write(FreePage { pattern: FREE_PAGE_PATTERN, next });
    }

    /// # Safety
    /// `address` must point at a committed page owned by this allocator.
    unsafe fn read(address: *const u8) -> FreePage {
        (address as *const FreePage).read()
    }

    fn is_valid(&self) -> bool {
        self.pattern == FREE_PAGE_PATTERN
    }
}

/// Two-level bitmap mirroring which pages of the region are committed.
///
/// Level 0: bit `i` of `page_masks[i / 64]` set when page `i` is committed.
/// Level 1: bit `j` of `index_masks[j / 64]` set when `page_masks[j]` is
/// fully committed. Bits past the end of the region are pre-set so partial
/// tail words never look like commit candidates.
struct CommittedMemoryTracker {
    range: MemoryRange,
    page_size: usize,
    page_size_log2: u8,
    num_pages: usize,
    committed_pages: usize,
    page_masks: Vec<u64>,
    index_masks: Vec<u64>,
}

const MASK_BITS: usize = 64;
const FULL_MASK: u64 = u64::max_value();

impl CommittedMemoryTracker {
    fn new(range: MemoryRange, page_size: usize) -> CommittedMemoryTracker {
        assert!(page_size.is_power_of_two());

        let num_pages = range.size() / page_size;
        let num_masks = (num_pages + MASK_BITS - 1) / MASK_BITS;
        let num_index_masks = (num_masks + MASK_BITS - 1) / MASK_BITS;

        let mut tracker = CommittedMemoryTracker {
            range,
            page_size,
            page_size_log2: page_size.log2(),
            num_pages,
            committed_pages: 0,
            page_masks: vec![0; num_masks],
            index_masks: vec![0; num_index_masks],
        };

        // Seal the bits that do not correspond to a real page.
        for page in num_pages..num_masks * MASK_BITS {
            tracker.page_masks[page / MASK_BITS].set_bit(page % MASK_BITS, true);
        }
        for mask in num_masks..num_index_masks * MASK_BITS {
            tracker.index_masks[mask / MASK_BITS].set_bit(mask % MASK_BITS, true);
        }
        for (index, mask) in tracker.page_masks.iter().enumerate() {
            if *mask == FULL_MASK {
                tracker.index_masks[index / MASK_BITS].set_bit(index % MASK_BITS, true);
            }
        }

        tracker
    }

    fn page_number(&self, address: *const u8) -> usize {
        debug_assert!(self.range.contains(address));
        (address as usize - self.range.begin() as usize) >> self.page_size_log2
    }

    fn page_address(&self, page: usize) -> *mut u8 {
        self.range.begin().wrapping_add(page << self.page_size_log2)
    }

    fn on_commit(&mut self, address: *const u8) {
        let page = self.page_number(address);
        let mask_index = page / MASK_BITS;

        self.page_masks[mask_index].set_bit(page % MASK_BITS, true);

        if self.page_masks[mask_index] == FULL_MASK {
            self.index_masks[mask_index / MASK_BITS].set_bit(mask_index % MASK_BITS, true);
        }

        self.committed_pages += 1;
    }

    fn on_free(&mut self, address: *const u8) {
        let page = self.page_number(address);
        let mask_index = page / MASK_BITS;

        self.page_masks[mask_index].set_bit(page % MASK_BITS, false);
        self.index_masks[mask_index / MASK_BITS].set_bit(mask_index % MASK_BITS, false);

        self.committed_pages -= 1;
    }

    fn is_committed(&self, address: *const u8) -> bool {
        if !self.range.contains(address) {
            return false;
        }

        let page = self.page_number(address);
        self.page_masks[page / MASK_BITS].get_bit(page % MASK_BITS)
    }

    /// Lowest-addressed page that is not committed, or None when the region
    /// is fully committed.
    fn next_page_to_commit(&self) -> Option<*mut u8> {
        if self.committed_pages == self.num_pages {
            return None;
        }

        for (index, mask) in self.index_masks.iter().enumerate() {
            if *mask != FULL_MASK {
                let mask_index = index * MASK_BITS + (!*mask).trailing_zeros() as usize;
                let page_bits = self.page_masks[mask_index];
                let page = mask_index * MASK_BITS + (!page_bits).trailing_zeros() as usize;

                debug_assert!(page < self.num_pages);
                return Some(self.page_address(page));
            }
        }

        None
    }

    fn committed_memory(&self) -> usize {
        self.committed_pages * self.page_size
    }
}

/// What the allocator sits on: its own reservation, or a slice of a region
/// shared with other allocators.
enum Backing {
    Owned(VirtualMemoryRegion),
    Shared(Arc<VirtualMemoryRegion>, MemoryRange),
}

impl Backing {
    fn range(&self) -> MemoryRange {
        match self {
            Backing::Owned(region) => region.range(),
            Backing::Shared(_, sub) => *sub,
        }
    }
}

struct PageAllocatorInner {
    backing: Backing,
    tracker: CommittedMemoryTracker,
    allocated_pages: usize,
    next_free_page: *mut u8,
}

// The raw pointers refer into the backing reservation, which lives as long
// as the allocator; all access is serialized by the outer lock.
unsafe impl Send for PageAllocatorInner {}

impl PageAllocatorInner {
    fn utilization(&self) -> f32 {
        let committed = self.tracker.committed_memory();
        if committed == 0 {
            1.0
        } else {
            (self.allocated_pages * self.tracker.page_size) as f32 / committed as f32
        }
    }

    fn allocate(&mut self) -> Result<NonNull<u8>, AllocationError> {
        let page_size = self.tracker.page_size;

        if !self.tracker.is_committed(self.next_free_page) {
            // Covers both "list empty, bump into fresh pages" and "region
            // exhausted" (null / out of range).
            if !self.tracker.range.contains(self.next_free_page) {
                return Err(AllocationError::OutOfMemory { size: page_size });
            }
            VirtualMemory::commit(self.next_free_page, page_size);
            self.tracker.on_commit(self.next_free_page);
        }

        let page = self.next_free_page;

        // A freshly committed page reads as zeroes, so its `next` is null
        // and we fall through to the next page to commit, exactly as if the
        // list had run dry.
        let header = unsafe { FreePage::read(page) };
        self.next_free_page = if !header.next.is_null() {
            header.next
        } else {
            self.tracker.next_page_to_commit().unwrap_or(core::ptr::null_mut())
        };

        unsafe { mark_uninitialized(page, page.wrapping_add(page_size)) };

        self.allocated_pages += 1;
        Ok(unsafe { NonNull::new_unchecked(page) })
    }

    fn free(&mut self, address: *mut u8) {
        let page_size = self.tracker.page_size;
        let range = self.tracker.range;

        assert!(range.contains(address), "free of {:p} outside {:?}", address, range);
        assert!(
            address == self.tracker.page_address(self.tracker.page_number(address)),
            "free of {:p} is not page-aligned",
            address
        );
        debug_assert!(self.tracker.is_committed(address), "free of an uncommitted page {:p}", address);

        unsafe {
            mark_free(address, address.wrapping_add(page_size));
            FreePage::write(address, self.next_free_page);
        }
        self.next_free_page = address;

        self.allocated_pages -= 1;

        if self.utilization() < START_DECOMMIT_THRESHOLD {
            trace!(
                "utilization {:.2}, decommitting free-list pages",
                self.utilization()
            );

            while self.tracker.is_committed(self.next_free_page)
                && self.utilization() < END_DECOMMIT_THRESHOLD
            {
                let to_free = self.next_free_page;
                let header = unsafe { FreePage::read(to_free) };
                assert!(header.is_valid(), "corrupt free-page header at {:p}", to_free);

                self.next_free_page = header.next;

                VirtualMemory::decommit(to_free, page_size);
                self.tracker.on_free(to_free);
            }

            if !self.tracker.is_committed(self.next_free_page) {
                self.next_free_page = self
                    .tracker
                    .next_page_to_commit()
                    .unwrap_or(core::ptr::null_mut());
            }
        }
    }

    fn is_allocated(&self, address: *const u8) -> bool {
        if !self.tracker.range.contains(address) {
            return false;
        }

        let page = self.tracker.page_address(self.tracker.page_number(address));
        if !self.tracker.is_committed(page) {
            return false;
        }

        !unsafe { FreePage::read(page) }.is_valid()
    }
}

/// Fixed-size page allocator over one reserved region.
///
/// Thread-safe: one lock serializes allocate/free.
pub struct PageAllocator {
    inner: Mutex<PageAllocatorInner>,
    page_size: usize,
    range: MemoryRange,
}

unsafe impl Send for PageAllocator {}
unsafe impl Sync for PageAllocator {}

impl PageAllocator {
    /// Reserve `pool_size` bytes and subdivide them into `page_size` pages.
    ///
    /// Both sizes are rounded up to the OS page size; `page_size` must come
    /// out a power of two.
    pub fn new(pool_size: usize, page_size: usize) -> Result<PageAllocator, AllocationError> {
        let region = VirtualMemoryRegion::new(pool_size)?;
        Ok(Self::with_backing(Backing::Owned(region), page_size))
    }

    /// A pool sized to the machine's physical memory.
    pub fn with_system_capacity(page_size: usize) -> Result<PageAllocator, AllocationError> {
        Self::new(crate::memory::memory_status().total_phys, page_size)
    }

    /// Manage `sub_range` of a region shared with other allocators.
    ///
    /// `sub_range` must lie inside the region and start on an OS page
    /// boundary; the region stays reserved for the allocator's lifetime via
    /// the `Arc`.
    pub fn shared(
        region: Arc<VirtualMemoryRegion>,
        sub_range: MemoryRange,
        page_size: usize,
    ) -> PageAllocator {
        assert!(region.range().contains_range(&sub_range));
        assert!(is_aligned(sub_range.begin(), VirtualMemory::page_size()));

        Self::with_backing(Backing::Shared(region, sub_range), page_size)
    }

    fn with_backing(backing: Backing, page_size: usize) -> PageAllocator {
        let page_size = VirtualMemory::align_to_page_size(page_size);
        let range = backing.range();
        let tracker = CommittedMemoryTracker::new(range, page_size);
        let next_free_page = range.begin();

        PageAllocator {
            inner: Mutex::new(PageAllocatorInner {
                backing,
                tracker,
                allocated_pages: 0,
                next_free_page,
            }),
            page_size,
            range,
        }
    }

    /// Hand out one page, committing it first if needed.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocationError> {
        self.inner.lock().allocate()
    }

    /// Return a page to the free list; may decommit cold pages.
    ///
    /// `address` must be a page-aligned, committed address inside the
    /// region.
    pub fn free(&self, address: *mut u8) {
        self.inner.lock().free(address)
    }

    /// True when `address` falls inside a live (committed, not free-listed)
    /// page.
    pub fn is_allocated(&self, address: *const u8) -> bool {
        self.inner.lock().is_allocated(address)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn range(&self) -> MemoryRange {
        self.range
    }

    /// Round `address` down to the containing page boundary, or None when
    /// outside the region.
    pub fn page_address(&self, address: *const u8) -> Option<*mut u8> {
        if !self.range.contains(address) {
            return None;
        }
        let offset = address as usize - self.range.begin() as usize;
        Some(self.range.begin().wrapping_add(offset - offset % self.page_size))
    }

    pub fn used_memory(&self) -> usize {
        self.inner.lock().allocated_pages * self.page_size
    }

    pub fn committed_memory(&self) -> usize {
        self.inner.lock().tracker.committed_memory()
    }

    pub fn allocated_pages(&self) -> usize {
        self.inner.lock().allocated_pages
    }

    pub fn utilization(&self) -> f32 {
        self.inner.lock().utilization()
    }
}

impl AllocatorStatistics for PageAllocator {
    fn allocated(&self) -> usize {
        self.used_memory()
    }

    fn size(&self) -> usize {
        self.committed_memory()
    }

    fn capacity(&self) -> usize {
        self.range.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(pages: usize, page_size: usize) -> PageAllocator {
        PageAllocator::new(pages * page_size, page_size).unwrap()
    }

    #[test]
    fn allocate_commits_one_page() {
        let pages = allocator(8, 4096);

        assert_eq!(pages.committed_memory(), 0);
        let page = pages.allocate().unwrap();
        assert_eq!(pages.committed_memory(), 4096);
        assert_eq!(pages.used_memory(), 4096);
        assert!(pages.is_allocated(page.as_ptr()));

        // The page is writable all the way through.
        unsafe { page.as_ptr().write_bytes(0x5A, 4096) };
    }

    #[test]
    fn allocations_are_distinct_pages() {
        let pages = allocator(16, 4096);
        let a = pages.allocate().unwrap().as_ptr();
        let b = pages.allocate().unwrap().as_ptr();
        let c = pages.allocate().unwrap().as_ptr();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!((a as usize) % 4096 == (pages.range().begin() as usize) % 4096);
        assert_eq!(pages.allocated_pages(), 3);
    }

    #[test]
    fn free_page_is_reused_lifo() {
        let pages = allocator(16, 4096);
        let a = pages.allocate().unwrap().as_ptr();
        let _b = pages.allocate().unwrap().as_ptr();

        pages.free(a);
        assert!(!pages.is_allocated(a));

        let c = pages.allocate().unwrap().as_ptr();
        assert_eq!(c, a);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let pages = allocator(2, 4096);
        let _a = pages.allocate().unwrap();
        let _b = pages.allocate().unwrap();

        assert!(pages.allocate().is_err());
    }

    #[test]
    fn exhaustion_recovers_after_free() {
        let pages = allocator(2, 4096);
        let a = pages.allocate().unwrap().as_ptr();
        let _b = pages.allocate().unwrap();
        assert!(pages.allocate().is_err());

        pages.free(a);
        assert_eq!(pages.allocate().unwrap().as_ptr(), a);
    }

    #[test]
    #[should_panic]
    fn unaligned_free_panics() {
        let pages = allocator(4, 4096);
        let a = pages.allocate().unwrap().as_ptr();
        pages.free(unsafe { a.add(1) });
    }

    #[test]
    fn decommit_hysteresis() {
        let page_size = 4096;
        let pages = allocator(100, page_size);

        let mut allocated: Vec<*mut u8> = (0..100)
            .map(|_| pages.allocate().unwrap().as_ptr())
            .collect();
        assert_eq!(pages.committed_memory(), 100 * page_size);

        // Free 70 pages in reverse order. The first decommit walk triggers
        // when utilization dips under 0.4 (39 allocated / 100 committed) and
        // stops at >= 0.8 (39 / 48).
        for _ in 0..70 {
            pages.free(allocated.pop().unwrap());
        }
        assert_eq!(pages.allocated_pages(), 30);
        assert_eq!(pages.committed_memory(), 48 * page_size);

        // Free the rest; the walk drains the entire free list.
        for _ in 0..30 {
            pages.free(allocated.pop().unwrap());
        }
        assert_eq!(pages.allocated_pages(), 0);
        assert_eq!(pages.committed_memory(), 0);

        // And the allocator still works afterwards.
        let again = pages.allocate().unwrap().as_ptr();
        assert!(pages.is_allocated(again));
    }

    #[test]
    fn malloc_free_loop_does_not_grow_commit() {
        let pages = allocator(32, 4096);

        let first = pages.allocate().unwrap().as_ptr();
        pages.free(first);
        let committed = pages.committed_memory();

        for _ in 0..1000 {
            let page = pages.allocate().unwrap().as_ptr();
            pages.free(page);
        }

        assert!(pages.committed_memory() <= committed.max(4096));
    }

    #[test]
    fn tracker_invariant_holds() {
        let pages = allocator(10, 4096);
        let mut live = Vec::new();

        for _ in 0..10 {
            live.push(pages.allocate().unwrap().as_ptr());
            assert!(pages.used_memory() <= pages.committed_memory());
            assert!(pages.committed_memory() <= pages.range().size());
        }
        for page in live {
            pages.free(page);
            assert!(pages.used_memory() <= pages.committed_memory());
        }
    }

    #[test]
    fn next_page_scan_spans_mask_words() {
        // More than 64 pages so the level-1 index mask is exercised.
        let pages = allocator(130, 4096);
        let mut live = Vec::new();
        for _ in 0..130 {
            live.push(pages.allocate().unwrap().as_ptr());
        }
        assert!(pages.allocate().is_err());

        // Free one page in the middle of the second mask word; it must be
        // the next page handed out.
        let victim = live[70];
        pages.free(victim);
        assert_eq!(pages.allocate().unwrap().as_ptr(), victim);
    }
}
