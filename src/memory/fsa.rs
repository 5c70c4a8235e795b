//! Fixed-size (slab) allocator.
//!
//! Each page taken from the backing [`PageAllocator`] starts with an
//! [`FsaPage`] header; the rest is a dense array of equal-size blocks. Free
//! blocks carry a 4-byte [`FreeBlock`] header with a validation token and a
//! 16-bit offset (from the page base) to the next free block, which caps an
//! FSA page at 64 KiB.
//!
//! The allocator keeps two disjoint page sets, "free" (at least one free
//! block) and "full", as intrusive doubly-linked lists threaded through the
//! page headers. The allocator therefore never allocates bookkeeping memory
//! of its own, which matters once it sits behind the global allocator.

use core::ptr::NonNull;
use std::sync::Arc;

use log::trace;

use crate::error::AllocationError;
use crate::memory::page::PageAllocator;
use crate::memory::{align_up, mark_free, mark_uninitialized};

/// Each block must at least hold the free-block header; blocks smaller than
/// a pointer are not worth the page metadata either.
pub const MIN_ALLOCATION_SIZE: usize = 8;

/// Largest page an FSA can subdivide (16-bit block offsets).
pub const MAX_PAGE_SIZE: usize = 1 << 16;

const VALIDATION_TOKEN: u16 = 0xFBAF;
const NO_NEXT_BLOCK: u16 = u16::max_value();

/// In-place header of a free block.
#[repr(C)]
#[derive(Clone, Copy)]
struct FreeBlock {
    token: u16,
    /// Offset of the next free block from the page base, or
    /// [`NO_NEXT_BLOCK`].
    next_offset: u16,
}

const_assert!(core::mem::size_of::<FreeBlock>() <= MIN_ALLOCATION_SIZE);

/// Header at the start of every slab page.
///
/// `prev_page`/`next_page` link the page into exactly one of the owning
/// allocator's two page sets.
#[repr(C)]
pub struct FsaPage {
    page_size: usize,
    allocation_size: usize,
    allocated_blocks: usize,
    next_free_block: *mut FreeBlock,
    prev_page: *mut FsaPage,
    next_page: *mut FsaPage,
}

impl FsaPage {
    /// In-place construct a page header at `address` and thread the free
    /// list through every block.
    ///
    /// # Safety
    /// `address` must point at `page_size` committed bytes exclusively owned
    /// by the caller.
    unsafe fn init(address: *mut u8, page_size: usize, allocation_size: usize) -> *mut FsaPage {
        let page = address as *mut FsaPage;
        page.write(FsaPage {
            page_size,
            allocation_size,
            allocated_blocks: 0,
            next_free_block: core::ptr::null_mut(),
            prev_page: core::ptr::null_mut(),
            next_page: core::ptr::null_mut(),
        });

        let start = (*page).start_offset();
        let blocks = (*page).max_allocations();
        assert!(
            blocks >= 1,
            "allocation size {} does not fit a {} byte page",
            allocation_size,
            page_size
        );

        for index in 0..blocks {
            let offset = start + index * allocation_size;
            let next_offset = if index + 1 < blocks {
                (offset + allocation_size) as u16
            } else {
                NO_NEXT_BLOCK
            };

            (address.add(offset) as *mut FreeBlock)
                .write(FreeBlock { token: VALIDATION_TOKEN, next_offset });
        }

        (*page).next_free_block = address.add(start) as *mut FreeBlock;
        page
    }

    /// Recover the page header from any address inside the page.
    ///
    /// # Safety
    /// `address` must lie within a live slab page of `pool`.
    pub(crate) unsafe fn from_address(
        address: *const u8,
        pool: &PageAllocator,
    ) -> Option<*mut FsaPage> {
        pool.page_address(address).map(|base| base as *mut FsaPage)
    }

    /// Offset of the first block: the header rounded up so every block
    /// offset is a multiple of the allocation size.
    fn start_offset(&self) -> usize {
        align_up(core::mem::size_of::<FsaPage>(), self.allocation_size)
    }

    pub fn max_allocations(&self) -> usize {
        (self.page_size - self.start_offset()) / self.allocation_size
    }

    pub fn is_full(&self) -> bool {
        self.allocated_blocks == self.max_allocations()
    }

    pub fn allocated_blocks(&self) -> usize {
        self.allocated_blocks
    }

    pub fn allocation_size(&self) -> usize {
        self.allocation_size
    }

    fn base(&self) -> *mut u8 {
        self as *const FsaPage as *mut u8
    }

    /// Pop one block off the embedded free list.
    ///
    /// # Safety
    /// The caller must have exclusive access to the page.
    unsafe fn allocate(&mut self) -> Option<*mut u8> {
        let block = self.next_free_block;
        if block.is_null() {
            return None;
        }

        let header = block.read();
        assert!(
            header.token == VALIDATION_TOKEN,
            "corrupt free-block header at {:p} (token {:#06x})",
            block,
            header.token
        );

        self.next_free_block = if header.next_offset != NO_NEXT_BLOCK {
            self.base().add(header.next_offset as usize) as *mut FreeBlock
        } else {
            core::ptr::null_mut()
        };

        self.allocated_blocks += 1;

        let block = block as *mut u8;
        core::ptr::write_bytes(block, 0, core::mem::size_of::<FreeBlock>());
        mark_uninitialized(block, block.add(self.allocation_size));

        Some(block)
    }

    /// Link a block back at the head of the embedded free list.
    ///
    /// # Safety
    /// `address` must be a live block of this page, and the caller must have
    /// exclusive access to the page.
    unsafe fn free(&mut self, address: *mut u8) {
        self.allocated_blocks -= 1;

        mark_free(address, address.add(self.allocation_size));

        let mut header = FreeBlock { token: VALIDATION_TOKEN, next_offset: NO_NEXT_BLOCK };

        if !self.next_free_block.is_null() {
            let head = self.next_free_block.read();
            assert!(
                head.token == VALIDATION_TOKEN,
                "corrupt free-block header at {:p}",
                self.next_free_block
            );
            header.next_offset = (self.next_free_block as usize - self.base() as usize) as u16;
        }

        let block = address as *mut FreeBlock;
        block.write(header);
        self.next_free_block = block;
    }
}

/// Head of an intrusive page list.
struct PageList {
    head: *mut FsaPage,
}

impl PageList {
    const fn new() -> PageList {
        PageList { head: core::ptr::null_mut() }
    }

    /// # Safety
    /// `page` must be live and not a member of any list.
    unsafe fn push_front(&mut self, page: *mut FsaPage) {
        (*page).prev_page = core::ptr::null_mut();
        (*page).next_page = self.head;
        if !self.head.is_null() {
            (*self.head).prev_page = page;
        }
        self.head = page;
    }

    /// # Safety
    /// `page` must be a member of this list.
    unsafe fn unlink(&mut self, page: *mut FsaPage) {
        if (*page).prev_page.is_null() {
            debug_assert!(self.head == page);
            self.head = (*page).next_page;
        } else {
            (*(*page).prev_page).next_page = (*page).next_page;
        }
        if !(*page).next_page.is_null() {
            (*(*page).next_page).prev_page = (*page).prev_page;
        }
        (*page).prev_page = core::ptr::null_mut();
        (*page).next_page = core::ptr::null_mut();
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn iter(&self) -> PageListIter {
        PageListIter { cursor: self.head }
    }
}

struct PageListIter {
    cursor: *mut FsaPage,
}

impl Iterator for PageListIter {
    type Item = *mut FsaPage;

    fn next(&mut self) -> Option<*mut FsaPage> {
        if self.cursor.is_null() {
            return None;
        }
        let page = self.cursor;
        // SAFETY: list members are live pages.
        self.cursor = unsafe { (*page).next_page };
        Some(page)
    }
}

/// Pool for one allocation size, backed by a shared [`PageAllocator`].
///
/// Not internally locked; the owning strategy serializes access.
pub struct FixedSizeAllocator {
    pool: Arc<PageAllocator>,
    allocation_size: usize,
    /// Pages with at least one free block; the front page serves
    /// allocations.
    free_pages: PageList,
    /// Pages with no free block.
    full_pages: PageList,
}

// Page pointers refer into the pool's reservation, which the Arc keeps
// alive; the owning strategy serializes access.
unsafe impl Send for FixedSizeAllocator {}

impl FixedSizeAllocator {
    /// `allocation_size` is rounded up to at least
    /// [`MIN_ALLOCATION_SIZE`] and to 8-byte granularity.
    pub fn new(allocation_size: usize, pool: Arc<PageAllocator>) -> FixedSizeAllocator {
        assert!(pool.page_size() <= MAX_PAGE_SIZE);

        let allocation_size =
            align_up(allocation_size.max(MIN_ALLOCATION_SIZE), MIN_ALLOCATION_SIZE);

        FixedSizeAllocator {
            pool,
            allocation_size,
            free_pages: PageList::new(),
            full_pages: PageList::new(),
        }
    }

    pub fn allocation_size(&self) -> usize {
        self.allocation_size
    }

    pub fn allocate(&mut self) -> Result<NonNull<u8>, AllocationError> {
        if self.free_pages.is_empty() {
            self.allocate_page()?;
        }

        let page = self.free_pages.head;

        // SAFETY: pages in the free set are live and exclusively ours.
        unsafe {
            let block = (*page)
                .allocate()
                .expect("page in the free set has no free block");

            if (*page).is_full() {
                self.free_pages.unlink(page);
                self.full_pages.push_front(page);
            }

            Ok(NonNull::new_unchecked(block))
        }
    }

    pub fn free(&mut self, address: *mut u8) {
        let page = unsafe { FsaPage::from_address(address, &self.pool) }
            .unwrap_or_else(|| panic!("free of {:p} outside the backing pool", address));
        assert!(
            self.pool.is_allocated(address),
            "free of {:p} on a page that is not live",
            address
        );

        // SAFETY: the address maps to a live page of our pool.
        unsafe {
            assert!(
                (*page).allocation_size == self.allocation_size,
                "free of {:p} through an allocator of size {} (block size {})",
                address,
                self.allocation_size,
                (*page).allocation_size
            );

            let was_full = (*page).is_full();

            (*page).free(address);

            if was_full {
                self.full_pages.unlink(page);
                self.free_pages.push_front(page);
                trace!("page {:p} is partial again", page);
            }

            if (*page).allocated_blocks == 0 {
                self.free_pages.unlink(page);
                self.pool.free(page as *mut u8);
                trace!("page {:p} is empty, returned to the pool", page);
            }
        }
    }

    fn allocate_page(&mut self) -> Result<(), AllocationError> {
        let address = self.pool.allocate()?;

        // SAFETY: a freshly committed page, exclusively ours.
        unsafe {
            let page =
                FsaPage::init(address.as_ptr(), self.pool.page_size(), self.allocation_size);
            self.free_pages.push_front(page);
        }

        trace!(
            "requested a page of size {} from the pool for blocks of {}",
            self.pool.page_size(),
            self.allocation_size
        );
        Ok(())
    }

    /// Bytes handed out from pages that still have free blocks. Used by the
    /// strategies' wasted-memory accounting.
    pub fn allocated_memory_in_partial_pages(&self) -> usize {
        self.free_pages
            .iter()
            // SAFETY: pages in the free set are live.
            .map(|page| unsafe { (*page).allocated_blocks * (*page).allocation_size })
            .sum()
    }

    pub fn partial_page_count(&self) -> usize {
        self.free_pages.iter().count()
    }

    /// Bytes handed out across all of this allocator's pages.
    pub fn allocated_memory(&self) -> usize {
        let full: usize = self
            .full_pages
            .iter()
            // SAFETY: pages in the full set are live.
            .map(|page| unsafe { (*page).allocated_blocks * (*page).allocation_size })
            .sum();
        full + self.allocated_memory_in_partial_pages()
    }

    #[cfg(test)]
    fn free_list_len(page: *const FsaPage) -> usize {
        let mut len = 0;
        unsafe {
            let base = (*page).base();
            let mut cursor = (*page).next_free_block;
            while !cursor.is_null() {
                let header = cursor.read();
                assert_eq!(header.token, VALIDATION_TOKEN);
                len += 1;
                cursor = if header.next_offset != NO_NEXT_BLOCK {
                    base.add(header.next_offset as usize) as *mut FreeBlock
                } else {
                    core::ptr::null_mut()
                };
            }
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pages: usize, page_size: usize) -> Arc<PageAllocator> {
        Arc::new(PageAllocator::new(pages * page_size, page_size).unwrap())
    }

    #[test]
    fn allocation_size_is_rounded() {
        let fsa = FixedSizeAllocator::new(1, pool(4, 4096));
        assert_eq!(fsa.allocation_size(), 8);

        let fsa = FixedSizeAllocator::new(20, pool(4, 4096));
        assert_eq!(fsa.allocation_size(), 24);
    }

    #[test]
    fn blocks_come_from_one_page_until_full() {
        let backing = pool(8, 4096);
        let mut fsa = FixedSizeAllocator::new(64, Arc::clone(&backing));

        let a = fsa.allocate().unwrap().as_ptr();
        let b = fsa.allocate().unwrap().as_ptr();

        assert_eq!(backing.allocated_pages(), 1);
        assert_eq!(b as usize - a as usize, 64);
    }

    #[test]
    fn page_free_list_invariant() {
        let backing = pool(8, 4096);
        let mut fsa = FixedSizeAllocator::new(32, Arc::clone(&backing));

        let first = fsa.allocate().unwrap().as_ptr();
        let page = unsafe { FsaPage::from_address(first, &backing) }.unwrap();
        let max = unsafe { (*page).max_allocations() };

        let mut live = vec![first];
        for _ in 1..max {
            live.push(fsa.allocate().unwrap().as_ptr());
            let allocated = unsafe { (*page).allocated_blocks() };
            assert_eq!(FixedSizeAllocator::free_list_len(page), max - allocated);
        }
        assert!(unsafe { (*page).is_full() });

        for (index, block) in live.drain(..).enumerate() {
            fsa.free(block);
            if index + 1 < max {
                let allocated = unsafe { (*page).allocated_blocks() };
                assert_eq!(FixedSizeAllocator::free_list_len(page), max - allocated);
            }
        }
    }

    #[test]
    fn empty_page_returns_to_the_pool() {
        let backing = pool(8, 4096);
        let mut fsa = FixedSizeAllocator::new(128, Arc::clone(&backing));

        let a = fsa.allocate().unwrap().as_ptr();
        let b = fsa.allocate().unwrap().as_ptr();
        assert_eq!(backing.allocated_pages(), 1);

        fsa.free(a);
        assert_eq!(backing.allocated_pages(), 1);
        fsa.free(b);
        assert_eq!(backing.allocated_pages(), 0);
    }

    #[test]
    fn one_block_per_page_when_size_fills_it() {
        let backing = pool(8, 4096);
        // The header rounds up to one block slot; only one 2048-byte block
        // fits after it in a 4 KiB page.
        let mut fsa = FixedSizeAllocator::new(2048, Arc::clone(&backing));

        let a = fsa.allocate().unwrap().as_ptr();
        let page = unsafe { FsaPage::from_address(a, &backing) }.unwrap();
        assert_eq!(unsafe { (*page).max_allocations() }, 1);

        let b = fsa.allocate().unwrap().as_ptr();
        assert_eq!(backing.allocated_pages(), 2);

        // Freeing the single block of a full page hands the page back.
        fsa.free(a);
        fsa.free(b);
        assert_eq!(backing.allocated_pages(), 0);
    }

    #[test]
    fn partial_page_accounting() {
        let backing = pool(8, 4096);
        let mut fsa = FixedSizeAllocator::new(256, Arc::clone(&backing));

        let _a = fsa.allocate().unwrap();
        let _b = fsa.allocate().unwrap();

        assert_eq!(fsa.partial_page_count(), 1);
        assert_eq!(fsa.allocated_memory_in_partial_pages(), 512);
    }

    #[test]
    #[should_panic]
    fn cross_allocator_free_is_detected() {
        let backing = pool(8, 4096);
        let mut fsa32 = FixedSizeAllocator::new(32, Arc::clone(&backing));
        let mut fsa64 = FixedSizeAllocator::new(64, Arc::clone(&backing));

        let block = fsa32.allocate().unwrap().as_ptr();
        fsa64.free(block);
    }

    #[test]
    fn churn() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut rng = rand::rngs::SmallRng::seed_from_u64(0x5AB);

        let page_size = 16 * 1024;
        let backing = pool(64, page_size);
        let mut fsa = FixedSizeAllocator::new(24, Arc::clone(&backing));

        let mut live: Vec<*mut u8> = (0..3000)
            .map(|_| fsa.allocate().unwrap().as_ptr())
            .collect();

        for block in &live {
            assert_eq!(*block as usize % 8, 0);
        }

        live.shuffle(&mut rng);
        for block in live.drain(..1500) {
            fsa.free(block);
        }

        for _ in 0..3000 {
            live.push(fsa.allocate().unwrap().as_ptr());
        }
        assert_eq!(live.len(), 4500);

        // Counts stayed consistent: every live page accounts for its blocks.
        let mut pages: Vec<*mut FsaPage> = live
            .iter()
            .map(|&block| unsafe { FsaPage::from_address(block, &backing) }.unwrap())
            .collect();
        pages.sort();
        pages.dedup();

        let total: usize = pages
            .iter()
            .map(|&page| unsafe { (*page).allocated_blocks() })
            .sum();
        assert_eq!(total, 4500);

        for block in live {
            fsa.free(block);
        }
        assert_eq!(backing.allocated_pages(), 0);
    }
}
