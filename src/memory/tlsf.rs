//! Two-Level Segregated Fit allocator.
//!
//! Free blocks are indexed by a `FL x SL` matrix of lists: the first level
//! splits sizes by power of two, the second subdivides each power linearly
//! into [`SL_COUNT`] classes. Two bitmaps (one over first levels, one per
//! first level over its sub-lists) make "find the smallest class that
//! certainly fits" a pair of bit scans.
//!
//! Physical neighbors are reached through the `prev_physical` pointer and
//! size-step arithmetic; free neighbors through the embedded doubly-linked
//! list. Coalescing is eager on free, so no two physically adjacent blocks
//! are ever both free. Every backing page ends in a zero-size used sentinel
//! so a right-merge never walks onto the next page.

use core::ptr::NonNull;
use std::sync::Arc;

use log::trace;
use spin::Mutex;

use crate::error::AllocationError;
use crate::memory::page::PageAllocator;
use crate::memory::vmem::VirtualMemoryRegion;
use crate::memory::{align_up, mark_free, mark_uninitialized, AllocatorStatistics, MemoryRange};
use crate::PowersOf2;

/// Number of first-level (power-of-two) classes.
pub const FL_COUNT: usize = 10;

/// log2 of the number of second-level subdivisions.
pub const SL_LOG2: usize = 4;

/// Second-level subdivisions per first level.
pub const SL_COUNT: usize = 1 << SL_LOG2;

/// log2 of the smallest block; first-level class 0 covers
/// `[MIN_BLOCK_SIZE, 2 * MIN_BLOCK_SIZE)`.
const START_FL: usize = 8;

/// Smallest block the directory manages; must hold the full header.
pub const MIN_BLOCK_SIZE: usize = 256;

/// Largest single allocation the directory serves.
pub const MAX_ALLOCATION_SIZE: usize = 1 << (START_FL + FL_COUNT - 2);

/// Size of the pages requested from the backing page allocator.
pub const BACKING_PAGE_SIZE: usize = 2 * MAX_ALLOCATION_SIZE;

/// Header bytes in front of every payload; padded so payloads stay
/// 16-aligned.
const HEADER_SIZE: usize = 48;

/// All block sizes are multiples of this.
const GRANULARITY: usize = 16;

const FLAG_FREE: usize = 1;
const FLAG_PREV_FREE: usize = 1 << 1;
/// Validation token carried in the high bits of the flags word.
const FLAG_TOKEN: usize = 0xB10C << 16;
const FLAG_BITS: usize = FLAG_FREE | FLAG_PREV_FREE;

/// Block header; `prev_free`/`next_free` are meaningful only while the
/// block is free.
#[repr(C)]
struct BlockHeader {
    prev_physical: *mut BlockHeader,
    /// Whole block size, header included; a multiple of [`GRANULARITY`].
    size: usize,
    flags: usize,
    prev_free: *mut BlockHeader,
    next_free: *mut BlockHeader,
}

const_assert!(core::mem::size_of::<BlockHeader>() <= HEADER_SIZE);
const_assert!(MIN_BLOCK_SIZE >= HEADER_SIZE + GRANULARITY);
const_assert_eq!(MAX_ALLOCATION_SIZE, 64 * 1024);
const_assert_eq!(BACKING_PAGE_SIZE, 128 * 1024);

impl BlockHeader {
    fn is_free(&self) -> bool {
        self.flags & FLAG_FREE != 0
    }

    fn is_prev_free(&self) -> bool {
        self.flags & FLAG_PREV_FREE != 0
    }

    fn is_sentinel(&self) -> bool {
        self.size == 0
    }

    fn set_prev_free(&mut self, value: bool) {
        if value {
            self.flags |= FLAG_PREV_FREE;
        } else {
            self.flags &= !FLAG_PREV_FREE;
        }
    }

    fn validate(&self) {
        assert!(
            self.flags & !FLAG_BITS == FLAG_TOKEN,
            "corrupt block header at {:p} (flags {:#x})",
            self,
            self.flags
        );
    }

    fn payload(&mut self) -> *mut u8 {
        (self as *mut BlockHeader as *mut u8).wrapping_add(HEADER_SIZE)
    }

    fn end(&self) -> *mut u8 {
        (self as *const BlockHeader as *mut u8).wrapping_add(self.size)
    }
}

/// Class a block of exactly `size` belongs in.
fn mapping_insert(size: usize) -> (usize, usize) {
    debug_assert!(size >= MIN_BLOCK_SIZE);

    let fl_raw = size.log2() as usize;
    let sl = (size ^ (1 << fl_raw)) >> (fl_raw - SL_LOG2);
    let fl = fl_raw - START_FL;

    debug_assert!(fl < FL_COUNT && sl < SL_COUNT);
    (fl, sl)
}

/// Class to *search* for a request of `size`: rounded up one sub-class so
/// any block found is guaranteed to fit.
fn mapping_search(size: usize) -> (usize, usize) {
    debug_assert!(size >= MIN_BLOCK_SIZE);

    let fl_raw = size.log2() as usize;
    let rounded = size + (1 << (fl_raw - SL_LOG2)) - 1;
    mapping_insert(rounded)
}

struct TlsfInner {
    pool: PageAllocator,
    free_lists: [[*mut BlockHeader; SL_COUNT]; FL_COUNT],
    fl_bitmap: u16,
    sl_bitmaps: [u16; FL_COUNT],
    allocated_bytes: usize,
}

// Raw pointers refer into the pool's reservation; access is serialized by
// the outer lock.
unsafe impl Send for TlsfInner {}

impl TlsfInner {
    fn new(pool: PageAllocator) -> TlsfInner {
        TlsfInner {
            pool,
            free_lists: [[core::ptr::null_mut(); SL_COUNT]; FL_COUNT],
            fl_bitmap: 0,
            sl_bitmaps: [0; FL_COUNT],
            allocated_bytes: 0,
        }
    }

    /// The non-empty class that certainly fits a request mapped to
    /// `(fl, sl)`, if any.
    fn find_suitable_block(&self, fl: usize, sl: usize) -> Option<(usize, usize)> {
        let masked = self.sl_bitmaps[fl] & !((1u16 << sl) - 1);
        if masked != 0 {
            return Some((fl, masked.trailing_zeros() as usize));
        }

        let masked = self.fl_bitmap & !((1u16 << (fl + 1)) - 1);
        if masked != 0 {
            let fl = masked.trailing_zeros() as usize;
            let sl = self.sl_bitmaps[fl].trailing_zeros() as usize;
            debug_assert!(sl < SL_COUNT);
            return Some((fl, sl));
        }

        None
    }

    /// Commit one backing page and hand it to the directory as a single
    /// free block with a trailing sentinel.
    fn grow(&mut self) -> Result<(), AllocationError> {
        let page = self
            .pool
            .allocate()
            .map_err(|_| AllocationError::OutOfMemory { size: BACKING_PAGE_SIZE })?
            .as_ptr();

        let page_size = self.pool.page_size();
        let block_size = page_size - HEADER_SIZE;

        // SAFETY: a freshly committed page, exclusively ours.
        unsafe {
            let block = page as *mut BlockHeader;
            block.write(BlockHeader {
                prev_physical: core::ptr::null_mut(),
                size: block_size,
                flags: FLAG_TOKEN,
                prev_free: core::ptr::null_mut(),
                next_free: core::ptr::null_mut(),
            });

            let sentinel = page.add(block_size) as *mut BlockHeader;
            sentinel.write(BlockHeader {
                prev_physical: core::ptr::null_mut(),
                size: 0,
                flags: FLAG_TOKEN,
                prev_free: core::ptr::null_mut(),
                next_free: core::ptr::null_mut(),
            });

            self.insert_free(block);
        }

        trace!("grew the heap by one {} byte page at {:p}", page_size, page);
        Ok(())
    }

    /// Mark `block` free, fix up its physical successor, and index it.
    ///
    /// # Safety
    /// `block` must be a live, unindexed block with no free physical
    /// predecessor.
    unsafe fn insert_free(&mut self, block: *mut BlockHeader) {
        (*block).flags = FLAG_TOKEN | FLAG_FREE;

        let successor = (*block).end() as *mut BlockHeader;
        (*successor).prev_physical = block;
        (*successor).set_prev_free(true);

        self.add_block(block);
    }

    /// Link `block` at the head of its class list and set the bitmaps.
    ///
    /// # Safety
    /// `block` must be free and not currently indexed.
    unsafe fn add_block(&mut self, block: *mut BlockHeader) {
        let (fl, sl) = mapping_insert((*block).size);

        let head = self.free_lists[fl][sl];
        (*block).prev_free = core::ptr::null_mut();
        (*block).next_free = head;
        if !head.is_null() {
            (*head).prev_free = block;
        }

        self.free_lists[fl][sl] = block;
        self.sl_bitmaps[fl] |= 1 << sl;
        self.fl_bitmap |= 1 << fl;
    }

    /// Unlink `block` from its class list and clear emptied bitmap bits.
    ///
    /// # Safety
    /// `block` must be indexed in the directory.
    unsafe fn remove_block(&mut self, block: *mut BlockHeader) {
        let (fl, sl) = mapping_insert((*block).size);

        if (*block).prev_free.is_null() {
            debug_assert!(self.free_lists[fl][sl] == block);
            self.free_lists[fl][sl] = (*block).next_free;

            if (*block).next_free.is_null() {
                self.sl_bitmaps[fl] &= !(1 << sl);
                if self.sl_bitmaps[fl] == 0 {
                    self.fl_bitmap &= !(1 << fl);
                }
            }
        } else {
            (*(*block).prev_free).next_free = (*block).next_free;
        }

        if !(*block).next_free.is_null() {
            (*(*block).next_free).prev_free = (*block).prev_free;
        }

        (*block).prev_free = core::ptr::null_mut();
        (*block).next_free = core::ptr::null_mut();
    }

    fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocationError> {
        debug_assert!(size > 0);
        debug_assert!(
            alignment <= GRANULARITY,
            "route alignments over {} to the direct strategy",
            GRANULARITY
        );

        let payload = align_up(size, GRANULARITY.max(alignment));
        if payload > MAX_ALLOCATION_SIZE {
            return Err(AllocationError::OutOfMemory { size });
        }

        let block_size = (payload + HEADER_SIZE).max(MIN_BLOCK_SIZE);
        let (fl, sl) = mapping_search(block_size);

        let (fl, sl) = loop {
            if let Some(found) = self.find_suitable_block(fl, sl) {
                break found;
            }
            self.grow()?;
        };

        // SAFETY: the bitmaps guarantee a non-empty list; the block came
        // from the directory and is exclusively ours once unlinked.
        unsafe {
            let block = self.free_lists[fl][sl];
            debug_assert!(!block.is_null());
            (*block).validate();
            self.remove_block(block);

            let total = (*block).size;
            if total - block_size >= MIN_BLOCK_SIZE {
                // Split: shrink the block and index the remainder.
                (*block).size = block_size;

                let remainder = (block as *mut u8).add(block_size) as *mut BlockHeader;
                remainder.write(BlockHeader {
                    prev_physical: block,
                    size: total - block_size,
                    flags: FLAG_TOKEN,
                    prev_free: core::ptr::null_mut(),
                    next_free: core::ptr::null_mut(),
                });

                self.insert_free(remainder);
            } else {
                // Handed out whole: the successor's predecessor is now used.
                let successor = (*block).end() as *mut BlockHeader;
                (*successor).set_prev_free(false);
            }

            // A block popped from the directory never has a free physical
            // predecessor.
            (*block).flags = FLAG_TOKEN;

            self.allocated_bytes += (*block).size;

            let payload_ptr = (*block).payload();
            mark_uninitialized(payload_ptr, (*block).end());

            Ok(NonNull::new_unchecked(payload_ptr))
        }
    }

    fn deallocate(&mut self, address: *mut u8) {
        // SAFETY: the payload pointer was handed out by allocate; the
        // header sits immediately before it.
        unsafe {
            let mut block = address.sub(HEADER_SIZE) as *mut BlockHeader;

            (*block).validate();
            assert!(!(*block).is_free(), "double free of {:p}", address);
            assert!(!(*block).is_sentinel(), "free of a boundary block at {:p}", address);

            self.allocated_bytes -= (*block).size;

            if (*block).is_prev_free() {
                let previous = (*block).prev_physical;
                debug_assert!(!previous.is_null());
                (*previous).validate();
                debug_assert!((*previous).is_free());

                self.remove_block(previous);
                (*previous).size += (*block).size;
                block = previous;
            }

            let next = (*block).end() as *mut BlockHeader;
            (*next).validate();
            if !(*next).is_sentinel() && (*next).is_free() {
                self.remove_block(next);
                (*block).size += (*next).size;
            }

            mark_free((*block).payload(), (*block).end());
            self.insert_free(block);

            #[cfg(feature = "tlsf-decommit")]
            self.try_release_page(block);
        }
    }

    /// Return a wholly-free backing page to the page allocator.
    #[cfg(feature = "tlsf-decommit")]
    unsafe fn try_release_page(&mut self, block: *mut BlockHeader) {
        let page_size = self.pool.page_size();
        let base = block as *mut u8;

        if (*block).size == page_size - HEADER_SIZE
            && self.pool.page_address(base) == Some(base)
        {
            self.remove_block(block);
            self.pool.free(base);
            trace!("released a wholly free backing page at {:p}", base);
        }
    }

    #[cfg(test)]
    fn verify(&self) {
        for fl in 0..FL_COUNT {
            let mut any_sl = false;

            for sl in 0..SL_COUNT {
                let head = self.free_lists[fl][sl];
                let bit_set = self.sl_bitmaps[fl] & (1 << sl) != 0;
                assert_eq!(!head.is_null(), bit_set, "bitmap out of sync at ({}, {})", fl, sl);
                any_sl |= bit_set;

                let mut previous: *mut BlockHeader = core::ptr::null_mut();
                let mut cursor = head;
                while !cursor.is_null() {
                    unsafe {
                        (*cursor).validate();
                        assert!((*cursor).is_free());
                        assert_eq!(mapping_insert((*cursor).size), (fl, sl));
                        assert_eq!((*cursor).prev_free, previous);

                        // Physical neighbors of a free block are never free.
                        let successor = (*cursor).end() as *mut BlockHeader;
                        assert!((*successor).is_sentinel() || !(*successor).is_free());
                        assert!((*successor).is_prev_free());

                        previous = cursor;
                        cursor = (*cursor).next_free;
                    }
                }
            }

            assert_eq!(any_sl, self.fl_bitmap & (1 << fl) != 0);
        }
    }
}

/// General-purpose allocator for the `[256 B, 64 KiB]` band.
///
/// Thread-safe: one lock serializes the directory and the page backing.
pub struct TlsfAllocator {
    inner: Mutex<TlsfInner>,
    range: MemoryRange,
}

unsafe impl Sync for TlsfAllocator {}

impl TlsfAllocator {
    /// An allocator with its own reservation of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<TlsfAllocator, AllocationError> {
        let pool = PageAllocator::new(capacity, BACKING_PAGE_SIZE)?;
        Ok(Self::with_pool(pool))
    }

    /// An allocator over `sub_range` of a shared region.
    pub fn shared(region: Arc<VirtualMemoryRegion>, sub_range: MemoryRange) -> TlsfAllocator {
        Self::with_pool(PageAllocator::shared(region, sub_range, BACKING_PAGE_SIZE))
    }

    fn with_pool(pool: PageAllocator) -> TlsfAllocator {
        let range = pool.range();
        TlsfAllocator {
            inner: Mutex::new(TlsfInner::new(pool)),
            range,
        }
    }

    pub const fn min_allocation_size() -> usize {
        MIN_BLOCK_SIZE
    }

    pub const fn max_allocation_size() -> usize {
        MAX_ALLOCATION_SIZE
    }

    /// Allocate `size` bytes aligned to `alignment` (at most 16).
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocationError> {
        self.inner.lock().allocate(size, alignment)
    }

    /// Free a pointer previously returned by [`allocate`](Self::allocate).
    /// Returns false when the pointer is outside this allocator's range.
    pub fn free(&self, address: *mut u8) -> bool {
        if !self.owns(address) {
            return false;
        }
        self.inner.lock().deallocate(address);
        true
    }

    pub fn owns(&self, address: *const u8) -> bool {
        self.range.contains(address)
    }

    pub fn allocated_memory(&self) -> usize {
        self.inner.lock().allocated_bytes
    }

    pub fn committed_memory(&self) -> usize {
        self.inner.lock().pool.committed_memory()
    }

    #[cfg(test)]
    fn verify(&self) {
        self.inner.lock().verify()
    }
}

impl AllocatorStatistics for TlsfAllocator {
    fn allocated(&self) -> usize {
        self.allocated_memory()
    }

    fn size(&self) -> usize {
        self.committed_memory()
    }

    fn capacity(&self) -> usize {
        self.range.size()
    }
}
