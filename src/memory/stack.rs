//! Monotonic allocators: the savepoint stack and the linear arena.
//!
//! Both reserve their whole capacity up front and commit pages as the top
//! advances. Neither locks: instances are owned by one thread (moving one to
//! another thread is fine, sharing one is not).
//!
//! [`StackAllocator::save_status`] pushes a savepoint *into the stack
//! itself*: an allocated pointer-sized slot holding the previous savepoint.
//! Restore is a single load. [`StackScope`] wraps a save/restore pair in an
//! RAII guard.

use core::ptr::NonNull;

use crate::error::AllocationError;
use crate::memory::vmem::{VirtualMemory, VirtualMemoryRegion};
use crate::memory::{align_up_ptr, mark_free, mark_uninitialized, AllocatorStatistics};

/// Bump allocator with savepoint/restore.
pub struct StackAllocator {
    region: VirtualMemoryRegion,
    /// Next free byte.
    top: *mut u8,
    /// First uncommitted byte.
    committed_end: *mut u8,
    /// Most recent savepoint slot, or null.
    last_savepoint: *mut u8,
}

// Owned by one thread at a time; the raw pointers refer into the owned
// region.
unsafe impl Send for StackAllocator {}

impl StackAllocator {
    /// Reserve `capacity` bytes and commit the first OS page eagerly.
    pub fn new(capacity: usize) -> Result<StackAllocator, AllocationError> {
        let region = VirtualMemoryRegion::new(capacity)?;
        let begin = region.begin();

        let page = VirtualMemory::page_size();
        VirtualMemory::commit(begin, page);

        Ok(StackAllocator {
            region,
            top: begin,
            committed_end: begin.wrapping_add(page),
            last_savepoint: core::ptr::null_mut(),
        })
    }

    /// Bump the top by `size` bytes aligned to `alignment`, committing new
    /// pages as needed.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocationError> {
        debug_assert!(size > 0);

        let aligned = align_up_ptr(self.top, alignment);
        let new_top = aligned.wrapping_add(size);

        if new_top as usize > self.region.end() as usize {
            return Err(AllocationError::OutOfMemory { size });
        }

        if new_top as usize > self.committed_end as usize {
            let commit_size =
                VirtualMemory::align_to_page_size(new_top as usize - self.committed_end as usize);
            VirtualMemory::commit(self.committed_end, commit_size);
            self.committed_end = self.committed_end.wrapping_add(commit_size);
        }

        // SAFETY: [aligned, new_top) was just bounds-checked and committed.
        unsafe { mark_uninitialized(aligned, new_top) };

        self.top = new_top;
        // SAFETY: aligned points into the reserved region, never null.
        Ok(unsafe { NonNull::new_unchecked(aligned) })
    }

    /// Truncate the stack down to `address`. Frees at or above the top are
    /// ignored; this is a truncation, not an arbitrary release.
    pub fn free(&mut self, address: *mut u8) -> bool {
        assert!(self.region.range().contains(address));

        if (address as usize) < self.top as usize {
            // Keep the savepoint chain consistent: drop savepoints that the
            // truncation wipes out.
            while !self.last_savepoint.is_null() && self.last_savepoint as usize >= address as usize
            {
                // SAFETY: live savepoint slots always hold the previous link.
                self.last_savepoint = unsafe { (self.last_savepoint as *const usize).read() } as *mut u8;
            }

            // SAFETY: [address, top) is committed stack memory.
            unsafe { mark_free(address, self.top) };
            self.top = address;
            return true;
        }

        false
    }

    /// Wipe the stack and decommit everything.
    pub fn reset(&mut self) {
        // SAFETY: [begin, top) is committed stack memory.
        unsafe { mark_free(self.region.begin(), self.top) };

        let committed = self.committed_memory();
        if committed > 0 {
            VirtualMemory::decommit(self.region.begin(), committed);
        }

        self.top = self.region.begin();
        self.committed_end = self.region.begin();
        self.last_savepoint = core::ptr::null_mut();
    }

    /// True when `address` lies below the current top.
    pub fn is_allocated(&self, address: *const u8) -> bool {
        self.region.range().contains(address) && (address as usize) < self.top as usize
    }

    /// Push a savepoint: a slot on the stack recording the previous one.
    pub fn save_status(&mut self) -> Result<(), AllocationError> {
        let previous = self.last_savepoint;

        let slot = self
            .allocate(core::mem::size_of::<usize>(), core::mem::align_of::<usize>())?
            .as_ptr();

        // SAFETY: the slot was just allocated on the stack.
        unsafe { (slot as *mut usize).write(previous as usize) };
        self.last_savepoint = slot;
        Ok(())
    }

    /// Rewind the top to the most recent savepoint. Nested saves unwind one
    /// level per call; without a savepoint this is a no-op.
    pub fn restore_status(&mut self) {
        if self.last_savepoint.is_null() {
            return;
        }

        let previous_top = self.top;
        self.top = self.last_savepoint;

        // SAFETY: the savepoint slot holds the previous link.
        self.last_savepoint = unsafe { (self.top as *const usize).read() } as *mut u8;

        // SAFETY: [top, previous_top) is committed stack memory.
        unsafe { mark_free(self.top, previous_top) };
    }

    /// Save now, restore when the returned guard drops.
    pub fn scope(&mut self) -> Result<StackScope<'_>, AllocationError> {
        self.save_status()?;
        Ok(StackScope { stack: self })
    }

    pub fn committed_memory(&self) -> usize {
        self.committed_end as usize - self.region.begin() as usize
    }

    pub fn allocated_memory(&self) -> usize {
        self.top as usize - self.region.begin() as usize
    }

    pub fn range(&self) -> crate::memory::MemoryRange {
        self.region.range()
    }

    #[cfg(test)]
    fn top(&self) -> *mut u8 {
        self.top
    }
}

impl AllocatorStatistics for StackAllocator {
    fn allocated(&self) -> usize {
        self.allocated_memory()
    }

    fn size(&self) -> usize {
        self.committed_memory()
    }

    fn capacity(&self) -> usize {
        self.region.size()
    }
}

/// RAII savepoint: restores the stack on scope exit.
pub struct StackScope<'a> {
    stack: &'a mut StackAllocator,
}

impl<'a> core::ops::Deref for StackScope<'a> {
    type Target = StackAllocator;

    fn deref(&self) -> &StackAllocator {
        self.stack
    }
}

impl<'a> core::ops::DerefMut for StackScope<'a> {
    fn deref_mut(&mut self) -> &mut StackAllocator {
        self.stack
    }
}

impl<'a> Drop for StackScope<'a> {
    fn drop(&mut self) {
        self.stack.restore_status();
    }
}

/// Allocate-only arena: no per-allocation free, only a wholesale reset.
pub struct LinearAllocator {
    region: VirtualMemoryRegion,
    cursor: *mut u8,
    committed_end: *mut u8,
}

unsafe impl Send for LinearAllocator {}

impl LinearAllocator {
    pub fn new(capacity: usize) -> Result<LinearAllocator, AllocationError> {
        let region = VirtualMemoryRegion::new(capacity)?;
        let begin = region.begin();

        Ok(LinearAllocator {
            region,
            cursor: begin,
            committed_end: begin,
        })
    }

    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocationError> {
        debug_assert!(size > 0);

        let aligned = align_up_ptr(self.cursor, alignment);
        let new_cursor = aligned.wrapping_add(size);

        if new_cursor as usize > self.region.end() as usize {
            return Err(AllocationError::OutOfMemory { size });
        }

        if new_cursor as usize > self.committed_end as usize {
            let commit_size = VirtualMemory::align_to_page_size(
                new_cursor as usize - self.committed_end as usize,
            );
            VirtualMemory::commit(self.committed_end, commit_size);
            self.committed_end = self.committed_end.wrapping_add(commit_size);
        }

        // SAFETY: [aligned, new_cursor) was just bounds-checked and
        // committed.
        unsafe { mark_uninitialized(aligned, new_cursor) };

        self.cursor = new_cursor;
        // SAFETY: aligned points into the reserved region, never null.
        Ok(unsafe { NonNull::new_unchecked(aligned) })
    }

    /// Wipe the arena and decommit everything.
    pub fn reset(&mut self) {
        // SAFETY: [begin, cursor) is committed arena memory.
        unsafe { mark_free(self.region.begin(), self.cursor) };

        let committed = self.committed_memory();
        if committed > 0 {
            VirtualMemory::decommit(self.region.begin(), committed);
        }

        self.cursor = self.region.begin();
        self.committed_end = self.region.begin();
    }

    pub fn is_allocated(&self, address: *const u8) -> bool {
        self.region.range().contains(address) && (address as usize) < self.cursor as usize
    }

    pub fn allocated_memory(&self) -> usize {
        self.cursor as usize - self.region.begin() as usize
    }

    pub fn remaining_memory(&self) -> usize {
        self.region.end() as usize - self.cursor as usize
    }

    pub fn committed_memory(&self) -> usize {
        self.committed_end as usize - self.region.begin() as usize
    }
}

impl AllocatorStatistics for LinearAllocator {
    fn allocated(&self) -> usize {
        self.allocated_memory()
    }

    fn size(&self) -> usize {
        self.committed_memory()
    }

    fn capacity(&self) -> usize {
        self.region.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: usize = 1024;
    const MIB: usize = 1024 * 1024;

    #[test]
    fn first_page_committed_eagerly() {
        let stack = StackAllocator::new(MIB).unwrap();
        assert_eq!(stack.committed_memory(), VirtualMemory::page_size());
        assert_eq!(stack.allocated_memory(), 0);
    }

    #[test]
    fn allocations_bump_and_align() {
        let mut stack = StackAllocator::new(MIB).unwrap();

        let a = stack.allocate(3, 1).unwrap().as_ptr();
        let b = stack.allocate(16, 16).unwrap().as_ptr();

        assert_eq!(b as usize % 16, 0);
        assert!(b as usize >= a as usize + 3);
        assert_eq!(stack.top(), unsafe { b.add(16) });
    }

    #[test]
    fn commit_grows_with_the_top() {
        let page = VirtualMemory::page_size();
        let mut stack = StackAllocator::new(MIB).unwrap();

        stack.allocate(3 * page, 1).unwrap();
        assert_eq!(stack.committed_memory(), 3 * page);

        // Invariant: begin <= top <= committed_end <= end.
        assert!(stack.allocated_memory() <= stack.committed_memory());
        assert!(stack.committed_memory() <= stack.range().size());
    }

    #[test]
    fn free_truncates() {
        let mut stack = StackAllocator::new(MIB).unwrap();

        let a = stack.allocate(64, 8).unwrap().as_ptr();
        let b = stack.allocate(64, 8).unwrap().as_ptr();

        assert!(StackAllocator::free(&mut stack, b));
        assert_eq!(stack.top(), b);
        assert!(stack.is_allocated(a));
        assert!(!stack.is_allocated(b));

        // A free at or above the top is ignored.
        assert!(!StackAllocator::free(&mut stack, b));
        assert_eq!(stack.top(), b);
    }

    #[test]
    fn savepoint_nesting() {
        let mut stack = StackAllocator::new(16 * MIB).unwrap();

        stack.allocate(MIB, 8).unwrap();
        let after_first = stack.top();

        stack.save_status().unwrap();
        stack.allocate(2 * MIB, 8).unwrap();
        stack.save_status().unwrap();
        stack.allocate(4 * MIB, 8).unwrap();

        stack.restore_status();
        stack.restore_status();

        assert_eq!(stack.top(), after_first);
    }

    #[test]
    fn restore_without_savepoint_is_a_noop() {
        let mut stack = StackAllocator::new(MIB).unwrap();
        stack.allocate(128, 8).unwrap();
        let top = stack.top();

        stack.restore_status();
        assert_eq!(stack.top(), top);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn restore_fills_freed_memory() {
        let mut stack = StackAllocator::new(MIB).unwrap();

        stack.save_status().unwrap();
        let data = stack.allocate(64, 8).unwrap().as_ptr();
        unsafe { data.write_bytes(0x11, 64) };

        stack.restore_status();

        // The rewound span carries the freed pattern; reading it is fine
        // because the pages stay committed.
        let bytes = unsafe { core::slice::from_raw_parts(data, 64) };
        assert!(bytes.iter().all(|&b| b == crate::memory::FREED_MEMORY_PATTERN));
    }

    #[test]
    fn scope_restores_on_drop() {
        let mut stack = StackAllocator::new(MIB).unwrap();
        stack.allocate(256, 8).unwrap();
        let before = stack.top();

        {
            let mut scope = stack.scope().unwrap();
            scope.allocate(4 * KIB, 8).unwrap();
        }

        assert_eq!(stack.top(), before);
    }

    #[test]
    fn free_below_savepoint_drops_it() {
        let mut stack = StackAllocator::new(MIB).unwrap();

        let base = stack.allocate(64, 8).unwrap().as_ptr();
        stack.save_status().unwrap();
        stack.allocate(64, 8).unwrap();

        StackAllocator::free(&mut stack, base);

        // The savepoint was wiped out by the truncation; restore must not
        // resurrect it.
        let top = stack.top();
        stack.restore_status();
        assert_eq!(stack.top(), top);
    }

    #[test]
    fn out_of_capacity_is_reported() {
        let page = VirtualMemory::page_size();
        let mut stack = StackAllocator::new(2 * page).unwrap();

        stack.allocate(2 * page, 1).unwrap();
        assert!(stack.allocate(1, 1).is_err());
    }

    #[test]
    fn reset_rewinds_and_decommits() {
        let page = VirtualMemory::page_size();
        let mut stack = StackAllocator::new(MIB).unwrap();
        stack.allocate(8 * page, 8).unwrap();

        stack.reset();
        assert_eq!(stack.allocated_memory(), 0);
        assert_eq!(stack.committed_memory(), 0);

        // Still usable: commit happens lazily again.
        stack.allocate(16, 8).unwrap();
        assert_eq!(stack.committed_memory(), page);
    }

    #[test]
    fn linear_allocate_and_reset() {
        let page = VirtualMemory::page_size();
        let mut arena = LinearAllocator::new(MIB).unwrap();

        assert_eq!(arena.committed_memory(), 0);
        let a = arena.allocate(100, 8).unwrap().as_ptr();
        assert!(arena.is_allocated(a));
        assert_eq!(arena.committed_memory(), page);
        assert_eq!(arena.remaining_memory(), MIB - 100);

        arena.reset();
        assert_eq!(arena.allocated_memory(), 0);
        assert_eq!(arena.committed_memory(), 0);
        assert!(!arena.is_allocated(a));
    }
}
