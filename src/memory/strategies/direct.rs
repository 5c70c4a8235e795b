//! Strategy for allocations too large for the pooled tiers.
//!
//! Every allocation is its own reserve-and-commit mapping, released whole on
//! free. Live bases are tracked in a self-backed table (the same kind the
//! virtual-memory layer uses for reservations) so ownership queries never
//! allocate from the heap they serve.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use log::trace;

use crate::error::AllocationError;
use crate::memory::vmem::{RegionRegistry, VirtualMemory};
use crate::memory::{mark_uninitialized, memory_status, DataSize};
use crate::sync::CriticalSection;

struct DirectInner {
    allocations: RegionRegistry,
    allocated_bytes: usize,
}

/// Whole-mapping allocator for requests above `min_allocation_size`.
pub struct DirectStrategy {
    section: CriticalSection,
    inner: UnsafeCell<DirectInner>,
    min_allocation_size: usize,
}

unsafe impl Send for DirectStrategy {}
unsafe impl Sync for DirectStrategy {}

impl DirectStrategy {
    pub fn new(min_allocation_size: usize) -> DirectStrategy {
        DirectStrategy {
            section: CriticalSection::new(),
            inner: UnsafeCell::new(DirectInner {
                allocations: RegionRegistry::new(),
                allocated_bytes: 0,
            }),
            min_allocation_size: VirtualMemory::align_to_page_size(min_allocation_size),
        }
    }

    pub fn min_allocation_size(&self) -> usize {
        self.min_allocation_size
    }

    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocationError> {
        debug_assert!(
            alignment <= VirtualMemory::page_size(),
            "direct mappings are page-aligned"
        );

        if size < self.min_allocation_size {
            return Err(AllocationError::AllocationFailed { size });
        }

        let allocation_size = VirtualMemory::align_to_page_size(size);
        assert!(
            allocation_size < memory_status().avail_phys,
            "direct allocation of {} exceeds available physical memory",
            DataSize::from_bytes(allocation_size)
        );

        let address = VirtualMemory::allocate(allocation_size)?;

        let _guard = self.section.enter();
        // SAFETY: inner is only touched under the critical section.
        let inner = unsafe { &mut *self.inner.get() };
        inner.allocations.insert(address.as_ptr() as usize, allocation_size);
        inner.allocated_bytes += allocation_size;

        // SAFETY: the mapping was just committed.
        unsafe { mark_uninitialized(address.as_ptr(), address.as_ptr().add(allocation_size)) };

        trace!(
            "direct allocation of {} at {:p}",
            DataSize::from_bytes(allocation_size),
            address
        );
        Ok(address)
    }

    /// Returns false when `address` is not a live direct mapping base.
    pub fn free(&self, address: *mut u8) -> bool {
        let removed = {
            let _guard = self.section.enter();
            // SAFETY: inner is only touched under the critical section.
            let inner = unsafe { &mut *self.inner.get() };

            match inner.allocations.remove(address as usize) {
                Some(size) => {
                    inner.allocated_bytes -= size;
                    true
                }
                None => false,
            }
        };

        if removed {
            VirtualMemory::release(address);
        }
        removed
    }

    /// True when `address` lies inside any live direct mapping.
    pub fn owns(&self, address: *const u8) -> bool {
        let _guard = self.section.enter();
        // SAFETY: inner is only touched under the critical section.
        let inner = unsafe { &*self.inner.get() };
        inner.allocations.find_containing(address as usize).is_some()
    }

    pub fn allocated_memory(&self) -> usize {
        let _guard = self.section.enter();
        unsafe { (*self.inner.get()).allocated_bytes }
    }

    pub fn allocation_count(&self) -> usize {
        let _guard = self.section.enter();
        unsafe { (*self.inner.get()).allocations.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn round_trip() {
        let direct = DirectStrategy::new(64 * 1024);

        let a = direct.allocate(2 * MIB, 8).unwrap().as_ptr();
        assert_eq!(a as usize % VirtualMemory::page_size(), 0);
        assert!(direct.owns(a));
        assert!(direct.owns(unsafe { a.add(MIB) }));
        assert_eq!(direct.allocated_memory(), 2 * MIB);

        unsafe { a.write_bytes(0x42, 2 * MIB) };

        assert!(direct.free(a));
        assert!(!direct.owns(a));
        assert_eq!(direct.allocated_memory(), 0);
    }

    #[test]
    fn undersized_request_is_refused() {
        let direct = DirectStrategy::new(64 * 1024);
        assert!(direct.allocate(4096, 8).is_err());
    }

    #[test]
    fn free_of_interior_pointer_is_refused() {
        let direct = DirectStrategy::new(64 * 1024);
        let a = direct.allocate(MIB, 8).unwrap().as_ptr();

        // Only the base releases the mapping.
        assert!(!direct.free(unsafe { a.add(4096) }));
        assert!(direct.free(a));
    }

    #[test]
    fn sizes_round_to_whole_pages() {
        let direct = DirectStrategy::new(64 * 1024);
        let a = direct.allocate(64 * 1024 + 1, 8).unwrap().as_ptr();
        assert_eq!(direct.allocated_memory(), 64 * 1024 + 4096);
        assert!(direct.free(a));
    }

    #[test]
    fn many_mappings_are_tracked() {
        let direct = DirectStrategy::new(64 * 1024);

        let mappings: Vec<*mut u8> = (0..32)
            .map(|_| direct.allocate(64 * 1024, 8).unwrap().as_ptr())
            .collect();
        assert_eq!(direct.allocation_count(), 32);

        for mapping in mappings {
            assert!(direct.free(mapping));
        }
        assert_eq!(direct.allocation_count(), 0);
    }
}
