//! Thin façade over the OS virtual-memory primitives.
//!
//! The four-state page lifecycle (Free -> Reserved -> Committed ->
//! Reserved -> Free) maps onto unix as follows: reserve is an anonymous
//! `PROT_NONE` mapping, commit re-protects to read/write, decommit drops the
//! backing with `MADV_DONTNEED` and re-protects to `PROT_NONE`, release
//! unmaps. Reservations are whole-region: a region is never partially
//! released and never resized.
//!
//! Commit and decommit failures are programming errors (the caller is
//! expected to stay inside a reserved range) and abort; only reservation
//! exhaustion is surfaced as a `Result`.

use core::ptr::NonNull;

use lazy_static::lazy_static;
use log::{error, trace};

use crate::error::AllocationError;
use crate::memory::{align_up, memory_status, DataSize, MemoryRange};

lazy_static! {
    /// OS page granularity, queried once per process.
    static ref OS_PAGE_SIZE: usize = os::page_size();

    /// Base address -> reservation size, for whole-region release. Backed by
    /// its own raw mapping: the reserve/release path must never allocate
    /// from the heap it underpins.
    static ref RESERVATIONS: spin::Mutex<RegionRegistry> =
        spin::Mutex::new(RegionRegistry::new());
}

/// A flat (base, size) table in a dedicated raw mapping, committed as it
/// grows. The table never allocates from the heap, so it is safe to use on
/// paths the heap itself depends on. Lookups and removals are linear scans;
/// these tables hold tens to a few thousand entries, not millions.
pub(crate) struct RegionRegistry {
    slots: *mut (usize, usize),
    capacity: usize,
    committed_bytes: usize,
    len: usize,
}

// Guarded by whatever lock owns the registry.
unsafe impl Send for RegionRegistry {}

impl RegionRegistry {
    /// Enough for 64Ki live entries.
    const RESERVED_BYTES: usize = 1024 * 1024;

    pub(crate) fn new() -> RegionRegistry {
        let slots = os::reserve(Self::RESERVED_BYTES)
            .expect("couldn't reserve the region registry")
            .as_ptr() as *mut (usize, usize);

        RegionRegistry {
            slots,
            capacity: Self::RESERVED_BYTES / core::mem::size_of::<(usize, usize)>(),
            committed_bytes: 0,
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, base: usize, size: usize) {
        assert!(self.len < self.capacity, "region registry exhausted");

        let needed = (self.len + 1) * core::mem::size_of::<(usize, usize)>();
        if needed > self.committed_bytes {
            let page = *OS_PAGE_SIZE;
            // SAFETY: committing inside our own reservation.
            let ok = os::commit(
                (self.slots as *mut u8).wrapping_add(self.committed_bytes),
                page,
            );
            assert!(ok, "couldn't grow the region registry");
            self.committed_bytes += page;
        }

        // SAFETY: the slot is committed and unused.
        unsafe { self.slots.add(self.len).write((base, size)) };
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, base: usize) -> Option<usize> {
        for index in 0..self.len {
            // SAFETY: slots below len are committed and initialized.
            let (slot_base, slot_size) = unsafe { self.slots.add(index).read() };
            if slot_base == base {
                self.len -= 1;
                if index != self.len {
                    // SAFETY: both slots are committed and initialized.
                    unsafe { self.slots.add(index).write(self.slots.add(self.len).read()) };
                }
                return Some(slot_size);
            }
        }
        None
    }

    /// The entry whose `[base, base + size)` range contains `address`.
    pub(crate) fn find_containing(&self, address: usize) -> Option<(usize, usize)> {
        for index in 0..self.len {
            // SAFETY: slots below len are committed and initialized.
            let (base, size) = unsafe { self.slots.add(index).read() };
            if base <= address && address < base + size {
                return Some((base, size));
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for RegionRegistry {
    fn drop(&mut self) {
        os::release(self.slots as *mut u8, Self::RESERVED_BYTES);
    }
}

/// Commit state of a queried address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    Free,
    Reserved,
    Committed,
}

/// Result of [`VirtualMemory::query`]: the state of the page containing the
/// address, and the contiguous same-state run around it. The range is
/// meaningless for `Free`.
#[derive(Debug, Clone, Copy)]
pub struct VirtualMemoryInformation {
    pub state: MemoryState,
    pub range: MemoryRange,
}

/// Namespace for the reserve/commit/decommit/release operations.
pub enum VirtualMemory {}

impl VirtualMemory {
    /// Reserve `size` bytes of address space, rounded up to page size.
    /// The pages are not backed by physical memory until committed.
    pub fn reserve(size: usize) -> Result<NonNull<u8>, AllocationError> {
        let aligned = Self::align_to_page_size(size);

        let base = os::reserve(aligned)
            .ok_or(AllocationError::OutOfAddressSpace { size: aligned })?;

        RESERVATIONS.lock().insert(base.as_ptr() as usize, aligned);

        trace!("reserved {} at {:p}", DataSize::from_bytes(aligned), base);
        Ok(base)
    }

    /// Reserve and commit in one call.
    pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocationError> {
        let aligned = Self::align_to_page_size(size);
        let base = Self::reserve(aligned)
            .map_err(|_| AllocationError::AllocationFailed { size: aligned })?;
        Self::commit(base.as_ptr(), aligned);
        Ok(base)
    }

    /// Release a whole previously reserved region. `address` must be the
    /// base returned by [`reserve`](Self::reserve). Returns false when the
    /// address is not a known reservation base.
    pub fn release(address: *mut u8) -> bool {
        let size = match RESERVATIONS.lock().remove(address as usize) {
            Some(size) => size,
            None => return false,
        };

        trace!("releasing {} at {:p}", DataSize::from_bytes(size), address);
        os::release(address, size)
    }

    /// Back `[address, address + size)` with physical memory. The range must
    /// lie inside a reservation.
    ///
    /// Aborts when the system is out of physical memory or the range is not
    /// reserved; commit failures are not surfaced up the stack.
    pub fn commit(address: *mut u8, size: usize) {
        let status = memory_status();
        if status.avail_phys < size {
            error!(
                "commit of {} refused, only {} physical memory available",
                DataSize::from_bytes(size),
                DataSize::from_bytes(status.avail_phys)
            );
            panic!("out of physical memory");
        }

        if !os::commit(address, size) {
            error!("commit({:p}, {}) failed", address, size);
            panic!("commit on unreserved memory");
        }

        trace!("committed {} at {:p}", DataSize::from_bytes(size), address);
    }

    /// Return `[address, address + size)` to the Reserved state without
    /// giving up the address space. The range must be fully committed.
    pub fn decommit(address: *mut u8, size: usize) {
        if !os::decommit(address, size) {
            error!("decommit({:p}, {}) failed", address, size);
            panic!("decommit on uncommitted memory");
        }

        trace!("decommitted {} at {:p}", DataSize::from_bytes(size), address);
    }

    /// OS page granularity.
    pub fn page_size() -> usize {
        *OS_PAGE_SIZE
    }

    /// Round `size` up to a whole number of OS pages.
    pub fn align_to_page_size(size: usize) -> usize {
        align_up(size, Self::page_size())
    }

    /// Commit state of the page containing `address`, plus the contiguous
    /// same-state run around it.
    #[cfg(target_os = "linux")]
    pub fn query(address: *const u8) -> VirtualMemoryInformation {
        // /proc/self/maps keeps one line per same-protection run; a PROT_NONE
        // run is a reservation, a readable one is committed.
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap_or_default();
        let addr = address as usize;

        for line in maps.lines() {
            let mut parts = line.split_whitespace();
            let range = match parts.next() {
                Some(r) => r,
                None => continue,
            };
            let perms = parts.next().unwrap_or("");

            let mut bounds = range.split('-');
            let begin = usize::from_str_radix(bounds.next().unwrap_or("0"), 16).unwrap_or(0);
            let end = usize::from_str_radix(bounds.next().unwrap_or("0"), 16).unwrap_or(0);

            if addr < begin || addr >= end {
                continue;
            }

            let state = if perms.starts_with("---") {
                MemoryState::Reserved
            } else {
                MemoryState::Committed
            };

            return VirtualMemoryInformation {
                state,
                range: MemoryRange::new(begin as *mut u8, end - begin),
            };
        }

        VirtualMemoryInformation {
            state: MemoryState::Free,
            range: MemoryRange::empty(),
        }
    }
}

/// Exclusive owner of one reserved region of address space.
///
/// The lifetime root for every allocator built on top: dropping the region
/// releases the whole range back to the OS. Never resized, never partially
/// released. Movable; not copyable.
pub struct VirtualMemoryRegion {
    range: MemoryRange,
}

// The region is an address range, not a live reference; the allocators
// layered on top serialize all access to the memory behind it.
unsafe impl Send for VirtualMemoryRegion {}
unsafe impl Sync for VirtualMemoryRegion {}

impl VirtualMemoryRegion {
    /// Reserve `capacity` bytes (rounded up to page size).
    pub fn new(capacity: usize) -> Result<VirtualMemoryRegion, AllocationError> {
        let aligned = VirtualMemory::align_to_page_size(capacity);
        let base = VirtualMemory::reserve(aligned)?;

        Ok(VirtualMemoryRegion {
            range: MemoryRange::new(base.as_ptr(), aligned),
        })
    }

    pub fn range(&self) -> MemoryRange {
        self.range
    }

    pub fn begin(&self) -> *mut u8 {
        self.range.begin()
    }

    pub fn end(&self) -> *mut u8 {
        self.range.end()
    }

    pub fn size(&self) -> usize {
        self.range.size()
    }
}

impl Drop for VirtualMemoryRegion {
    fn drop(&mut self) {
        if !self.range.begin().is_null() {
            VirtualMemory::release(self.range.begin());
        }
    }
}

#[cfg(unix)]
mod os {
    //! Raw unix bindings; every caller goes through [`VirtualMemory`].

    use core::ptr::{self, NonNull};

    pub fn page_size() -> usize {
        // SAFETY: sysconf with a valid name has no preconditions.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(result > 0, "sysconf(_SC_PAGESIZE) failed");
        result as usize
    }

    pub fn reserve(size: usize) -> Option<NonNull<u8>> {
        // SAFETY: a fresh anonymous mapping; PROT_NONE + MAP_NORESERVE keeps
        // it out of the commit charge until we re-protect it.
        let result = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if result == libc::MAP_FAILED {
            None
        } else {
            NonNull::new(result as *mut u8)
        }
    }

    pub fn commit(address: *mut u8, size: usize) -> bool {
        // SAFETY: re-protecting pages inside a mapping we reserved.
        unsafe { libc::mprotect(address as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }

    pub fn decommit(address: *mut u8, size: usize) -> bool {
        // Drop the backing first (while still accessible), then seal the
        // range so a stale pointer faults instead of reading zeroes.
        // SAFETY: the range lies inside a mapping we reserved.
        unsafe {
            libc::madvise(address as *mut libc::c_void, size, libc::MADV_DONTNEED) == 0
                && libc::mprotect(address as *mut libc::c_void, size, libc::PROT_NONE) == 0
        }
    }

    pub fn release(address: *mut u8, size: usize) -> bool {
        // SAFETY: address/size name one whole reservation.
        unsafe { libc::munmap(address as *mut libc::c_void, size) == 0 }
    }
}
