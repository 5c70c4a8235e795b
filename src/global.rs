//! Process-wide allocator lifecycle.
//!
//! Two allocators exist for the life of the process: the `default`
//! allocator, a malloc-wrapping fallback that is always available, and the
//! `primary` [`TieredAllocator`], constructed lazily on first use. The
//! bootstrap problem is that constructing the primary allocator itself
//! allocates (slab tables, commit-tracker bitmaps): while the
//! `IS_CONSTRUCTING` flag is up, every request is served by the default
//! allocator instead.
//!
//! Frees try the primary allocator first and fall back to the default, so
//! bootstrap-era pointers are released correctly. Neither allocator is ever
//! torn down: static destructors may free memory after main, and the OS
//! reclaims everything at process exit anyway.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::error;
use spin::Once;

use crate::memory::strategies::tiered::TieredAllocator;

static DEFAULT_ALLOCATOR: TrackedMalloc = TrackedMalloc::new();
static PRIMARY_ALLOCATOR: Once<TieredAllocator> = Once::new();
static IS_CONSTRUCTING: AtomicBool = AtomicBool::new(false);

/// Runtime escape hatch (the `-use-default-malloc` engine flag): serve
/// everything from the default allocator.
static FORCE_DEFAULT: AtomicBool = AtomicBool::new(false);

/// Bypass the primary allocator for the rest of the process lifetime.
pub fn force_default_malloc() {
    FORCE_DEFAULT.store(true, Ordering::Release);
}

/// Undo [`force_default_malloc`].
pub fn use_engine_allocator() {
    FORCE_DEFAULT.store(false, Ordering::Release);
}

fn use_default_malloc() -> bool {
    static FROM_ENV: Once<bool> = Once::new();

    let from_env = *FROM_ENV.call_once(|| {
        // getenv, not std::env: this runs on the allocation path.
        let name = b"GMEM_USE_DEFAULT_MALLOC\0";
        !unsafe { libc::getenv(name.as_ptr() as *const libc::c_char) }.is_null()
    });

    from_env || FORCE_DEFAULT.load(Ordering::Acquire)
}

/// Allocation-tracking sinks; called around every successful global
/// operation. Compiled out in release builds.
pub type TrackAllocFn = fn(address: *mut u8, size: usize);
pub type TrackFreeFn = fn(address: *mut u8);

#[cfg(debug_assertions)]
static TRACK_ALLOC_HOOK: AtomicUsize = AtomicUsize::new(0);
#[cfg(debug_assertions)]
static TRACK_FREE_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Register tracking sinks. Only debug builds invoke them.
pub fn set_tracking_hooks(on_alloc: TrackAllocFn, on_free: TrackFreeFn) {
    #[cfg(debug_assertions)]
    {
        TRACK_ALLOC_HOOK.store(on_alloc as usize, Ordering::Release);
        TRACK_FREE_HOOK.store(on_free as usize, Ordering::Release);
    }
    #[cfg(not(debug_assertions))]
    let _ = (on_alloc, on_free);
}

#[inline]
fn track_alloc(address: *mut u8, size: usize) {
    #[cfg(debug_assertions)]
    {
        let hook = TRACK_ALLOC_HOOK.load(Ordering::Acquire);
        if hook != 0 {
            // SAFETY: only ever stored from a TrackAllocFn.
            let hook: TrackAllocFn = unsafe { core::mem::transmute(hook) };
            hook(address, size);
        }
    }
    #[cfg(not(debug_assertions))]
    let _ = (address, size);
}

#[inline]
fn track_free(address: *mut u8) {
    #[cfg(debug_assertions)]
    {
        let hook = TRACK_FREE_HOOK.load(Ordering::Acquire);
        if hook != 0 {
            // SAFETY: only ever stored from a TrackFreeFn.
            let hook: TrackFreeFn = unsafe { core::mem::transmute(hook) };
            hook(address);
        }
    }
    #[cfg(not(debug_assertions))]
    let _ = address;
}

/// The bootstrap fallback: system malloc with allocation accounting.
pub struct TrackedMalloc {
    allocations: AtomicUsize,
    frees: AtomicUsize,
}

impl TrackedMalloc {
    pub const fn new() -> TrackedMalloc {
        TrackedMalloc {
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    pub fn malloc(&self, size: usize, alignment: usize) -> *mut u8 {
        let alignment = alignment.max(core::mem::size_of::<usize>()).next_power_of_two();

        let mut address: *mut libc::c_void = ptr::null_mut();
        // SAFETY: posix_memalign with a power-of-two alignment of at least
        // a word.
        let result = unsafe { libc::posix_memalign(&mut address, alignment, size.max(1)) };
        if result != 0 {
            return ptr::null_mut();
        }

        self.allocations.fetch_add(1, Ordering::Relaxed);
        address as *mut u8
    }

    /// The default allocator is the last resort: it claims every pointer.
    pub fn free(&self, address: *mut u8) -> bool {
        if !address.is_null() {
            // SAFETY: last-resort contract; the pointer came from malloc.
            unsafe { libc::free(address as *mut libc::c_void) };
            self.frees.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }
}

/// The process-wide default allocator.
pub fn default_allocator() -> &'static TrackedMalloc {
    &DEFAULT_ALLOCATOR
}

/// The primary allocator, if bootstrap has completed.
pub fn primary_allocator() -> Option<&'static TieredAllocator> {
    PRIMARY_ALLOCATOR.get()
}

pub fn is_bootstrapped() -> bool {
    PRIMARY_ALLOCATOR.get().is_some() && !IS_CONSTRUCTING.load(Ordering::Acquire)
}

/// Allocate through the engine: primary when available, default during the
/// bootstrap window or when bypassed. Returns null on failure.
pub fn allocate(size: usize, alignment: usize) -> *mut u8 {
    if use_default_malloc() {
        let address = DEFAULT_ALLOCATOR.malloc(size, alignment);
        if !address.is_null() {
            track_alloc(address, size);
        }
        return address;
    }

    if PRIMARY_ALLOCATOR.get().is_none() && !IS_CONSTRUCTING.swap(true, Ordering::AcqRel) {
        PRIMARY_ALLOCATOR.call_once(|| {
            TieredAllocator::new().expect("couldn't construct the primary allocator")
        });
        IS_CONSTRUCTING.store(false, Ordering::Release);
    }

    let address = match PRIMARY_ALLOCATOR.get() {
        Some(primary) if !IS_CONSTRUCTING.load(Ordering::Acquire) => primary
            .malloc(size, alignment)
            .map(|block| block.as_ptr())
            .unwrap_or_else(|fault| {
                error!("allocation of {} bytes failed: {}", size, fault);
                ptr::null_mut()
            }),
        // Bootstrap window: requests issued while the primary allocator is
        // under construction (possibly by that construction itself).
        _ => DEFAULT_ALLOCATOR.malloc(size, alignment),
    };

    if !address.is_null() {
        track_alloc(address, size);
    }
    address
}

/// Free through the engine: the primary allocator claims its own pointers,
/// everything else (bootstrap-era, foreign) falls to the default.
pub fn deallocate(address: *mut u8) {
    if address.is_null() {
        return;
    }

    track_free(address);

    let released = PRIMARY_ALLOCATOR
        .get()
        .map_or(false, |primary| primary.free(address));

    if !released {
        DEFAULT_ALLOCATOR.free(address);
    }
}

/// `core::alloc::GlobalAlloc` façade over the engine allocator pair.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: gmem::GlobalAllocator = gmem::GlobalAllocator::new();
/// ```
pub struct GlobalAllocator;

impl GlobalAllocator {
    pub const fn new() -> GlobalAllocator {
        GlobalAllocator
    }
}

unsafe impl GlobalAlloc for GlobalAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        allocate(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        deallocate(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Global state is shared between tests; serialize them.
    fn lock() -> std::sync::MutexGuard<'static, ()> {
        use std::sync::Mutex;
        lazy_static::lazy_static! {
            static ref TEST_LOCK: Mutex<()> = Mutex::new(());
        }
        TEST_LOCK.lock().unwrap()
    }

    #[test]
    fn first_allocation_bootstraps_the_primary() {
        let _guard = lock();

        let address = allocate(64, 8);
        assert!(!address.is_null());
        assert!(is_bootstrapped());
        assert!(primary_allocator().unwrap().owns(address));

        deallocate(address);
    }

    #[test]
    fn construction_window_is_served_by_the_default() {
        let _guard = lock();

        // Make sure the primary exists, then reopen the bootstrap window:
        // this is what an allocation issued *during* construction sees.
        let warmup = allocate(16, 8);
        deallocate(warmup);

        IS_CONSTRUCTING.store(true, Ordering::Release);

        let allocations_before = DEFAULT_ALLOCATOR.allocation_count();
        let address = allocate(32, 8);

        assert!(!address.is_null());
        assert_eq!(DEFAULT_ALLOCATOR.allocation_count(), allocations_before + 1);
        assert!(!primary_allocator().unwrap().owns(address));

        IS_CONSTRUCTING.store(false, Ordering::Release);

        // The bootstrap-era pointer is refused by the primary and released
        // by the default allocator, exactly once.
        let frees_before = DEFAULT_ALLOCATOR.free_count();
        deallocate(address);
        assert_eq!(DEFAULT_ALLOCATOR.free_count(), frees_before + 1);
    }

    #[test]
    fn default_bypass_switch() {
        let _guard = lock();

        force_default_malloc();
        let allocations_before = DEFAULT_ALLOCATOR.allocation_count();
        let address = allocate(128, 16);
        assert_eq!(DEFAULT_ALLOCATOR.allocation_count(), allocations_before + 1);
        use_engine_allocator();

        deallocate(address);
    }

    #[test]
    fn global_alloc_trait_round_trip() {
        let _guard = lock();

        let layout = Layout::from_size_align(1024, 16).unwrap();
        let global = GlobalAllocator::new();

        unsafe {
            let address = global.alloc(layout);
            assert!(!address.is_null());
            assert_eq!(address as usize % 16, 0);
            address.write_bytes(0x77, 1024);
            global.dealloc(address, layout);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    fn tracking_hooks_fire() {
        let _guard = lock();

        static ALLOCS_SEEN: AtomicUsize = AtomicUsize::new(0);
        static FREES_SEEN: AtomicUsize = AtomicUsize::new(0);

        fn on_alloc(_address: *mut u8, _size: usize) {
            ALLOCS_SEEN.fetch_add(1, Ordering::Relaxed);
        }
        fn on_free(_address: *mut u8) {
            FREES_SEEN.fetch_add(1, Ordering::Relaxed);
        }

        set_tracking_hooks(on_alloc, on_free);

        let address = allocate(64, 8);
        deallocate(address);

        assert!(ALLOCS_SEEN.load(Ordering::Relaxed) >= 1);
        assert!(FREES_SEEN.load(Ordering::Relaxed) >= 1);

        // Unhook so other tests are unaffected.
        TRACK_ALLOC_HOOK.store(0, Ordering::Release);
        TRACK_FREE_HOOK.store(0, Ordering::Release);
    }

    #[test]
    fn tracked_malloc_counts() {
        let tracked = TrackedMalloc::new();

        let address = tracked.malloc(100, 8);
        assert!(!address.is_null());
        assert_eq!(tracked.allocation_count(), 1);

        assert!(tracked.free(address));
        assert_eq!(tracked.free_count(), 1);
    }
}
