//! The top-level allocator: four strategies selected by request size.
//!
//! One reservation is partitioned between the pooled tiers (tiny, buckets,
//! TLSF); the direct tier maps its allocations individually. Ownership of a
//! pointer is decided by range containment, so a free can fall through the
//! tiers until one claims it.

use core::ptr::NonNull;
use std::sync::Arc;

use arrayvec::ArrayVec;
use hashbrown::HashMap;

use crate::error::AllocationError;
use crate::memory::page::PageAllocator;
use crate::memory::strategies::buckets::{BucketsStrategy, DEFAULT_STEP};
use crate::memory::strategies::direct::DirectStrategy;
use crate::memory::strategies::tiny::TinyStrategy;
use crate::memory::tlsf::{TlsfAllocator, BACKING_PAGE_SIZE, MAX_ALLOCATION_SIZE};
use crate::memory::vmem::VirtualMemoryRegion;
use crate::memory::{align_up, AllocatorStatistics, MemoryRange};

/// Largest request served by the bucketed slab tier.
pub const BUCKETS_MAX_ALLOCATION: usize = 8 * 1024;

/// Page size of the bucketed tier's slab pool.
const BUCKETS_POOL_PAGE_SIZE: usize = 16 * 1024;

/// Largest alignment the pooled tiers guarantee without help.
const POOLED_MAX_ALIGNMENT: usize = 16;

const GIB: usize = 1024 * 1024 * 1024;

/// Default address-space reservations per pooled tier.
pub const DEFAULT_TINY_CAPACITY: usize = 1 * GIB;
pub const DEFAULT_BUCKETS_CAPACITY: usize = 4 * GIB;
pub const DEFAULT_MEDIUM_CAPACITY: usize = 8 * GIB;

/// Byte counters for one strategy, as reported by
/// [`TieredAllocator::statistics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyStatistics {
    pub allocated: usize,
    pub committed: usize,
}

/// Multi-strategy allocator routing by size class.
pub struct TieredAllocator {
    region: Arc<VirtualMemoryRegion>,
    tiny: TinyStrategy,
    buckets: BucketsStrategy,
    medium: TlsfAllocator,
    direct: DirectStrategy,
}

impl TieredAllocator {
    pub fn new() -> Result<TieredAllocator, AllocationError> {
        Self::with_capacities(
            DEFAULT_TINY_CAPACITY,
            DEFAULT_BUCKETS_CAPACITY,
            DEFAULT_MEDIUM_CAPACITY,
        )
    }

    /// Reserve one region split into the given per-tier address-space
    /// capacities (each rounded up to the TLSF backing-page size).
    pub fn with_capacities(
        tiny_capacity: usize,
        buckets_capacity: usize,
        medium_capacity: usize,
    ) -> Result<TieredAllocator, AllocationError> {
        let tiny_capacity = align_up(tiny_capacity, BACKING_PAGE_SIZE);
        let buckets_capacity = align_up(buckets_capacity, BACKING_PAGE_SIZE);
        let medium_capacity = align_up(medium_capacity, BACKING_PAGE_SIZE);

        let region = Arc::new(VirtualMemoryRegion::new(
            tiny_capacity + buckets_capacity + medium_capacity,
        )?);

        let (tiny_range, rest) = region.range().split_at(tiny_capacity);
        let (buckets_range, medium_range) = rest.split_at(buckets_capacity);

        let buckets_pool = Arc::new(PageAllocator::shared(
            Arc::clone(&region),
            buckets_range,
            BUCKETS_POOL_PAGE_SIZE,
        ));

        Ok(TieredAllocator {
            tiny: TinyStrategy::shared(Arc::clone(&region), tiny_range),
            buckets: BucketsStrategy::new(buckets_pool, BUCKETS_MAX_ALLOCATION, DEFAULT_STEP),
            medium: TlsfAllocator::shared(Arc::clone(&region), medium_range),
            direct: DirectStrategy::new(MAX_ALLOCATION_SIZE),
            region,
        })
    }

    /// Route `size`/`alignment` to the first strategy whose class accepts
    /// it.
    pub fn malloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocationError> {
        let alignment = alignment.max(1);
        debug_assert!(alignment.is_power_of_two());

        let aligned_size = align_up(size.max(1), alignment);

        if alignment <= POOLED_MAX_ALIGNMENT {
            if aligned_size <= self.tiny.max_allocation_size() {
                self.tiny.allocate(aligned_size, alignment)
            } else if aligned_size <= self.buckets.max_allocation_size() {
                self.buckets.allocate(aligned_size, alignment)
            } else if aligned_size <= TlsfAllocator::max_allocation_size() {
                self.medium.allocate(aligned_size, alignment)
            } else {
                self.direct.allocate(aligned_size, alignment)
            }
        } else if alignment <= self.buckets.step()
            && aligned_size <= self.buckets.max_allocation_size()
        {
            // Bucket blocks are aligned to multiples of the step, which any
            // smaller power of two divides.
            self.buckets.allocate(aligned_size, alignment)
        } else {
            // Direct mappings are page-aligned; over-reserve undersized
            // requests that ended up here for their alignment.
            self.direct
                .allocate(aligned_size.max(self.direct.min_allocation_size()), alignment)
        }
    }

    /// Give a pointer back to whichever strategy owns it. Returns false if
    /// none claims it; a null pointer is accepted and ignored.
    pub fn free(&self, address: *mut u8) -> bool {
        if address.is_null() {
            return true;
        }

        self.tiny.free(address)
            || self.buckets.free(address)
            || self.medium.free(address)
            || self.direct.free(address)
    }

    /// True when any strategy's memory contains `address`.
    pub fn owns(&self, address: *const u8) -> bool {
        self.tiny.owns(address)
            || self.buckets.owns(address)
            || self.medium.owns(address)
            || self.direct.owns(address)
    }

    /// The pooled tiers' sub-ranges, for diagnostics.
    pub fn regions(&self) -> ArrayVec<(&'static str, MemoryRange), 3> {
        let mut regions = ArrayVec::new();
        regions.push(("tiny", self.tiny.range()));
        regions.push(("buckets", self.buckets.range()));
        regions.push(("medium", self.medium_range()));
        regions
    }

    fn medium_range(&self) -> MemoryRange {
        let (_, rest) = self
            .region
            .range()
            .split_at(self.tiny.range().size() + self.buckets.range().size());
        rest
    }

    /// Per-strategy byte counters keyed by strategy name.
    pub fn statistics(&self) -> HashMap<&'static str, StrategyStatistics> {
        let mut statistics = HashMap::new();
        statistics.insert(
            "tiny",
            StrategyStatistics {
                allocated: self.tiny.allocated_memory(),
                committed: self.tiny.committed_memory(),
            },
        );
        statistics.insert(
            "buckets",
            StrategyStatistics {
                allocated: self.buckets.allocated_memory(),
                committed: self.buckets.committed_memory(),
            },
        );
        statistics.insert(
            "medium",
            StrategyStatistics {
                allocated: self.medium.allocated_memory(),
                committed: self.medium.committed_memory(),
            },
        );
        statistics.insert(
            "direct",
            StrategyStatistics {
                allocated: self.direct.allocated_memory(),
                committed: self.direct.allocated_memory(),
            },
        );
        statistics
    }
}

impl AllocatorStatistics for TieredAllocator {
    fn allocated(&self) -> usize {
        self.statistics().values().map(|s| s.allocated).sum()
    }

    fn size(&self) -> usize {
        self.statistics().values().map(|s| s.committed).sum()
    }

    fn capacity(&self) -> usize {
        self.region.range().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn allocator() -> TieredAllocator {
        TieredAllocator::with_capacities(64 * MIB, 64 * MIB, 64 * MIB).unwrap()
    }

    fn range_of(tiered: &TieredAllocator, name: &str) -> MemoryRange {
        tiered
            .regions()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, range)| *range)
            .unwrap()
    }

    #[test]
    fn sizes_route_to_the_expected_tier() {
        let tiered = allocator();

        let tiny = tiered.malloc(16, 8).unwrap().as_ptr();
        let small = tiered.malloc(256, 8).unwrap().as_ptr();
        let medium = tiered.malloc(16 * 1024, 8).unwrap().as_ptr();
        let large = tiered.malloc(4 * MIB, 8).unwrap().as_ptr();

        assert!(range_of(&tiered, "tiny").contains(tiny));
        assert!(range_of(&tiered, "buckets").contains(small));
        assert!(range_of(&tiered, "medium").contains(medium));
        assert!(!tiered.region.range().contains(large));
        assert!(tiered.owns(large));

        // Free out of order; every pointer finds its owner.
        for ptr in [medium, tiny, large, small] {
            assert!(tiered.free(ptr));
        }
    }

    #[test]
    fn class_boundaries() {
        let tiered = allocator();

        // The aligned size is what routes: 255 with 8-byte alignment rounds
        // to 256 and lands in the buckets, so probe the edge with alignment
        // 1.
        let at_tiny_edge = tiered.malloc(255, 1).unwrap().as_ptr();
        let past_tiny_edge = tiered.malloc(256, 8).unwrap().as_ptr();
        assert!(range_of(&tiered, "tiny").contains(at_tiny_edge));
        assert!(range_of(&tiered, "buckets").contains(past_tiny_edge));

        let at_buckets_edge = tiered.malloc(8 * 1024, 8).unwrap().as_ptr();
        let past_buckets_edge = tiered.malloc(8 * 1024 + 1, 8).unwrap().as_ptr();
        assert!(range_of(&tiered, "buckets").contains(at_buckets_edge));
        assert!(range_of(&tiered, "medium").contains(past_buckets_edge));

        let at_medium_edge = tiered.malloc(64 * 1024, 8).unwrap().as_ptr();
        let past_medium_edge = tiered.malloc(64 * 1024 + 1, 8).unwrap().as_ptr();
        assert!(range_of(&tiered, "medium").contains(at_medium_edge));
        assert!(tiered.direct.owns(past_medium_edge));

        for ptr in [
            at_tiny_edge,
            past_tiny_edge,
            at_buckets_edge,
            past_buckets_edge,
            at_medium_edge,
            past_medium_edge,
        ] {
            assert!(tiered.free(ptr));
        }
    }

    #[test]
    fn null_free_is_accepted() {
        let tiered = allocator();
        assert!(tiered.free(core::ptr::null_mut()));
    }

    #[test]
    fn foreign_pointer_is_refused() {
        let tiered = allocator();
        assert!(!tiered.free(0x1000 as *mut u8));
        assert!(!tiered.owns(0x1000 as *const u8));
    }

    #[test]
    fn alignment_steers_routing() {
        let tiered = allocator();

        // 64-byte alignment: served by a bucket (step is a multiple of 64).
        let a = tiered.malloc(100, 64).unwrap().as_ptr();
        assert_eq!(a as usize % 64, 0);
        assert!(range_of(&tiered, "buckets").contains(a));

        // 512-byte alignment exceeds the bucket step: page-aligned mapping.
        let b = tiered.malloc(100, 512).unwrap().as_ptr();
        assert_eq!(b as usize % 512, 0);
        assert!(tiered.direct.owns(b));

        // Medium-sized requests with a large alignment divert to direct
        // too, since the TLSF only guarantees 16.
        let c = tiered.malloc(32 * 1024, 64).unwrap().as_ptr();
        assert_eq!(c as usize % 64, 0);
        assert!(tiered.direct.owns(c));

        for ptr in [a, b, c] {
            assert!(tiered.free(ptr));
        }
    }

    #[test]
    fn returned_pointers_satisfy_requested_alignment() {
        let tiered = allocator();

        let mut live = Vec::new();
        for &size in &[1usize, 16, 100, 255, 256, 1000, 8192, 20000, 65536, 80000] {
            for &alignment in &[1usize, 8, 16] {
                let ptr = tiered.malloc(size, alignment).unwrap().as_ptr();
                assert_eq!(ptr as usize % alignment, 0, "size {} align {}", size, alignment);
                live.push(ptr);
            }
        }

        for ptr in live {
            assert!(tiered.free(ptr));
        }
    }

    #[test]
    fn statistics_track_allocations() {
        let tiered = allocator();

        let a = tiered.malloc(100, 8).unwrap().as_ptr();
        let b = tiered.malloc(100 * 1024, 8).unwrap().as_ptr();

        let statistics = tiered.statistics();
        assert!(statistics["tiny"].allocated > 0);
        assert!(statistics["direct"].allocated >= 100 * 1024);
        assert!(tiered.allocated() > 0);
        assert!(tiered.capacity() >= 192 * MIB);

        tiered.free(a);
        tiered.free(b);

        let statistics = tiered.statistics();
        assert_eq!(statistics["tiny"].allocated, 0);
        assert_eq!(statistics["direct"].allocated, 0);
    }
}
