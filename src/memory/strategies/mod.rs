//! Size-class routing strategies and the tiered allocator that composes
//! them.
//!
//! | request                  | strategy                         |
//! |--------------------------|----------------------------------|
//! | <= 255 B                 | [`tiny::TinyStrategy`]           |
//! | 256 B ..= 8 KiB          | [`buckets::BucketsStrategy`]     |
//! | 8 KiB ..= 64 KiB         | TLSF                             |
//! | > 64 KiB                 | [`direct::DirectStrategy`]       |
//!
//! [`small::SmallStrategy`] is the fine-grained (8-byte-step) sibling of the
//! bucketed strategy; it is not part of the default tier but shares the same
//! slab machinery.
//!
//! Every strategy reports a foreign pointer on free by returning false, so
//! the router can fall through to the next one. Alignments above 16 bytes
//! skip the tiny tier (whose slots are only 16-aligned) and above 256 go
//! straight to the direct strategy, whose mappings are page-aligned.

pub mod buckets;
pub mod direct;
pub mod small;
pub mod tiered;
pub mod tiny;
