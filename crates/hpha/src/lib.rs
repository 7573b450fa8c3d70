//! HPHA: a general-purpose heap allocator.
//!
//! Requests up to [`MAX_SMALL_ALLOCATION`] bytes are served from size-class
//! buckets backed by fixed-size slab pages; larger requests go to a
//! boundary-tag tree allocator with best-fit extraction and coalescing.
//! An optional debug layer ([`DebugTracking`]) adds guard bytes, a live
//! allocation registry and call-stack capture, and compiles away entirely
//! when the allocator is instantiated with [`NoDebug`].
//!
//! ```no_run
//! use hpha::HphaAllocator;
//!
//! let heap = HphaAllocator::new();
//! let block = heap.allocate(64, 8).expect("allocation should succeed");
//! // SAFETY: `block.ptr` came from `heap` and is released exactly once.
//! unsafe { heap.deallocate(block.ptr.as_ptr(), None, None) };
//! ```

#[macro_use]
mod util;

pub mod allocator;
mod block;
pub mod bucket;
pub mod config;
pub mod debug;
pub mod error;
pub mod os;
mod page;
mod page_map;
pub mod size_class;
pub mod stats;
pub mod tree;

pub use allocator::{Allocation, DebugHphaAllocator, Hpha, HphaAllocator, MAX_CONTIGUOUS_ALLOCATION};
pub use config::HphaConfig;
pub use debug::{DebugPolicy, DebugTracking, NoDebug, Origin};
pub use error::ConfigError;
pub use os::{PageSource, SystemPages};
pub use size_class::{DEFAULT_ALIGNMENT, MAX_SMALL_ALLOCATION, MIN_ALLOCATION, NUM_BUCKETS};
pub use stats::{BucketSnapshot, HeapSnapshot, HphaStats, PageSnapshot, TreeArenaSnapshot, TreeSnapshot};
pub use util::FastRng;
