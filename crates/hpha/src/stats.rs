//! Allocator statistics and structural snapshots.
//!
//! [`HphaStats`] is the cheap counter view; [`HeapSnapshot`] walks every
//! page list and every arena chain and is meant for tests, tooling and
//! post-mortem reports.

use serde::Serialize;

/// Byte counters of both paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HphaStats {
    /// Bytes handed out by the bucket path (element sizes).
    pub bucket_allocated: usize,
    /// Bytes of pages mapped by the bucket path.
    pub bucket_capacity: usize,
    /// Bytes handed out by the tree path (block payload sizes).
    pub tree_allocated: usize,
    /// Bytes of arenas mapped by the tree path.
    pub tree_capacity: usize,
    pub allocated_bytes: usize,
    pub capacity_bytes: usize,
    /// Free bytes inside mapped memory (free slots plus free tree blocks).
    pub unused_bytes: usize,
    /// Live records in the debug registry; zero without debugging.
    pub live_debug_records: usize,
    /// Requested bytes plus guards held by live debug records.
    pub debug_requested_bytes: usize,
}

/// One page of a bucket, in list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageSnapshot {
    pub address: usize,
    pub live_elements: usize,
    pub has_free_slot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    pub index: usize,
    pub element_size: usize,
    pub slots_per_page: usize,
    pub pages: Vec<PageSnapshot>,
}

/// Block accounting of a single tree arena.
///
/// For a consistent arena
/// `used_bytes + free_bytes + header_bytes == reserved_bytes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeArenaSnapshot {
    pub base: usize,
    pub reserved_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    /// Both fences plus one header per block.
    pub header_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeSnapshot {
    pub arenas: Vec<TreeArenaSnapshot>,
    pub allocated_bytes: usize,
    /// Used blocks lent out as bucket pages (fixed-block mode only).
    pub carved_bytes: usize,
    pub capacity_bytes: usize,
    pub indexed_free_blocks: usize,
    pub indexed_free_bytes: usize,
}

impl TreeSnapshot {
    /// True when every arena accounts for all of its bytes and the counters
    /// agree with the chains.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let arenas_ok = self
            .arenas
            .iter()
            .all(|a| a.used_bytes + a.free_bytes + a.header_bytes == a.reserved_bytes);
        let used: usize = self.arenas.iter().map(|a| a.used_bytes).sum();
        let free: usize = self.arenas.iter().map(|a| a.free_bytes).sum();
        let reserved: usize = self.arenas.iter().map(|a| a.reserved_bytes).sum();
        arenas_ok && used == self.allocated_bytes + self.carved_bytes && free == self.indexed_free_bytes && reserved == self.capacity_bytes
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeapSnapshot {
    pub buckets: Vec<BucketSnapshot>,
    pub tree: TreeSnapshot,
}

impl HeapSnapshot {
    /// True when every bucket keeps pages with free slots ahead of full
    /// pages and no page counts more live elements than it has slots.
    #[must_use]
    pub fn buckets_consistent(&self) -> bool {
        self.buckets.iter().all(|bucket| {
            let first_full = bucket
                .pages
                .iter()
                .position(|page| !page.has_free_slot)
                .unwrap_or(bucket.pages.len());
            bucket.pages[first_full..].iter().all(|page| !page.has_free_slot)
                && bucket.pages.iter().all(|page| {
                    page.live_elements <= bucket.slots_per_page
                        && page.has_free_slot == (page.live_elements < bucket.slots_per_page)
                })
        })
    }
}
