//! Dispatch layer.
//!
//! [`Hpha`] routes every request by size and alignment: anything that fits
//! a bucket (guard bytes included) goes to the [`BucketAllocator`], the
//! rest to the [`TreeAllocator`]. Freeing without a size hint recovers the
//! path from the bucket page map; with a hint the path is recomputed from
//! the size alone.
//!
//! Memory comes from a [`PageSource`], the OS by default. An allocator
//! built over a fixed block carves its bucket pages out of the tree and
//! never asks the source for anything.
//!
//! Lock order is tree, then bucket, then page map, then debug registry.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::bucket::BucketAllocator;
use crate::config::HphaConfig;
use crate::debug::{DebugPolicy, DebugTracking, NoDebug, Origin};
use crate::error::ConfigError;
use crate::os::{PageSource, SystemPages};
use crate::size_class::{DEFAULT_ALIGNMENT, MAX_SMALL_ALLOCATION, MIN_ALLOCATION, bucket_index_aligned, element_size, is_small};
use crate::stats::{HeapSnapshot, HphaStats};
use crate::tree::{ARENA_OVERHEAD, MIN_FIXED_BLOCK, TREE_ALIGNMENT, TreeAllocator};
use crate::util::{align_down, is_aligned};

/// Largest request the tree could ever satisfy with a single arena.
pub const MAX_CONTIGUOUS_ALLOCATION: usize = (isize::MAX as usize - ARENA_OVERHEAD) & !(TREE_ALIGNMENT - 1);

/// Smallest block a tree allocation is resized down to, so a resized
/// block keeps routing to the tree.
const MIN_TREE_RESIZE: usize = MAX_SMALL_ALLOCATION + MIN_ALLOCATION;

/// A block handed out by the allocator. `size` is the number of bytes the
/// caller may use; it can exceed the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

/// Where a live block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Bucket(usize),
    Tree,
}

impl Route {
    const fn origin(self) -> Origin {
        match self {
            Self::Bucket(_) => Origin::Bucket,
            Self::Tree => Origin::Tree,
        }
    }
}

/// Zero means the default alignment; anything else must be a power of two.
fn effective_alignment(alignment: usize) -> usize {
    hpha_assert!(
        alignment == 0 || alignment.is_power_of_two(),
        "alignment {alignment} is not a power of two"
    );
    alignment.max(DEFAULT_ALIGNMENT)
}

/// Where bucket pages come from: the page source itself, or the tree when
/// the whole heap lives in a fixed block.
enum BucketPages<S: PageSource> {
    Source(Arc<S>),
    Tree(Arc<TreeAllocator<Arc<S>>>),
}

impl<S: PageSource> PageSource for BucketPages<S> {
    fn alloc_pages(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        match self {
            Self::Source(source) => source.alloc_pages(size, alignment),
            Self::Tree(tree) => tree.carve_page(size, alignment.max(TREE_ALIGNMENT)),
        }
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded.
        unsafe {
            match self {
                Self::Source(source) => source.free_pages(ptr, size),
                Self::Tree(tree) => tree.release_page(ptr),
            }
        }
    }
}

/// Heap allocator with a compile-time debug policy over a page source.
pub struct Hpha<D: DebugPolicy = NoDebug, S: PageSource = SystemPages> {
    config: HphaConfig,
    // dropped before the tree: in fixed-block mode its pages go back there
    buckets: BucketAllocator<BucketPages<S>>,
    tree: Arc<TreeAllocator<Arc<S>>>,
    fixed_block: bool,
    debug: D,
}

/// Production allocator: no guards, no registry.
pub type HphaAllocator = Hpha<NoDebug>;

/// Allocator with guard bytes and live-allocation tracking.
pub type DebugHphaAllocator = Hpha<DebugTracking>;

impl<D: DebugPolicy> Default for Hpha<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DebugPolicy> Hpha<D> {
    /// Allocator with the host-derived default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::build(HphaConfig::default(), SystemPages, None)
    }

    pub fn with_config(config: HphaConfig) -> Result<Self, ConfigError> {
        Self::with_source(config, SystemPages)
    }

    /// Allocator configured from `HPHA_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::build(HphaConfig::from_env()?, SystemPages, None))
    }

    /// Allocator that serves everything from `block..block + len` and
    /// never maps memory. `len` is rounded down to a multiple of 16.
    ///
    /// Dropping the allocator with no live allocations asserts that the
    /// block is one free range again.
    ///
    /// # Safety
    ///
    /// The block must be writable and untouched by anything else until
    /// the allocator is dropped.
    pub unsafe fn with_fixed_block(config: HphaConfig, block: NonNull<u8>, len: usize) -> Result<Self, ConfigError> {
        config.validate()?;
        let address = block.as_ptr() as usize;
        if !is_aligned(address, TREE_ALIGNMENT) {
            return Err(ConfigError::FixedBlockMisaligned {
                address,
                alignment: TREE_ALIGNMENT,
            });
        }
        let len = align_down(len, TREE_ALIGNMENT);
        if len < MIN_FIXED_BLOCK {
            return Err(ConfigError::FixedBlockTooSmall {
                len,
                min: MIN_FIXED_BLOCK,
            });
        }
        Ok(Self::build(config, SystemPages, Some((block, len))))
    }
}

impl<D: DebugPolicy, S: PageSource> Hpha<D, S> {
    /// Allocator that maps its pages and arenas through `source`.
    pub fn with_source(config: HphaConfig, source: S) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, source, None))
    }

    fn build(config: HphaConfig, source: S, fixed: Option<(NonNull<u8>, usize)>) -> Self {
        log::debug!(
            "hpha: pool pages {} bytes, tree pages {} bytes, buckets {}, guard {} bytes, {}",
            config.pool_page_size,
            config.tree_page_size,
            if config.enable_pool_allocations { "on" } else { "off" },
            D::GUARD_SIZE,
            if fixed.is_some() { "fixed block" } else { "mapped" }
        );
        let source = Arc::new(source);
        let (tree, pages) = match fixed {
            Some((block, len)) => {
                // SAFETY: the caller vouched for the block; alignment and
                // length were checked by `with_fixed_block`.
                let tree = Arc::new(unsafe {
                    TreeAllocator::with_fixed_block(config.tree_page_size, Arc::clone(&source), block, len)
                });
                let pages = BucketPages::Tree(Arc::clone(&tree));
                (tree, pages)
            }
            None => (
                Arc::new(TreeAllocator::new(config.tree_page_size, Arc::clone(&source))),
                BucketPages::Source(source),
            ),
        };
        Self {
            buckets: BucketAllocator::new(config.pool_page_size, pages),
            tree,
            fixed_block: fixed.is_some(),
            debug: D::new(&config),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HphaConfig {
        &self.config
    }

    /// Path for `total` bytes (guard included) at `align`.
    fn route(&self, total: usize, align: usize) -> Route {
        if self.config.enable_pool_allocations && is_small(total, align) {
            Route::Bucket(bucket_index_aligned(total, align))
        } else {
            Route::Tree
        }
    }

    /// Path of a block, from the bucket page map: anything outside a
    /// registered page is a tree block. The tracking policy also checks it
    /// against the origin it recorded.
    fn resolve(&self, ptr: NonNull<u8>) -> Route {
        let recorded = self.debug.registered_origin(ptr);
        let route = self.buckets.lookup(ptr.as_ptr()).map_or(Route::Tree, Route::Bucket);
        if let Some(recorded) = recorded {
            hpha_assert!(
                recorded == route.origin(),
                "{:#x} was recorded as a {recorded:?} allocation but belongs to {:?}",
                ptr.as_ptr() as usize,
                route.origin()
            );
        }
        route
    }

    /// Usable bytes of the block behind a resolved pointer, guard included.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation on `route`.
    unsafe fn block_size(&self, ptr: NonNull<u8>, route: Route) -> usize {
        match route {
            Route::Bucket(index) => element_size(index),
            // SAFETY: forwarded.
            Route::Tree => unsafe { self.tree.size_of(ptr) },
        }
    }

    /// Allocate `total` bytes on the routed path, purging once on failure.
    fn allocate_block(&self, total: usize, align: usize) -> Option<(Allocation, Origin)> {
        match self.route(total, align) {
            Route::Bucket(index) => {
                // a page carved from a fixed block takes the tree lock
                let _tree = self.fixed_block.then(|| self.tree.hold());
                self.buckets
                    .alloc_direct(index)
                    .or_else(|| {
                        log::warn!("bucket {index}: out of memory, purging and retrying");
                        self.purge();
                        self.buckets.alloc_direct(index)
                    })
                    .map(|block| (block, Origin::Bucket))
            }
            Route::Tree => {
                let _tree = self.tree.hold();
                self.tree
                    .alloc_aligned(total, align)
                    .or_else(|| {
                        log::warn!("tree: out of memory for {total} bytes, purging and retrying");
                        self.purge();
                        self.tree.alloc_aligned(total, align)
                    })
                    .map(|block| (block, Origin::Tree))
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a live block on `route` whose debug record is gone.
    unsafe fn free_block(&self, ptr: NonNull<u8>, route: Route) -> usize {
        // SAFETY: forwarded.
        unsafe {
            match route {
                Route::Bucket(index) => self.buckets.free_direct(ptr, index),
                Route::Tree => self.tree.free(ptr),
            }
        }
    }

    /// Allocate `size` bytes aligned to `alignment` (0 for the default).
    ///
    /// Returns `None` for a zero size or when memory is exhausted even
    /// after a purge.
    pub fn allocate(&self, size: usize, alignment: usize) -> Option<Allocation> {
        let align = effective_alignment(alignment);
        if size == 0 {
            return None;
        }
        let total = size.checked_add(D::GUARD_SIZE)?;
        let (block, origin) = self.allocate_block(total, align)?;
        // SAFETY: the block is fresh and `block.size` bytes long.
        let size = unsafe { self.debug.on_allocate(block.ptr, size, block.size, origin) };
        Some(Allocation { ptr: block.ptr, size })
    }

    /// Resize an allocation, moving it when it cannot stay in place.
    ///
    /// A null `ptr` allocates; a zero `new_size` frees and returns `None`.
    /// On failure the old allocation is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator. After
    /// a successful call only the returned pointer may be used.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize, alignment: usize) -> Option<Allocation> {
        let align = effective_alignment(alignment);
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size, alignment);
        };
        if new_size == 0 {
            // SAFETY: forwarded.
            unsafe { self.deallocate(ptr, None, None) };
            return None;
        }

        let route = self.resolve(old);
        // SAFETY: `old` is live.
        let old_size = unsafe {
            let usable = self.block_size(old, route) - D::GUARD_SIZE;
            self.debug.on_query(old, usable)
        };
        let total = new_size.checked_add(D::GUARD_SIZE)?;

        if is_aligned(old.as_ptr() as usize, align) {
            match (route, self.route(total, align)) {
                (Route::Bucket(index), Route::Bucket(wanted)) if index == wanted => {
                    // SAFETY: same block, same element.
                    let size = unsafe { self.debug.on_reallocate(old, old, new_size, element_size(index), Origin::Bucket) };
                    return Some(Allocation { ptr: old, size });
                }
                (Route::Tree, Route::Tree) => {
                    let _tree = self.tree.hold();
                    // SAFETY: `old` is a live tree block; on failure it is untouched.
                    let block = unsafe {
                        self.tree.realloc_aligned(old, total, align).or_else(|| {
                            log::warn!("tree: out of memory growing to {total} bytes, purging and retrying");
                            self.purge();
                            self.tree.realloc_aligned(old, total, align)
                        })
                    }?;
                    // SAFETY: `block` holds `block.size` bytes.
                    let size = unsafe { self.debug.on_reallocate(old, block.ptr, new_size, block.size, Origin::Tree) };
                    return Some(Allocation { ptr: block.ptr, size });
                }
                _ => {}
            }
        }

        let (block, origin) = self.allocate_block(total, align)?;
        // SAFETY: `old` and `block` are distinct live blocks, each at least
        // as long as the copied prefix. The old record is dropped before the
        // old block can be handed out again.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr(), block.ptr.as_ptr(), old_size.min(new_size));
            let size = self.debug.on_reallocate(old, block.ptr, new_size, block.size, origin);
            self.free_block(old, route);
            Some(Allocation { ptr: block.ptr, size })
        }
    }

    /// Free an allocation; returns the bytes released (element or block size).
    ///
    /// With `size_hint` the path is computed from the size (and
    /// `alignment_hint`) instead of the ownership test. The hints must be
    /// the ones the block was allocated with; the debug allocator asserts
    /// that they are.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn deallocate(&self, ptr: *mut u8, size_hint: Option<usize>, alignment_hint: Option<usize>) -> usize {
        let Some(ptr) = NonNull::new(ptr) else {
            return 0;
        };
        let align = effective_alignment(alignment_hint.unwrap_or(0));
        let route = match size_hint {
            Some(hint) => {
                let hinted = self.route(hint.saturating_add(D::GUARD_SIZE), align);
                if D::ENABLED {
                    let actual = self.resolve(ptr);
                    hpha_assert!(
                        hinted == actual,
                        "{:#x}: size hint {hint} selects {hinted:?} but the block belongs to {actual:?}",
                        ptr.as_ptr() as usize
                    );
                }
                hinted
            }
            None => self.resolve(ptr),
        };
        // SAFETY: forwarded; the record goes before the block does.
        unsafe {
            self.debug.on_deallocate(ptr, size_hint);
            self.free_block(ptr, route)
        }
    }

    /// Bytes the caller may use at `ptr`, guard excluded. The debug
    /// allocator reports the requested size and checks the guard.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn query_size(&self, ptr: *const u8) -> usize {
        let Some(ptr) = NonNull::new(ptr.cast_mut()) else {
            return 0;
        };
        let route = self.resolve(ptr);
        // SAFETY: forwarded.
        unsafe {
            let usable = self.block_size(ptr, route).saturating_sub(D::GUARD_SIZE);
            self.debug.on_query(ptr, usable)
        }
    }

    /// Resize without moving; returns the usable size afterwards.
    ///
    /// Bucket elements keep their size. Tree blocks shrink or absorb the
    /// next free block, but never drop below the bucket ceiling.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn resize_in_place(&self, ptr: *mut u8, size: usize) -> usize {
        let Some(ptr) = NonNull::new(ptr) else {
            return 0;
        };
        let route = self.resolve(ptr);
        // SAFETY: forwarded.
        unsafe {
            self.debug.check(ptr);
            let usable = match route {
                Route::Bucket(index) => element_size(index),
                Route::Tree => self
                    .tree
                    .resize(ptr, size.saturating_add(D::GUARD_SIZE).max(MIN_TREE_RESIZE)),
            };
            self.debug
                .on_reallocate(ptr, ptr, usable - D::GUARD_SIZE, usable, route.origin())
        }
    }

    /// Return empty bucket pages and wholly free tree arenas to their
    /// source; returns the bytes released. In fixed-block mode bucket pages
    /// go back to the tree and the block itself stays.
    pub fn purge(&self) -> usize {
        let _tree = self.tree.hold();
        self.buckets.purge() + self.tree.purge()
    }

    /// Largest request served without mapping more memory, after a purge.
    pub fn max_allocation_size(&self) -> usize {
        let _tree = self.tree.hold();
        self.purge();
        self.buckets
            .max_allocation()
            .max(self.tree.max_allocation())
            .saturating_sub(D::GUARD_SIZE)
    }

    #[must_use]
    pub fn max_contiguous_allocation_size(&self) -> usize {
        MAX_CONTIGUOUS_ALLOCATION - D::GUARD_SIZE
    }

    /// Free bytes inside mapped memory; logs every free slot run and tree
    /// block at `info` when `report` is set.
    pub fn unused_memory(&self, report: bool) -> usize {
        self.buckets.unused_memory(report) + self.tree.unused_memory(report)
    }

    /// Bytes currently handed out, counted in element and block sizes.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.buckets.allocated() + self.tree.allocated()
    }

    /// Bytes reserved from the page source, or the fixed block length.
    /// Bucket pages carved from a fixed block are already part of it.
    #[must_use]
    pub fn capacity(&self) -> usize {
        if self.fixed_block {
            self.tree.capacity()
        } else {
            self.buckets.capacity() + self.tree.capacity()
        }
    }

    /// Whether the heap lives in a caller-supplied block.
    #[must_use]
    pub fn is_fixed_block(&self) -> bool {
        self.fixed_block
    }

    /// Log every live allocation (debug allocator only); returns the count.
    pub fn report(&self) -> usize {
        self.debug.report()
    }

    /// Verify the guard of every live allocation (debug allocator only).
    pub fn check(&self) {
        self.debug.check_all();
    }

    pub fn stats(&self) -> HphaStats {
        let bucket_allocated = self.buckets.allocated();
        let bucket_capacity = self.buckets.capacity();
        let tree_allocated = self.tree.allocated();
        let tree_capacity = self.tree.capacity();
        HphaStats {
            bucket_allocated,
            bucket_capacity,
            tree_allocated,
            tree_capacity,
            allocated_bytes: bucket_allocated + tree_allocated,
            capacity_bytes: self.capacity(),
            unused_bytes: self.unused_memory(false),
            live_debug_records: self.debug.live_records(),
            debug_requested_bytes: self.debug.requested_bytes(Origin::Bucket) + self.debug.requested_bytes(Origin::Tree),
        }
    }

    /// Walk every page list and arena chain.
    pub fn snapshot(&self) -> HeapSnapshot {
        let _tree = self.tree.hold();
        HeapSnapshot {
            buckets: self.buckets.snapshot(),
            tree: self.tree.snapshot(),
        }
    }
}

impl<D: DebugPolicy, S: PageSource> Drop for Hpha<D, S> {
    fn drop(&mut self) {
        let mut leaked = 0;
        if !std::thread::panicking() {
            leaked = self.allocated_bytes();
            if leaked > 0 {
                log::warn!("hpha: dropped with {leaked} bytes still allocated");
                self.debug.report();
            }
        }
        self.purge();
        if leaked == 0 && !std::thread::panicking() {
            if let Some(intact) = self.tree.fixed_block_intact() {
                hpha_assert!(intact, "fixed block is not whole again after every allocation was freed");
            }
        }
        // remaining pages and arenas go with the sub-allocators
    }
}
