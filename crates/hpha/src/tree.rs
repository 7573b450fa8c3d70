//! Large-object path: boundary-tag blocks indexed by size.
//!
//! Arenas come from a [`PageSource`] on demand, or from one caller-supplied
//! fixed block that is never grown past, and are laid out as a chain of
//! [`BlockHeader`](crate::block)s framed by two zero-size fences. Free
//! blocks are kept in a `(size, address)` ordered set for best-fit lookup;
//! every free is immediately coalesced with free neighbours, so two free
//! blocks are never adjacent.
//!
//! All operations run under one re-entrant lock. The dispatch layer holds
//! it across an allocation attempt, the purge that follows a failure, and
//! the retry.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::allocator::Allocation;
use crate::block::{BLOCK_HEADER_SIZE, BlockPtr, MIN_FREE_NODE_SIZE};
use crate::os::{PageSource, SystemPages};
use crate::stats::{TreeArenaSnapshot, TreeSnapshot};
use crate::util::{align_up, is_aligned};

/// Alignment of every tree payload.
pub const TREE_ALIGNMENT: usize = BLOCK_HEADER_SIZE;

/// Bytes of bookkeeping in a fresh arena: two fences and one block header.
pub const ARENA_OVERHEAD: usize = 3 * BLOCK_HEADER_SIZE;

/// Upper bound on free blocks examined per aligned allocation before
/// falling back to a block beyond the search window or a fresh arena.
pub const MAX_ALIGNED_SCAN: usize = 64;

/// Smallest block a fixed-block tree can be seeded with.
pub const MIN_FIXED_BLOCK: usize = ARENA_OVERHEAD + MIN_FREE_NODE_SIZE;

/// Smallest gap that may precede an aligned block: a header plus a free node.
const MIN_FILLER: usize = BLOCK_HEADER_SIZE + MIN_FREE_NODE_SIZE;

pub(crate) struct TreeState<P> {
    /// Free blocks keyed by `(payload size, header address)`.
    free: BTreeSet<(usize, usize)>,
    /// Live arenas: base address -> mapped length.
    arenas: BTreeMap<usize, usize>,
    allocated: usize,
    /// Payload bytes of used blocks lent out as bucket pages.
    carved: usize,
    capacity: usize,
    page_size: usize,
    /// Base of the caller-supplied arena, which is never purged or freed.
    fixed: Option<usize>,
    source: P,
}

/// Boundary-tag allocator for requests above the bucket ceiling.
pub struct TreeAllocator<P: PageSource = SystemPages> {
    state: ReentrantMutex<RefCell<TreeState<P>>>,
}

/// Payload size actually reserved for a request of `size` bytes.
fn normalize(size: usize) -> Option<usize> {
    align_up(size.max(MIN_FREE_NODE_SIZE), BLOCK_HEADER_SIZE)
}

/// Distance from `mem` to the first `align`-aligned address that leaves
/// either no gap or a gap big enough to become a free block.
fn aligned_offset(mem: usize, align: usize) -> Option<usize> {
    let mut offset = align_up(mem, align)? - mem;
    if offset > 0 && offset < MIN_FILLER {
        offset = align_up(mem.checked_add(MIN_FILLER)?, align)? - mem;
    }
    Some(offset)
}

fn to_allocation(block: BlockPtr) -> Allocation {
    // SAFETY: a payload address is a header address plus 16, never null.
    let ptr = unsafe { NonNull::new_unchecked(block.mem()) };
    Allocation {
        ptr,
        size: block.size(),
    }
}

impl<P: PageSource> TreeState<P> {
    fn insert(&mut self, block: BlockPtr) {
        debug_assert!(!block.used());
        self.free.insert((block.size(), block.addr()));
    }

    fn detach(&mut self, block: BlockPtr) {
        let removed = self.free.remove(&(block.size(), block.addr()));
        hpha_assert!(
            removed,
            "free block {:#x} ({} bytes) missing from the size index",
            block.addr(),
            block.size()
        );
    }

    /// Frame `base..base + len` with fences, index its one free block and
    /// return it.
    ///
    /// # Safety
    ///
    /// The range must be writable, 16-byte aligned, at least
    /// [`MIN_FIXED_BLOCK`] long and used by nothing else.
    unsafe fn add_arena(&mut self, base: usize, len: usize) -> BlockPtr {
        self.capacity += len;
        self.arenas.insert(base, len);
        // SAFETY: all three headers land inside the range.
        let block = unsafe {
            let front = BlockPtr::init(base, None, 0, true);
            let block = BlockPtr::init(base + BLOCK_HEADER_SIZE, Some(front), len - ARENA_OVERHEAD, false);
            BlockPtr::init(base + len - BLOCK_HEADER_SIZE, Some(block), 0, true);
            block
        };
        self.insert(block);
        block
    }

    /// Map a new arena with room for a `size`-byte payload and index it.
    /// A fixed-block tree never grows.
    fn grow(&mut self, size: usize) -> Option<BlockPtr> {
        if self.fixed.is_some() {
            log::debug!("tree: fixed block exhausted by a {size} byte request");
            return None;
        }
        let needed = size.checked_add(ARENA_OVERHEAD)?;
        let len = if needed < self.page_size {
            self.page_size
        } else {
            align_up(needed, crate::os::page_size())?
        };
        let base = self.source.alloc_pages(len, 0)?.as_ptr() as usize;
        log::debug!("tree: new arena {base:#x} ({len} bytes) for a {size} byte request");
        // SAFETY: a fresh block of `len` bytes, page aligned.
        Some(unsafe { self.add_arena(base, len) })
    }

    /// Remove and return the smallest free block of at least `size` bytes.
    fn extract(&mut self, size: usize) -> Option<BlockPtr> {
        let &(_, addr) = self.free.range((size, 0)..).next()?;
        // SAFETY: indexed addresses are live free headers.
        let block = unsafe { BlockPtr::from_addr(addr) };
        self.detach(block);
        Some(block)
    }

    /// Find a free block that can host an `align`-aligned payload of `size`
    /// bytes, detach it, and return it with the offset of the aligned payload.
    fn extract_aligned(&mut self, size: usize, align: usize) -> Option<(BlockPtr, usize)> {
        let window_end = size.checked_add(align)?.checked_add(MIN_FILLER)?;
        let mut hit = None;
        for &(block_size, addr) in self.free.range((size, 0)..(window_end, 0)).take(MAX_ALIGNED_SCAN) {
            // SAFETY: indexed addresses are live free headers.
            let block = unsafe { BlockPtr::from_addr(addr) };
            let offset = aligned_offset(block.mem() as usize, align)?;
            if block_size >= size + offset {
                hit = Some((block, offset));
                break;
            }
        }
        let (block, offset) = match hit {
            Some(found) => found,
            None => {
                // Anything at or past the window end fits whatever the offset.
                let &(_, addr) = self.free.range((window_end, 0)..).next()?;
                // SAFETY: as above.
                let block = unsafe { BlockPtr::from_addr(addr) };
                (block, aligned_offset(block.mem() as usize, align)?)
            }
        };
        self.detach(block);
        Some((block, offset))
    }

    /// Trim `block` to `size`, return the tail to the index, mark it used.
    fn finish_alloc(&mut self, block: BlockPtr, size: usize) -> BlockPtr {
        if block.size() >= size + BLOCK_HEADER_SIZE + MIN_FREE_NODE_SIZE {
            let tail = block.split(size);
            self.insert(tail);
        }
        block.set_used();
        self.allocated += block.size();
        block
    }

    fn alloc(&mut self, size: usize) -> Option<BlockPtr> {
        let size = normalize(size)?;
        let block = match self.extract(size) {
            Some(block) => block,
            None => {
                let block = self.grow(size)?;
                self.detach(block);
                block
            }
        };
        Some(self.finish_alloc(block, size))
    }

    fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<BlockPtr> {
        if align <= TREE_ALIGNMENT {
            return self.alloc(size);
        }
        let size = normalize(size)?;
        let (block, offset) = match self.extract_aligned(size, align) {
            Some(found) => found,
            None => {
                let padded = size.checked_add(align)?.checked_add(MIN_FILLER)?;
                let block = self.grow(padded)?;
                self.detach(block);
                let offset = aligned_offset(block.mem() as usize, align)?;
                (block, offset)
            }
        };
        let block = if offset > 0 {
            // Leading filler stays free; its predecessor is used because free
            // blocks never touch.
            let aligned = block.split(offset - BLOCK_HEADER_SIZE);
            self.insert(block);
            aligned
        } else {
            block
        };
        hpha_assert!(
            is_aligned(block.mem() as usize, align),
            "aligned extraction produced {:#x} for alignment {align}",
            block.mem() as usize
        );
        Some(self.finish_alloc(block, size))
    }

    /// Merge a just-freed block with free neighbours. The result is not
    /// yet indexed.
    fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        debug_assert!(!block.used());
        let next = block.next();
        if !next.used() {
            self.detach(next);
            next.unlink();
        }
        match block.prev() {
            Some(prev) if !prev.used() => {
                self.detach(prev);
                block.unlink();
                prev
            }
            _ => block,
        }
    }

    fn free_block(&mut self, block: BlockPtr) -> usize {
        hpha_assert!(
            block.used(),
            "double free of tree block {:#x} ({} bytes)",
            block.mem() as usize,
            block.size()
        );
        let size = block.size();
        self.allocated -= size;
        block.set_unused();
        let merged = self.coalesce(block);
        self.insert(merged);
        size
    }

    /// Shrink a used block in place when the remainder can stand alone.
    fn shrink(&mut self, block: BlockPtr, size: usize) {
        let current = block.size();
        if current >= size + BLOCK_HEADER_SIZE + MIN_FREE_NODE_SIZE {
            let tail = block.split(size);
            let tail = self.coalesce(tail);
            self.insert(tail);
            self.allocated -= current - block.size();
        }
    }

    /// Grow a used block by absorbing the free block after it.
    fn grow_into_next(&mut self, block: BlockPtr, size: usize) -> bool {
        let next = block.next();
        if next.used() || block.size() + BLOCK_HEADER_SIZE + next.size() < size {
            return false;
        }
        let current = block.size();
        self.detach(next);
        next.unlink();
        if block.size() >= size + BLOCK_HEADER_SIZE + MIN_FREE_NODE_SIZE {
            let tail = block.split(size);
            self.insert(tail);
        }
        self.allocated += block.size() - current;
        true
    }

    /// Grow a used block by absorbing both free neighbours; the payload
    /// moves down to the previous block's payload address.
    fn grow_into_neighbours(&mut self, block: BlockPtr, size: usize) -> Option<BlockPtr> {
        let prev = block.prev()?;
        if prev.used() {
            return None;
        }
        let next = block.next();
        let next_room = if next.used() { 0 } else { BLOCK_HEADER_SIZE + next.size() };
        if prev.size() + BLOCK_HEADER_SIZE + block.size() + next_room < size {
            return None;
        }
        let current = block.size();
        self.detach(prev);
        if !next.used() {
            self.detach(next);
            next.unlink();
        }
        block.unlink();
        // SAFETY: source and destination both lie inside the merged block;
        // `copy` tolerates the overlap.
        unsafe { std::ptr::copy(block.mem(), prev.mem(), current) };
        prev.set_used();
        if prev.size() >= size + BLOCK_HEADER_SIZE + MIN_FREE_NODE_SIZE {
            let tail = prev.split(size);
            self.insert(tail);
        }
        self.allocated += prev.size() - current;
        Some(prev)
    }

    fn realloc(&mut self, block: BlockPtr, size: usize) -> Option<BlockPtr> {
        hpha_assert!(block.used(), "realloc of free tree block {:#x}", block.mem() as usize);
        let size = normalize(size)?;
        if size <= block.size() {
            self.shrink(block, size);
            return Some(block);
        }
        if self.grow_into_next(block, size) {
            return Some(block);
        }
        if let Some(moved) = self.grow_into_neighbours(block, size) {
            return Some(moved);
        }
        let fresh = self.alloc(size)?;
        // SAFETY: distinct used blocks never overlap; `block` is smaller
        // than `fresh` here.
        unsafe { std::ptr::copy_nonoverlapping(block.mem(), fresh.mem(), block.size()) };
        self.free_block(block);
        Some(fresh)
    }

    fn realloc_aligned(&mut self, block: BlockPtr, size: usize, align: usize) -> Option<BlockPtr> {
        hpha_assert!(block.used(), "realloc of free tree block {:#x}", block.mem() as usize);
        let size = normalize(size)?;
        if is_aligned(block.mem() as usize, align) {
            if size <= block.size() {
                self.shrink(block, size);
                return Some(block);
            }
            if self.grow_into_next(block, size) {
                return Some(block);
            }
        }
        let fresh = self.alloc_aligned(size, align)?;
        let keep = block.size().min(fresh.size());
        // SAFETY: distinct used blocks never overlap.
        unsafe { std::ptr::copy_nonoverlapping(block.mem(), fresh.mem(), keep) };
        self.free_block(block);
        Some(fresh)
    }

    fn resize(&mut self, block: BlockPtr, size: usize) -> usize {
        hpha_assert!(block.used(), "resize of free tree block {:#x}", block.mem() as usize);
        if let Some(size) = normalize(size) {
            if size <= block.size() {
                self.shrink(block, size);
            } else {
                self.grow_into_next(block, size);
            }
        }
        block.size()
    }

    /// Release every arena that is one free block from fence to fence.
    fn purge(&mut self) -> usize {
        let whole_arenas: Vec<BlockPtr> = self
            .free
            .iter()
            // SAFETY: indexed addresses are live free headers.
            .map(|&(_, addr)| unsafe { BlockPtr::from_addr(addr) })
            .filter(|block| {
                block
                    .prev()
                    .is_some_and(|front| front.prev().is_none() && Some(front.addr()) != self.fixed)
                    && block.next().is_fence()
            })
            .collect();

        let mut released = 0;
        for block in whole_arenas {
            let Some(front) = block.prev() else { continue };
            self.detach(block);
            let base = front.addr();
            let len = block.size() + ARENA_OVERHEAD;
            let recorded = self.arenas.remove(&base);
            hpha_assert!(
                recorded == Some(len),
                "arena {base:#x} spans {len} bytes but {recorded:?} were mapped"
            );
            self.capacity -= len;
            released += len;
            // SAFETY: the arena holds no used blocks and is no longer indexed.
            unsafe {
                std::ptr::write_bytes(base as *mut u8, 0xFF, BLOCK_HEADER_SIZE);
                if let Some(ptr) = NonNull::new(base as *mut u8) {
                    self.source.free_pages(ptr, len);
                }
            }
        }
        released
    }

    fn snapshot(&self) -> TreeSnapshot {
        let mut arenas = Vec::with_capacity(self.arenas.len());
        for (&base, &reserved) in &self.arenas {
            let mut arena = TreeArenaSnapshot {
                base,
                reserved_bytes: reserved,
                header_bytes: 2 * BLOCK_HEADER_SIZE,
                ..TreeArenaSnapshot::default()
            };
            // SAFETY: every arena starts with a front fence followed by a block.
            let mut block = unsafe { BlockPtr::from_addr(base + BLOCK_HEADER_SIZE) };
            while !block.is_fence() {
                arena.header_bytes += BLOCK_HEADER_SIZE;
                if block.used() {
                    arena.used_bytes += block.size();
                    arena.used_blocks += 1;
                } else {
                    arena.free_bytes += block.size();
                    arena.free_blocks += 1;
                }
                block = block.next();
            }
            hpha_assert!(
                block.addr() == base + reserved - BLOCK_HEADER_SIZE,
                "arena {base:#x} chain ends at {:#x}, expected the end fence",
                block.addr()
            );
            arenas.push(arena);
        }
        TreeSnapshot {
            arenas,
            allocated_bytes: self.allocated,
            carved_bytes: self.carved,
            capacity_bytes: self.capacity,
            indexed_free_blocks: self.free.len(),
            indexed_free_bytes: self.free.iter().map(|&(size, _)| size).sum(),
        }
    }
}

impl<P: PageSource> TreeAllocator<P> {
    /// `page_size` is the minimum arena length requested from `source`.
    #[must_use]
    pub fn new(page_size: usize, source: P) -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(TreeState {
                free: BTreeSet::new(),
                arenas: BTreeMap::new(),
                allocated: 0,
                carved: 0,
                capacity: 0,
                page_size,
                fixed: None,
                source,
            })),
        }
    }

    /// Tree that lives entirely inside `base..base + len` and never asks
    /// `source` for memory.
    ///
    /// # Safety
    ///
    /// The block must be writable, aligned to [`TREE_ALIGNMENT`], a
    /// multiple of it in length, at least [`MIN_FIXED_BLOCK`] long, and
    /// untouched by anything but this tree until the tree is dropped.
    pub unsafe fn with_fixed_block(page_size: usize, source: P, base: NonNull<u8>, len: usize) -> Self {
        let base = base.as_ptr() as usize;
        hpha_assert!(
            is_aligned(base, TREE_ALIGNMENT) && is_aligned(len, TREE_ALIGNMENT) && len >= MIN_FIXED_BLOCK,
            "fixed block {base:#x} ({len} bytes) is misaligned or too small"
        );
        let mut tree = Self::new(page_size, source);
        let state = tree.state.get_mut().get_mut();
        state.fixed = Some(base);
        // SAFETY: forwarded.
        unsafe { state.add_arena(base, len) };
        log::debug!("tree: seeded from fixed block {base:#x} ({len} bytes)");
        tree
    }

    /// Take the tree lock for a sequence of calls. Nested calls from the
    /// same thread re-enter it.
    pub(crate) fn hold(&self) -> ReentrantMutexGuard<'_, RefCell<TreeState<P>>> {
        self.state.lock()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TreeState<P>) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// Allocate at least `size` bytes, 16-byte aligned.
    pub fn alloc(&self, size: usize) -> Option<Allocation> {
        self.with_state(|state| state.alloc(size)).map(to_allocation)
    }

    /// Allocate at least `size` bytes aligned to `align` (a power of two).
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Option<Allocation> {
        hpha_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        self.with_state(|state| state.alloc_aligned(size, align)).map(to_allocation)
    }

    /// Grow or shrink a block, in place when possible.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this tree.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<Allocation> {
        // SAFETY: forwarded.
        let block = unsafe { BlockPtr::from_mem(ptr.as_ptr()) };
        self.with_state(|state| state.realloc(block, size)).map(to_allocation)
    }

    /// As [`realloc`](Self::realloc), keeping the payload `align`-aligned.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this tree.
    pub unsafe fn realloc_aligned(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Option<Allocation> {
        hpha_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        // SAFETY: forwarded.
        let block = unsafe { BlockPtr::from_mem(ptr.as_ptr()) };
        if align <= TREE_ALIGNMENT {
            return self.with_state(|state| state.realloc(block, size)).map(to_allocation);
        }
        self.with_state(|state| state.realloc_aligned(block, size, align)).map(to_allocation)
    }

    /// Resize in place only; returns the resulting payload size.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this tree.
    pub unsafe fn resize(&self, ptr: NonNull<u8>, size: usize) -> usize {
        // SAFETY: forwarded.
        let block = unsafe { BlockPtr::from_mem(ptr.as_ptr()) };
        self.with_state(|state| state.resize(block, size))
    }

    /// Free a block; returns its payload size.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this tree. Freeing it twice is
    /// caught by the used-flag check as long as the block was not reused.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: forwarded.
        let block = unsafe { BlockPtr::from_mem(ptr.as_ptr()) };
        self.with_state(|state| state.free_block(block))
    }

    /// Payload size of a used block, zero if the block is free.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a payload inside a live tree arena.
    pub unsafe fn size_of(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: forwarded.
        let block = unsafe { BlockPtr::from_mem(ptr.as_ptr()) };
        self.with_state(|_| if block.used() { block.size() } else { 0 })
    }

    /// Return whole free arenas to the OS; returns bytes released.
    pub fn purge(&self) -> usize {
        let released = self.with_state(TreeState::purge);
        if released > 0 {
            log::debug!("tree: purge released {released} bytes");
        }
        released
    }

    /// Largest free block, i.e. the largest request served without growing.
    #[must_use]
    pub fn max_allocation(&self) -> usize {
        self.with_state(|state| state.free.last().map_or(0, |&(size, _)| size))
    }

    /// Total free payload bytes; lists every free block at `info` if `report`.
    pub fn unused_memory(&self, report: bool) -> usize {
        self.with_state(|state| {
            let mut unused = 0;
            for &(size, addr) in &state.free {
                unused += size;
                if report {
                    log::info!("tree: unused block {:#x} size {size}", addr + BLOCK_HEADER_SIZE);
                }
            }
            unused
        })
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.with_state(|state| state.allocated)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.with_state(|state| state.capacity)
    }

    #[must_use]
    pub fn snapshot(&self) -> TreeSnapshot {
        self.with_state(|state| state.snapshot())
    }

    /// Lend out `size` bytes aligned to `align` as a bucket page. The block
    /// counts as carved rather than allocated.
    pub fn carve_page(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        hpha_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        self.with_state(|state| {
            let block = state.alloc_aligned(size, align)?;
            state.allocated -= block.size();
            state.carved += block.size();
            Some(to_allocation(block).ptr)
        })
    }

    /// Take back a page lent out by [`carve_page`](Self::carve_page).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `carve_page` on this tree and be unused.
    pub unsafe fn release_page(&self, ptr: NonNull<u8>) {
        // SAFETY: forwarded.
        let block = unsafe { BlockPtr::from_mem(ptr.as_ptr()) };
        self.with_state(|state| {
            let size = block.size();
            state.carved -= size;
            state.allocated += size;
            state.free_block(block);
        });
    }

    /// For a fixed-block tree, whether the block is one free block from
    /// fence to fence again; `None` for a tree that maps its own arenas.
    #[must_use]
    pub fn fixed_block_intact(&self) -> Option<bool> {
        self.with_state(|state| {
            let base = state.fixed?;
            let len = state.arenas.get(&base).copied()?;
            Some(
                state.arenas.len() == 1
                    && state.free.len() == 1
                    && state
                        .free
                        .first()
                        .is_some_and(|&(size, addr)| addr == base + BLOCK_HEADER_SIZE && size + ARENA_OVERHEAD == len),
            )
        })
    }
}

impl<P: PageSource> Drop for TreeAllocator<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut().get_mut();
        for (&base, &len) in &state.arenas {
            if Some(base) == state.fixed {
                continue;
            }
            if let Some(ptr) = NonNull::new(base as *mut u8) {
                // SAFETY: the allocator is going away; nothing can reach the
                // arena through it any more.
                unsafe { state.source.free_pages(ptr, len) };
            }
        }
        state.arenas.clear();
        state.free.clear();
        state.capacity = 0;
    }
}
