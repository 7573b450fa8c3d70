mod common;

use hpha::FastRng;
use hpha::{HphaAllocator, HphaConfig};

fn tree_only() -> HphaAllocator {
    HphaAllocator::with_config(HphaConfig {
        enable_pool_allocations: false,
        ..HphaConfig::default()
    })
    .expect("config")
}

fn assert_tree_accounting(heap: &HphaAllocator) {
    let snapshot = heap.snapshot().tree;
    assert!(snapshot.is_consistent(), "inconsistent tree: {snapshot:?}");
    for arena in &snapshot.arenas {
        assert_eq!(
            arena.used_bytes + arena.free_bytes + arena.header_bytes,
            arena.reserved_bytes
        );
        // coalescing leaves at most one free block between used ones
        assert!(arena.free_blocks <= arena.used_blocks + 1);
    }
}

#[test]
fn random_churn_keeps_every_byte_accounted_for() {
    let heap = tree_only();
    let mut rng = FastRng::new(0xC0A1_E5CE);
    let mut live: Vec<(*mut u8, usize)> = Vec::new();
    for step in 0..3_000 {
        let op = rng.range(0, 9);
        if op < 5 || live.is_empty() {
            let size = rng.range(1, 20_000);
            let block = heap.allocate(size, 0).expect("allocation");
            live.push((block.ptr.as_ptr(), size));
        } else if op < 8 {
            let (ptr, _) = live.swap_remove(rng.range(0, live.len() - 1));
            // SAFETY: live block freed once.
            unsafe { heap.deallocate(ptr, None, None) };
        } else {
            let index = rng.range(0, live.len() - 1);
            let size = rng.range(1, 40_000);
            // SAFETY: live block replaced by the result.
            let block = unsafe { heap.reallocate(live[index].0, size, 0) }.expect("realloc");
            live[index] = (block.ptr.as_ptr(), size);
        }
        if step % 50 == 0 {
            assert_tree_accounting(&heap);
        }
    }
    for (ptr, _) in live {
        // SAFETY: live block freed once.
        unsafe { heap.deallocate(ptr, None, None) };
    }
    assert_tree_accounting(&heap);
    assert_eq!(heap.allocated_bytes(), 0);
    let snapshot = heap.snapshot().tree;
    assert!(snapshot.arenas.iter().all(|arena| arena.used_blocks == 0 && arena.free_blocks == 1));
}

#[test]
fn freeing_in_any_order_restores_one_free_block() {
    let heap = tree_only();
    let blocks: Vec<_> = (0..8).map(|_| heap.allocate(1_000, 0).expect("allocation")).collect();
    assert_eq!(heap.snapshot().tree.arenas.len(), 1);
    for index in [3, 1, 2, 7, 0, 5, 6, 4] {
        // SAFETY: each block is freed once.
        unsafe { heap.deallocate(blocks[index].ptr.as_ptr(), None, None) };
        assert_tree_accounting(&heap);
    }
    let arena = heap.snapshot().tree.arenas[0];
    assert_eq!(arena.free_blocks, 1);
    assert_eq!(arena.used_blocks, 0);
}

#[test]
fn aligned_blocks_leave_usable_fillers() {
    let heap = tree_only();
    let mut blocks = Vec::new();
    for align in [32, 64, 128, 512, 2048, 8192] {
        let block = heap.allocate(700, align).expect("allocation");
        assert_eq!(block.ptr.as_ptr() as usize % align, 0);
        blocks.push(block);
        assert_tree_accounting(&heap);
    }
    for block in blocks {
        // SAFETY: each block is freed once.
        unsafe { heap.deallocate(block.ptr.as_ptr(), None, None) };
    }
    assert_tree_accounting(&heap);
}

#[test]
fn in_place_growth_preserves_contents() {
    let heap = tree_only();
    let block = heap.allocate(2_000, 0).expect("allocation");
    // SAFETY: the block holds 2000 bytes.
    unsafe { common::stamp(block.ptr.as_ptr(), 2_000, 9) };
    // SAFETY: live block replaced by the result.
    let grown = unsafe { heap.reallocate(block.ptr.as_ptr(), 30_000, 0) }.expect("realloc");
    // the arena is otherwise empty, so the next block is free
    assert_eq!(grown.ptr, block.ptr);
    // SAFETY: the first 2000 bytes carry over.
    unsafe {
        assert!(common::stamped(grown.ptr.as_ptr(), 2_000, 9));
        heap.deallocate(grown.ptr.as_ptr(), None, None);
    }
    assert_tree_accounting(&heap);
}
