use hpha::HphaAllocator;

#[test]
fn purge_is_idempotent_and_keeps_allocations() {
    let heap = HphaAllocator::new();
    let keep_small = heap.allocate(32, 0).expect("allocation");
    let keep_large = heap.allocate(10_000, 0).expect("allocation");
    let temporary: Vec<_> = (0..200)
        .map(|i| heap.allocate(if i % 2 == 0 { 48 } else { 200_000 }, 0).expect("allocation"))
        .collect();
    for block in temporary {
        // SAFETY: freed once.
        unsafe { heap.deallocate(block.ptr.as_ptr(), None, None) };
    }

    let allocated = heap.allocated_bytes();
    let capacity = heap.capacity();
    let released = heap.purge();
    assert!(released > 0);
    assert_eq!(heap.capacity(), capacity - released);
    assert_eq!(heap.allocated_bytes(), allocated);
    assert_eq!(heap.purge(), 0);
    assert_eq!(heap.allocated_bytes(), allocated);

    // SAFETY: both blocks are still live.
    unsafe {
        assert!(heap.query_size(keep_small.ptr.as_ptr()) >= 32);
        assert!(heap.query_size(keep_large.ptr.as_ptr()) >= 10_000);
        heap.deallocate(keep_small.ptr.as_ptr(), None, None);
        heap.deallocate(keep_large.ptr.as_ptr(), None, None);
    }
    heap.purge();
    assert_eq!(heap.capacity(), 0);
}

#[test]
fn purged_memory_is_reused_after_regrowth() {
    let heap = HphaAllocator::new();
    for round in 0..4 {
        let blocks: Vec<_> = (0..64).map(|_| heap.allocate(1 << 14, 0).expect("allocation")).collect();
        for block in blocks {
            // SAFETY: freed once.
            unsafe { heap.deallocate(block.ptr.as_ptr(), None, None) };
        }
        assert_eq!(heap.allocated_bytes(), 0, "round {round}");
        heap.purge();
        assert_eq!(heap.capacity(), 0, "round {round}");
    }
}

#[test]
fn stats_track_both_paths() {
    let heap = HphaAllocator::new();
    let small = heap.allocate(100, 0).expect("allocation");
    let large = heap.allocate(5_000, 0).expect("allocation");
    let stats = heap.stats();
    assert_eq!(stats.bucket_allocated, small.size);
    assert_eq!(stats.tree_allocated, large.size);
    assert_eq!(stats.allocated_bytes, small.size + large.size);
    assert_eq!(stats.capacity_bytes, heap.capacity());
    assert_eq!(stats.unused_bytes, heap.unused_memory(false));
    assert!(stats.unused_bytes + stats.allocated_bytes <= stats.capacity_bytes);
    let json = serde_json::to_value(stats).expect("stats serialize");
    assert_eq!(json["live_debug_records"], 0);
    // SAFETY: freed once.
    unsafe {
        heap.deallocate(small.ptr.as_ptr(), None, None);
        heap.deallocate(large.ptr.as_ptr(), None, None);
    }
}
