mod common;

use common::debug_heap;
use hpha::{DebugHphaAllocator, HphaAllocator, HphaConfig};

#[test]
#[should_panic(expected = "buffer overrun")]
fn overrun_of_a_bucket_block_is_caught_on_free() {
    let heap = debug_heap();
    let block = heap.allocate(20, 0).expect("allocation");
    // SAFETY: one byte past the request lands in the guard, still inside
    // the element.
    unsafe {
        let past = block.ptr.as_ptr().add(20);
        past.write(!past.read());
        heap.deallocate(block.ptr.as_ptr(), None, None);
    }
}

#[test]
#[should_panic(expected = "buffer overrun")]
fn overrun_of_a_tree_block_is_caught_on_query() {
    let heap = debug_heap();
    let block = heap.allocate(3_000, 0).expect("allocation");
    // SAFETY: as above, inside the tree block.
    unsafe {
        let past = block.ptr.as_ptr().add(3_000);
        past.write(!past.read());
        heap.query_size(block.ptr.as_ptr());
    }
}

#[test]
#[should_panic(expected = "buffer overrun")]
fn check_walks_every_live_allocation() {
    let heap = debug_heap();
    let blocks: Vec<_> = (1..50).map(|size| heap.allocate(size * 7, 0).expect("allocation")).collect();
    heap.check();
    let victim = blocks[31];
    // SAFETY: inside the victim's guard.
    unsafe {
        let past = victim.ptr.as_ptr().add(victim.size + 3);
        past.write(!past.read());
    }
    heap.check();
}

#[test]
fn overrun_goes_unnoticed_without_debugging() {
    let heap = HphaAllocator::new();
    let block = heap.allocate(20, 0).expect("allocation");
    // SAFETY: the element is 24 bytes, so byte 20 is in bounds.
    unsafe {
        block.ptr.as_ptr().add(20).write(0xAA);
        assert_eq!(heap.deallocate(block.ptr.as_ptr(), None, None), 24);
    }
}

#[test]
fn fresh_and_freed_memory_is_filled() {
    let heap = debug_heap();
    let block = heap.allocate(64, 0).expect("allocation");
    // SAFETY: the block holds 64 bytes.
    let fresh = unsafe { std::slice::from_raw_parts(block.ptr.as_ptr(), 64) };
    assert!(fresh.chunks(4).all(|word| word == [0xFF, 0xC0, 0xC0, 0xFF]));
    // SAFETY: freed once.
    unsafe { heap.deallocate(block.ptr.as_ptr(), None, None) };
}

#[test]
fn filling_can_be_disabled() {
    let heap = DebugHphaAllocator::with_config(HphaConfig {
        fill_debug_memory: false,
        capture_call_stacks: false,
        ..HphaConfig::default()
    })
    .expect("config");
    let block = heap.allocate(5_000, 0).expect("allocation");
    // fresh arena pages come zeroed from the OS
    // SAFETY: the block holds 5000 bytes.
    let fresh = unsafe { std::slice::from_raw_parts(block.ptr.as_ptr(), 5_000) };
    assert!(fresh.iter().all(|&b| b == 0));
    // SAFETY: freed once.
    unsafe { heap.deallocate(block.ptr.as_ptr(), None, None) };
}

#[test]
fn report_counts_live_allocations_and_stacks() {
    let heap = DebugHphaAllocator::new();
    let a = heap.allocate(10, 0).expect("allocation");
    let b = heap.allocate(10_000, 64).expect("allocation");
    assert_eq!(heap.report(), 2);
    let stats = heap.stats();
    assert_eq!(stats.live_debug_records, 2);
    assert_eq!(stats.debug_requested_bytes, 10 + 10_000 + 2 * 16);
    // SAFETY: freed once each.
    unsafe {
        heap.deallocate(a.ptr.as_ptr(), Some(10), None);
        heap.deallocate(b.ptr.as_ptr(), Some(10_000), Some(64));
    }
    assert_eq!(heap.report(), 0);
}

#[test]
#[should_panic(expected = "size hint")]
fn short_size_hint_is_fatal() {
    let heap = debug_heap();
    let block = heap.allocate(100, 0).expect("allocation");
    // SAFETY: deliberately short hint that still routes to the same bucket.
    unsafe { heap.deallocate(block.ptr.as_ptr(), Some(99), None) };
}

#[test]
fn leaks_are_reported_not_fatal() {
    let heap = debug_heap();
    let _leaked = heap.allocate(77, 0).expect("allocation");
    drop(heap);
}
