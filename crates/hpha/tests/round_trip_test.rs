mod common;

use common::{debug_heap, stamp, stamped};
use hpha::{FastRng, HphaAllocator, MAX_SMALL_ALLOCATION};

const ALIGNMENTS: [usize; 8] = [0, 8, 16, 32, 64, 256, 1024, 4096];

fn sizes() -> Vec<usize> {
    let mut sizes: Vec<usize> = (1..=64).collect();
    sizes.extend([
        MAX_SMALL_ALLOCATION - 16,
        MAX_SMALL_ALLOCATION - 1,
        MAX_SMALL_ALLOCATION,
        MAX_SMALL_ALLOCATION + 1,
        1000,
        4095,
        4096,
        65_536,
        300_000,
    ]);
    sizes
}

#[test]
fn every_size_and_alignment_round_trips() {
    let heap = HphaAllocator::new();
    for align in ALIGNMENTS {
        for size in sizes() {
            let block = heap.allocate(size, align).expect("allocation");
            let addr = block.ptr.as_ptr() as usize;
            assert_eq!(addr % align.max(8), 0, "size {size} align {align} at {addr:#x}");
            assert!(block.size >= size);
            // SAFETY: the block holds `size` bytes and is freed once.
            unsafe {
                stamp(block.ptr.as_ptr(), size, size as u8);
                assert!(heap.query_size(block.ptr.as_ptr()) >= size);
                assert!(stamped(block.ptr.as_ptr(), size, size as u8));
                assert!(heap.deallocate(block.ptr.as_ptr(), None, None) >= size);
            }
        }
    }
    assert_eq!(heap.allocated_bytes(), 0);
}

#[test]
fn hinted_frees_match_unhinted_frees() {
    let heap = debug_heap();
    for align in ALIGNMENTS {
        for size in sizes() {
            let block = heap.allocate(size, align).expect("allocation");
            // SAFETY: live block freed once with the hints it was allocated with.
            let released = unsafe { heap.deallocate(block.ptr.as_ptr(), Some(size), Some(align)) };
            assert!(released >= size + 16);
        }
    }
    assert_eq!(heap.allocated_bytes(), 0);
    assert_eq!(heap.stats().live_debug_records, 0);
}

#[test]
fn many_live_blocks_keep_their_contents() {
    let heap = HphaAllocator::new();
    let mut rng = FastRng::new(0x5EED);
    let mut live = Vec::new();
    for tag in 0..2_000u32 {
        let size = rng.range(1, 3_000);
        let block = heap.allocate(size, 0).expect("allocation");
        // SAFETY: fresh block of at least `size` bytes.
        unsafe { stamp(block.ptr.as_ptr(), size, tag as u8) };
        live.push((block.ptr, size, tag as u8));
    }
    for (ptr, size, tag) in live {
        // SAFETY: blocks are live and distinct.
        unsafe {
            assert!(stamped(ptr.as_ptr(), size, tag));
            heap.deallocate(ptr.as_ptr(), Some(size), None);
        }
    }
    assert_eq!(heap.allocated_bytes(), 0);
}

#[test]
#[should_panic(expected = "double free or pointer not owned")]
fn second_free_is_fatal_with_debugging() {
    let heap = debug_heap();
    let block = heap.allocate(48, 0).expect("allocation");
    // SAFETY: deliberately freed twice.
    unsafe {
        heap.deallocate(block.ptr.as_ptr(), None, None);
        heap.deallocate(block.ptr.as_ptr(), None, None);
    }
}

#[test]
#[should_panic(expected = "double free of tree block")]
fn second_tree_free_is_fatal_without_debugging() {
    let heap = HphaAllocator::new();
    let block = heap.allocate(4096, 0).expect("allocation");
    // keep the freed block from coalescing into an arena-sized block
    let _neighbour = heap.allocate(4096, 0).expect("allocation");
    // SAFETY: deliberately freed twice; the header is still mapped.
    unsafe {
        heap.deallocate(block.ptr.as_ptr(), None, None);
        heap.deallocate(block.ptr.as_ptr(), None, None);
    }
}
