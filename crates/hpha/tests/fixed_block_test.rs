mod common;

use std::ptr::NonNull;

use common::{stamp, stamped};
use hpha::{ConfigError, DebugHphaAllocator, HphaAllocator, HphaConfig};

/// 16-byte aligned scratch memory for a heap to live in.
fn block(len: usize) -> Vec<u128> {
    vec![0; len / 16]
}

fn base_of(block: &mut [u128]) -> NonNull<u8> {
    NonNull::new(block.as_mut_ptr().cast::<u8>()).expect("vec pointer")
}

#[test]
fn every_block_comes_from_the_fixed_range() {
    let mut memory = block(1024 * 1024);
    let base = base_of(&mut memory);
    let len = memory.len() * 16;
    // SAFETY: `memory` outlives the heap and is not touched meanwhile.
    let heap = unsafe { HphaAllocator::with_fixed_block(HphaConfig::default(), base, len) }.expect("fixed block");
    let range = base.as_ptr() as usize..base.as_ptr() as usize + len;

    let mut live = Vec::new();
    for (i, size) in [8, 24, 200, 512, 700, 4_000, 33_000].into_iter().cycle().take(70).enumerate() {
        let block = heap.allocate(size, 0).expect("allocation");
        assert!(range.contains(&(block.ptr.as_ptr() as usize)));
        assert!(range.contains(&(block.ptr.as_ptr() as usize + size - 1)));
        // SAFETY: fresh block of at least `size` bytes.
        unsafe { stamp(block.ptr.as_ptr(), size, i as u8) };
        live.push((block.ptr, size, i as u8));
    }
    assert_eq!(heap.capacity(), len);
    assert!(heap.snapshot().tree.is_consistent());
    assert!(heap.snapshot().tree.carved_bytes > 0);

    for (ptr, size, tag) in live {
        // SAFETY: live, freed once, unhinted.
        unsafe {
            assert!(stamped(ptr.as_ptr(), size, tag));
            heap.deallocate(ptr.as_ptr(), None, None);
        }
    }
    assert_eq!(heap.allocated_bytes(), 0);
    heap.purge();
    assert_eq!(heap.snapshot().tree.carved_bytes, 0);
    assert_eq!(heap.capacity(), len);
    // the drop asserts the block is one free range again
    drop(heap);
}

#[test]
fn exhaustion_returns_none_without_mapping() {
    let mut memory = block(64 * 1024);
    let base = base_of(&mut memory);
    let len = memory.len() * 16;
    // SAFETY: as above.
    let heap = unsafe { HphaAllocator::with_fixed_block(HphaConfig::default(), base, len) }.expect("fixed block");
    let mut live = Vec::new();
    while let Some(block) = heap.allocate(10_000, 0) {
        live.push(block);
        assert!(live.len() < 8, "a 64 KiB block cannot hold eight 10 KB blocks");
    }
    assert_eq!(heap.allocate(len, 0), None);
    assert_eq!(heap.capacity(), len);
    for block in live {
        // SAFETY: freed once.
        unsafe { heap.deallocate(block.ptr.as_ptr(), Some(10_000), None) };
    }
    let whole = heap.allocate(40_000, 0).expect("freed blocks coalesce");
    // SAFETY: freed once.
    unsafe { heap.deallocate(whole.ptr.as_ptr(), None, None) };
}

#[test]
fn leaked_blocks_do_not_trip_the_drop_check() {
    let mut memory = block(64 * 1024);
    let base = base_of(&mut memory);
    // SAFETY: as above.
    let heap = unsafe { HphaAllocator::with_fixed_block(HphaConfig::default(), base, memory.len() * 16) }.expect("fixed block");
    assert!(heap.allocate(100, 0).is_some());
    assert!(heap.allocate(5_000, 0).is_some());
    drop(heap);
}

#[test]
fn debug_heap_in_a_fixed_block_checks_guards() {
    let mut memory = block(256 * 1024);
    let base = base_of(&mut memory);
    let config = HphaConfig {
        capture_call_stacks: false,
        ..HphaConfig::default()
    };
    // SAFETY: as above.
    let heap = unsafe { DebugHphaAllocator::with_fixed_block(config, base, memory.len() * 16) }.expect("fixed block");
    let small = heap.allocate(30, 0).expect("allocation");
    let large = heap.allocate(3_000, 0).expect("allocation");
    heap.check();
    assert_eq!(heap.report(), 2);
    // SAFETY: live blocks, freed once.
    unsafe {
        assert_eq!(heap.query_size(small.ptr.as_ptr()), 30);
        heap.deallocate(small.ptr.as_ptr(), Some(30), None);
        heap.deallocate(large.ptr.as_ptr(), None, None);
    }
    assert_eq!(heap.stats().live_debug_records, 0);
}

#[test]
fn unusable_blocks_are_refused() {
    let mut memory = block(4096);
    let base = base_of(&mut memory);
    // SAFETY: every call fails before the block is touched.
    unsafe {
        let odd = NonNull::new(base.as_ptr().add(4)).expect("non-null");
        assert!(matches!(
            HphaAllocator::with_fixed_block(HphaConfig::default(), odd, 1024),
            Err(ConfigError::FixedBlockMisaligned { .. })
        ));
        assert!(matches!(
            HphaAllocator::with_fixed_block(HphaConfig::default(), base, 40),
            Err(ConfigError::FixedBlockTooSmall { len: 32, .. })
        ));
        assert!(matches!(
            HphaAllocator::with_fixed_block(
                HphaConfig {
                    tree_page_size: 1000,
                    ..HphaConfig::default()
                },
                base,
                4096
            ),
            Err(ConfigError::NotPowerOfTwo { .. })
        ));
    }
}
