#![allow(dead_code)]

use hpha::{DebugHphaAllocator, HphaConfig};

/// Debug allocator without call-stack capture, which is slow under load.
pub fn debug_heap() -> DebugHphaAllocator {
    DebugHphaAllocator::with_config(HphaConfig {
        capture_call_stacks: false,
        ..HphaConfig::default()
    })
    .expect("default config is valid")
}

/// Write a byte pattern derived from `tag` over `len` bytes.
///
/// # Safety
///
/// `ptr` must be valid for `len` writes.
pub unsafe fn stamp(ptr: *mut u8, len: usize, tag: u8) {
    for i in 0..len {
        // SAFETY: caller guarantees the range.
        unsafe { ptr.add(i).write(tag.wrapping_add(i as u8)) };
    }
}

/// Check a pattern written by [`stamp`].
///
/// # Safety
///
/// `ptr` must be valid for `len` reads.
pub unsafe fn stamped(ptr: *const u8, len: usize, tag: u8) -> bool {
    // SAFETY: caller guarantees the range.
    (0..len).all(|i| unsafe { ptr.add(i).read() } == tag.wrapping_add(i as u8))
}
