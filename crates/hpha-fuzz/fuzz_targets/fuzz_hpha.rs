#![no_main]
use hpha::{DebugHphaAllocator, HphaConfig};
use libfuzzer_sys::fuzz_target;

// Each 4-byte chunk is one operation: opcode, 16-bit size, alignment shift.
fuzz_target!(|data: &[u8]| {
    let Ok(heap) = DebugHphaAllocator::with_config(HphaConfig {
        capture_call_stacks: false,
        ..HphaConfig::default()
    }) else {
        return;
    };
    let mut live: Vec<(*mut u8, usize, usize)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let size = usize::from(u16::from_le_bytes([chunk[1], chunk[2]])).max(1);
        let align = 1usize << (chunk[3] % 13);
        match chunk[0] % 5 {
            0 => {
                if let Some(block) = heap.allocate(size, align) {
                    assert_eq!(block.ptr.as_ptr() as usize % align.max(8), 0);
                    // SAFETY: fresh block of `size` bytes.
                    unsafe { block.ptr.as_ptr().write_bytes(chunk[0], size) };
                    live.push((block.ptr.as_ptr(), size, align));
                }
            }
            1 => {
                if let Some((ptr, size, align)) = live.pop() {
                    // SAFETY: live block freed once with its allocation hints.
                    unsafe { heap.deallocate(ptr, Some(size), Some(align)) };
                }
            }
            2 => {
                if !live.is_empty() {
                    let index = usize::from(chunk[3]) % live.len();
                    let (ptr, _, _) = live[index];
                    // SAFETY: live block replaced by the result.
                    if let Some(block) = unsafe { heap.reallocate(ptr, size, 0) } {
                        live[index] = (block.ptr.as_ptr(), size, 8);
                    }
                }
            }
            3 => {
                if let Some(&(ptr, size, _)) = live.last() {
                    // SAFETY: live block.
                    assert_eq!(unsafe { heap.query_size(ptr) }, size);
                }
            }
            _ => {
                heap.purge();
                heap.check();
            }
        }
    }

    for (ptr, _, _) in live {
        // SAFETY: live block freed once.
        unsafe { heap.deallocate(ptr, None, None) };
    }
    assert_eq!(heap.allocated_bytes(), 0);
});
