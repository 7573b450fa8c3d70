mod common;

use std::ptr::NonNull;

use common::{debug_heap, stamp, stamped};
use hpha::{DebugPolicy, FastRng, Hpha, HphaAllocator};

const THREADS: usize = 8;
const OPS: usize = 10_000;

struct Live {
    ptr: NonNull<u8>,
    size: usize,
    tag: u8,
}

// SAFETY: a `Live` is only touched by the thread that allocated it.
unsafe impl Send for Live {}

/// Random alloc/free mix; returns what is still live and its byte count.
fn churn<D: DebugPolicy>(heap: &Hpha<D>, seed: u64) -> (Vec<Live>, usize) {
    let mut rng = FastRng::new(seed);
    let mut live: Vec<Live> = Vec::new();
    for op in 0..OPS {
        if rng.range(0, 1) == 0 || live.is_empty() {
            let size = rng.range(1, 2_048);
            let block = heap.allocate(size, 0).expect("allocation");
            let tag = op as u8;
            // SAFETY: fresh block of at least `size` bytes.
            unsafe { stamp(block.ptr.as_ptr(), size, tag) };
            live.push(Live { ptr: block.ptr, size, tag });
        } else {
            let victim = live.swap_remove(rng.range(0, live.len() - 1));
            // SAFETY: this thread owns the block; freed once.
            unsafe {
                assert!(stamped(victim.ptr.as_ptr(), victim.size, victim.tag));
                heap.deallocate(victim.ptr.as_ptr(), Some(victim.size), None);
            }
        }
    }
    // SAFETY: every remaining block is live.
    let bytes = live
        .iter()
        .map(|block| unsafe { heap.query_size(block.ptr.as_ptr()) })
        .sum();
    (live, bytes)
}

fn run<D: DebugPolicy>(heap: &Hpha<D>) {
    let results: Vec<(Vec<Live>, usize)> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|thread| scope.spawn(move || churn(heap, 0x1234_5678 + thread as u64)))
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker panicked"))
            .collect()
    });

    let outstanding: usize = results.iter().map(|(_, bytes)| bytes).sum();
    if D::ENABLED {
        // the debug allocator reports requested sizes
        assert_eq!(heap.stats().debug_requested_bytes, outstanding + 16 * results.iter().map(|(live, _)| live.len()).sum::<usize>());
    } else {
        assert_eq!(heap.allocated_bytes(), outstanding);
    }
    assert!(heap.snapshot().buckets_consistent());
    assert!(heap.snapshot().tree.is_consistent());

    for (live, _) in results {
        for block in live {
            // SAFETY: every thread is done; each block is freed once.
            unsafe {
                assert!(stamped(block.ptr.as_ptr(), block.size, block.tag));
                heap.deallocate(block.ptr.as_ptr(), None, None);
            }
        }
    }
    assert_eq!(heap.allocated_bytes(), 0);
    heap.purge();
    assert_eq!(heap.capacity(), 0);
}

#[test]
fn eight_threads_keep_counters_consistent() {
    run(&HphaAllocator::new());
}

#[test]
fn eight_threads_with_debugging() {
    let heap = debug_heap();
    run(&heap);
    assert_eq!(heap.stats().live_debug_records, 0);
}

/// Blocks cross threads and are freed without hints while other threads
/// purge, so pages join and leave the bucket map under concurrent lookups.
#[test]
fn unhinted_frees_race_with_page_turnover() {
    let heap = HphaAllocator::new();
    let handoff: Vec<parking_lot::Mutex<Vec<(usize, usize)>>> =
        (0..THREADS).map(|_| parking_lot::Mutex::new(Vec::new())).collect();
    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let (heap, handoff) = (&heap, &handoff);
            scope.spawn(move || {
                let mut rng = FastRng::new(0xF4EE + thread as u64);
                for op in 0..2_000 {
                    let size = if rng.range(0, 3) == 0 { rng.range(3_000, 40_000) } else { rng.range(1, 512) };
                    let block = heap.allocate(size, 0).expect("allocation");
                    // SAFETY: live block of at least `size` bytes.
                    assert!(unsafe { heap.query_size(block.ptr.as_ptr()) } >= size);
                    handoff[(thread + 1) % THREADS]
                        .lock()
                        .push((block.ptr.as_ptr() as usize, size));
                    let taken: Vec<_> = std::mem::take(&mut *handoff[thread].lock());
                    for (addr, size) in taken {
                        // SAFETY: each handed-off block is live and freed once,
                        // by the thread that took it.
                        unsafe {
                            assert!(heap.query_size(addr as *const u8) >= size);
                            heap.deallocate(addr as *mut u8, None, None);
                        }
                    }
                    if op % 97 == 0 {
                        heap.purge();
                    }
                }
            });
        }
    });
    for queue in &handoff {
        for (addr, _) in queue.lock().drain(..) {
            // SAFETY: left over after every thread finished; freed once.
            unsafe { heap.deallocate(addr as *mut u8, None, None) };
        }
    }
    assert_eq!(heap.allocated_bytes(), 0);
    heap.purge();
    assert_eq!(heap.capacity(), 0);
}
