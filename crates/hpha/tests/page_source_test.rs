mod common;

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{stamp, stamped};
use hpha::{Hpha, HphaConfig, NoDebug, PageSource, SystemPages};

const ALWAYS: usize = usize::MAX;

/// OS pages behind a switch that refuses the next `fail` requests.
#[derive(Default)]
struct Flaky {
    fail: AtomicUsize,
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

impl Flaky {
    fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    fn refuse(&self, count: usize) {
        self.fail.store(count, Ordering::SeqCst);
    }
}

impl PageSource for Flaky {
    fn alloc_pages(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                ALWAYS => Some(ALWAYS),
                left => Some(left - 1),
            })
            .is_ok();
        if refused {
            return None;
        }
        SystemPages.alloc_pages(size, alignment)
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, size: usize) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        // SAFETY: forwarded.
        unsafe { SystemPages.free_pages(ptr, size) }
    }
}

fn heap() -> (Hpha<NoDebug, Arc<Flaky>>, Arc<Flaky>) {
    let source = Arc::new(Flaky::default());
    let heap = Hpha::with_source(HphaConfig::default(), Arc::clone(&source)).expect("default config is valid");
    (heap, source)
}

#[test]
fn tree_growth_purges_once_and_retries_once() {
    let (heap, source) = heap();
    let first = heap.allocate(100_000, 0).expect("allocation");
    // SAFETY: freed once; the arena is now wholly free but still mapped.
    unsafe { heap.deallocate(first.ptr.as_ptr(), None, None) };
    assert_eq!((source.allocs(), source.frees()), (1, 0));

    source.refuse(1);
    let second = heap.allocate(1_000_000, 0).expect("the retry after the purge succeeds");
    // refused growth, the purge unmapping the free arena, then the retry
    assert_eq!(source.allocs(), 3);
    assert_eq!(source.frees(), 1);
    // SAFETY: freed once.
    unsafe { heap.deallocate(second.ptr.as_ptr(), None, None) };
}

#[test]
fn exhausted_tree_gives_up_after_one_retry() {
    let (heap, source) = heap();
    source.refuse(ALWAYS);
    assert_eq!(heap.allocate(1_000_000, 0), None);
    assert_eq!(source.allocs(), 2);
    assert_eq!(source.frees(), 0);
    assert_eq!(heap.capacity(), 0);
}

#[test]
fn exhausted_bucket_gives_up_after_one_retry() {
    let (heap, source) = heap();
    source.refuse(ALWAYS);
    assert_eq!(heap.allocate(32, 0), None);
    assert_eq!(source.allocs(), 2);
    assert_eq!(heap.allocated_bytes(), 0);
}

#[test]
fn failed_reallocate_leaves_the_block_alone() {
    let (heap, source) = heap();
    let block = heap.allocate(10_000, 0).expect("allocation");
    // SAFETY: fresh block of 10 000 bytes.
    unsafe { stamp(block.ptr.as_ptr(), 10_000, 0x5A) };
    let before = source.allocs();

    source.refuse(ALWAYS);
    // SAFETY: live block; on failure it stays live.
    assert_eq!(unsafe { heap.reallocate(block.ptr.as_ptr(), 10_000_000, 0) }, None);
    assert_eq!(source.allocs() - before, 2);

    source.refuse(0);
    // SAFETY: still live, freed once.
    unsafe {
        assert!(stamped(block.ptr.as_ptr(), 10_000, 0x5A));
        assert!(heap.query_size(block.ptr.as_ptr()) >= 10_000);
        heap.deallocate(block.ptr.as_ptr(), None, None);
    }
    assert_eq!(heap.allocated_bytes(), 0);
}

#[test]
fn everything_goes_back_to_the_source() {
    let source = Arc::new(Flaky::default());
    {
        let heap = Hpha::<NoDebug, _>::with_source(HphaConfig::default(), Arc::clone(&source)).expect("config");
        let small = heap.allocate(64, 0).expect("allocation");
        let large = heap.allocate(200_000, 0).expect("allocation");
        // SAFETY: freed once each.
        unsafe {
            heap.deallocate(small.ptr.as_ptr(), None, None);
            heap.deallocate(large.ptr.as_ptr(), None, None);
        }
    }
    assert_eq!(source.allocs(), 2);
    assert_eq!(source.frees(), 2);
}
