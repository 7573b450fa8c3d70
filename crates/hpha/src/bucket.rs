//! Small-object path: size-class buckets of slab pages.
//!
//! Each bucket owns an intrusive page list behind its own mutex, so
//! operations on different size classes never contend. Within a bucket,
//! pages with a free slot precede full ones; allocation always takes the
//! front page and a page that fills up moves to the back.
//!
//! Whether a pointer is a bucket element is answered by the page map
//! side table, never by reading memory near the pointer. Every page header
//! also carries an obfuscated marker, `bucket.marker ^ page_address`,
//! which is verified whenever the map resolves a page. Building with
//! `exhaustive-ownership-check` additionally cross-checks the map against
//! a scan of every page list.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::allocator::Allocation;
use crate::os::{PageSource, SystemPages};
use crate::page::{PAGE_HEADER_SIZE, PageList, PagePtr, slots_per_page};
use crate::page_map::PageMap;
use crate::size_class::{NUM_BUCKETS, bucket_index, element_size};
use crate::stats::{BucketSnapshot, PageSnapshot};
use crate::util::FastRng;

/// Distinguishes marker streams of allocators created in the same instant.
static INSTANCE_SEED: AtomicU64 = AtomicU64::new(0x6A09_E667_F3BC_C908);

/// One size class.
#[repr(align(64))]
struct Bucket {
    pages: Mutex<PageList>,
    marker: usize,
}

/// Slab allocator for requests up to `MAX_SMALL_ALLOCATION` bytes.
pub struct BucketAllocator<P: PageSource = SystemPages> {
    buckets: Box<[Bucket]>,
    page_map: PageMap,
    page_size: usize,
    allocated: AtomicUsize,
    capacity: AtomicUsize,
    source: P,
}

impl<P: PageSource> BucketAllocator<P> {
    /// `page_size` must be a power of two no smaller than the OS page and
    /// small enough that a page of 8-byte slots is countable in a `u16`;
    /// [`HphaConfig::validate`](crate::HphaConfig::validate) enforces both.
    #[must_use]
    pub fn new(page_size: usize, source: P) -> Self {
        let seed = INSTANCE_SEED.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
        let mut rng = FastRng::from_entropy(seed);
        let buckets: Vec<Bucket> = (0..NUM_BUCKETS)
            .map(|_| Bucket {
                pages: Mutex::new(PageList::new()),
                // odd, so it never equals a page address XOR zero
                marker: (rng.next_u64() as usize) | 1,
            })
            .collect();
        Self {
            buckets: buckets.into_boxed_slice(),
            page_map: PageMap::new(page_size),
            page_size,
            allocated: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            source,
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages currently owned across all buckets.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_map.len()
    }

    /// Fetch and format a new page for bucket `index`. Called with the
    /// bucket lock held.
    fn grow(&self, index: usize) -> Option<PagePtr> {
        let mem = self.source.alloc_pages(self.page_size, self.page_size)?;
        let base = mem.as_ptr() as usize;
        hpha_assert!(
            base % self.page_size == 0,
            "page source returned {base:#x}, which is not aligned to the {} byte pool page",
            self.page_size
        );
        self.capacity.fetch_add(self.page_size, Ordering::Relaxed);
        log::debug!("bucket {index}: new page {base:#x} for {}-byte elements", element_size(index));
        // SAFETY: fresh page-aligned block of `page_size` bytes.
        let page = unsafe { PagePtr::init(mem, self.page_size, index, self.buckets[index].marker ^ base) };
        self.page_map.insert(base, index);
        Some(page)
    }

    /// Unregister, scrub and return a page that holds no live elements.
    /// Called with the bucket lock held and the page already unlinked.
    fn release(&self, page: PagePtr) {
        self.page_map.remove(page.addr());
        page.invalidate();
        // SAFETY: the page came from `grow` with this size and nothing
        // reaches it any more.
        unsafe {
            self.source
                .free_pages(NonNull::new_unchecked(page.addr() as *mut u8), self.page_size)
        };
        self.capacity.fetch_sub(self.page_size, Ordering::Relaxed);
    }

    /// Allocate one element from bucket `index`.
    pub fn alloc_direct(&self, index: usize) -> Option<Allocation> {
        hpha_assert!(index < NUM_BUCKETS, "bucket index {index} out of range");
        let mut pages = self.buckets[index].pages.lock();
        let page = match pages.front().filter(|page| page.has_free_slot()) {
            Some(page) => page,
            None => {
                let page = self.grow(index)?;
                pages.push_front(page);
                page
            }
        };
        let slot = page.pop_slot()?;
        if !page.has_free_slot() {
            pages.remove(page);
            pages.push_back(page);
        }
        let size = element_size(index);
        self.allocated.fetch_add(size, Ordering::Relaxed);
        Some(Allocation { ptr: slot, size })
    }

    /// Allocate an element of at least `size` bytes (`1..=MAX_SMALL_ALLOCATION`).
    pub fn alloc(&self, size: usize) -> Option<Allocation> {
        self.alloc_direct(bucket_index(size))
    }

    /// Free an element, reading its bucket from the page header.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live element from this allocator.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: forwarded.
        unsafe {
            let index = self.index_of(ptr);
            self.free_direct(ptr, index)
        }
    }

    /// Free an element whose bucket the caller already knows.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live element of bucket `index`. A wrong index
    /// corrupts the bookkeeping of both buckets involved.
    pub unsafe fn free_direct(&self, ptr: NonNull<u8>, index: usize) -> usize {
        hpha_assert!(index < NUM_BUCKETS, "bucket index {index} out of range");
        // SAFETY: `ptr` lives in one of our pages.
        let page = unsafe { PagePtr::containing(ptr.as_ptr(), self.page_size) };
        let mut pages = self.buckets[index].pages.lock();
        let was_full = !page.has_free_slot();
        // SAFETY: forwarded.
        unsafe { page.push_slot(ptr) };
        if was_full {
            pages.remove(page);
            pages.push_front(page);
        }
        let size = element_size(index);
        self.allocated.fetch_sub(size, Ordering::Relaxed);
        size
    }

    /// Bucket index of the page holding `ptr`, or `None` when `ptr` is not
    /// inside one of this allocator's pages. Reads no memory outside the
    /// registered page headers, so any address may be passed.
    pub fn lookup(&self, ptr: *const u8) -> Option<usize> {
        let found = self.page_map.with_page(ptr, |base, index| {
            // SAFETY: registered pages are formatted and stay mapped while
            // the map's read lock is held.
            let page = unsafe { PagePtr::containing(base as *const u8, self.page_size) };
            hpha_assert!(
                page.bucket_index() == index && page.marker() == self.buckets[index].marker ^ base,
                "header of bucket page {base:#x} is corrupt: index {} marker {:#x}",
                page.bucket_index(),
                page.marker()
            );
            index
        });

        #[cfg(feature = "exhaustive-ownership-check")]
        {
            let base = crate::util::align_down(ptr as usize, self.page_size);
            let scanned = self
                .buckets
                .iter()
                .position(|bucket| bucket.pages.lock().iter().any(|page| page.addr() == base));
            hpha_assert!(
                found == scanned,
                "page map says {found:?} but the page lists say {scanned:?} for {:#x}",
                ptr as usize
            );
        }

        found
    }

    /// Whether `ptr` lies in one of this allocator's pages.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.lookup(ptr).is_some()
    }

    /// Bucket index recorded in the page holding `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live element from this allocator.
    pub unsafe fn index_of(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: forwarded.
        unsafe { PagePtr::containing(ptr.as_ptr(), self.page_size) }.bucket_index()
    }

    /// Element size of the page holding `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live element from this allocator.
    pub unsafe fn element_size_of(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: forwarded.
        unsafe { PagePtr::containing(ptr.as_ptr(), self.page_size) }.element_size()
    }

    /// Release every page with no live elements; returns bytes released.
    pub fn purge(&self) -> usize {
        let mut released = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            let mut pages = bucket.pages.lock();
            let mut cursor = pages.front();
            while let Some(page) = cursor {
                // everything from the first full page on is full
                if !page.has_free_slot() {
                    break;
                }
                cursor = page.next();
                if page.use_count() == 0 {
                    pages.remove(page);
                    log::trace!("bucket {index}: releasing page {:#x}", page.addr());
                    self.release(page);
                    released += self.page_size;
                }
            }
        }
        if released > 0 {
            log::debug!("buckets: purge released {released} bytes");
        }
        released
    }

    /// Largest element size available without mapping a new page.
    #[must_use]
    pub fn max_allocation(&self) -> usize {
        (0..NUM_BUCKETS)
            .rev()
            .find(|&index| {
                self.buckets[index]
                    .pages
                    .lock()
                    .front()
                    .is_some_and(|page| page.has_free_slot())
            })
            .map_or(0, element_size)
    }

    /// Bytes sitting unused in pages that still have free slots.
    pub fn unused_memory(&self, report: bool) -> usize {
        let usable = self.page_size - PAGE_HEADER_SIZE;
        let mut unused = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            let element = element_size(index);
            let pages = bucket.pages.lock();
            for page in pages.iter().take_while(|page| page.has_free_slot()) {
                let available = usable - element * page.use_count();
                unused += available;
                if report {
                    log::info!(
                        "bucket {index}: page {:#x} element {element} bytes, {} free elements",
                        page.addr(),
                        available / element
                    );
                }
            }
        }
        unused
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Page lists of every bucket that owns at least one page, in list order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(index, bucket)| {
                let pages = bucket.pages.lock();
                if pages.len() == 0 {
                    return None;
                }
                let element = element_size(index);
                Some(BucketSnapshot {
                    index,
                    element_size: element,
                    slots_per_page: slots_per_page(self.page_size, element),
                    pages: pages
                        .iter()
                        .map(|page| PageSnapshot {
                            address: page.addr(),
                            live_elements: page.use_count(),
                            has_free_slot: page.has_free_slot(),
                        })
                        .collect(),
                })
            })
            .collect()
    }
}

impl<P: PageSource> Drop for BucketAllocator<P> {
    fn drop(&mut self) {
        // the allocator is going away; live elements go with their pages
        for index in 0..NUM_BUCKETS {
            while let Some(page) = self.buckets[index].pages.get_mut().front() {
                self.buckets[index].pages.get_mut().remove(page);
                self.release(page);
            }
        }
    }
}
