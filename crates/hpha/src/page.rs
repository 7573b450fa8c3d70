//! Slab pages for the bucket path.
//!
//! A page is one `page_size`-aligned mapping. The header sits at the start;
//! equal-size slots fill the rest, packed against the page end so that an
//! element size that is a multiple of some power of two yields slots
//! aligned to it. Free slots form a singly linked list through their first
//! word.

use std::ptr::NonNull;

use crate::size_class::element_size;
use crate::util::align_down;

#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

#[repr(C)]
pub(crate) struct PageHeader {
    free_list: *mut FreeSlot,
    /// Owning bucket's marker XOR this page's address.
    marker: usize,
    prev: *mut PageHeader,
    next: *mut PageHeader,
    bucket_index: u16,
    use_count: u16,
}

pub(crate) const PAGE_HEADER_SIZE: usize = std::mem::size_of::<PageHeader>();

/// Number of `element`-byte slots in a page of `page_size` bytes.
#[inline]
pub(crate) const fn slots_per_page(page_size: usize, element: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / element
}

/// Handle to the header of a mapped page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PagePtr(NonNull<PageHeader>);

impl PagePtr {
    /// Format a fresh mapping as a page for bucket `index`.
    ///
    /// # Safety
    ///
    /// `mem` must be a writable, `page_size`-aligned mapping of `page_size`
    /// bytes that nothing else uses.
    pub(crate) unsafe fn init(mem: NonNull<u8>, page_size: usize, index: usize, marker: usize) -> Self {
        let element = element_size(index);
        let count = slots_per_page(page_size, element);
        hpha_assert!(
            count <= usize::from(u16::MAX),
            "page of {page_size} bytes holds {count} slots of {element} bytes, more than a u16 can count"
        );
        let base = mem.as_ptr() as usize;
        let first = base + page_size - count * element;
        // SAFETY: header and every slot lie inside the mapping.
        unsafe {
            for i in 0..count {
                let slot = (first + i * element) as *mut FreeSlot;
                let next = if i + 1 < count {
                    (first + (i + 1) * element) as *mut FreeSlot
                } else {
                    std::ptr::null_mut()
                };
                slot.write(FreeSlot { next });
            }
            let header = mem.as_ptr().cast::<PageHeader>();
            header.write(PageHeader {
                free_list: if count > 0 { first as *mut FreeSlot } else { std::ptr::null_mut() },
                marker,
                prev: std::ptr::null_mut(),
                next: std::ptr::null_mut(),
                bucket_index: index as u16,
                use_count: 0,
            });
            Self(NonNull::new_unchecked(header))
        }
    }

    /// Header of the page holding `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must lie in a formatted page of `page_size` bytes that is
    /// still mapped.
    #[inline]
    pub(crate) unsafe fn containing(ptr: *const u8, page_size: usize) -> Self {
        let base = align_down(ptr as usize, page_size);
        // SAFETY: non-null because `ptr` is at least one page above zero.
        Self(unsafe { NonNull::new_unchecked(base as *mut PageHeader) })
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn header(self) -> *mut PageHeader {
        self.0.as_ptr()
    }

    /// Stored bucket index; written once by [`init`](Self::init).
    #[inline]
    pub(crate) fn bucket_index(self) -> usize {
        // SAFETY: handle invariant.
        usize::from(unsafe { (*self.header()).bucket_index })
    }

    #[inline]
    pub(crate) fn marker(self) -> usize {
        // SAFETY: handle invariant.
        unsafe { (*self.header()).marker }
    }

    /// Clear the marker of a page that is leaving its bucket.
    pub(crate) fn invalidate(self) {
        // SAFETY: handle invariant.
        unsafe { (*self.header()).marker = 0 }
    }

    #[inline]
    pub(crate) fn element_size(self) -> usize {
        element_size(self.bucket_index())
    }

    #[inline]
    pub(crate) fn use_count(self) -> usize {
        // SAFETY: handle invariant.
        usize::from(unsafe { (*self.header()).use_count })
    }

    #[inline]
    pub(crate) fn has_free_slot(self) -> bool {
        // SAFETY: handle invariant.
        unsafe { !(*self.header()).free_list.is_null() }
    }

    /// Pop a free slot. Caller holds the bucket lock.
    pub(crate) fn pop_slot(self) -> Option<NonNull<u8>> {
        // SAFETY: handle invariant; free slots are owned by the page.
        unsafe {
            let header = self.header();
            let slot = NonNull::new((*header).free_list)?;
            (*header).free_list = (*slot.as_ptr()).next;
            (*header).use_count += 1;
            Some(slot.cast())
        }
    }

    /// Return a slot to the free list. Caller holds the bucket lock.
    ///
    /// # Safety
    ///
    /// `ptr` must be a slot of this page that is currently handed out.
    pub(crate) unsafe fn push_slot(self, ptr: NonNull<u8>) {
        // SAFETY: forwarded; the slot is at least one word long.
        unsafe {
            let header = self.header();
            hpha_assert!(
                (*header).use_count > 0,
                "free of {:#x} into page {:#x} with no live elements",
                ptr.as_ptr() as usize,
                self.addr()
            );
            let slot = ptr.as_ptr().cast::<FreeSlot>();
            slot.write(FreeSlot {
                next: (*header).free_list,
            });
            (*header).free_list = slot;
            (*header).use_count -= 1;
        }
    }

    #[inline]
    pub(crate) fn next(self) -> Option<PagePtr> {
        // SAFETY: handle invariant.
        NonNull::new(unsafe { (*self.header()).next }).map(PagePtr)
    }

    #[inline]
    fn prev(self) -> Option<PagePtr> {
        // SAFETY: handle invariant.
        NonNull::new(unsafe { (*self.header()).prev }).map(PagePtr)
    }

    #[inline]
    fn set_next(self, next: Option<PagePtr>) {
        // SAFETY: handle invariant.
        unsafe { (*self.header()).next = next.map_or(std::ptr::null_mut(), |p| p.header()) }
    }

    #[inline]
    fn set_prev(self, prev: Option<PagePtr>) {
        // SAFETY: handle invariant.
        unsafe { (*self.header()).prev = prev.map_or(std::ptr::null_mut(), |p| p.header()) }
    }
}

/// Intrusive doubly linked list of a bucket's pages: pages with a free
/// slot first, full pages after them.
#[derive(Debug, Default)]
pub(crate) struct PageList {
    head: Option<PagePtr>,
    tail: Option<PagePtr>,
    len: usize,
}

// SAFETY: the list only holds addresses of pages owned by its bucket, and
// every access happens under the bucket mutex.
unsafe impl Send for PageList {}

impl PageList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn front(&self) -> Option<PagePtr> {
        self.head
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push_front(&mut self, page: PagePtr) {
        page.set_prev(None);
        page.set_next(self.head);
        match self.head {
            Some(head) => head.set_prev(Some(page)),
            None => self.tail = Some(page),
        }
        self.head = Some(page);
        self.len += 1;
    }

    pub(crate) fn push_back(&mut self, page: PagePtr) {
        page.set_next(None);
        page.set_prev(self.tail);
        match self.tail {
            Some(tail) => tail.set_next(Some(page)),
            None => self.head = Some(page),
        }
        self.tail = Some(page);
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, page: PagePtr) {
        let prev = page.prev();
        let next = page.next();
        match prev {
            Some(prev) => prev.set_next(next),
            None => self.head = next,
        }
        match next {
            Some(next) => next.set_prev(prev),
            None => self.tail = prev,
        }
        page.set_prev(None);
        page.set_next(None);
        self.len -= 1;
    }

    pub(crate) fn iter(&self) -> PageIter {
        PageIter { cursor: self.head }
    }
}

pub(crate) struct PageIter {
    cursor: Option<PagePtr>,
}

impl Iterator for PageIter {
    type Item = PagePtr;

    fn next(&mut self) -> Option<PagePtr> {
        let page = self.cursor?;
        self.cursor = page.next();
        Some(page)
    }
}
