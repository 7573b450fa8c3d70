//! Side table of live bucket pages.
//!
//! Deciding whether a pointer belongs to the bucket path must not read the
//! memory around it: for a tree pointer that memory is another block's
//! payload or a header guarded by the tree lock. The map answers from
//! addresses alone. A page is registered after its header is written and
//! unregistered before it goes back to its source, so a header reached
//! through the map is always initialised and stable for as long as the
//! read lock is held.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::util::align_down;

pub(crate) struct PageMap {
    page_size: usize,
    /// Page base address -> bucket index.
    pages: RwLock<HashMap<usize, usize>>,
}

impl PageMap {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, page: usize, index: usize) {
        let previous = self.pages.write().insert(page, index);
        hpha_assert!(
            previous.is_none(),
            "bucket page {page:#x} registered twice (bucket {previous:?} and {index})"
        );
    }

    pub(crate) fn remove(&self, page: usize) {
        let removed = self.pages.write().remove(&page);
        hpha_assert!(removed.is_some(), "bucket page {page:#x} was never registered");
    }

    /// Run `f` with the base address and bucket index of the registered
    /// page holding `ptr`. The page stays registered until `f` returns.
    pub(crate) fn with_page<R>(&self, ptr: *const u8, f: impl FnOnce(usize, usize) -> R) -> Option<R> {
        let base = align_down(ptr as usize, self.page_size);
        let pages = self.pages.read();
        pages.get(&base).map(|&index| f(base, index))
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.read().len()
    }
}
