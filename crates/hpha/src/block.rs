//! Boundary-tag block headers for the tree allocator.
//!
//! Each tree arena is a chain of blocks:
//!
//! ```text
//! | fence (size 0, used) | hdr | payload ... | hdr | payload ... | fence (size 0, used) |
//! ```
//!
//! A header stores the address of the previous header and the payload size
//! packed with two flag bits. The next header is always at
//! `header + BLOCK_HEADER_SIZE + size`, so only `prev` needs storing.

use std::ptr::NonNull;

/// In-band header preceding every tree payload.
#[repr(C)]
pub(crate) struct BlockHeader {
    prev: *mut BlockHeader,
    size_and_flags: u64,
}

pub(crate) const BLOCK_HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// Smallest payload a free block may have; splits that would leave less
/// than a header plus this are not performed.
pub(crate) const MIN_FREE_NODE_SIZE: usize = 32;

const FLAG_USED: u64 = 0b01;
const FLAG_MASK: u64 = 0b11;

/// Handle to a block header inside an arena owned by the tree allocator.
///
/// Creating one is unsafe; once created, the accessors trust that the
/// header stays mapped for as long as the handle is used, which the tree
/// lock guarantees.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockPtr(NonNull<BlockHeader>);

impl BlockPtr {
    /// # Safety
    ///
    /// `addr` must be the address of an initialised header in a live arena.
    #[inline]
    pub(crate) unsafe fn from_addr(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr % BLOCK_HEADER_SIZE == 0);
        // SAFETY: non-null per the caller's contract.
        Self(unsafe { NonNull::new_unchecked(addr as *mut BlockHeader) })
    }

    /// Header owning the payload starting at `mem`.
    ///
    /// # Safety
    ///
    /// `mem` must be a payload pointer handed out by the tree allocator.
    #[inline]
    pub(crate) unsafe fn from_mem(mem: *mut u8) -> Self {
        // SAFETY: forwarded.
        unsafe { Self::from_addr(mem as usize - BLOCK_HEADER_SIZE) }
    }

    /// Write a fresh header at `addr`.
    ///
    /// # Safety
    ///
    /// `addr..addr + BLOCK_HEADER_SIZE` must be writable arena memory.
    pub(crate) unsafe fn init(addr: usize, prev: Option<BlockPtr>, size: usize, used: bool) -> Self {
        let header = addr as *mut BlockHeader;
        // SAFETY: caller guarantees the header slot is writable.
        unsafe {
            header.write(BlockHeader {
                prev: prev.map_or(std::ptr::null_mut(), |p| p.0.as_ptr()),
                size_and_flags: (size as u64 & !FLAG_MASK) | if used { FLAG_USED } else { 0 },
            });
            Self::from_addr(addr)
        }
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// First payload byte.
    #[inline]
    pub(crate) fn mem(self) -> *mut u8 {
        (self.addr() + BLOCK_HEADER_SIZE) as *mut u8
    }

    #[inline]
    fn word(self) -> u64 {
        // SAFETY: handle invariant.
        unsafe { (*self.0.as_ptr()).size_and_flags }
    }

    #[inline]
    fn set_word(self, word: u64) {
        // SAFETY: handle invariant.
        unsafe { (*self.0.as_ptr()).size_and_flags = word }
    }

    #[inline]
    pub(crate) fn size(self) -> usize {
        (self.word() & !FLAG_MASK) as usize
    }

    #[inline]
    pub(crate) fn set_size(self, size: usize) {
        self.set_word((size as u64 & !FLAG_MASK) | (self.word() & FLAG_MASK));
    }

    #[inline]
    pub(crate) fn used(self) -> bool {
        self.word() & FLAG_USED != 0
    }

    #[inline]
    pub(crate) fn set_used(self) {
        self.set_word(self.word() | FLAG_USED);
    }

    #[inline]
    pub(crate) fn set_unused(self) {
        self.set_word(self.word() & !FLAG_USED);
    }

    /// Previous header, `None` for an arena's front fence.
    #[inline]
    pub(crate) fn prev(self) -> Option<BlockPtr> {
        // SAFETY: handle invariant; non-null prev pointers always refer to
        // headers of the same arena.
        let prev = unsafe { (*self.0.as_ptr()).prev };
        NonNull::new(prev).map(BlockPtr)
    }

    #[inline]
    pub(crate) fn set_prev(self, prev: Option<BlockPtr>) {
        // SAFETY: handle invariant.
        unsafe { (*self.0.as_ptr()).prev = prev.map_or(std::ptr::null_mut(), |p| p.0.as_ptr()) }
    }

    /// Following header. Never called on the end fence.
    #[inline]
    pub(crate) fn next(self) -> BlockPtr {
        // SAFETY: every non-end block is followed by another header.
        unsafe { Self::from_addr(self.addr() + BLOCK_HEADER_SIZE + self.size()) }
    }

    /// Zero-size blocks only occur as arena fences.
    #[inline]
    pub(crate) fn is_fence(self) -> bool {
        self.size() == 0
    }

    /// Merge this block into its predecessor, which absorbs the header and
    /// payload. The caller must have detached both from the free index.
    pub(crate) fn unlink(self) {
        let Some(prev) = self.prev() else {
            hpha_assert!(false, "cannot unlink a front fence at {:#x}", self.addr());
            return;
        };
        let next = self.next();
        prev.set_size(prev.size() + BLOCK_HEADER_SIZE + self.size());
        next.set_prev(Some(prev));
    }

    /// Shrink the payload to `size` and carve the remainder into a new free
    /// block linked right after this one.
    pub(crate) fn split(self, size: usize) -> BlockPtr {
        hpha_assert!(
            size + BLOCK_HEADER_SIZE + MIN_FREE_NODE_SIZE <= self.size(),
            "split of {} byte block at {size} leaves no room for a free node",
            self.size()
        );
        let next = self.next();
        let rest = self.size() - size - BLOCK_HEADER_SIZE;
        // SAFETY: the new header lands inside this block's payload.
        let tail = unsafe { Self::init(self.addr() + BLOCK_HEADER_SIZE + size, Some(self), rest, false) };
        next.set_prev(Some(tail));
        self.set_size(size);
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build `[fence][block][fence]` over a 16-aligned scratch buffer.
    fn scratch_arena(words: usize) -> (Vec<u128>, BlockPtr) {
        let mut buf = vec![0u128; words];
        let base = buf.as_mut_ptr() as usize;
        let len = words * 16;
        // SAFETY: all headers land inside `buf`.
        let block = unsafe {
            let front = BlockPtr::init(base, None, 0, true);
            let block = BlockPtr::init(base + BLOCK_HEADER_SIZE, Some(front), len - 3 * BLOCK_HEADER_SIZE, false);
            BlockPtr::init(base + len - BLOCK_HEADER_SIZE, Some(block), 0, true);
            block
        };
        (buf, block)
    }

    #[test]
    fn header_is_two_words() {
        assert_eq!(BLOCK_HEADER_SIZE, 16);
    }

    #[test]
    fn flags_do_not_disturb_size() {
        let (_buf, block) = scratch_arena(32);
        let size = block.size();
        block.set_used();
        assert!(block.used());
        assert_eq!(block.size(), size);
        block.set_size(96);
        assert!(block.used(), "resizing must keep the used flag");
        block.set_unused();
        assert_eq!(block.size(), 96);
        assert!(!block.used());
    }

    #[test]
    fn next_of_block_is_end_fence() {
        let (_buf, block) = scratch_arena(32);
        let end = block.next();
        assert!(end.is_fence());
        assert!(end.used());
        assert_eq!(end.prev(), Some(block));
        let front = block.prev().expect("block has a front fence");
        assert!(front.prev().is_none());
        assert_eq!(front.next(), block);
    }

    #[test]
    fn split_then_unlink_restores_block() {
        let (_buf, block) = scratch_arena(32);
        let original = block.size();
        let tail = block.split(64);
        assert_eq!(block.size(), 64);
        assert_eq!(tail.size(), original - 64 - BLOCK_HEADER_SIZE);
        assert_eq!(block.next(), tail);
        assert_eq!(tail.next().prev(), Some(tail));
        assert!(!tail.used());

        tail.unlink();
        assert_eq!(block.size(), original);
        assert_eq!(block.next().prev(), Some(block));
    }

    #[test]
    #[should_panic(expected = "leaves no room for a free node")]
    fn split_refuses_slivers() {
        let (_buf, block) = scratch_arena(16);
        let _ = block.split(block.size() - BLOCK_HEADER_SIZE);
    }
}
