//! System page-allocation primitive.
//!
//! Every byte the allocator hands out is carved from memory obtained here.
//! Blocks are always a whole number of OS pages and aligned to at least the
//! OS page size; larger power-of-two alignments are honoured by over-mapping
//! and trimming (unix) or by reserve/release/re-reserve (windows).

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::align_up;

/// Low-level memory calls, one implementation per platform.
trait PlatformMemory {
    /// Map `len` bytes of zeroed read-write memory aligned to the OS page.
    unsafe fn map(len: usize) -> Option<NonNull<u8>>;

    /// Map `len` bytes aligned to `align` (a power of two above the OS page).
    unsafe fn map_aligned(len: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return a region previously obtained from `map`/`map_aligned`.
    unsafe fn unmap(addr: NonNull<u8>, len: usize);

    /// Virtual memory page size in bytes.
    fn query_page_size() -> usize;
}

struct System;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Virtual memory page size of the host, cached after the first query.
#[must_use]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = System::query_page_size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Reserve and commit `size` bytes aligned to `alignment`.
///
/// `size` is rounded up to the OS page size and `alignment` is raised to at
/// least the OS page size. Returns `None` when the OS refuses the request
/// or the padded size overflows.
#[must_use]
pub fn system_alloc(size: usize, alignment: usize) -> Option<NonNull<u8>> {
    hpha_assert!(
        alignment == 0 || alignment.is_power_of_two(),
        "system alignment {alignment} is not a power of two"
    );
    if size == 0 {
        return None;
    }
    let page = page_size();
    let len = align_up(size, page)?;
    let alignment = alignment.max(page);
    // SAFETY: `len` is a non-zero multiple of the page size.
    let mem = unsafe {
        if alignment == page {
            System::map(len)
        } else {
            System::map_aligned(len, alignment)
        }
    };
    match mem {
        Some(ptr) => {
            log::trace!("os: mapped {len} bytes at {:#x} (align {alignment})", ptr.as_ptr() as usize);
            Some(ptr)
        }
        None => {
            log::debug!("os: failed to map {len} bytes (align {alignment})");
            None
        }
    }
}

/// Release memory obtained from [`system_alloc`].
///
/// # Safety
///
/// `ptr` must have been returned by [`system_alloc`] with the same `size`,
/// and nothing may access the region afterwards.
pub unsafe fn system_free(ptr: NonNull<u8>, size: usize) {
    let len = align_up(size, page_size()).unwrap_or(size);
    log::trace!("os: unmapping {len} bytes at {:#x}", ptr.as_ptr() as usize);
    // SAFETY: forwarded from the caller.
    unsafe { System::unmap(ptr, len) }
}

/// Supplier of the page-granular memory both allocation paths carve from.
///
/// [`SystemPages`] maps straight from the OS. A host that wants the heap's
/// backing memory to come from its own allocator implements this trait and
/// hands it to [`Hpha::with_source`](crate::Hpha::with_source).
///
/// Bucket pages are requested with `alignment == size`, and the returned
/// block must honour that: pages are found by masking element addresses.
pub trait PageSource: Send + Sync {
    /// `size` bytes aligned to `alignment` (a power of two; 0 means the OS
    /// page). `None` when the source is exhausted.
    fn alloc_pages(&self, size: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// Give back a block.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_pages` on this source with the same
    /// `size`, and nothing may touch the block afterwards.
    unsafe fn free_pages(&self, ptr: NonNull<u8>, size: usize);
}

/// The OS virtual memory as a [`PageSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPages;

impl PageSource for SystemPages {
    fn alloc_pages(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        system_alloc(size, alignment)
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded.
        unsafe { system_free(ptr, size) }
    }
}

impl<P: PageSource + ?Sized> PageSource for Arc<P> {
    fn alloc_pages(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        (**self).alloc_pages(size, alignment)
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded.
        unsafe { (**self).free_pages(ptr, size) }
    }
}

#[cfg(unix)]
mod unix {
    use super::{PlatformMemory, System};

    use std::ffi::c_void;
    use std::ptr::NonNull;

    impl PlatformMemory for System {
        unsafe fn map(len: usize) -> Option<NonNull<u8>> {
            const PROT: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // SAFETY: anonymous private mapping with no address hint.
            let addr = unsafe { libc::mmap(std::ptr::null_mut(), len, PROT, FLAGS, -1, 0) };
            if addr == libc::MAP_FAILED {
                None
            } else {
                NonNull::new(addr.cast::<u8>())
            }
        }

        unsafe fn map_aligned(len: usize, align: usize) -> Option<NonNull<u8>> {
            let padded = len.checked_add(align)?;
            // SAFETY: `padded` is non-zero.
            let raw = unsafe { Self::map(padded) }?;
            let start = raw.as_ptr() as usize;
            let aligned = (start + align - 1) & !(align - 1);
            let head = aligned - start;
            let tail = padded - head - len;
            // SAFETY: both trimmed ranges lie inside the mapping just created
            // and are page multiples because `start`, `aligned`, `len` and
            // `padded` all are.
            unsafe {
                if head > 0 {
                    libc::munmap(start as *mut c_void, head);
                }
                if tail > 0 {
                    libc::munmap((aligned + len) as *mut c_void, tail);
                }
            }
            NonNull::new(aligned as *mut u8)
        }

        unsafe fn unmap(addr: NonNull<u8>, len: usize) {
            // SAFETY: caller guarantees the range was mapped by us.
            unsafe {
                libc::munmap(addr.as_ptr().cast::<c_void>(), len);
            }
        }

        fn query_page_size() -> usize {
            // SAFETY: sysconf has no preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }
    }
}

#[cfg(windows)]
mod win32 {
    use super::{PlatformMemory, System};

    use std::ffi::c_void;
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;

    use ::windows::Win32::System::{Memory, SystemInformation};

    const ALIGNED_RESERVE_ATTEMPTS: usize = 8;

    fn system_info() -> SystemInformation::SYSTEM_INFO {
        let mut info = MaybeUninit::uninit();
        // SAFETY: GetSystemInfo fully initialises the out-parameter.
        unsafe {
            SystemInformation::GetSystemInfo(info.as_mut_ptr());
            info.assume_init()
        }
    }

    impl PlatformMemory for System {
        unsafe fn map(len: usize) -> Option<NonNull<u8>> {
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            // SAFETY: no address hint, fresh reservation.
            let addr = unsafe { Memory::VirtualAlloc(None, len, flags, Memory::PAGE_READWRITE) };
            NonNull::new(addr.cast())
        }

        unsafe fn map_aligned(len: usize, align: usize) -> Option<NonNull<u8>> {
            if align <= system_info().dwAllocationGranularity as usize {
                // SAFETY: reservations are already granularity aligned.
                return unsafe { Self::map(len) };
            }
            let padded = len.checked_add(align)?;
            // Reservations cannot be trimmed, so look for an aligned hole and
            // re-reserve exactly there. Another thread may win the race for
            // that hole; retry a few times before giving up.
            for _ in 0..ALIGNED_RESERVE_ATTEMPTS {
                // SAFETY: reserve-only trial, released immediately below.
                let trial = unsafe {
                    Memory::VirtualAlloc(None, padded, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS)
                };
                if trial.is_null() {
                    return None;
                }
                let aligned = (trial as usize + align - 1) & !(align - 1);
                // SAFETY: `trial` is the base of the reservation just made.
                unsafe {
                    let _ = Memory::VirtualFree(trial, 0, Memory::MEM_RELEASE);
                }
                let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
                // SAFETY: the hint lies in address space we just released.
                let addr = unsafe {
                    Memory::VirtualAlloc(
                        Some(aligned as *const c_void),
                        len,
                        flags,
                        Memory::PAGE_READWRITE,
                    )
                };
                if let Some(ptr) = NonNull::new(addr.cast::<u8>()) {
                    return Some(ptr);
                }
            }
            None
        }

        unsafe fn unmap(addr: NonNull<u8>, _len: usize) {
            // SAFETY: caller guarantees `addr` is a reservation base.
            unsafe {
                let _ = Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE);
            }
        }

        fn query_page_size() -> usize {
            system_info().dwPageSize as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn alloc_rounds_to_page_and_is_writable() {
        let page = page_size();
        let ptr = system_alloc(100, 0).expect("system allocation should succeed");
        assert_eq!(ptr.as_ptr() as usize % page, 0);
        // SAFETY: at least one page was mapped.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, page);
            assert_eq!(*ptr.as_ptr().add(page - 1), 0xAB);
            system_free(ptr, 100);
        }
    }

    #[test]
    fn alloc_honours_large_alignment() {
        let align = page_size() * 16;
        for _ in 0..4 {
            let ptr = system_alloc(page_size() * 3, align).expect("aligned mapping should succeed");
            assert_eq!(ptr.as_ptr() as usize % align, 0, "mapping must be {align}-aligned");
            // SAFETY: mapping is three pages long.
            unsafe {
                ptr.as_ptr().write(1);
                system_free(ptr, page_size() * 3);
            }
        }
    }

    #[test]
    fn zero_size_is_refused() {
        assert!(system_alloc(0, 0).is_none());
    }

    #[test]
    fn shared_system_source_maps_aligned_pages() {
        let source: Arc<dyn PageSource> = Arc::new(SystemPages);
        let align = page_size() * 4;
        let ptr = source.alloc_pages(align, align).expect("mapping should succeed");
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        // SAFETY: mapped just above with the same size.
        unsafe { source.free_pages(ptr, align) };
    }
}
