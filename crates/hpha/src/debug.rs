//! Guard bytes and live-allocation tracking.
//!
//! The dispatch layer is generic over a [`DebugPolicy`]. [`NoDebug`] is a
//! zero-sized policy whose hooks compile to nothing. [`DebugTracking`]
//! reserves [`GUARD_SIZE`](DebugPolicy::GUARD_SIZE) extra bytes behind every
//! request, fills them with a per-record byte sequence, and keeps a registry
//! of every live allocation so double frees, foreign pointers and overruns
//! are caught at the next free, query or [`check_all`](DebugPolicy::check_all).

use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::ptr::NonNull;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::HphaConfig;
use crate::util::FastRng;

/// Frames kept when a recorded call stack is printed.
pub const MAX_CALLSTACK_DEPTH: usize = 16;

/// Byte pattern written over fresh and freed payloads: a quiet NaN read as
/// an `f32` in either byte order.
pub const FILL_PATTERN: [u8; 4] = [0xFF, 0xC0, 0xC0, 0xFF];

/// Which path served an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Bucket,
    Tree,
}

impl Origin {
    const fn slot(self) -> usize {
        match self {
            Self::Bucket => 0,
            Self::Tree => 1,
        }
    }
}

/// Compile-time debugging strategy of an [`Hpha`](crate::Hpha).
///
/// Every hook that takes a pointer is `unsafe`: the pointer must be a
/// payload the owning allocator handed out (or is about to hand out), with
/// at least `requested + GUARD_SIZE` writable bytes.
pub trait DebugPolicy: Send + Sync + Sized {
    /// Whether the dispatch layer should run the consistency checks that
    /// only make sense with a registry behind them.
    const ENABLED: bool;
    /// Extra bytes reserved behind every request.
    const GUARD_SIZE: usize;

    fn new(config: &HphaConfig) -> Self;

    /// Origin recorded for a live allocation; `None` when nothing is
    /// tracked. A tracking policy treats an unknown pointer as fatal.
    fn registered_origin(&self, ptr: NonNull<u8>) -> Option<Origin>;

    /// Register a fresh allocation; returns the size reported to the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must have `usable` writable bytes.
    unsafe fn on_allocate(&self, ptr: NonNull<u8>, requested: usize, usable: usize, origin: Origin) -> usize;

    /// Move the record of `old` to `new` (possibly equal) without filling.
    /// The old guard must already have been checked.
    ///
    /// # Safety
    ///
    /// `new` must have `usable` writable bytes.
    unsafe fn on_reallocate(
        &self,
        old: NonNull<u8>,
        new: NonNull<u8>,
        requested: usize,
        usable: usize,
        origin: Origin,
    ) -> usize;

    /// Validate and drop the record of an allocation about to be freed.
    ///
    /// # Safety
    ///
    /// `ptr` must still be mapped.
    unsafe fn on_deallocate(&self, ptr: NonNull<u8>, size_hint: Option<usize>);

    /// Size reported for a live allocation whose block holds `usable` bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must still be mapped.
    unsafe fn on_query(&self, ptr: NonNull<u8>, usable: usize) -> usize;

    /// Verify the guard of one live allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must still be mapped.
    unsafe fn check(&self, ptr: NonNull<u8>);

    /// Verify the guard of every live allocation.
    fn check_all(&self);

    /// Log every live allocation; returns how many there are.
    fn report(&self) -> usize;

    fn live_records(&self) -> usize;

    /// Requested bytes plus guards of live allocations from `origin`.
    fn requested_bytes(&self, origin: Origin) -> usize;
}

/// No guards, no registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDebug;

impl DebugPolicy for NoDebug {
    const ENABLED: bool = false;
    const GUARD_SIZE: usize = 0;

    #[inline]
    fn new(_config: &HphaConfig) -> Self {
        Self
    }

    #[inline]
    fn registered_origin(&self, _ptr: NonNull<u8>) -> Option<Origin> {
        None
    }

    #[inline]
    unsafe fn on_allocate(&self, _ptr: NonNull<u8>, _requested: usize, usable: usize, _origin: Origin) -> usize {
        usable
    }

    #[inline]
    unsafe fn on_reallocate(
        &self,
        _old: NonNull<u8>,
        _new: NonNull<u8>,
        _requested: usize,
        usable: usize,
        _origin: Origin,
    ) -> usize {
        usable
    }

    #[inline]
    unsafe fn on_deallocate(&self, _ptr: NonNull<u8>, _size_hint: Option<usize>) {}

    #[inline]
    unsafe fn on_query(&self, _ptr: NonNull<u8>, usable: usize) -> usize {
        usable
    }

    #[inline]
    unsafe fn check(&self, _ptr: NonNull<u8>) {}

    #[inline]
    fn check_all(&self) {}

    #[inline]
    fn report(&self) -> usize {
        0
    }

    #[inline]
    fn live_records(&self) -> usize {
        0
    }

    #[inline]
    fn requested_bytes(&self, _origin: Origin) -> usize {
        0
    }
}

struct DebugRecord {
    size: usize,
    origin: Origin,
    /// First guard byte; the rest count up from it.
    guard_seed: u8,
    backtrace: Option<Backtrace>,
}

impl DebugRecord {
    /// # Safety
    ///
    /// `ptr + size .. ptr + size + GUARD_SIZE` must be writable.
    unsafe fn write_guard(&self, ptr: NonNull<u8>) {
        let mut byte = self.guard_seed;
        for offset in 0..DebugTracking::GUARD_SIZE {
            // SAFETY: caller guarantees the guard range is in bounds.
            unsafe { ptr.as_ptr().add(self.size + offset).write(byte) };
            byte = byte.wrapping_add(1);
        }
    }

    /// # Safety
    ///
    /// `ptr + size .. ptr + size + GUARD_SIZE` must be readable.
    unsafe fn guard_intact(&self, ptr: usize) -> bool {
        let mut byte = self.guard_seed;
        for offset in 0..DebugTracking::GUARD_SIZE {
            // SAFETY: caller guarantees the guard range is in bounds.
            let found = unsafe { (ptr as *const u8).add(self.size + offset).read() };
            if found != byte {
                return false;
            }
            byte = byte.wrapping_add(1);
        }
        true
    }

    fn log_stack(&self, ptr: usize) {
        let Some(backtrace) = &self.backtrace else {
            log::error!("{ptr:#x}: no call stack recorded");
            return;
        };
        let rendered = backtrace.to_string();
        let mut out = String::new();
        // every frame prints as a symbol line followed by an `at` line
        for line in rendered.lines().take(MAX_CALLSTACK_DEPTH * 2) {
            let _ = writeln!(out, "    {line}");
        }
        log::error!("{ptr:#x} allocated at:\n{out}");
    }
}

struct Registry {
    records: BTreeMap<usize, DebugRecord>,
    requested: [usize; 2],
    rng: FastRng,
}

impl Registry {
    fn live(&self, ptr: usize) -> &DebugRecord {
        match self.records.get(&ptr) {
            Some(record) => record,
            None => {
                log::error!("{ptr:#x}: double free or pointer not owned by this allocator");
                panic!("{ptr:#x}: double free or pointer not owned by this allocator");
            }
        }
    }

    fn verify_guard(record: &DebugRecord, ptr: usize) {
        // SAFETY: the record describes a live allocation with a guard.
        let intact = unsafe { record.guard_intact(ptr) };
        if !intact {
            record.log_stack(ptr);
        }
        hpha_assert!(
            intact,
            "buffer overrun: guard behind {} bytes at {ptr:#x} was overwritten",
            record.size
        );
    }
}

/// Guard bytes, a registry of live allocations, optional payload filling
/// and call-stack capture.
pub struct DebugTracking {
    registry: Mutex<Registry>,
    fill: bool,
    capture: bool,
}

/// # Safety
///
/// `ptr .. ptr + len` must be writable.
unsafe fn fill_pattern(ptr: NonNull<u8>, len: usize) {
    for offset in 0..len {
        // SAFETY: caller guarantees the range.
        unsafe { ptr.as_ptr().add(offset).write(FILL_PATTERN[offset % FILL_PATTERN.len()]) };
    }
}

impl DebugTracking {
    fn capture_stack(&self) -> Option<Backtrace> {
        self.capture.then(Backtrace::force_capture)
    }
}

impl DebugPolicy for DebugTracking {
    const ENABLED: bool = true;
    const GUARD_SIZE: usize = 16;

    fn new(config: &HphaConfig) -> Self {
        let seed = config.pool_page_size as u64 ^ (config.tree_page_size as u64).rotate_left(17);
        Self {
            registry: Mutex::new(Registry {
                records: BTreeMap::new(),
                requested: [0; 2],
                rng: FastRng::from_entropy(seed),
            }),
            fill: config.fill_debug_memory,
            capture: config.capture_call_stacks,
        }
    }

    fn registered_origin(&self, ptr: NonNull<u8>) -> Option<Origin> {
        Some(self.registry.lock().live(ptr.as_ptr() as usize).origin)
    }

    unsafe fn on_allocate(&self, ptr: NonNull<u8>, requested: usize, usable: usize, origin: Origin) -> usize {
        hpha_assert!(
            requested + Self::GUARD_SIZE <= usable,
            "block of {usable} bytes cannot hold {requested} bytes and a guard"
        );
        let backtrace = self.capture_stack();
        let addr = ptr.as_ptr() as usize;
        let mut registry = self.registry.lock();
        let record = DebugRecord {
            size: requested,
            origin,
            guard_seed: registry.rng.next_u8(),
            backtrace,
        };
        // SAFETY: `usable` covers payload and guard.
        unsafe {
            if self.fill {
                fill_pattern(ptr, requested);
            }
            record.write_guard(ptr);
        }
        registry.requested[origin.slot()] += requested + Self::GUARD_SIZE;
        let previous = registry.records.insert(addr, record);
        hpha_assert!(previous.is_none(), "{addr:#x} handed out twice");
        requested
    }

    unsafe fn on_reallocate(
        &self,
        old: NonNull<u8>,
        new: NonNull<u8>,
        requested: usize,
        usable: usize,
        origin: Origin,
    ) -> usize {
        hpha_assert!(
            requested + Self::GUARD_SIZE <= usable,
            "block of {usable} bytes cannot hold {requested} bytes and a guard"
        );
        let backtrace = self.capture_stack();
        let old_addr = old.as_ptr() as usize;
        let new_addr = new.as_ptr() as usize;
        let mut registry = self.registry.lock();
        let removed = registry.records.remove(&old_addr);
        hpha_assert!(
            removed.is_some(),
            "{old_addr:#x}: double free or pointer not owned by this allocator"
        );
        if let Some(removed) = removed {
            registry.requested[removed.origin.slot()] -= removed.size + Self::GUARD_SIZE;
        }
        let record = DebugRecord {
            size: requested,
            origin,
            guard_seed: registry.rng.next_u8(),
            backtrace,
        };
        // SAFETY: `usable` covers payload and guard.
        unsafe { record.write_guard(new) };
        registry.requested[origin.slot()] += requested + Self::GUARD_SIZE;
        let previous = registry.records.insert(new_addr, record);
        hpha_assert!(previous.is_none(), "{new_addr:#x} handed out twice");
        requested
    }

    unsafe fn on_deallocate(&self, ptr: NonNull<u8>, size_hint: Option<usize>) {
        let addr = ptr.as_ptr() as usize;
        let mut registry = self.registry.lock();
        let record = registry.live(addr);
        if let Some(hint) = size_hint {
            if hint < record.size {
                record.log_stack(addr);
            }
            hpha_assert!(
                record.size <= hint,
                "{addr:#x}: size hint {hint} is smaller than the {} bytes allocated",
                record.size
            );
        }
        Registry::verify_guard(record, addr);
        let (size, origin) = (record.size, record.origin);
        if self.fill {
            // SAFETY: the payload is still mapped until the caller frees it.
            unsafe { fill_pattern(ptr, size) };
        }
        registry.requested[origin.slot()] -= size + Self::GUARD_SIZE;
        registry.records.remove(&addr);
    }

    unsafe fn on_query(&self, ptr: NonNull<u8>, _usable: usize) -> usize {
        let addr = ptr.as_ptr() as usize;
        let registry = self.registry.lock();
        let record = registry.live(addr);
        Registry::verify_guard(record, addr);
        record.size
    }

    unsafe fn check(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let registry = self.registry.lock();
        Registry::verify_guard(registry.live(addr), addr);
    }

    fn check_all(&self) {
        let registry = self.registry.lock();
        for (&addr, record) in &registry.records {
            Registry::verify_guard(record, addr);
        }
    }

    fn report(&self) -> usize {
        let registry = self.registry.lock();
        log::info!(
            "report: {} live allocations, requested {} bytes (buckets {}, tree {})",
            registry.records.len(),
            registry.requested.iter().sum::<usize>(),
            registry.requested[Origin::Bucket.slot()],
            registry.requested[Origin::Tree.slot()],
        );
        for (&addr, record) in &registry.records {
            log::info!("  {addr:#x}: {} bytes from {:?}", record.size, record.origin);
            if let Some(backtrace) = &record.backtrace {
                for line in backtrace.to_string().lines().take(MAX_CALLSTACK_DEPTH * 2) {
                    log::info!("      {line}");
                }
            }
        }
        registry.records.len()
    }

    fn live_records(&self) -> usize {
        self.registry.lock().records.len()
    }

    fn requested_bytes(&self, origin: Origin) -> usize {
        self.registry.lock().requested[origin.slot()]
    }
}
