//! Allocation workloads.
#![allow(unsafe_code)]

use std::time::Instant;

use hpha::{DebugPolicy, FastRng, Hpha, MAX_SMALL_ALLOCATION};
use serde::Serialize;

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StressOptions {
    pub threads: usize,
    pub ops_per_thread: usize,
    pub max_size: usize,
    pub seed: u64,
}

impl Default for StressOptions {
    fn default() -> Self {
        Self {
            threads: 8,
            ops_per_thread: 10_000,
            max_size: 2_048,
            seed: 0x1234_5678,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressOutcome {
    pub options: StressOptions,
    pub allocations: usize,
    pub frees: usize,
    /// Blocks still live when every worker had finished.
    pub outstanding_blocks: usize,
    /// Usable bytes of those blocks, as reported by `query_size`.
    pub outstanding_bytes: usize,
    /// Bytes reserved from the OS when the workers finished.
    pub capacity_bytes: usize,
    pub elapsed_ms: u128,
}

/// One worker's leftovers: `(address, size, tag)` of every live block.
type Leftovers = Vec<(usize, usize, u8)>;

struct WorkerResult {
    allocations: usize,
    frees: usize,
    live: Leftovers,
}

/// # Safety
///
/// `addr` must be a live block of at least `size` bytes.
unsafe fn fill(addr: usize, size: usize, tag: u8) {
    // SAFETY: forwarded.
    unsafe { std::ptr::write_bytes(addr as *mut u8, tag, size) };
}

/// # Safety
///
/// `addr` must be a live block of at least `size` bytes.
unsafe fn intact(addr: usize, size: usize, tag: u8) -> bool {
    // SAFETY: forwarded.
    let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
    bytes.iter().all(|&b| b == tag)
}

fn stress_worker<D: DebugPolicy>(heap: &Hpha<D>, options: &StressOptions, seed: u64) -> Result<WorkerResult, HarnessError> {
    let mut rng = FastRng::new(seed);
    let mut result = WorkerResult {
        allocations: 0,
        frees: 0,
        live: Vec::new(),
    };
    for step in 0..options.ops_per_thread {
        if rng.range(0, 1) == 0 || result.live.is_empty() {
            let size = rng.range(1, options.max_size);
            let block = heap
                .allocate(size, 0)
                .ok_or(HarnessError::OutOfMemory { step, size })?;
            let tag = step as u8;
            // SAFETY: fresh block of at least `size` bytes.
            unsafe { fill(block.ptr.as_ptr() as usize, size, tag) };
            result.live.push((block.ptr.as_ptr() as usize, size, tag));
            result.allocations += 1;
        } else {
            let (addr, size, tag) = result.live.swap_remove(rng.range(0, result.live.len() - 1));
            // SAFETY: this worker allocated the block and has not freed it.
            if !unsafe { intact(addr, size, tag) } {
                return Err(HarnessError::Invariant {
                    step,
                    detail: format!("block {addr:#x} of {size} bytes was overwritten"),
                });
            }
            // SAFETY: this worker allocated the block and frees it once.
            unsafe { heap.deallocate(addr as *mut u8, Some(size), None) };
            result.frees += 1;
        }
    }
    Ok(result)
}

/// Random alloc/free from several threads, then verify the counters
/// against the blocks left over and free them.
pub fn run_stress<D: DebugPolicy>(heap: &Hpha<D>, options: &StressOptions) -> Result<StressOutcome, HarnessError> {
    if options.threads == 0 || options.max_size == 0 {
        return Err(HarnessError::InvalidOption(
            "stress needs at least one thread and a non-zero max size".to_string(),
        ));
    }
    let started = Instant::now();
    let results: Vec<Result<WorkerResult, HarnessError>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..options.threads)
            .map(|thread| {
                let seed = options.seed.wrapping_add(thread as u64);
                std::thread::Builder::new()
                    .name(format!("stress-{thread}"))
                    .spawn_scoped(scope, move || stress_worker(heap, options, seed))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| match worker {
                Ok(handle) => handle.join().unwrap_or(Err(HarnessError::WorkerPanicked)),
                Err(err) => Err(HarnessError::Io(err)),
            })
            .collect()
    });
    let elapsed_ms = started.elapsed().as_millis();
    let capacity_bytes = heap.capacity();

    let mut workers = Vec::with_capacity(results.len());
    for result in results {
        workers.push(result?);
    }
    let live: Leftovers = workers.iter().flat_map(|worker| worker.live.iter().copied()).collect();
    // SAFETY: every leftover block is live and no worker runs any more.
    let outstanding_bytes: usize = live
        .iter()
        .map(|&(addr, _, _)| unsafe { heap.query_size(addr as *const u8) })
        .sum();

    let stats = heap.stats();
    let (counted, expected) = if D::ENABLED {
        (stats.debug_requested_bytes, outstanding_bytes + live.len() * D::GUARD_SIZE)
    } else {
        (stats.allocated_bytes, outstanding_bytes)
    };
    if counted != expected {
        return Err(HarnessError::Invariant {
            step: options.ops_per_thread,
            detail: format!("counters say {counted} bytes are live, blocks add up to {expected}"),
        });
    }

    for &(addr, size, tag) in &live {
        // SAFETY: leftover blocks are live.
        if !unsafe { intact(addr, size, tag) } {
            return Err(HarnessError::Invariant {
                step: options.ops_per_thread,
                detail: format!("block {addr:#x} of {size} bytes was overwritten"),
            });
        }
        // SAFETY: leftover blocks are freed once.
        unsafe { heap.deallocate(addr as *mut u8, None, None) };
    }
    let leaked = heap.allocated_bytes();
    if leaked != 0 {
        return Err(HarnessError::Invariant {
            step: options.ops_per_thread,
            detail: format!("{leaked} bytes still allocated after cleanup"),
        });
    }

    log::info!(
        "stress: {} threads x {} ops in {elapsed_ms} ms, {} blocks left over",
        options.threads,
        options.ops_per_thread,
        live.len()
    );
    Ok(StressOutcome {
        options: *options,
        allocations: workers.iter().map(|worker| worker.allocations).sum(),
        frees: workers.iter().map(|worker| worker.frees).sum(),
        outstanding_blocks: live.len(),
        outstanding_bytes,
        capacity_bytes,
        elapsed_ms,
    })
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChurnOptions {
    pub steps: usize,
    pub max_size: usize,
    pub seed: u64,
}

impl Default for ChurnOptions {
    fn default() -> Self {
        Self {
            steps: 2_000,
            max_size: 64 * 1024,
            seed: 0xC0A1_E5CE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChurnOutcome {
    pub options: ChurnOptions,
    pub allocations: usize,
    pub frees: usize,
    pub reallocations: usize,
    /// Reallocations that kept their address.
    pub in_place: usize,
    pub peak_arenas: usize,
    pub released_by_purge: usize,
}

/// Tree-sized alloc/free/realloc churn, checking after every step that the
/// arenas account for every byte.
pub fn run_churn<D: DebugPolicy>(heap: &Hpha<D>, options: &ChurnOptions) -> Result<ChurnOutcome, HarnessError> {
    let min_size = MAX_SMALL_ALLOCATION + 1;
    if options.max_size < min_size {
        return Err(HarnessError::InvalidOption(format!(
            "churn sizes must exceed {MAX_SMALL_ALLOCATION} bytes"
        )));
    }
    let mut rng = FastRng::new(options.seed);
    let mut live: Vec<(usize, usize)> = Vec::new();
    let mut outcome = ChurnOutcome {
        options: *options,
        allocations: 0,
        frees: 0,
        reallocations: 0,
        in_place: 0,
        peak_arenas: 0,
        released_by_purge: 0,
    };

    for step in 0..options.steps {
        match rng.range(0, 9) {
            0..=4 => {
                let size = rng.range(min_size, options.max_size);
                let block = heap
                    .allocate(size, 0)
                    .ok_or(HarnessError::OutOfMemory { step, size })?;
                live.push((block.ptr.as_ptr() as usize, size));
                outcome.allocations += 1;
            }
            5..=7 if !live.is_empty() => {
                let (addr, _) = live.swap_remove(rng.range(0, live.len() - 1));
                // SAFETY: live block freed once.
                unsafe { heap.deallocate(addr as *mut u8, None, None) };
                outcome.frees += 1;
            }
            _ if !live.is_empty() => {
                let index = rng.range(0, live.len() - 1);
                let size = rng.range(min_size, options.max_size);
                // SAFETY: live block replaced by the result.
                let block = unsafe { heap.reallocate(live[index].0 as *mut u8, size, 0) }
                    .ok_or(HarnessError::OutOfMemory { step, size })?;
                if block.ptr.as_ptr() as usize == live[index].0 {
                    outcome.in_place += 1;
                }
                live[index] = (block.ptr.as_ptr() as usize, size);
                outcome.reallocations += 1;
            }
            _ => continue,
        }

        let tree = heap.snapshot().tree;
        if !tree.is_consistent() {
            return Err(HarnessError::Invariant {
                step,
                detail: format!("tree accounting broken: {tree:?}"),
            });
        }
        outcome.peak_arenas = outcome.peak_arenas.max(tree.arenas.len());
    }

    for (addr, _) in live {
        // SAFETY: live block freed once.
        unsafe { heap.deallocate(addr as *mut u8, None, None) };
    }
    outcome.released_by_purge = heap.purge();
    let tree = heap.snapshot().tree;
    if !tree.arenas.is_empty() {
        return Err(HarnessError::Invariant {
            step: options.steps,
            detail: format!("{} arenas survived a purge of an empty heap", tree.arenas.len()),
        });
    }
    log::info!(
        "churn: {} steps, {} in-place reallocations, peak {} arenas",
        options.steps,
        outcome.in_place,
        outcome.peak_arenas
    );
    Ok(outcome)
}
