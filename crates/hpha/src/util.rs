//! Small helpers shared by both allocation paths.

/// Fatal invariant check.
///
/// Logs the message at `error` level before panicking so the diagnostic
/// reaches whatever log sink the host installed even if the panic is
/// swallowed by an FFI boundary.
macro_rules! hpha_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            log::error!($($arg)+);
            panic!($($arg)+);
        }
    };
}

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline]
#[must_use]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Fast non-cryptographic PRNG (xorshift64*), used for bucket markers,
/// guard seeds and randomized workloads. Only accidental corruption is
/// defended against.
#[derive(Debug, Clone)]
pub struct FastRng {
    state: u64,
}

impl FastRng {
    /// Seed from `seed` mixed with the clock and a stack address, so two
    /// allocators in one process get unrelated streams.
    #[must_use]
    pub fn from_entropy(seed: u64) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let local = 0u8;
        let stack = std::ptr::addr_of!(local) as u64;
        Self::new(seed ^ nanos ^ stack.rotate_left(32))
    }

    #[must_use]
    pub fn new(seed: u64) -> Self {
        // splitmix64 finaliser so small or zero seeds still give a full state
        let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        Self {
            state: if z == 0 { 0x2545_F491_4F6C_DD1D } else { z },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn next_u8(&mut self) -> u8 {
        (self.next_u64() >> 56) as u8
    }

    /// Uniform-ish value in `lo..=hi`.
    pub fn range(&mut self, lo: usize, hi: usize) -> usize {
        debug_assert!(lo <= hi);
        match (hi - lo).checked_add(1) {
            Some(span) => lo + (self.next_u64() % span as u64) as usize,
            None => self.next_u64() as usize,
        }
    }
}
