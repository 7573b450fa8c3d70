//! Size classes for the bucket path.
//!
//! Small requests are rounded up to a multiple of [`MIN_ALLOCATION`]; bucket
//! `i` serves elements of `(i + 1) * MIN_ALLOCATION` bytes, up to
//! [`MAX_SMALL_ALLOCATION`].

/// Minimum allocation granularity (bytes).
pub const MIN_ALLOCATION: usize = 8;

/// Largest request (payload plus guard) served by the bucket path.
pub const MAX_SMALL_ALLOCATION: usize = 512;

/// Number of buckets, one per multiple of `MIN_ALLOCATION`.
pub const NUM_BUCKETS: usize = MAX_SMALL_ALLOCATION / MIN_ALLOCATION;

/// Alignment every allocation gets without asking.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// Bucket index for an element of at least `size` bytes.
///
/// `size` must be in `1..=MAX_SMALL_ALLOCATION`; zero maps to bucket 0.
#[inline]
#[must_use]
pub const fn bucket_index(size: usize) -> usize {
    if size <= MIN_ALLOCATION {
        0
    } else {
        size.div_ceil(MIN_ALLOCATION) - 1
    }
}

/// Bucket index for `size` bytes whose slots must be `alignment`-aligned.
///
/// Slots are laid out back from the (page-aligned) page end, so an element
/// size that is a multiple of the alignment yields aligned slots.
#[inline]
#[must_use]
pub fn bucket_index_aligned(size: usize, alignment: usize) -> usize {
    if alignment <= DEFAULT_ALIGNMENT {
        return bucket_index(size);
    }
    bucket_index(size.next_multiple_of(alignment))
}

/// Element size served by bucket `index`.
#[inline]
#[must_use]
pub const fn element_size(index: usize) -> usize {
    (index + 1) * MIN_ALLOCATION
}

/// True when `size` bytes (guard included) at `alignment` fit a bucket.
#[inline]
#[must_use]
pub const fn is_small(size: usize, alignment: usize) -> bool {
    size <= MAX_SMALL_ALLOCATION && alignment <= MAX_SMALL_ALLOCATION
}
