//! Size-class table.
//!
//! ```text
//!   index  0..8    1..=64 bytes, 8-byte steps
//!   index  8..24   65..=1024 bytes, 4 classes per power of two
//!   index 24..29   "fitting" sizes: 9, 6, 4, 3, 2 objects per block
//! ```
//!
//! Fitting sizes are rounded down to [`FITTING_ALIGNMENT`] so that objects
//! carved from the end of a block stay 128-byte aligned.

use super::block::{BLOCK_HEADER_SIZE, BLOCK_SIZE};

pub(crate) const NUM_SMALL_BINS: usize = 8;
pub(crate) const MAX_SMALL_OBJECT_SIZE: usize = 64;

pub(crate) const MIN_SEGREGATED_INDEX: usize = NUM_SMALL_BINS;
pub(crate) const NUM_SEGREGATED_BINS: usize = 16;
pub(crate) const MAX_SEGREGATED_OBJECT_SIZE: usize = 1024;

pub(crate) const MIN_FITTING_INDEX: usize = MIN_SEGREGATED_INDEX + NUM_SEGREGATED_BINS;
pub(crate) const NUM_FITTING_BINS: usize = 5;
pub(crate) const FITTING_ALIGNMENT: usize = 128;

const fn fitting_size(per_block: usize) -> usize {
    ((BLOCK_SIZE - BLOCK_HEADER_SIZE) / per_block) & !(FITTING_ALIGNMENT - 1)
}

pub(crate) const FITTING_SIZES: [usize; NUM_FITTING_BINS] = [
    fitting_size(9),
    fitting_size(6),
    fitting_size(4),
    fitting_size(3),
    fitting_size(2),
];

/// Requests of this size and above bypass blocks entirely.
pub const MIN_LARGE_OBJECT_SIZE: usize = FITTING_SIZES[NUM_FITTING_BINS - 1] + 1;

/// Number of per-thread bins.
pub(crate) const NUM_BINS: usize = MIN_FITTING_INDEX + NUM_FITTING_BINS;

/// Returned by [`classify`] for sizes that have no block size class.
pub(crate) const NOT_A_SIZE_CLASS: usize = usize::MAX;

/// Position of the highest set bit. `n` must be non-zero.
#[inline]
pub(crate) fn highest_bit_pos(n: u32) -> u32 {
    debug_assert!(n != 0, "highest_bit_pos(0) is undefined");
    31 - n.leading_zeros()
}

/// Round `size` up to a power-of-two `alignment`.
#[inline]
pub(crate) const fn align_up(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

/// Size-class index for a request of `size` bytes.
///
/// Returns [`NOT_A_SIZE_CLASS`] for zero or large-object sizes; both are
/// caller bugs and trip a debug assertion.
#[inline]
pub(crate) fn classify(size: usize) -> usize {
    if size == 0 || size >= MIN_LARGE_OBJECT_SIZE {
        debug_assert!(false, "classify called with non-block size {size}");
        return NOT_A_SIZE_CLASS;
    }
    if size <= MAX_SMALL_OBJECT_SIZE {
        return (size - 1) >> 3;
    }
    if size <= MAX_SEGREGATED_OBJECT_SIZE {
        #[allow(clippy::cast_possible_truncation)]
        let order = highest_bit_pos((size - 1) as u32) as usize;
        debug_assert!((6..=9).contains(&order));
        // Four classes per group: 4*(order-6) + position within the group.
        return MIN_SEGREGATED_INDEX + 4 * order + ((size - 1) >> (order - 2)) - 28;
    }
    let offset = FITTING_SIZES
        .iter()
        .position(|&fit| size <= fit)
        .unwrap_or(NUM_FITTING_BINS - 1);
    MIN_FITTING_INDEX + offset
}

/// Canonical object size of the class that serves `size`.
#[inline]
pub(crate) fn object_size(size: usize) -> usize {
    if size <= MAX_SMALL_OBJECT_SIZE {
        return align_up(size.max(1), 8);
    }
    if size <= MAX_SEGREGATED_OBJECT_SIZE {
        #[allow(clippy::cast_possible_truncation)]
        let order = highest_bit_pos((size - 1) as u32) as usize;
        let alignment = 128 >> (9 - order);
        return align_up(size, alignment);
    }
    match classify(size) {
        NOT_A_SIZE_CLASS => NOT_A_SIZE_CLASS,
        idx => FITTING_SIZES[idx - MIN_FITTING_INDEX],
    }
}

/// Object size served by bin `index`.
#[cfg(test)]
pub(crate) fn object_size_of_class(index: usize) -> usize {
    debug_assert!(index < NUM_BINS);
    if index < MIN_SEGREGATED_INDEX {
        return (index + 1) * 8;
    }
    if index < MIN_FITTING_INDEX {
        let group = (index - MIN_SEGREGATED_INDEX) / 4;
        let step = (index - MIN_SEGREGATED_INDEX) % 4;
        let base = 64usize << group;
        return base + (step + 1) * (base / 4);
    }
    FITTING_SIZES[index - MIN_FITTING_INDEX]
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_fitting_sizes_match_block_geometry() {
        if BLOCK_HEADER_SIZE == 128 {
            assert_eq!(FITTING_SIZES, [1792, 2688, 3968, 5376, 8064]);
            assert_eq!(MIN_LARGE_OBJECT_SIZE, 8065);
        }
        for (n, &fit) in [9, 6, 4, 3, 2].iter().zip(FITTING_SIZES.iter()) {
            assert!(fit * n <= BLOCK_SIZE - BLOCK_HEADER_SIZE);
            assert_eq!(fit % FITTING_ALIGNMENT, 0);
        }
        assert_eq!(NUM_BINS, 29);
    }

    #[test]
    fn test_small_classes() {
        assert_eq!(classify(1), 0);
        assert_eq!(classify(8), 0);
        assert_eq!(classify(9), 1);
        assert_eq!(classify(64), 7);
        assert_eq!(object_size(1), 8);
        assert_eq!(object_size(17), 24);
        assert_eq!(object_size(64), 64);
    }

    #[test]
    fn test_segregated_classes() {
        assert_eq!(classify(65), 8);
        assert_eq!(object_size(65), 80);
        assert_eq!(classify(80), 8);
        assert_eq!(classify(81), 9);
        assert_eq!(object_size(100), 112);
        assert_eq!(classify(128), 11);
        assert_eq!(object_size(129), 160);
        assert_eq!(classify(1024), 23);
        assert_eq!(object_size(1024), 1024);
        assert_eq!(object_size(900), 1024);
        assert_eq!(object_size(897), 1024);
        assert_eq!(object_size(896), 896);
    }

    #[test]
    fn test_fitting_classes() {
        assert_eq!(classify(1025), MIN_FITTING_INDEX);
        assert_eq!(object_size(1025), FITTING_SIZES[0]);
        assert_eq!(classify(FITTING_SIZES[0] + 1), MIN_FITTING_INDEX + 1);
        let last = MIN_LARGE_OBJECT_SIZE - 1;
        assert_eq!(classify(last), NUM_BINS - 1);
        assert_eq!(object_size(last), FITTING_SIZES[4]);
    }

    #[test]
    fn test_every_size_fits_its_class() {
        for size in 1..MIN_LARGE_OBJECT_SIZE {
            let idx = classify(size);
            assert!(idx < NUM_BINS, "size {size} got index {idx}");
            let obj = object_size(size);
            assert!(obj >= size, "size {size} → object {obj}");
            assert_eq!(obj, object_size_of_class(idx), "size {size}");
            // The class must be monotone in size.
            if size > 1 {
                assert!(classify(size - 1) <= idx);
            }
        }
    }

    #[test]
    fn test_class_sizes_are_self_consistent() {
        for idx in 0..NUM_BINS {
            let obj = object_size_of_class(idx);
            assert_eq!(classify(obj), idx, "class {idx} size {obj}");
            assert_eq!(object_size(obj), obj);
        }
    }

    #[test]
    fn test_aligned_sizes_give_aligned_classes() {
        // For every power-of-two alignment up to 1024, a size that is a
        // multiple of it maps to a class that is also a multiple of it.
        let mut align = 8;
        while align <= MAX_SEGREGATED_OBJECT_SIZE {
            let mut size = align;
            while size <= MAX_SEGREGATED_OBJECT_SIZE {
                assert_eq!(object_size(size) % align, 0, "size {size} align {align}");
                size += align;
            }
            align *= 2;
        }
    }

    #[test]
    fn test_highest_bit_pos() {
        assert_eq!(highest_bit_pos(1), 0);
        assert_eq!(highest_bit_pos(64), 6);
        assert_eq!(highest_bit_pos(1023), 9);
        assert_eq!(highest_bit_pos(u32::MAX), 31);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_classify_out_of_range_sentinel() {
        assert_eq!(classify(0), NOT_A_SIZE_CLASS);
        assert_eq!(classify(MIN_LARGE_OBJECT_SIZE), NOT_A_SIZE_CLASS);
    }
}
