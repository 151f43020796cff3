//! Pinned seeded permutation.
//!
//! Both the corpus order and every train/test split come from this one
//! algorithm, so a given `(n, seed)` yields the same permutation on every
//! platform:
//!
//! - RNG: `ChaCha8Rng::seed_from_u64(seed)` (value-stable across releases)
//! - Fisher-Yates from the last index down to 1
//! - Swap partner `j = (u * (i + 1)) >> 64` with `u = next_u64()`
//!
//! The widening multiply is used instead of `Rng::random_range` because the
//! latter's sampling method is not guaranteed stable between `rand` versions.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Map a uniform `u64` onto `0..bound` by widening multiply.
#[inline]
fn bounded_index(u: u64, bound: usize) -> usize {
    ((u as u128 * bound as u128) >> 64) as usize
}

/// Shuffle `items` in place with the pinned algorithm.
pub fn shuffle_in_place<T>(items: &mut [T], seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for i in (1..items.len()).rev() {
        let j = bounded_index(rng.next_u64(), i + 1);
        items.swap(i, j);
    }
}

/// Seeded permutation of `0..n`.
pub fn permutation(n: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    shuffle_in_place(&mut indices, seed);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutation_is_deterministic() {
        assert_eq!(permutation(50, 42), permutation(50, 42));
    }

    #[test]
    fn test_permutation_golden_values() {
        // pinned output; any change here breaks every stored corpus order and split
        assert_eq!(permutation(10, 42), vec![9, 7, 2, 5, 0, 1, 4, 3, 8, 6]);
        assert_eq!(permutation(5, 7), vec![3, 1, 2, 4, 0]);
    }

    #[test]
    fn test_permutation_covers_all_indices() {
        let mut perm = permutation(37, 7);
        perm.sort_unstable();
        assert_eq!(perm, (0..37).collect::<Vec<_>>());
    }

    #[test]
    fn test_different_seeds_differ() {
        assert_ne!(permutation(100, 1), permutation(100, 2));
    }

    #[test]
    fn test_degenerate_sizes() {
        assert!(permutation(0, 3).is_empty());
        assert_eq!(permutation(1, 3), vec![0]);
    }

    #[test]
    fn test_bounded_index_range() {
        assert_eq!(bounded_index(0, 10), 0);
        assert_eq!(bounded_index(u64::MAX, 10), 9);
        assert_eq!(bounded_index(u64::MAX / 2, 2), 0);
        assert_eq!(bounded_index(u64::MAX / 2 + 1, 2), 1);
    }
}
