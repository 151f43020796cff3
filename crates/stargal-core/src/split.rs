//! Train/test partitioning and bipolar label encoding.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sample::{FlattenedSample, Label};
use crate::shuffle::permutation;

/// Bipolar one-hot encoding: `0 -> [1, -1]`, `1 -> [-1, 1]`.
pub fn encode_label(label: i64) -> Result<[f64; 2]> {
    Ok(encode(Label::try_from(label)?))
}

fn encode(label: Label) -> [f64; 2] {
    match label {
        Label::Star => [1.0, -1.0],
        Label::Galaxy => [-1.0, 1.0],
    }
}

/// Encode the labels of `rows` (selected by `indices`) as an N x 2 matrix.
pub fn encode_labels(rows: &[FlattenedSample], indices: &[usize]) -> Array2<f64> {
    let mut out = Array2::zeros((indices.len(), 2));
    for (r, &idx) in indices.iter().enumerate() {
        let [a, b] = encode(rows[idx].label);
        out[[r, 0]] = a;
        out[[r, 1]] = b;
    }
    out
}

/// Number of test rows for a ratio: `round(r * n)`, half away from zero.
pub fn test_size(n: usize, ratio: f64) -> usize {
    (ratio * n as f64).round() as usize
}

/// Reject ratios outside the open interval (0, 1).
pub fn validate_ratio(ratio: f64) -> Result<()> {
    if ratio.is_finite() && ratio > 0.0 && ratio < 1.0 {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "split ratio {ratio} is outside (0, 1)"
        )))
    }
}

/// Disjoint train/test row indices, each in ascending order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Partition `0..n` into test (`round(ratio * n)` rows) and train (the rest).
///
/// Test rows are the head of the pinned seeded permutation, so the same
/// `(n, ratio, seed)` always yields the same partition.
pub fn split_indices(n: usize, ratio: f64, seed: u64) -> Result<Split> {
    validate_ratio(ratio)?;
    let perm = permutation(n, seed);
    let (test, train) = perm.split_at(test_size(n, ratio).min(n));
    let mut test = test.to_vec();
    let mut train = train.to_vec();
    test.sort_unstable();
    train.sort_unstable();
    Ok(Split { train, test })
}

/// Class counts on each side of a split
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassBalance {
    pub train_stars: usize,
    pub train_galaxies: usize,
    pub test_stars: usize,
    pub test_galaxies: usize,
}

impl ClassBalance {
    pub fn of(rows: &[FlattenedSample], split: &Split) -> Self {
        let count = |indices: &[usize]| {
            let galaxies = indices
                .iter()
                .filter(|&&i| rows[i].label == Label::Galaxy)
                .count();
            (indices.len() - galaxies, galaxies)
        };
        let (train_stars, train_galaxies) = count(&split.train);
        let (test_stars, test_galaxies) = count(&split.test);
        Self {
            train_stars,
            train_galaxies,
            test_stars,
            test_galaxies,
        }
    }
}
