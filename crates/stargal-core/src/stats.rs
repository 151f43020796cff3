//! Corpus-wide pixel extrema.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::sample::FlattenedSample;

/// Global min/max over every raw pixel of the corpus.
///
/// Computed once, before any technique that needs global extrema, and passed
/// by reference from then on. Fields are private so it cannot drift after
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorpusStatistics {
    min_pixel_all: f64,
    max_pixel_all: f64,
    sample_count: usize,
}

impl CorpusStatistics {
    /// Single read-only pass over all raw vectors.
    pub fn compute(samples: &[FlattenedSample]) -> Result<Self> {
        Self::from_vectors(samples.iter().map(|s| s.values.as_slice()))
    }

    /// Same pass over bare vectors of any (shared) length.
    pub fn from_vectors<'a, I>(vectors: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut count = 0usize;
        for vector in vectors {
            count += 1;
            for &value in vector {
                min = min.min(value);
                max = max.max(value);
            }
        }
        if count == 0 || !min.is_finite() || !max.is_finite() {
            return Err(Error::input(
                "corpus",
                "cannot compute statistics of an empty corpus",
            ));
        }
        debug!("Corpus statistics: min={} max={} over {} samples", min, max, count);
        Ok(Self {
            min_pixel_all: min,
            max_pixel_all: max,
            sample_count: count,
        })
    }

    pub fn min_pixel_all(&self) -> f64 {
        self.min_pixel_all
    }

    pub fn max_pixel_all(&self) -> f64 {
        self.max_pixel_all
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// True when every pixel in the corpus has the same value
    pub fn is_degenerate(&self) -> bool {
        self.max_pixel_all == self.min_pixel_all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Label, VECTOR_LEN};

    fn sample(values: &[f64]) -> FlattenedSample {
        let mut full = vec![values[0]; VECTOR_LEN];
        full[..values.len()].copy_from_slice(values);
        FlattenedSample {
            label: Label::Star,
            values: full,
        }
    }

    #[test]
    fn test_extrema_span_all_samples() {
        let stats =
            CorpusStatistics::compute(&[sample(&[1.0, 2.0, 3.0, 4.0]), sample(&[5.0, 6.0, 7.0, 8.0])])
                .unwrap();
        assert_eq!(stats.min_pixel_all(), 1.0);
        assert_eq!(stats.max_pixel_all(), 8.0);
        assert_eq!(stats.sample_count(), 2);
        assert!(!stats.is_degenerate());
    }

    #[test]
    fn test_degenerate_corpus() {
        let stats = CorpusStatistics::compute(&[sample(&[3.0]), sample(&[3.0])]).unwrap();
        assert!(stats.is_degenerate());
    }

    #[test]
    fn test_empty_corpus() {
        assert!(CorpusStatistics::compute(&[]).is_err());
    }
}
