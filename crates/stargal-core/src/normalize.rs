//! Normalization engine
//!
//! Five pure transforms, each mapping one raw vector (plus, where needed, the
//! corpus-wide extrema) to a vector of the same length:
//!
//! | id | formula                                         | extrema used               |
//! |----|-------------------------------------------------|----------------------------|
//! | t1 | `log10(x) - min(log10(x))`                      | per-sample                 |
//! | t2 | `(x - min(x)) / (max(x) - min(x))`              | per-sample                 |
//! | t3 | `(x - min_all) / (max_all - min_all)`           | global                     |
//! | t4 | `(x - min(x)) / max_all`                        | per-sample min, global max |
//! | t5 | `(log10(x) - min(log10(x))) / log10(max_all)`   | per-sample min, global max |
//!
//! Inputs a transform cannot handle produce a [`DomainViolation`] instead of a
//! non-finite value. No transform looks at another sample's pixels except
//! through [`CorpusStatistics`].

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::corpus::Corpus;
use crate::error::{Error, Result};
use crate::sample::FlattenedSample;
use crate::stats::CorpusStatistics;

/// Raw passthrough plus the five normalization techniques
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technique {
    Raw,
    T1,
    T2,
    T3,
    T4,
    T5,
}

impl Technique {
    pub const ALL: [Technique; 6] = [
        Technique::Raw,
        Technique::T1,
        Technique::T2,
        Technique::T3,
        Technique::T4,
        Technique::T5,
    ];

    /// Stable short id, also the table file stem
    pub fn id(self) -> &'static str {
        match self {
            Technique::Raw => "raw",
            Technique::T1 => "t1",
            Technique::T2 => "t2",
            Technique::T3 => "t3",
            Technique::T4 => "t4",
            Technique::T5 => "t5",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Technique::Raw => "raw pixels",
            Technique::T1 => "per-sample log shift",
            Technique::T2 => "per-sample min-max",
            Technique::T3 => "global min-max",
            Technique::T4 => "per-sample shift, global max scale",
            Technique::T5 => "per-sample log shift, global log-max scale",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.csv", self.id())
    }

    /// Apply the transform to one raw vector.
    pub fn apply(
        self,
        values: &[f64],
        stats: &CorpusStatistics,
    ) -> std::result::Result<Vec<f64>, DomainViolation> {
        let out = match self {
            Technique::Raw => values.to_vec(),
            Technique::T1 => log_shift(values)?,
            Technique::T2 => min_max(values)?,
            Technique::T3 => global_min_max(values, stats)?,
            Technique::T4 => shift_by_global_max(values, stats)?,
            Technique::T5 => log_shift_by_global_log_max(values, stats)?,
        };
        if let Some(pos) = out.iter().position(|v| !v.is_finite()) {
            return Err(DomainViolation(format!(
                "output value {pos} is not finite ({})",
                out[pos]
            )));
        }
        Ok(out)
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for Technique {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" | "t0" => Ok(Technique::Raw),
            "t1" => Ok(Technique::T1),
            "t2" => Ok(Technique::T2),
            "t3" => Ok(Technique::T3),
            "t4" => Ok(Technique::T4),
            "t5" => Ok(Technique::T5),
            other => Err(Error::Config(format!(
                "unknown technique '{other}'. Available: raw, t1, t2, t3, t4, t5"
            ))),
        }
    }
}

/// Why a transform refused an input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainViolation(pub String);

impl fmt::Display for DomainViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Transformed = std::result::Result<Vec<f64>, DomainViolation>;

fn extrema(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

fn log10_positive(values: &[f64]) -> Transformed {
    values
        .iter()
        .enumerate()
        .map(|(pos, &v)| {
            if v > 0.0 {
                Ok(v.log10())
            } else {
                Err(DomainViolation(format!(
                    "pixel {pos} is {v}; log-based techniques need strictly positive pixels"
                )))
            }
        })
        .collect()
}

/// T1: `log10(x) - min(log10(x))`
pub fn log_shift(values: &[f64]) -> Transformed {
    let logs = log10_positive(values)?;
    let (lo, _) = extrema(&logs);
    Ok(logs.into_iter().map(|v| v - lo).collect())
}

/// T2: `(x - min(x)) / (max(x) - min(x))`
pub fn min_max(values: &[f64]) -> Transformed {
    let (lo, hi) = extrema(values);
    let range = hi - lo;
    if range == 0.0 {
        return Err(DomainViolation(format!(
            "sample is constant ({lo}); min-max range is zero"
        )));
    }
    Ok(values.iter().map(|&v| (v - lo) / range).collect())
}

/// T3: `(x - min_all) / (max_all - min_all)`
pub fn global_min_max(values: &[f64], stats: &CorpusStatistics) -> Transformed {
    if stats.is_degenerate() {
        return Err(DomainViolation(format!(
            "corpus is constant ({}); global min-max range is zero",
            stats.min_pixel_all()
        )));
    }
    let lo = stats.min_pixel_all();
    let range = stats.max_pixel_all() - lo;
    Ok(values.iter().map(|&v| (v - lo) / range).collect())
}

/// T4: `(x - min(x)) / max_all`
pub fn shift_by_global_max(values: &[f64], stats: &CorpusStatistics) -> Transformed {
    let max_all = stats.max_pixel_all();
    if max_all == 0.0 {
        return Err(DomainViolation("global max is 0".to_string()));
    }
    let (lo, _) = extrema(values);
    Ok(values.iter().map(|&v| (v - lo) / max_all).collect())
}

/// T5: `(log10(x) - min(log10(x))) / log10(max_all)`
pub fn log_shift_by_global_log_max(values: &[f64], stats: &CorpusStatistics) -> Transformed {
    let max_all = stats.max_pixel_all();
    if max_all <= 0.0 {
        return Err(DomainViolation(format!(
            "global max is {max_all}; its log10 is undefined"
        )));
    }
    let log_max = max_all.log10();
    if log_max == 0.0 {
        return Err(DomainViolation(
            "global max is 1; log10(max_all) is zero".to_string(),
        ));
    }
    let shifted = log_shift(values)?;
    Ok(shifted.into_iter().map(|v| v / log_max).collect())
}

/// Normalize one sample, attaching technique and sample identity to failures.
pub fn normalize_sample(
    technique: Technique,
    id: &str,
    sample: &FlattenedSample,
    stats: &CorpusStatistics,
) -> Result<FlattenedSample> {
    let values = technique
        .apply(&sample.values, stats)
        .map_err(|violation| Error::Domain {
            technique,
            sample: id.to_string(),
            reason: violation.0,
        })?;
    Ok(FlattenedSample {
        label: sample.label,
        values,
    })
}

/// Normalize the whole corpus with one technique, preserving row order.
///
/// Stops at the first sample the technique cannot handle.
pub fn normalize_corpus(
    technique: Technique,
    corpus: &Corpus,
    stats: &CorpusStatistics,
) -> Result<Vec<FlattenedSample>> {
    let mut rows = Vec::with_capacity(corpus.len());
    for (id, sample) in corpus.ids().iter().zip(corpus.samples()) {
        rows.push(normalize_sample(technique, id, sample, stats)?);
    }
    Ok(rows)
}

/// Run several techniques independently and in parallel.
///
/// One technique failing does not affect the others.
pub fn normalize_all(
    techniques: &[Technique],
    corpus: &Corpus,
    stats: &CorpusStatistics,
) -> Vec<(Technique, Result<Vec<FlattenedSample>>)> {
    techniques
        .par_iter()
        .map(|&technique| (technique, normalize_corpus(technique, corpus, stats)))
        .collect()
}
