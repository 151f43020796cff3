//! Error taxonomy for the normalization and evaluation pipeline.

use std::path::PathBuf;
use thiserror::Error;

use crate::normalize::Technique;

/// Errors raised by the core library.
///
/// The first four variants are the pipeline's own failure classes; the rest
/// wrap lower-level I/O and format errors with enough context to locate them.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed, missing, or wrongly shaped sample.
    #[error("input format error in {sample}: {reason}")]
    InputFormat { sample: String, reason: String },

    /// A technique cannot produce finite output for this sample.
    #[error("domain error: technique {technique} cannot normalize sample {sample}: {reason}")]
    Domain {
        technique: Technique,
        sample: String,
        reason: String,
    },

    /// Invalid label, ratio, repeat count, seed list, or other setting.
    #[error("configuration error: {0}")]
    Config(String),

    /// Opaque failure reported by (or about) the classifier.
    #[error("classifier error: {0}")]
    ExternalClassifier(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn input(sample: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InputFormat {
            sample: sample.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
