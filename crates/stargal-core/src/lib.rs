//! stargal-core: Cutout normalization and split-ratio evaluation
//!
//! This crate provides:
//! - Corpus loading from a label manifest with one fixed, seeded row order
//! - Corpus-wide pixel extrema
//! - Five normalization techniques plus raw passthrough, persisted as CSV tables
//! - Seeded train/test splits with bipolar label encoding
//! - A repeated-trial evaluation harness around a pluggable classifier
//! - Aggregation of trial results into per-(technique, ratio) accuracy cells

pub mod classifier;
pub mod config;
pub mod corpus;
pub mod error;
pub mod eval;
pub mod normalize;
pub mod report;
pub mod sample;
pub mod shuffle;
pub mod split;
pub mod stats;
pub mod table;
pub mod trial_log;

// Re-exports
pub use classifier::{Classifier, CommandClassifier, KnnClassifier};
pub use config::{load_config, locate_config, ExperimentConfig};
pub use corpus::{load_corpus, Corpus, CorpusSource, ManifestEntry};
pub use error::{Error, Result};
pub use eval::{run_sweep, SeedPlan, SweepConfig, TechniqueData, TrialOutcome, TrialResult};
pub use normalize::{normalize_corpus, normalize_sample, Technique};
pub use report::{aggregate, AccuracyGrid, AggregateResult, TrialGrid};
pub use sample::{Cutout, FlattenedSample, Label, GRID_SIDE, VECTOR_LEN};
pub use split::{encode_label, split_indices, ClassBalance, Split};
pub use stats::CorpusStatistics;
pub use table::{prepare_tables, read_run_manifest, read_table, write_table, RunManifest};
pub use trial_log::TrialLog;
