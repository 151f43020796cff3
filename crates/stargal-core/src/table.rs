//! Tabular persistence
//!
//! One headerless CSV per technique (`raw.csv`, `t1.csv` .. `t5.csv`), each row
//! `label,v0,..,v399`, all files sharing the corpus row order. Every file is
//! staged in a temp file next to its destination and renamed into place, so an
//! interrupted run never leaves a half-written table behind.
//!
//! A `manifest.json` alongside the tables records which techniques were
//! written, the corpus statistics, and the sample identity of every row.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::corpus::Corpus;
use crate::error::{Error, Result};
use crate::normalize::{normalize_corpus, Technique};
use crate::sample::{FlattenedSample, Label, VECTOR_LEN};
use crate::stats::CorpusStatistics;
use crate::trial_log::{grid_path, TRIAL_LOG_FILE};

/// Run manifest file name inside the table directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Outcome of preparing one technique's table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TechniqueStatus {
    Written { file: String, rows: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueRecord {
    pub technique: Technique,
    #[serde(flatten)]
    pub status: TechniqueStatus,
}

/// What a `normalize` run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub shuffle_seed: u64,
    pub statistics: CorpusStatistics,
    /// Sample identity per row, in table order
    pub sample_ids: Vec<String>,
    pub techniques: Vec<TechniqueRecord>,
}

impl RunManifest {
    /// Techniques whose table was written successfully
    pub fn written(&self) -> Vec<Technique> {
        self.techniques
            .iter()
            .filter(|r| matches!(r.status, TechniqueStatus::Written { .. }))
            .map(|r| r.technique)
            .collect()
    }

    pub fn failed(&self) -> Vec<(Technique, &str)> {
        self.techniques
            .iter()
            .filter_map(|r| match &r.status {
                TechniqueStatus::Failed { error } => Some((r.technique, error.as_str())),
                TechniqueStatus::Written { .. } => None,
            })
            .collect()
    }
}

/// Stage output in a temp file beside `path`, then rename it over `path`.
pub(crate) fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut staged = NamedTempFile::new_in(&dir).map_err(|e| Error::io(&dir, e))?;
    {
        let mut writer = BufWriter::new(staged.as_file_mut());
        write(&mut writer)?;
        writer.flush().map_err(|e| Error::io(path, e))?;
    }
    staged
        .as_file()
        .sync_all()
        .map_err(|e| Error::io(path, e))?;
    staged
        .persist(path)
        .map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

/// Write one technique table atomically.
pub fn write_table(path: &Path, rows: &[FlattenedSample]) -> Result<()> {
    write_atomically(path, |out| {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(out);
        let mut record: Vec<String> = Vec::with_capacity(VECTOR_LEN + 1);
        for row in rows {
            record.clear();
            record.push(row.label.code().to_string());
            // Display for f64 is the shortest string that parses back exactly
            record.extend(row.values.iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush().map_err(|e| Error::io(path, e))?;
        Ok(())
    })
}

/// Read a technique table, validating every row.
pub fn read_table(path: &Path) -> Result<Vec<FlattenedSample>> {
    let file = fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let where_ = format!("{}:{}", path.display(), idx + 1);
        let record = record.map_err(|e| Error::input(&where_, e.to_string()))?;
        if record.len() != VECTOR_LEN + 1 {
            return Err(Error::input(
                &where_,
                format!(
                    "expected {} fields (label + {VECTOR_LEN} values), found {}",
                    VECTOR_LEN + 1,
                    record.len()
                ),
            ));
        }
        let label_field = record.get(0).unwrap_or_default().trim();
        let code: i64 = label_field
            .parse()
            .map_err(|_| Error::input(&where_, format!("label '{label_field}' is not an integer")))?;
        let label = Label::try_from(code)?;
        let values = record
            .iter()
            .skip(1)
            .map(|field| {
                field.trim().parse::<f64>().map_err(|_| {
                    Error::input(&where_, format!("'{field}' is not a number"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(FlattenedSample::new(&where_, label, values)?);
    }
    Ok(rows)
}

/// Path of a technique's table inside `dir`
pub fn table_path(dir: &Path, technique: Technique) -> PathBuf {
    dir.join(technique.file_name())
}

pub fn load_table(dir: &Path, technique: Technique) -> Result<Vec<FlattenedSample>> {
    read_table(&table_path(dir, technique))
}

pub fn write_run_manifest(dir: &Path, manifest: &RunManifest) -> Result<()> {
    let path = dir.join(MANIFEST_FILE);
    write_atomically(&path, |out| {
        serde_json::to_writer_pretty(&mut *out, manifest)?;
        out.write_all(b"\n").map_err(|e| Error::io(&path, e))?;
        Ok(())
    })
}

pub fn read_run_manifest(dir: &Path) -> Result<RunManifest> {
    let path = dir.join(MANIFEST_FILE);
    let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Normalize and persist every requested technique.
///
/// Techniques run independently in parallel. A technique that fails to
/// normalize gets no table (a stale one from an earlier run is removed) and is
/// recorded as failed; the rest are unaffected. Only directory-level I/O
/// failures abort the whole call.
pub fn prepare_tables(
    corpus: &Corpus,
    stats: &CorpusStatistics,
    techniques: &[Technique],
    out_dir: &Path,
) -> Result<RunManifest> {
    fs::create_dir_all(out_dir).map_err(|e| Error::io(out_dir, e))?;

    let mut records: Vec<TechniqueRecord> = techniques
        .par_iter()
        .map(|&technique| {
            let path = table_path(out_dir, technique);
            let outcome = normalize_corpus(technique, corpus, stats)
                .and_then(|rows| write_table(&path, &rows).map(|_| rows.len()));
            let status = match outcome {
                Ok(rows) => {
                    info!("Wrote {} ({} rows)", path.display(), rows);
                    TechniqueStatus::Written {
                        file: technique.file_name(),
                        rows,
                    }
                }
                Err(err) => {
                    warn!("Technique {} not persisted: {}", technique, err);
                    if path.exists() {
                        if let Err(e) = fs::remove_file(&path) {
                            warn!("Failed to remove stale {}: {}", path.display(), e);
                        }
                    }
                    TechniqueStatus::Failed {
                        error: err.to_string(),
                    }
                }
            };
            TechniqueRecord { technique, status }
        })
        .collect();
    records.sort_by_key(|r| r.technique);

    // trials scored against the previous tables no longer describe these ones
    let trials = out_dir.join(TRIAL_LOG_FILE);
    for stale in [grid_path(&trials), trials] {
        if stale.exists() {
            fs::remove_file(&stale).map_err(|e| Error::io(&stale, e))?;
            info!("Removed stale {}", stale.display());
        }
    }

    let manifest = RunManifest {
        shuffle_seed: corpus.shuffle_seed(),
        statistics: *stats,
        sample_ids: corpus.ids().to_vec(),
        techniques: records,
    };
    write_run_manifest(out_dir, &manifest)?;
    Ok(manifest)
}

/// Quick per-row summary for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowSummary {
    pub row: usize,
    pub label: Label,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Summarize the first `k` rows of a table.
pub fn summarize_rows(rows: &[FlattenedSample], k: usize) -> Vec<RowSummary> {
    rows.iter()
        .take(k)
        .enumerate()
        .map(|(row, sample)| {
            let (min, max) = sample
                .values
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            let mean = sample.values.iter().sum::<f64>() / sample.values.len().max(1) as f64;
            RowSummary {
                row,
                label: sample.label,
                min,
                max,
                mean,
            }
        })
        .collect()
}
