//! Durable trial log (`trials.csv`).
//!
//! Every finished trial is appended and flushed immediately, so an
//! interrupted sweep keeps everything it completed. A sweep starts by
//! rewriting the log with only the rows it can reuse, so the file always
//! describes one sweep and never mixes results from different tables,
//! classifiers, or seeds.
//!
//! The grid the sweep was asked to fill is stored beside the log
//! (`trials.grid.json`), so a later report can show cells that never ran.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::eval::{TrialOutcome, TrialResult};
use crate::normalize::Technique;
use crate::report::TrialGrid;
use crate::split::ClassBalance;
use crate::table::write_atomically;

/// Default trial log file name
pub const TRIAL_LOG_FILE: &str = "trials.csv";

/// Flat CSV shape of a [`TrialResult`]
#[derive(Debug, Serialize, Deserialize)]
struct TrialRow {
    technique: Technique,
    ratio: f64,
    repeat: usize,
    seed: u64,
    fingerprint: String,
    accuracy: Option<f64>,
    error: Option<String>,
    train_stars: usize,
    train_galaxies: usize,
    test_stars: usize,
    test_galaxies: usize,
}

impl From<&TrialResult> for TrialRow {
    fn from(result: &TrialResult) -> Self {
        let (accuracy, error) = match &result.outcome {
            TrialOutcome::Completed { accuracy } => (Some(*accuracy), None),
            TrialOutcome::Failed { error } => (None, Some(error.clone())),
        };
        Self {
            technique: result.technique,
            ratio: result.ratio,
            repeat: result.repeat,
            seed: result.seed,
            fingerprint: result.fingerprint.clone(),
            accuracy,
            error,
            train_stars: result.balance.train_stars,
            train_galaxies: result.balance.train_galaxies,
            test_stars: result.balance.test_stars,
            test_galaxies: result.balance.test_galaxies,
        }
    }
}

impl From<TrialRow> for TrialResult {
    fn from(row: TrialRow) -> Self {
        let outcome = match (row.accuracy, row.error) {
            (Some(accuracy), _) => TrialOutcome::Completed { accuracy },
            (None, error) => TrialOutcome::Failed {
                error: error.unwrap_or_else(|| "unknown failure".to_string()),
            },
        };
        Self {
            technique: row.technique,
            ratio: row.ratio,
            repeat: row.repeat,
            seed: row.seed,
            fingerprint: row.fingerprint,
            outcome,
            balance: ClassBalance {
                train_stars: row.train_stars,
                train_galaxies: row.train_galaxies,
                test_stars: row.test_stars,
                test_galaxies: row.test_galaxies,
            },
        }
    }
}

/// Sweep grid file stored beside the log at `log_path`
pub fn grid_path(log_path: &Path) -> PathBuf {
    log_path.with_extension("grid.json")
}

pub fn write_sweep_grid(log_path: &Path, grid: &TrialGrid) -> Result<()> {
    write_atomically(&grid_path(log_path), |out| {
        serde_json::to_writer_pretty(&mut *out, grid)?;
        Ok(())
    })
}

/// The grid recorded for the log at `log_path`, if one was written.
pub fn read_sweep_grid(log_path: &Path) -> Result<Option<TrialGrid>> {
    let path = grid_path(log_path);
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
    Ok(Some(serde_json::from_reader(BufReader::new(file))?))
}

/// Read every well-formed row of a trial log.
///
/// Malformed rows (for example a line cut short by an interruption) are
/// skipped with a warning.
pub fn read_trial_log(path: &Path) -> Result<Vec<TrialResult>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(file);
    let mut results = Vec::new();
    for (idx, row) in reader.deserialize::<TrialRow>().enumerate() {
        match row {
            Ok(row) => results.push(TrialResult::from(row)),
            Err(e) => warn!("Skipping malformed trial log line {}: {}", idx + 2, e),
        }
    }
    Ok(results)
}

/// Append handle on a trial log
pub struct TrialLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl TrialLog {
    /// Replace the log at `path` with `kept` and open it for appending.
    pub fn create(path: &Path, kept: &[TrialResult]) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        write_atomically(path, |out| {
            let mut writer = csv::Writer::from_writer(out);
            for result in kept {
                writer.serialize(TrialRow::from(result))?;
            }
            writer.flush().map_err(|e| Error::io(path, e))?;
            Ok(())
        })?;

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        // an empty `kept` leaves the file without a header
        let writer = csv::WriterBuilder::new()
            .has_headers(kept.is_empty())
            .from_writer(file);
        debug!("Opened trial log {} ({} kept trials)", path.display(), kept.len());
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Append one result and flush it to disk.
    pub fn append(&mut self, result: &TrialResult) -> Result<()> {
        self.writer.serialize(TrialRow::from(result))?;
        self.writer
            .flush()
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }
}
