//! Classifier contract
//!
//! The evaluation harness treats the predictor as a black box:
//! `classify(train_features N x 400, train_labels N x 2 bipolar,
//! test_features M x 400, nn_count, verbose) -> M x 2 probabilities`.
//!
//! Two implementations ship with the crate:
//! - [`KnnClassifier`]: in-process k-nearest-neighbor vote
//! - [`CommandClassifier`]: an external program speaking JSON over stdin/stdout

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::Serialize;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::{Error, Result};

/// Probabilistic two-class predictor
pub trait Classifier: Sync {
    /// Short name for logs and reports
    fn name(&self) -> &str;

    fn classify(
        &self,
        train_features: ArrayView2<'_, f64>,
        train_labels: ArrayView2<'_, f64>,
        test_features: ArrayView2<'_, f64>,
        nn_count: usize,
        verbose: bool,
    ) -> Result<Array2<f64>>;
}

/// Arg-max of a probability row; ties resolve to class 0.
pub fn argmax(row: ArrayView1<'_, f64>) -> usize {
    let mut best = 0;
    for (idx, &p) in row.iter().enumerate().skip(1) {
        if p > row[best] {
            best = idx;
        }
    }
    best
}

/// Check that a classifier answered with an M x 2 matrix of finite values.
pub fn validate_probabilities(probs: &Array2<f64>, expected_rows: usize) -> Result<()> {
    if probs.nrows() != expected_rows || probs.ncols() != 2 {
        return Err(Error::ExternalClassifier(format!(
            "expected {expected_rows}x2 probabilities, got {}x{}",
            probs.nrows(),
            probs.ncols()
        )));
    }
    if probs.iter().any(|p| !p.is_finite()) {
        return Err(Error::ExternalClassifier(
            "probabilities contain non-finite values".to_string(),
        ));
    }
    Ok(())
}

/// Euclidean k-nearest-neighbor vote.
///
/// The probability of a class is the fraction of the `min(nn_count, N)`
/// nearest training rows whose bipolar slot for that class is `+1`. Equal
/// distances are broken by the lower training index, so output is fully
/// deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnnClassifier;

impl KnnClassifier {
    pub fn new() -> Self {
        Self
    }
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl Classifier for KnnClassifier {
    fn name(&self) -> &str {
        "knn"
    }

    fn classify(
        &self,
        train_features: ArrayView2<'_, f64>,
        train_labels: ArrayView2<'_, f64>,
        test_features: ArrayView2<'_, f64>,
        nn_count: usize,
        verbose: bool,
    ) -> Result<Array2<f64>> {
        let n = train_features.nrows();
        if n == 0 {
            return Err(Error::ExternalClassifier("empty training set".to_string()));
        }
        if train_labels.nrows() != n || train_labels.ncols() != 2 {
            return Err(Error::ExternalClassifier(format!(
                "training labels are {}x{}, expected {n}x2",
                train_labels.nrows(),
                train_labels.ncols()
            )));
        }
        if test_features.ncols() != train_features.ncols() {
            return Err(Error::ExternalClassifier(format!(
                "feature width mismatch: train {}, test {}",
                train_features.ncols(),
                test_features.ncols()
            )));
        }
        if nn_count == 0 {
            return Err(Error::ExternalClassifier(
                "nn_count must be at least 1".to_string(),
            ));
        }

        let k = nn_count.min(n);
        let mut probs = Array2::zeros((test_features.nrows(), 2));
        let mut distances: Vec<(f64, usize)> = Vec::with_capacity(n);

        for (m, query) in test_features.rows().into_iter().enumerate() {
            distances.clear();
            distances.extend(
                train_features
                    .rows()
                    .into_iter()
                    .enumerate()
                    .map(|(i, row)| (squared_distance(query, row), i)),
            );
            let by_distance = |a: &(f64, usize), b: &(f64, usize)| {
                a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
            };
            if k < n {
                distances.select_nth_unstable_by(k - 1, by_distance);
            }

            for &(_, i) in &distances[..k] {
                for class in 0..2 {
                    if train_labels[[i, class]] > 0.0 {
                        probs[[m, class]] += 1.0;
                    }
                }
            }
            probs.row_mut(m).mapv_inplace(|v| v / k as f64);
        }

        if verbose {
            debug!(
                "knn: classified {} rows against {} training rows (k={})",
                test_features.nrows(),
                n,
                k
            );
        }
        Ok(probs)
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    train_features: Vec<&'a [f64]>,
    train_labels: Vec<[f64; 2]>,
    test_features: Vec<&'a [f64]>,
    nn_count: usize,
    verbose: bool,
}

/// External predictor invoked as `sh -c <command>`.
///
/// Receives one JSON object on stdin with keys `train_features`,
/// `train_labels`, `test_features` (arrays of rows), `nn_count`, `verbose`,
/// and must print an M x 2 JSON array of probabilities on stdout.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    command: String,
}

impl CommandClassifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn rows<'a>(view: &'a ArrayView2<'_, f64>) -> Result<Vec<&'a [f64]>> {
        view.rows()
            .into_iter()
            .map(|row| {
                row.to_slice().ok_or_else(|| {
                    Error::ExternalClassifier("feature matrix is not row-contiguous".to_string())
                })
            })
            .collect()
    }
}

impl Classifier for CommandClassifier {
    fn name(&self) -> &str {
        &self.command
    }

    fn classify(
        &self,
        train_features: ArrayView2<'_, f64>,
        train_labels: ArrayView2<'_, f64>,
        test_features: ArrayView2<'_, f64>,
        nn_count: usize,
        verbose: bool,
    ) -> Result<Array2<f64>> {
        let request = ClassifyRequest {
            train_features: Self::rows(&train_features)?,
            train_labels: train_labels
                .rows()
                .into_iter()
                .map(|r| [r[0], r[1]])
                .collect(),
            test_features: Self::rows(&test_features)?,
            nn_count,
            verbose,
        };
        let payload = serde_json::to_vec(&request)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if verbose {
                Stdio::inherit()
            } else {
                Stdio::piped()
            })
            .spawn()
            .map_err(|e| {
                Error::ExternalClassifier(format!("failed to start '{}': {e}", self.command))
            })?;

        // Feed stdin from a separate thread so a chatty child cannot deadlock on a full stdout pipe
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || stdin.write_all(&payload))
        });

        let output = child
            .wait_with_output()
            .map_err(|e| Error::ExternalClassifier(format!("failed to wait for classifier: {e}")))?;
        let sent = writer.map(|handle| handle.join());
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExternalClassifier(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        match sent {
            Some(Ok(Err(e))) => {
                return Err(Error::ExternalClassifier(format!(
                    "failed to send request: {e}"
                )))
            }
            Some(Err(_)) => {
                return Err(Error::ExternalClassifier(
                    "request writer thread panicked".to_string(),
                ))
            }
            _ => {}
        }

        let rows: Vec<Vec<f64>> = serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::ExternalClassifier(format!("malformed classifier output: {e}"))
        })?;
        let m = rows.len();
        if let Some(bad) = rows.iter().position(|r| r.len() != 2) {
            return Err(Error::ExternalClassifier(format!(
                "row {bad} has {} probabilities, expected 2",
                rows[bad].len()
            )));
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((m, 2), flat)
            .map_err(|e| Error::ExternalClassifier(format!("bad output shape: {e}")))
    }
}
