//! Aggregation of trial results into per-(technique, ratio) cells.
//!
//! Cells come from the expected sweep grid, not from whatever the log holds,
//! so a cell or technique that never ran still appears with zero completed
//! trials. A cell's mean covers completed trials only, and every cell carries
//! its completed/failed/expected counts so a short average is always visible
//! as such.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::eval::TrialResult;
use crate::normalize::Technique;

/// Mean accuracy for one `(technique, ratio)` cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub technique: Technique,
    pub ratio: f64,
    /// `None` when no trial in the cell completed
    pub mean_accuracy: Option<f64>,
    pub completed: usize,
    pub failed: usize,
    pub expected: usize,
}

impl AggregateResult {
    pub fn is_complete(&self) -> bool {
        self.completed == self.expected
    }

    /// Trials that neither completed nor were recorded as failed
    pub fn missing(&self) -> usize {
        self.expected.saturating_sub(self.completed + self.failed)
    }

    /// Table cell text: `0.925`, `0.900*` for a partial cell, `n/a` when empty.
    pub fn cell_text(&self) -> String {
        match self.mean_accuracy {
            None => "n/a".to_string(),
            Some(mean) if self.is_complete() => format!("{mean:.3}"),
            Some(mean) => format!("{mean:.3}*"),
        }
    }
}

/// The techniques, ratios and repeat count a sweep was asked to fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialGrid {
    pub techniques: Vec<Technique>,
    pub ratios: Vec<f64>,
    pub repeats: usize,
}

impl TrialGrid {
    pub fn new(techniques: &[Technique], ratios: &[f64], repeats: usize) -> Self {
        let mut grid = Self {
            techniques: techniques.to_vec(),
            ratios: ratios.to_vec(),
            repeats,
        };
        grid.canonicalize();
        grid
    }

    /// Grid implied by a trial log alone: every technique and ratio it
    /// mentions, and the highest repeat index plus one.
    pub fn observed(results: &[TrialResult]) -> Self {
        let techniques: Vec<Technique> = results.iter().map(|r| r.technique).collect();
        let ratios: Vec<f64> = results.iter().map(|r| r.ratio).collect();
        Self::new(&techniques, &ratios, infer_repeats(results))
    }

    /// Add techniques (and ratios) that results reference but the grid lacks.
    pub fn cover(&mut self, results: &[TrialResult]) {
        self.techniques.extend(results.iter().map(|r| r.technique));
        self.ratios.extend(results.iter().map(|r| r.ratio));
        self.canonicalize();
    }

    fn canonicalize(&mut self) {
        self.techniques.sort();
        self.techniques.dedup();
        self.ratios.sort_by(f64::total_cmp);
        self.ratios.dedup_by(|a, b| a.to_bits() == b.to_bits());
    }

    fn contains(&self, result: &TrialResult) -> bool {
        result.repeat < self.repeats
            && self.techniques.contains(&result.technique)
            && self
                .ratios
                .iter()
                .any(|r| r.to_bits() == result.ratio.to_bits())
    }
}

/// Keep one result per `(technique, ratio, repeat)` inside `grid`.
///
/// A log can hold a failed attempt followed by a successful rerun of the same
/// trial; the completed one wins, otherwise the latest entry.
fn settle<'a>(results: &'a [TrialResult], grid: &TrialGrid) -> Vec<&'a TrialResult> {
    let mut latest: HashMap<(Technique, u64, usize), &TrialResult> = HashMap::new();
    for result in results.iter().filter(|r| grid.contains(r)) {
        let key = (result.technique, result.ratio.to_bits(), result.repeat);
        match latest.get(&key) {
            Some(prev) if prev.accuracy().is_some() && result.accuracy().is_none() => {}
            _ => {
                latest.insert(key, result);
            }
        }
    }
    let mut settled: Vec<&TrialResult> = latest.into_values().collect();
    settled.sort_by(|a, b| {
        a.technique
            .cmp(&b.technique)
            .then(a.ratio.total_cmp(&b.ratio))
            .then(a.repeat.cmp(&b.repeat))
    });
    settled
}

/// Every cell of `grid` in technique-then-ratio order, with its settled
/// results (possibly none).
fn cells<'a>(
    results: &'a [TrialResult],
    grid: &TrialGrid,
) -> Vec<(Technique, f64, Vec<&'a TrialResult>)> {
    let settled = settle(results, grid);
    let mut out = Vec::with_capacity(grid.techniques.len() * grid.ratios.len());
    for &technique in &grid.techniques {
        for &ratio in &grid.ratios {
            let members: Vec<&TrialResult> = settled
                .iter()
                .copied()
                .filter(|r| r.technique == technique && r.ratio.to_bits() == ratio.to_bits())
                .collect();
            out.push((technique, ratio, members));
        }
    }
    out
}

/// One cell per `(technique, ratio)` of `grid`, sorted by technique then
/// ratio. Cells with no logged trial have `completed == 0`.
pub fn aggregate(results: &[TrialResult], grid: &TrialGrid) -> Vec<AggregateResult> {
    cells(results, grid)
        .into_iter()
        .map(|(technique, ratio, members)| {
            let accuracies: Vec<f64> = members.iter().filter_map(|r| r.accuracy()).collect();
            let completed = accuracies.len();
            let mean_accuracy =
                (completed > 0).then(|| accuracies.iter().sum::<f64>() / completed as f64);
            AggregateResult {
                technique,
                ratio,
                mean_accuracy,
                completed,
                failed: members.len() - completed,
                expected: grid.repeats,
            }
        })
        .collect()
}

/// Repeat count implied by a trial log: highest repeat index plus one.
fn infer_repeats(results: &[TrialResult]) -> usize {
    results.iter().map(|r| r.repeat + 1).max().unwrap_or(0)
}

/// Techniques as rows, ratios as columns
#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyGrid {
    pub ratios: Vec<f64>,
    pub rows: Vec<(Technique, Vec<Option<AggregateResult>>)>,
}

impl AccuracyGrid {
    pub fn new(aggregates: &[AggregateResult]) -> Self {
        let mut ratios: Vec<f64> = aggregates.iter().map(|a| a.ratio).collect();
        ratios.sort_by(f64::total_cmp);
        ratios.dedup_by(|a, b| a.to_bits() == b.to_bits());

        let mut by_technique: BTreeMap<Technique, Vec<Option<AggregateResult>>> = BTreeMap::new();
        for cell in aggregates {
            let row = by_technique
                .entry(cell.technique)
                .or_insert_with(|| vec![None; ratios.len()]);
            if let Some(col) = ratios.iter().position(|r| r.to_bits() == cell.ratio.to_bits()) {
                row[col] = Some(cell.clone());
            }
        }
        Self {
            ratios,
            rows: by_technique.into_iter().collect(),
        }
    }

    /// Footnote lines for every cell that is not complete.
    pub fn notes(&self) -> Vec<String> {
        self.rows
            .iter()
            .flat_map(|(_, cells)| cells.iter().flatten())
            .filter(|cell| !cell.is_complete())
            .map(|cell| {
                let mut note = format!(
                    "{} @ {}: {} of {} trials completed",
                    cell.technique, cell.ratio, cell.completed, cell.expected
                );
                if cell.failed > 0 {
                    note.push_str(&format!(", {} failed", cell.failed));
                }
                if cell.missing() > 0 {
                    note.push_str(&format!(", {} not run", cell.missing()));
                }
                note
            })
            .collect()
    }
}

/// One point of a ratio-vs-accuracy series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub ratio: f64,
    pub mean_accuracy: Option<f64>,
    pub completed: usize,
    pub expected: usize,
}

/// Ratio-vs-accuracy series keyed by technique id, for external charting.
pub fn series(aggregates: &[AggregateResult]) -> BTreeMap<String, Vec<SeriesPoint>> {
    let mut out: BTreeMap<String, Vec<SeriesPoint>> = BTreeMap::new();
    for cell in aggregates {
        out.entry(cell.technique.id().to_string())
            .or_default()
            .push(SeriesPoint {
                ratio: cell.ratio,
                mean_accuracy: cell.mean_accuracy,
                completed: cell.completed,
                expected: cell.expected,
            });
    }
    out
}

/// Mean class counts per split side for one `(technique, ratio)` cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSummary {
    pub technique: Technique,
    pub ratio: f64,
    pub trials: usize,
    pub train_stars: f64,
    pub train_galaxies: f64,
    pub test_stars: f64,
    pub test_galaxies: f64,
}

/// Class balance for every cell with at least one logged trial.
pub fn balance_summary(results: &[TrialResult], grid: &TrialGrid) -> Vec<BalanceSummary> {
    cells(results, grid)
        .into_iter()
        .filter(|(_, _, members)| !members.is_empty())
        .map(|(technique, ratio, members)| {
            let n = members.len() as f64;
            let mean = |f: fn(&TrialResult) -> usize| {
                members.iter().map(|r| f(r) as f64).sum::<f64>() / n
            };
            BalanceSummary {
                technique,
                ratio,
                trials: members.len(),
                train_stars: mean(|r| r.balance.train_stars),
                train_galaxies: mean(|r| r.balance.train_galaxies),
                test_stars: mean(|r| r.balance.test_stars),
                test_galaxies: mean(|r| r.balance.test_galaxies),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::TrialOutcome;
    use crate::split::ClassBalance;

    fn trial(technique: Technique, ratio: f64, repeat: usize, accuracy: Option<f64>) -> TrialResult {
        TrialResult {
            technique,
            ratio,
            repeat,
            seed: repeat as u64,
            fingerprint: "knn|nn=10|table=0000000000000001".to_string(),
            outcome: match accuracy {
                Some(accuracy) => TrialOutcome::Completed { accuracy },
                None => TrialOutcome::Failed {
                    error: "classifier error: boom".into(),
                },
            },
            balance: ClassBalance {
                train_stars: 4 + repeat,
                train_galaxies: 4,
                test_stars: 1,
                test_galaxies: 1,
            },
        }
    }

    #[test]
    fn test_complete_cell_mean() {
        let results = vec![
            trial(Technique::T2, 0.5, 0, Some(0.8)),
            trial(Technique::T2, 0.5, 1, Some(0.6)),
        ];
        let cells = aggregate(&results, &TrialGrid::new(&[Technique::T2], &[0.5], 2));
        assert_eq!(cells.len(), 1);
        assert!(cells[0].is_complete());
        assert!((cells[0].mean_accuracy.unwrap() - 0.7).abs() < 1e-12);
        assert_eq!(cells[0].cell_text(), "0.700");
    }

    #[test]
    fn test_failed_trial_marks_cell_partial() {
        let results = vec![
            trial(Technique::Raw, 0.3, 0, Some(1.0)),
            trial(Technique::Raw, 0.3, 1, None),
            trial(Technique::Raw, 0.3, 2, Some(0.5)),
        ];
        let cell = &aggregate(&results, &TrialGrid::observed(&results))[0];
        assert!(!cell.is_complete());
        assert_eq!(cell.completed, 2);
        assert_eq!(cell.failed, 1);
        // mean over completed trials, not diluted by the failure
        assert_eq!(cell.mean_accuracy, Some(0.75));
        assert_eq!(cell.cell_text(), "0.750*");
    }

    #[test]
    fn test_all_failed_is_na() {
        let results = vec![trial(Technique::T5, 0.1, 0, None)];
        let cell = &aggregate(&results, &TrialGrid::observed(&results))[0];
        assert_eq!(cell.mean_accuracy, None);
        assert_eq!(cell.cell_text(), "n/a");
    }

    #[test]
    fn test_rerun_success_supersedes_failure() {
        let results = vec![
            trial(Technique::T1, 0.2, 0, None),
            trial(Technique::T1, 0.2, 0, Some(0.9)),
            trial(Technique::T1, 0.2, 0, None),
        ];
        let cell = &aggregate(&results, &TrialGrid::observed(&results))[0];
        assert!(cell.is_complete());
        assert_eq!(cell.failed, 0);
        assert_eq!(cell.mean_accuracy, Some(0.9));
    }

    #[test]
    fn test_missing_trials_are_disclosed() {
        let results = vec![trial(Technique::T3, 0.4, 0, Some(1.0))];
        let cells = aggregate(&results, &TrialGrid::new(&[Technique::T3], &[0.4], 4));
        assert_eq!(cells[0].missing(), 3);
        let grid = AccuracyGrid::new(&cells);
        let notes = grid.notes();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("1 of 4"));
        assert!(notes[0].contains("3 not run"));
    }

    #[test]
    fn test_cells_that_never_ran_are_disclosed() {
        // raw ran everywhere, t2 only at 0.5
        let results = vec![
            trial(Technique::Raw, 0.1, 0, Some(1.0)),
            trial(Technique::Raw, 0.1, 1, Some(1.0)),
            trial(Technique::Raw, 0.5, 0, Some(0.5)),
            trial(Technique::Raw, 0.5, 1, Some(0.5)),
            trial(Technique::T2, 0.5, 0, Some(1.0)),
            trial(Technique::T2, 0.5, 1, Some(1.0)),
        ];
        let expected = TrialGrid::new(&[Technique::Raw, Technique::T2], &[0.1, 0.5], 2);
        let cells = aggregate(&results, &expected);
        assert_eq!(cells.len(), 4);

        let empty = cells
            .iter()
            .find(|c| c.technique == Technique::T2 && c.ratio == 0.1)
            .unwrap();
        assert_eq!((empty.completed, empty.failed, empty.expected), (0, 0, 2));
        assert_eq!(empty.cell_text(), "n/a");

        let notes = AccuracyGrid::new(&cells).notes();
        assert_eq!(notes, vec!["t2 @ 0.1: 0 of 2 trials completed, 2 not run".to_string()]);
    }

    #[test]
    fn test_technique_without_trials_still_has_a_row() {
        let results = vec![trial(Technique::Raw, 0.5, 0, Some(1.0))];
        let expected = TrialGrid::new(&[Technique::T4, Technique::Raw], &[0.5], 1);
        let grid = AccuracyGrid::new(&aggregate(&results, &expected));

        assert_eq!(grid.rows.len(), 2);
        assert_eq!(grid.rows[1].0, Technique::T4);
        let cell = grid.rows[1].1[0].as_ref().unwrap();
        assert_eq!(cell.completed, 0);
        assert_eq!(grid.notes().len(), 1);
        // no balance row for a cell with nothing logged
        assert_eq!(balance_summary(&results, &expected).len(), 1);
    }

    #[test]
    fn test_grid_covers_unexpected_results() {
        let results = vec![trial(Technique::T5, 0.3, 0, Some(1.0))];
        let mut grid = TrialGrid::new(&[Technique::Raw], &[0.5], 1);
        grid.cover(&results);
        assert_eq!(grid.techniques, vec![Technique::Raw, Technique::T5]);
        assert_eq!(grid.ratios, vec![0.3, 0.5]);
        assert_eq!(aggregate(&results, &grid).len(), 4);
    }

    #[test]
    fn test_grid_layout_and_series() {
        let results = vec![
            trial(Technique::T4, 0.5, 0, Some(0.5)),
            trial(Technique::Raw, 0.1, 0, Some(1.0)),
            trial(Technique::Raw, 0.5, 0, Some(0.0)),
        ];
        let cells = aggregate(&results, &TrialGrid::observed(&results));
        let grid = AccuracyGrid::new(&cells);
        assert_eq!(grid.ratios, vec![0.1, 0.5]);
        assert_eq!(grid.rows.len(), 2);
        assert_eq!(grid.rows[0].0, Technique::Raw);
        assert_eq!(grid.rows[1].0, Technique::T4);
        assert_eq!(grid.rows[1].1[0].as_ref().unwrap().completed, 0);

        let series = series(&cells);
        assert_eq!(series["raw"].len(), 2);
        assert_eq!(series["t4"][1].mean_accuracy, Some(0.5));
        let json = serde_json::to_string(&series).unwrap();
        assert!(json.contains("\"t4\""));
    }

    #[test]
    fn test_balance_summary_means() {
        let results = vec![
            trial(Technique::Raw, 0.5, 0, Some(1.0)),
            trial(Technique::Raw, 0.5, 1, None),
        ];
        let summary = balance_summary(&results, &TrialGrid::observed(&results));
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].trials, 2);
        assert_eq!(summary[0].train_stars, 4.5);
        assert_eq!(summary[0].test_galaxies, 1.0);
    }

    #[test]
    fn test_observed_grid() {
        let results = vec![
            trial(Technique::Raw, 0.5, 0, Some(1.0)),
            trial(Technique::Raw, 0.5, 6, Some(1.0)),
        ];
        assert_eq!(
            TrialGrid::observed(&results),
            TrialGrid::new(&[Technique::Raw], &[0.5], 7)
        );
        assert_eq!(TrialGrid::observed(&[]).repeats, 0);
    }
}
