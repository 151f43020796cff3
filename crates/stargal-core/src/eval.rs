//! Repeated-trial evaluation harness
//!
//! For each technique table and each `(ratio, repeat)` grid point: split the
//! rows with the trial's seed, encode labels, call the classifier, arg-max its
//! probabilities and score accuracy on the test rows.
//!
//! Trials share nothing mutable except the read-only tables, so they run on a
//! rayon pool. Finished trials stream over a channel to a single consumer that
//! appends each one to the trial log before counting it, which means a sweep
//! interrupted at any point keeps every trial it completed.
//!
//! A classifier failure aborts only its own trial; the failure is recorded in
//! the result and surfaces in the aggregate report.
//!
//! Every result carries a fingerprint of the classifier, the neighbor count
//! and the table contents it was scored on. A reproducible rerun reuses a
//! logged trial only when its seed and fingerprint both match; exploratory
//! sweeps always start a fresh log.

use crossbeam_channel::unbounded;
use indicatif::ProgressBar;
use ndarray::{Array2, Axis};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::classifier::{argmax, validate_probabilities, Classifier};
use crate::error::{Error, Result};
use crate::normalize::Technique;
use crate::sample::{FlattenedSample, VECTOR_LEN};
use crate::split::{encode_labels, split_indices, test_size, validate_ratio, ClassBalance};
use crate::report::TrialGrid;
use crate::trial_log::{read_trial_log, write_sweep_grid, TrialLog};

/// Default split ratios (test fraction)
pub const DEFAULT_RATIOS: [f64; 9] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];

/// Default number of repeats per ratio
pub const DEFAULT_REPEATS: usize = 10;

/// Default neighbor count handed to the classifier
pub const DEFAULT_NN_COUNT: usize = 10;

/// How per-trial seeds are chosen
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SeedPlan {
    /// Exploratory: a fresh OS-entropy seed per trial
    #[default]
    Entropy,
    /// Reproducible: a ChaCha8 stream from this seed yields one seed per trial
    Base(u64),
    /// Reproducible: one listed seed per trial, grid order (ratio-major)
    Explicit(Vec<u64>),
}

impl SeedPlan {
    pub fn is_reproducible(&self) -> bool {
        !matches!(self, SeedPlan::Entropy)
    }

    /// Seeds for `trials` grid points, in grid order.
    pub fn resolve(&self, trials: usize) -> Result<Vec<u64>> {
        match self {
            SeedPlan::Entropy => {
                let mut rng = rand::rng();
                Ok((0..trials).map(|_| rng.random::<u64>()).collect())
            }
            SeedPlan::Base(base) => {
                let mut rng = ChaCha8Rng::seed_from_u64(*base);
                Ok((0..trials).map(|_| rng.next_u64()).collect())
            }
            SeedPlan::Explicit(seeds) => {
                if seeds.len() != trials {
                    return Err(Error::Config(format!(
                        "seed list has {} entries but the grid has {trials} trials",
                        seeds.len()
                    )));
                }
                Ok(seeds.clone())
            }
        }
    }
}

/// Sweep grid and execution settings
#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    pub ratios: Vec<f64>,
    pub repeats: usize,
    pub nn_count: usize,
    /// Worker threads; 1 runs trials one after another, 0 uses all cores
    pub jobs: usize,
    pub seeds: SeedPlan,
    pub verbose: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            ratios: DEFAULT_RATIOS.to_vec(),
            repeats: DEFAULT_REPEATS,
            nn_count: DEFAULT_NN_COUNT,
            jobs: 1,
            seeds: SeedPlan::default(),
            verbose: false,
        }
    }
}

impl SweepConfig {
    pub fn trial_count(&self) -> usize {
        self.ratios.len() * self.repeats
    }

    /// Validate the grid against a table of `n_rows` rows.
    pub fn validate(&self, n_rows: usize) -> Result<()> {
        if self.ratios.is_empty() {
            return Err(Error::Config("no split ratios given".to_string()));
        }
        if self.repeats == 0 {
            return Err(Error::Config("repeat count must be at least 1".to_string()));
        }
        if self.nn_count == 0 {
            return Err(Error::Config("nn_count must be at least 1".to_string()));
        }
        for &ratio in &self.ratios {
            validate_ratio(ratio)?;
            let test = test_size(n_rows, ratio);
            if test == 0 || test >= n_rows {
                return Err(Error::Config(format!(
                    "ratio {ratio} on {n_rows} rows leaves {test} test and {} train rows; both must be non-empty",
                    n_rows.saturating_sub(test)
                )));
            }
        }
        Ok(())
    }
}

/// Identity of a grid point: technique, ratio bits, repeat, seed
type TrialKey = (Technique, u64, usize, u64);

/// One grid point for one technique
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialSpec {
    pub technique: Technique,
    pub ratio: f64,
    pub repeat: usize,
    pub seed: u64,
}

impl TrialSpec {
    fn key(&self) -> TrialKey {
        (self.technique, self.ratio.to_bits(), self.repeat, self.seed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialOutcome {
    Completed { accuracy: f64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub technique: Technique,
    pub ratio: f64,
    pub repeat: usize,
    pub seed: u64,
    /// Classifier, neighbor count and table contents the trial was scored on
    pub fingerprint: String,
    pub outcome: TrialOutcome,
    pub balance: ClassBalance,
}

impl TrialResult {
    pub fn accuracy(&self) -> Option<f64> {
        match self.outcome {
            TrialOutcome::Completed { accuracy } => Some(accuracy),
            TrialOutcome::Failed { .. } => None,
        }
    }

    fn key(&self) -> TrialKey {
        (self.technique, self.ratio.to_bits(), self.repeat, self.seed)
    }
}

/// A technique's rows plus their feature matrix, built once per sweep
pub struct TechniqueData {
    pub technique: Technique,
    pub rows: Vec<FlattenedSample>,
    features: Array2<f64>,
    content_hash: u64,
}

impl TechniqueData {
    pub fn new(technique: Technique, rows: Vec<FlattenedSample>) -> Self {
        let mut features = Array2::zeros((rows.len(), VECTOR_LEN));
        let mut hasher = Xxh3::new();
        for (mut target, row) in features.rows_mut().into_iter().zip(&rows) {
            hasher.update(&[row.label.code()]);
            for (dst, &src) in target.iter_mut().zip(&row.values) {
                *dst = src;
                hasher.update(&src.to_le_bytes());
            }
        }
        Self {
            technique,
            rows,
            features,
            content_hash: hasher.digest(),
        }
    }

    /// Fingerprint of a trial scored on this table by `classifier`
    pub fn trial_fingerprint(&self, classifier: &dyn Classifier, nn_count: usize) -> String {
        format!(
            "{}|nn={}|table={:016x}",
            classifier.name(),
            nn_count,
            self.content_hash
        )
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Run one trial. Never fails: errors are recorded in the outcome.
pub fn run_trial(
    data: &TechniqueData,
    spec: &TrialSpec,
    nn_count: usize,
    classifier: &dyn Classifier,
    verbose: bool,
) -> TrialResult {
    let mut balance = ClassBalance::default();
    let outcome = match score_trial(data, spec, nn_count, classifier, verbose, &mut balance) {
        Ok(accuracy) => TrialOutcome::Completed { accuracy },
        Err(err) => {
            warn!(
                "Trial {} ratio={} repeat={} seed={} failed: {}",
                spec.technique, spec.ratio, spec.repeat, spec.seed, err
            );
            TrialOutcome::Failed {
                error: err.to_string(),
            }
        }
    };
    TrialResult {
        technique: spec.technique,
        ratio: spec.ratio,
        repeat: spec.repeat,
        seed: spec.seed,
        fingerprint: data.trial_fingerprint(classifier, nn_count),
        outcome,
        balance,
    }
}

fn score_trial(
    data: &TechniqueData,
    spec: &TrialSpec,
    nn_count: usize,
    classifier: &dyn Classifier,
    verbose: bool,
    balance: &mut ClassBalance,
) -> Result<f64> {
    let split = split_indices(data.len(), spec.ratio, spec.seed)?;
    *balance = ClassBalance::of(&data.rows, &split);
    if split.test.is_empty() || split.train.is_empty() {
        return Err(Error::Config(format!(
            "ratio {} leaves an empty side on {} rows",
            spec.ratio,
            data.len()
        )));
    }

    let train_x = data.features.select(Axis(0), &split.train);
    let test_x = data.features.select(Axis(0), &split.test);
    let train_y = encode_labels(&data.rows, &split.train);

    let probs = classifier.classify(
        train_x.view(),
        train_y.view(),
        test_x.view(),
        nn_count,
        verbose,
    )?;
    validate_probabilities(&probs, split.test.len())?;

    let matches = probs
        .rows()
        .into_iter()
        .zip(&split.test)
        .filter(|(row, &idx)| argmax(*row) == data.rows[idx].label.code() as usize)
        .count();
    let accuracy = matches as f64 / split.test.len() as f64;

    if verbose {
        debug!(
            "Trial {} ratio={} repeat={} seed={}: {}/{} correct",
            spec.technique,
            spec.ratio,
            spec.repeat,
            spec.seed,
            matches,
            split.test.len()
        );
    }
    Ok(accuracy)
}

/// Grid points in ratio-major order, paired with their seeds.
///
/// The same seed list is used for every technique, so at a given grid point
/// all techniques are scored on the same train/test rows.
pub fn plan_trials(techniques: &[Technique], config: &SweepConfig) -> Result<Vec<TrialSpec>> {
    let seeds = config.seeds.resolve(config.trial_count())?;
    let mut specs = Vec::with_capacity(techniques.len() * seeds.len());
    for &technique in techniques {
        for (ratio_idx, &ratio) in config.ratios.iter().enumerate() {
            for repeat in 0..config.repeats {
                specs.push(TrialSpec {
                    technique,
                    ratio,
                    repeat,
                    seed: seeds[ratio_idx * config.repeats + repeat],
                });
            }
        }
    }
    Ok(specs)
}

/// Sweep every technique over the grid, logging each trial to `log_path`.
///
/// With a reproducible seed plan, successful trials already in the log whose
/// seed and fingerprint match this sweep are reused instead of rerun. The log
/// is then rewritten to hold only those reused trials before new ones are
/// appended. An exploratory sweep reuses nothing and starts a fresh log.
/// The expected grid is written beside the log before any trial runs.
///
/// Returns all results (reused and new) sorted by technique, ratio, repeat.
pub fn run_sweep(
    tables: &[TechniqueData],
    config: &SweepConfig,
    classifier: &dyn Classifier,
    log_path: &Path,
    progress: Option<&ProgressBar>,
) -> Result<Vec<TrialResult>> {
    for data in tables {
        config.validate(data.len())?;
    }
    let techniques: Vec<Technique> = tables.iter().map(|d| d.technique).collect();
    let specs = plan_trials(&techniques, config)?;

    let recorded = if log_path.exists() {
        if config.seeds.is_reproducible() {
            read_trial_log(log_path)?
        } else {
            info!(
                "Exploratory seeds; starting a new trial log at {}",
                log_path.display()
            );
            Vec::new()
        }
    } else {
        Vec::new()
    };
    let done: HashMap<TrialKey, &TrialResult> = recorded
        .iter()
        .filter(|r| r.accuracy().is_some())
        .map(|r| (r.key(), r))
        .collect();

    let mut results: Vec<TrialResult> = Vec::with_capacity(specs.len());
    let mut pending: Vec<(&TechniqueData, TrialSpec)> = Vec::new();
    for data in tables {
        let fingerprint = data.trial_fingerprint(classifier, config.nn_count);
        for spec in specs.iter().filter(|s| s.technique == data.technique) {
            match done.get(&spec.key()) {
                Some(previous) if previous.fingerprint == fingerprint => {
                    results.push((*previous).clone())
                }
                _ => pending.push((data, *spec)),
            }
        }
    }
    if !results.is_empty() {
        info!(
            "Reusing {} completed trials from {}",
            results.len(),
            log_path.display()
        );
    }
    let dropped = recorded.len().saturating_sub(results.len());
    if dropped > 0 {
        info!(
            "Discarding {} logged trials that failed or belong to another sweep",
            dropped
        );
    }
    let mut log = TrialLog::create(log_path, &results)?;
    write_sweep_grid(
        log_path,
        &TrialGrid::new(&techniques, &config.ratios, config.repeats),
    )?;

    if let Some(pb) = progress {
        pb.set_length((results.len() + pending.len()) as u64);
        pb.set_position(results.len() as u64);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.jobs)
        .build()
        .map_err(|e| Error::Config(format!("failed to build worker pool: {e}")))?;

    let (tx, rx) = unbounded::<TrialResult>();
    let nn_count = config.nn_count;
    let verbose = config.verbose;

    std::thread::scope(|scope| -> Result<()> {
        let pending = &pending;
        scope.spawn(move || {
            pool.install(|| {
                pending.par_iter().for_each_with(tx, |tx, (data, spec)| {
                    let result = run_trial(data, spec, nn_count, classifier, verbose);
                    // receiver only goes away when the log write failed
                    let _ = tx.send(result);
                });
            });
        });

        for result in rx {
            log.append(&result)?;
            if let Some(pb) = progress {
                pb.inc(1);
            }
            results.push(result);
        }
        Ok(())
    })?;

    results.sort_by(|a, b| {
        a.technique
            .cmp(&b.technique)
            .then(a.ratio.total_cmp(&b.ratio))
            .then(a.repeat.cmp(&b.repeat))
    });

    let failed = results.iter().filter(|r| r.accuracy().is_none()).count();
    info!(
        "Sweep finished: {} trials, {} failed",
        results.len(),
        failed
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::KnnClassifier;
    use crate::sample::Label;
    use ndarray::ArrayView2;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn rows(n: usize) -> Vec<FlattenedSample> {
        (0..n)
            .map(|i| {
                let label = if i % 2 == 0 { Label::Star } else { Label::Galaxy };
                let base = if label == Label::Star { 1.0 } else { 50.0 };
                FlattenedSample {
                    label,
                    values: (0..VECTOR_LEN)
                        .map(|p| base + ((i * 7 + p) % 5) as f64 * 0.1)
                        .collect(),
                }
            })
            .collect()
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn name(&self) -> &str {
            "failing"
        }

        fn classify(
            &self,
            _train_features: ArrayView2<'_, f64>,
            _train_labels: ArrayView2<'_, f64>,
            test_features: ArrayView2<'_, f64>,
            _nn_count: usize,
            _verbose: bool,
        ) -> Result<Array2<f64>> {
            if test_features.nrows() > 5 {
                Err(Error::ExternalClassifier("too many rows".into()))
            } else {
                Ok(Array2::from_elem((test_features.nrows(), 2), 0.5))
            }
        }
    }

    fn config(seeds: SeedPlan) -> SweepConfig {
        SweepConfig {
            ratios: vec![0.2, 0.5],
            repeats: 3,
            nn_count: 3,
            jobs: 2,
            seeds,
            verbose: false,
        }
    }

    #[test]
    fn test_seed_plans() {
        assert_eq!(
            SeedPlan::Base(9).resolve(5).unwrap(),
            SeedPlan::Base(9).resolve(5).unwrap()
        );
        assert_eq!(SeedPlan::Entropy.resolve(4).unwrap().len(), 4);
        assert_eq!(
            SeedPlan::Explicit(vec![1, 2, 3]).resolve(3).unwrap(),
            vec![1, 2, 3]
        );
        assert!(matches!(
            SeedPlan::Explicit(vec![1, 2]).resolve(3),
            Err(Error::Config(_))
        ));
        assert!(!SeedPlan::Entropy.is_reproducible());
    }

    #[test]
    fn test_validate_rejects_bad_grids() {
        let mut cfg = config(SeedPlan::Base(1));
        assert!(cfg.validate(20).is_ok());

        cfg.repeats = 0;
        assert!(matches!(cfg.validate(20), Err(Error::Config(_))));

        let mut cfg = config(SeedPlan::Base(1));
        cfg.ratios = vec![1.2];
        assert!(matches!(cfg.validate(20), Err(Error::Config(_))));

        let mut cfg = config(SeedPlan::Base(1));
        cfg.ratios = vec![0.01];
        assert!(matches!(cfg.validate(20), Err(Error::Config(_))));

        let mut cfg = config(SeedPlan::Base(1));
        cfg.nn_count = 0;
        assert!(matches!(cfg.validate(20), Err(Error::Config(_))));
    }

    #[test]
    fn test_trial_on_separable_data_is_accurate() {
        let data = TechniqueData::new(Technique::Raw, rows(20));
        let spec = TrialSpec {
            technique: Technique::Raw,
            ratio: 0.5,
            repeat: 0,
            seed: 42,
        };
        let result = run_trial(&data, &spec, 3, &KnnClassifier, false);
        assert_eq!(result.accuracy(), Some(1.0));
        let b = result.balance;
        assert_eq!(b.test_stars + b.test_galaxies, 10);
        assert_eq!(b.train_stars + b.train_galaxies, 10);
    }

    #[test]
    fn test_reproducible_sweep_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let tables = vec![TechniqueData::new(Technique::Raw, rows(20))];
        let cfg = config(SeedPlan::Base(7));

        let a = run_sweep(&tables, &cfg, &KnnClassifier, &dir.path().join("a.csv"), None).unwrap();
        let b = run_sweep(&tables, &cfg, &KnnClassifier, &dir.path().join("b.csv"), None).unwrap();

        assert_eq!(a.len(), 6);
        assert_eq!(a, b);
    }

    #[test]
    fn test_techniques_share_splits() {
        let dir = TempDir::new().unwrap();
        let tables = vec![
            TechniqueData::new(Technique::Raw, rows(20)),
            TechniqueData::new(Technique::T2, rows(20)),
        ];
        let results = run_sweep(
            &tables,
            &config(SeedPlan::Base(3)),
            &KnnClassifier,
            &dir.path().join("t.csv"),
            None,
        )
        .unwrap();
        let (raw, t2): (Vec<_>, Vec<_>) = results
            .iter()
            .partition(|r| r.technique == Technique::Raw);
        for (a, b) in raw.iter().zip(&t2) {
            assert_eq!(a.seed, b.seed);
            assert_eq!(a.balance, b.balance);
        }
    }

    #[test]
    fn test_classifier_failure_only_aborts_its_trial() {
        let dir = TempDir::new().unwrap();
        let tables = vec![TechniqueData::new(Technique::Raw, rows(20))];
        let results = run_sweep(
            &tables,
            &config(SeedPlan::Base(1)),
            &FailingClassifier,
            &dir.path().join("t.csv"),
            None,
        )
        .unwrap();

        // ratio 0.2 -> 4 test rows (ok), ratio 0.5 -> 10 test rows (fails)
        assert_eq!(results.len(), 6);
        for r in &results {
            if r.ratio == 0.2 {
                assert!(r.accuracy().is_some());
            } else {
                assert!(matches!(r.outcome, TrialOutcome::Failed { .. }));
            }
        }
    }

    /// Reference classifier that counts its calls
    #[derive(Default)]
    struct CountingClassifier {
        calls: AtomicUsize,
    }

    impl CountingClassifier {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Classifier for CountingClassifier {
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            KnnClassifier.classify(train_features, train_labels, test_features, nn_count, verbose)
        }
    }

    #[test]
    fn test_resume_reuses_only_matching_trials() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trials.csv");
        let tables = vec![TechniqueData::new(Technique::Raw, rows(20))];
        let cfg = config(SeedPlan::Base(11));
        let counter = CountingClassifier::default();

        let first = run_sweep(&tables, &cfg, &counter, &path, None).unwrap();
        assert_eq!(counter.calls(), 6);

        // identical rerun: every trial comes from the log
        let second = run_sweep(&tables, &cfg, &counter, &path, None).unwrap();
        assert_eq!(counter.calls(), 6);
        assert_eq!(first, second);

        // a different neighbor count invalidates every logged trial
        let mut wider = cfg.clone();
        wider.nn_count = 5;
        run_sweep(&tables, &wider, &counter, &path, None).unwrap();
        assert_eq!(counter.calls(), 12);

        // so does a change in the table contents
        let mut changed = rows(20);
        changed[0].values[0] += 1.0;
        let changed = vec![TechniqueData::new(Technique::Raw, changed)];
        run_sweep(&changed, &wider, &counter, &path, None).unwrap();
        assert_eq!(counter.calls(), 18);

        // and a different classifier
        let failing = run_sweep(&changed, &wider, &FailingClassifier, &path, None).unwrap();
        assert!(failing.iter().any(|r| r.accuracy().is_none()));
        assert!(failing.iter().all(|r| r.fingerprint.starts_with("failing|")));
    }

    #[test]
    fn test_new_base_seed_replaces_logged_trials() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trials.csv");
        let tables = vec![TechniqueData::new(Technique::Raw, rows(20))];

        run_sweep(&tables, &config(SeedPlan::Base(3)), &KnnClassifier, &path, None).unwrap();
        let results =
            run_sweep(&tables, &config(SeedPlan::Base(7)), &KnnClassifier, &path, None).unwrap();

        let expected: Vec<u64> = plan_trials(&[Technique::Raw], &config(SeedPlan::Base(7)))
            .unwrap()
            .iter()
            .map(|s| s.seed)
            .collect();
        let seeds: Vec<u64> = results.iter().map(|r| r.seed).collect();
        assert_eq!(seeds, expected);

        // logged in completion order; nothing from the Base(3) sweep survives
        let mut logged: Vec<u64> = read_trial_log(&path).unwrap().iter().map(|r| r.seed).collect();
        let mut expected = expected;
        logged.sort_unstable();
        expected.sort_unstable();
        assert_eq!(logged, expected);
    }

    #[test]
    fn test_exploratory_sweep_never_resumes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trials.csv");
        let tables = vec![TechniqueData::new(Technique::Raw, rows(20))];
        let counter = CountingClassifier::default();

        let first = run_sweep(&tables, &config(SeedPlan::Entropy), &counter, &path, None).unwrap();
        let second = run_sweep(&tables, &config(SeedPlan::Entropy), &counter, &path, None).unwrap();

        assert_eq!(counter.calls(), 12);
        let seeds = |results: &[TrialResult]| results.iter().map(|r| r.seed).collect::<Vec<_>>();
        assert_ne!(seeds(&first), seeds(&second));
        // the log holds the latest sweep only, in completion order
        let mut logged = seeds(&read_trial_log(&path).unwrap());
        let mut latest = seeds(&second);
        logged.sort_unstable();
        latest.sort_unstable();
        assert_eq!(logged, latest);
    }
}
