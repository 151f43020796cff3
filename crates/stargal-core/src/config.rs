//! Experiment configuration (`stargal.toml`).
//!
//! Every field is optional; accessors fall back to built-in defaults.
//! Command-line flags override whatever is loaded here.

use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::corpus::{CorpusSource, DEFAULT_SHUFFLE_SEED};
use crate::error::{Error, Result};
use crate::eval::{SeedPlan, SweepConfig, DEFAULT_NN_COUNT, DEFAULT_RATIOS, DEFAULT_REPEATS};
use crate::normalize::Technique;

/// Config file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "stargal.toml";

/// Default directory for technique tables, the run manifest and the trial log
pub const DEFAULT_OUTPUT_DIR: &str = "tables";

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub corpus: Option<CorpusConfig>,
    pub output: Option<OutputConfig>,
    pub evaluation: Option<EvaluationConfig>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct CorpusConfig {
    pub manifest: Option<PathBuf>,
    pub directory: Option<PathBuf>,
    pub shuffle_seed: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct OutputConfig {
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct EvaluationConfig {
    pub ratios: Option<Vec<f64>>,
    pub repeats: Option<usize>,
    pub nn_count: Option<usize>,
    pub jobs: Option<usize>,
    pub techniques: Option<Vec<String>>,
    pub base_seed: Option<u64>,
    pub seeds: Option<Vec<u64>>,
    pub classifier_command: Option<String>,
}

impl ExperimentConfig {
    /// Manifest or directory source. Setting both is an error.
    pub fn corpus_source(&self) -> Result<Option<CorpusSource>> {
        let corpus = match &self.corpus {
            Some(corpus) => corpus,
            None => return Ok(None),
        };
        match (&corpus.manifest, &corpus.directory) {
            (Some(_), Some(_)) => Err(Error::Config(
                "[corpus] sets both manifest and directory".to_string(),
            )),
            (Some(manifest), None) => Ok(Some(CorpusSource::Manifest(manifest.clone()))),
            (None, Some(dir)) => Ok(Some(CorpusSource::Directory(dir.clone()))),
            (None, None) => Ok(None),
        }
    }

    pub fn shuffle_seed(&self) -> u64 {
        self.corpus
            .as_ref()
            .and_then(|c| c.shuffle_seed)
            .unwrap_or(DEFAULT_SHUFFLE_SEED)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output
            .as_ref()
            .and_then(|o| o.dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
    }

    fn evaluation(&self) -> EvaluationConfig {
        self.evaluation.clone().unwrap_or_default()
    }

    pub fn ratios(&self) -> Vec<f64> {
        self.evaluation()
            .ratios
            .unwrap_or_else(|| DEFAULT_RATIOS.to_vec())
    }

    pub fn repeats(&self) -> usize {
        self.evaluation().repeats.unwrap_or(DEFAULT_REPEATS)
    }

    pub fn nn_count(&self) -> usize {
        self.evaluation().nn_count.unwrap_or(DEFAULT_NN_COUNT)
    }

    /// Worker threads; defaults to 1 (trials run one after another)
    pub fn jobs(&self) -> usize {
        self.evaluation().jobs.unwrap_or(1)
    }

    /// Techniques to evaluate; all six unless listed.
    pub fn techniques(&self) -> Result<Vec<Technique>> {
        match self.evaluation().techniques {
            None => Ok(Technique::ALL.to_vec()),
            Some(ids) => parse_techniques(&ids),
        }
    }

    /// Reproducible when `base_seed` or `seeds` is set, exploratory otherwise.
    pub fn seed_plan(&self) -> Result<SeedPlan> {
        let eval = self.evaluation();
        match (eval.base_seed, eval.seeds) {
            (Some(_), Some(_)) => Err(Error::Config(
                "[evaluation] sets both base_seed and seeds".to_string(),
            )),
            (Some(base), None) => Ok(SeedPlan::Base(base)),
            (None, Some(seeds)) => Ok(SeedPlan::Explicit(seeds)),
            (None, None) => Ok(SeedPlan::Entropy),
        }
    }

    pub fn classifier_command(&self) -> Option<String> {
        self.evaluation().classifier_command
    }

    /// Sweep settings from this file alone.
    pub fn sweep_config(&self) -> Result<SweepConfig> {
        Ok(SweepConfig {
            ratios: self.ratios(),
            repeats: self.repeats(),
            nn_count: self.nn_count(),
            jobs: self.jobs(),
            seeds: self.seed_plan()?,
            verbose: false,
        })
    }
}

/// Parse technique ids (`raw`, `t1`..`t5`), dropping duplicates, in canonical order.
pub fn parse_techniques<S: AsRef<str>>(ids: &[S]) -> Result<Vec<Technique>> {
    let mut techniques = ids
        .iter()
        .map(|id| id.as_ref().parse::<Technique>())
        .collect::<Result<Vec<_>>>()?;
    techniques.sort();
    techniques.dedup();
    Ok(techniques)
}

/// Per-user config file path
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "stargal").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// First existing config: `explicit`, then `./stargal.toml`, then the per-user file.
pub fn locate_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    default_config_path().filter(|p| p.exists())
}

pub fn load_config(path: &Path) -> Result<ExperimentConfig> {
    if !path.exists() {
        return Ok(ExperimentConfig::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let config: ExperimentConfig = toml::from_str(&contents)?;
    Ok(config)
}
