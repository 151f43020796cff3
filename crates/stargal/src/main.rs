//! stargal - normalize star/galaxy cutouts and measure split-ratio robustness
//!
//! Usage:
//!   stargal normalize --manifest labels.csv --out tables
//!   stargal evaluate --tables tables --seed 7 --jobs 4
//!   stargal report --tables tables --json series.json
//!   stargal inspect --tables tables --technique t3 --rows 5

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use stargal_core::{
    classifier::{Classifier, CommandClassifier, KnnClassifier},
    config::{self, parse_techniques, ExperimentConfig},
    corpus::{load_corpus, CorpusSource},
    eval::{run_sweep, SeedPlan, SweepConfig, TechniqueData, TrialResult},
    normalize::Technique,
    report::{aggregate, balance_summary, series, AccuracyGrid, TrialGrid},
    stats::CorpusStatistics,
    table::{self, prepare_tables, read_run_manifest, summarize_rows, TechniqueStatus},
    trial_log::{grid_path, read_sweep_grid, read_trial_log, TRIAL_LOG_FILE},
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "stargal")]
#[command(about = "Normalize star/galaxy cutouts and measure split-ratio robustness")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Experiment config file (default: ./stargal.toml, then the user config dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the corpus, normalize it with every technique and write the tables
    Normalize {
        /// Label manifest (CSV with a path,label header)
        #[arg(long, value_name = "PATH", conflicts_with = "dir")]
        manifest: Option<PathBuf>,

        /// Cutout directory labeled by star*/gal* file name prefixes
        #[arg(long, value_name = "PATH")]
        dir: Option<PathBuf>,

        /// Output directory for the technique tables
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,

        /// Seed for the one-time corpus shuffle
        #[arg(long)]
        seed: Option<u64>,

        /// Restrict to these techniques (raw, t1..t5)
        #[arg(long = "technique", value_name = "ID")]
        techniques: Vec<String>,

        /// Worker threads (0 = all cores)
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// Run the repeated-trial sweep over the written tables and report
    Evaluate {
        /// Directory holding the technique tables
        #[arg(long, value_name = "DIR")]
        tables: Option<PathBuf>,

        /// Restrict to these techniques (raw, t1..t5)
        #[arg(long = "technique", value_name = "ID")]
        techniques: Vec<String>,

        /// Test fractions, comma separated
        #[arg(long, value_delimiter = ',', value_name = "LIST")]
        ratios: Vec<f64>,

        /// Trials per ratio
        #[arg(long)]
        repeats: Option<usize>,

        /// Neighbor count passed to the classifier
        #[arg(long = "nn")]
        nn_count: Option<usize>,

        /// Worker threads (0 = all cores)
        #[arg(long)]
        jobs: Option<usize>,

        /// Reproducible mode: derive every trial seed from this base seed
        #[arg(long, conflicts_with_all = ["seeds", "exploratory"])]
        seed: Option<u64>,

        /// Reproducible mode: one seed per trial, ratio-major
        #[arg(long, value_delimiter = ',', value_name = "LIST", conflicts_with = "exploratory")]
        seeds: Vec<u64>,

        /// Exploratory mode: fresh random seed per trial
        #[arg(long)]
        exploratory: bool,

        /// External classifier, run as `sh -c CMD` with a JSON request on stdin
        #[arg(long = "classifier-cmd", value_name = "CMD")]
        classifier_cmd: Option<String>,

        /// Rerun every trial even when a matching one is logged
        #[arg(long)]
        fresh: bool,

        /// Also write the ratio-vs-accuracy series as JSON
        #[arg(long, value_name = "PATH")]
        json: Option<PathBuf>,
    },
    /// Aggregate an existing trial log without running trials
    Report {
        /// Directory holding the trial log
        #[arg(long, value_name = "DIR")]
        tables: Option<PathBuf>,

        /// Expected trials per ratio (default: the recorded sweep grid)
        #[arg(long)]
        repeats: Option<usize>,

        /// Also write the ratio-vs-accuracy series as JSON
        #[arg(long, value_name = "PATH")]
        json: Option<PathBuf>,
    },
    /// Show label and min/max/mean of the first rows of a technique table
    Inspect {
        /// Directory holding the technique tables
        #[arg(long, value_name = "DIR")]
        tables: Option<PathBuf>,

        /// Technique id (raw, t1..t5)
        #[arg(long)]
        technique: String,

        /// Number of rows to show
        #[arg(long, default_value = "5")]
        rows: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let config = load_experiment_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Normalize {
            manifest,
            dir,
            out,
            seed,
            techniques,
            jobs,
        } => {
            let source = match (manifest, dir) {
                (Some(path), _) => CorpusSource::Manifest(path),
                (None, Some(path)) => CorpusSource::Directory(path),
                (None, None) => config.corpus_source()?.context(
                    "No corpus given: pass --manifest or --dir, or set [corpus] in stargal.toml",
                )?,
            };
            let techniques = if techniques.is_empty() {
                Technique::ALL.to_vec()
            } else {
                parse_techniques(&techniques)?
            };
            if let Some(jobs) = jobs {
                init_thread_pool(jobs)?;
            }
            cmd_normalize(
                &source,
                &out.unwrap_or_else(|| config.output_dir()),
                seed.unwrap_or_else(|| config.shuffle_seed()),
                &techniques,
            )
        }
        Commands::Evaluate {
            tables,
            techniques,
            ratios,
            repeats,
            nn_count,
            jobs,
            seed,
            seeds,
            exploratory,
            classifier_cmd,
            fresh,
            json,
        } => {
            let mut sweep = config.sweep_config()?;
            if !ratios.is_empty() {
                sweep.ratios = ratios;
            }
            if let Some(repeats) = repeats {
                sweep.repeats = repeats;
            }
            if let Some(nn_count) = nn_count {
                sweep.nn_count = nn_count;
            }
            if let Some(jobs) = jobs {
                sweep.jobs = jobs;
            }
            if let Some(seed) = seed {
                sweep.seeds = SeedPlan::Base(seed);
            } else if !seeds.is_empty() {
                sweep.seeds = SeedPlan::Explicit(seeds);
            } else if exploratory {
                sweep.seeds = SeedPlan::Entropy;
            }
            sweep.verbose = cli.verbose > 0;

            let techniques = if techniques.is_empty() {
                config.techniques()?
            } else {
                parse_techniques(&techniques)?
            };
            let classifier: Box<dyn Classifier> = match classifier_cmd
                .or_else(|| config.classifier_command())
            {
                Some(command) => Box::new(CommandClassifier::new(command)),
                None => Box::new(KnnClassifier::new()),
            };

            cmd_evaluate(
                &tables.unwrap_or_else(|| config.output_dir()),
                &techniques,
                &sweep,
                classifier.as_ref(),
                fresh,
                json.as_deref(),
            )
        }
        Commands::Report {
            tables,
            repeats,
            json,
        } => cmd_report(
            &tables.unwrap_or_else(|| config.output_dir()),
            repeats,
            json.as_deref(),
        ),
        Commands::Inspect {
            tables,
            technique,
            rows,
            json,
        } => {
            let technique: Technique = technique.parse()?;
            cmd_inspect(
                &tables.unwrap_or_else(|| config.output_dir()),
                technique,
                rows,
                json,
            )
        }
    }
}

fn load_experiment_config(explicit: Option<&Path>) -> Result<ExperimentConfig> {
    if let Some(path) = explicit {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
    }
    match config::locate_config(explicit) {
        Some(path) => {
            tracing::debug!("Using config {}", path.display());
            config::load_config(&path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))
        }
        None => Ok(ExperimentConfig::default()),
    }
}

fn init_thread_pool(jobs: usize) -> Result<()> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build_global()
        .context("Failed to configure worker threads")
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let sp = ProgressBar::new_spinner();
    sp.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]")
            .context("Invalid progress template")?,
    );
    sp.set_message(message.to_string());
    sp.enable_steady_tick(Duration::from_millis(100));
    Ok(sp)
}

fn cmd_normalize(
    source: &CorpusSource,
    out_dir: &Path,
    shuffle_seed: u64,
    techniques: &[Technique],
) -> Result<()> {
    let entries = source.entries().context("Failed to read corpus source")?;

    let sp = spinner(&format!("Loading {} cutouts", entries.len()))?;
    let corpus = load_corpus(&entries, shuffle_seed);
    sp.finish_and_clear();
    let corpus = corpus.context("Failed to load corpus")?;

    let stats = CorpusStatistics::compute(corpus.samples())
        .context("Failed to compute corpus statistics")?;
    let (stars, galaxies) = corpus.label_counts();

    println!("{}", "Corpus".cyan().bold());
    println!(
        "  Cutouts:      {} ({} stars, {} galaxies)",
        corpus.len().to_string().cyan(),
        stars,
        galaxies
    );
    println!("  Shuffle seed: {}", shuffle_seed);
    println!(
        "  Pixel range:  {} .. {}",
        stats.min_pixel_all(),
        stats.max_pixel_all()
    );
    if stats.is_degenerate() {
        println!(
            "  {} every pixel has the same value; global min-max is undefined",
            "Warning:".yellow().bold()
        );
    }

    let sp = spinner(&format!("Writing {} technique tables", techniques.len()))?;
    let manifest = prepare_tables(&corpus, &stats, techniques, out_dir);
    sp.finish_and_clear();
    let manifest = manifest
        .with_context(|| format!("Failed to write tables to {}", out_dir.display()))?;

    println!();
    println!("{}", "Techniques".cyan().bold());
    for record in &manifest.techniques {
        match &record.status {
            TechniqueStatus::Written { file, rows } => println!(
                "  {:<4} {}  {} ({} rows)",
                record.technique.id(),
                "written".green(),
                out_dir.join(file).display(),
                rows
            ),
            TechniqueStatus::Failed { error } => println!(
                "  {:<4} {}   {}",
                record.technique.id(),
                "failed".red(),
                error
            ),
        }
    }

    if manifest.written().is_empty() {
        anyhow::bail!("Every technique failed; no tables written");
    }
    Ok(())
}

/// Techniques whose tables exist, warning about requested ones that do not.
fn available_techniques(tables_dir: &Path, requested: &[Technique]) -> Result<Vec<Technique>> {
    let written: Vec<Technique> = match read_run_manifest(tables_dir) {
        Ok(manifest) => {
            for (technique, error) in manifest.failed() {
                if requested.contains(&technique) {
                    println!(
                        "{} skipping {}: normalization failed ({})",
                        "Warning:".yellow().bold(),
                        technique,
                        error
                    );
                }
            }
            manifest.written()
        }
        Err(_) => Technique::ALL
            .into_iter()
            .filter(|t| table::table_path(tables_dir, *t).exists())
            .collect(),
    };

    let available: Vec<Technique> = requested
        .iter()
        .copied()
        .filter(|t| written.contains(t))
        .collect();
    if available.is_empty() {
        anyhow::bail!(
            "No technique tables found in {} (run `stargal normalize` first)",
            tables_dir.display()
        );
    }
    Ok(available)
}

fn cmd_evaluate(
    tables_dir: &Path,
    techniques: &[Technique],
    sweep: &SweepConfig,
    classifier: &dyn Classifier,
    fresh: bool,
    json: Option<&Path>,
) -> Result<()> {
    let techniques = available_techniques(tables_dir, techniques)?;

    let mut data = Vec::with_capacity(techniques.len());
    for technique in &techniques {
        let rows = table::load_table(tables_dir, *technique)
            .with_context(|| format!("Failed to read {} table", technique))?;
        data.push(TechniqueData::new(*technique, rows));
    }

    let log_path = tables_dir.join(TRIAL_LOG_FILE);
    if fresh {
        for path in [log_path.clone(), grid_path(&log_path)] {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
    }

    let mode = if sweep.seeds.is_reproducible() {
        "reproducible"
    } else {
        "exploratory"
    };
    println!(
        "Evaluating {} techniques x {} ratios x {} repeats with {} ({} seeds)...",
        data.len(),
        sweep.ratios.len(),
        sweep.repeats,
        classifier.name().cyan(),
        mode
    );

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .context("Invalid progress template")?
        .progress_chars("#>-"),
    );
    let results = run_sweep(&data, sweep, classifier, &log_path, Some(&pb));
    pb.finish_and_clear();
    let results = results.context("Evaluation sweep failed")?;

    println!();
    let grid = TrialGrid::new(&techniques, &sweep.ratios, sweep.repeats);
    print_report(&results, &grid, json)?;
    println!();
    println!("Trial log: {}", log_path.display().to_string().dimmed());
    Ok(())
}

fn cmd_report(tables_dir: &Path, repeats: Option<usize>, json: Option<&Path>) -> Result<()> {
    let log_path = tables_dir.join(TRIAL_LOG_FILE);
    if !log_path.exists() {
        anyhow::bail!(
            "No trial log at {} (run `stargal evaluate` first)",
            log_path.display()
        );
    }
    let results = read_trial_log(&log_path)
        .with_context(|| format!("Failed to read {}", log_path.display()))?;
    let recorded = read_sweep_grid(&log_path)
        .with_context(|| format!("Failed to read {}", grid_path(&log_path).display()))?;
    let mut grid = match recorded {
        Some(mut grid) => {
            grid.cover(&results);
            grid
        }
        None => {
            if results.is_empty() {
                anyhow::bail!("Trial log {} holds no trials", log_path.display());
            }
            tracing::warn!(
                "No sweep grid beside {}; cells that never ran cannot be listed",
                log_path.display()
            );
            TrialGrid::observed(&results)
        }
    };
    if let Some(repeats) = repeats {
        grid.repeats = repeats;
    }
    print_report(&results, &grid, json)
}

fn print_report(results: &[TrialResult], grid: &TrialGrid, json: Option<&Path>) -> Result<()> {
    let cells = aggregate(results, grid);
    let table = AccuracyGrid::new(&cells);

    println!("{}", "Mean accuracy by test ratio".cyan().bold());
    let mut header = format!("  {:<9}", "technique");
    for ratio in &table.ratios {
        header.push_str(&format!("{:>9}", ratio));
    }
    println!("{}", header.bold());
    for (technique, row) in &table.rows {
        let mut line = format!("  {:<9}", technique.id()).cyan().to_string();
        for cell in row {
            let text = match cell {
                None => format!("{:>9}", "-").dimmed(),
                Some(cell) if cell.mean_accuracy.is_none() => format!("{:>9}", cell.cell_text()).red(),
                Some(cell) if !cell.is_complete() => {
                    format!("{:>9}", cell.cell_text()).yellow()
                }
                Some(cell) => format!("{:>9}", cell.cell_text()).normal(),
            };
            line.push_str(&text.to_string());
        }
        println!("{}", line);
    }

    let notes = table.notes();
    if !notes.is_empty() {
        println!();
        println!("{}", "* incomplete cells (mean over completed trials only):".yellow());
        for note in notes {
            println!("  {}", note);
        }
    }

    println!();
    println!("{}", "Class balance (mean per trial)".cyan().bold());
    println!(
        "  {}",
        format!(
            "{:<9}{:>7}{:>12}{:>12}{:>12}{:>12}",
            "technique", "ratio", "train star", "train gal", "test star", "test gal"
        )
        .bold()
    );
    for b in balance_summary(results, grid) {
        println!(
            "  {:<9}{:>7}{:>12.1}{:>12.1}{:>12.1}{:>12.1}",
            b.technique.id(),
            b.ratio,
            b.train_stars,
            b.train_galaxies,
            b.test_stars,
            b.test_galaxies
        );
    }

    if let Some(path) = json {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &series(&cells))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!();
        println!("Series written to {}", path.display().to_string().dimmed());
    }
    Ok(())
}

fn cmd_inspect(tables_dir: &Path, technique: Technique, rows: usize, json: bool) -> Result<()> {
    let path = table::table_path(tables_dir, technique);
    let table = table::read_table(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let summary = summarize_rows(&table, rows);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "{} ({}, {} rows)",
        technique.id().cyan().bold(),
        technique.description(),
        table.len()
    );
    println!(
        "  {}",
        format!("{:>5}  {:<7}{:>14}{:>14}{:>14}", "row", "label", "min", "max", "mean").bold()
    );
    for s in summary {
        println!(
            "  {:>5}  {:<7}{:>14.6}{:>14.6}{:>14.6}",
            s.row,
            s.label.name(),
            s.min,
            s.max,
            s.mean
        );
    }
    Ok(())
}
