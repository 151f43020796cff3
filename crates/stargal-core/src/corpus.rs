//! Corpus loading
//!
//! Reads labeled cutouts from an explicit manifest (or a directory scan with
//! filename-prefix labels), validates every sample, and fixes one
//! deterministic row order with a single seeded shuffle.
//!
//! Loading is fail-fast: the first malformed entry aborts the whole load with
//! [`Error::InputFormat`] naming that entry. Nothing is skipped silently.

use rayon::prelude::*;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::sample::{Cutout, FlattenedSample, Label, GRID_SIDE};
use crate::shuffle::shuffle_in_place;

/// Default seed for the one-time corpus shuffle
pub const DEFAULT_SHUFFLE_SEED: u64 = 42;

/// Raster extensions decoded with the `image` crate
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

/// Numeric text grid extensions
const GRID_EXTENSIONS: &[&str] = &["csv", "txt", "dat"];

/// One `(path, label)` pair from the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub label: Label,
}

impl ManifestEntry {
    pub fn id(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    path: String,
    label: String,
}

/// Where cutouts come from
#[derive(Debug, Clone)]
pub enum CorpusSource {
    /// CSV manifest with a `path,label` header
    Manifest(PathBuf),
    /// Directory scan; labels come from `star*` / `gal*` filename prefixes
    Directory(PathBuf),
}

impl CorpusSource {
    pub fn entries(&self) -> Result<Vec<ManifestEntry>> {
        match self {
            CorpusSource::Manifest(path) => read_manifest(path),
            CorpusSource::Directory(dir) => scan_directory(dir),
        }
    }
}

/// Read a `path,label` manifest. Relative paths resolve against the manifest's directory.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let file = fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut entries = Vec::new();
    for (idx, row) in reader.deserialize::<ManifestRow>().enumerate() {
        // header is line 1
        let line = idx + 2;
        let where_ = format!("{}:{line}", path.display());
        let row = row.map_err(|e| Error::input(&where_, e.to_string()))?;
        let label = Label::from_token(&row.label).ok_or_else(|| {
            Error::input(&where_, format!("unknown label '{}'", row.label))
        })?;
        let entry_path = PathBuf::from(&row.path);
        let entry_path = if entry_path.is_absolute() {
            entry_path
        } else {
            base.join(entry_path)
        };
        entries.push(ManifestEntry {
            path: entry_path,
            label,
        });
    }
    debug!("Manifest {} lists {} cutouts", path.display(), entries.len());
    Ok(entries)
}

/// Label a file by its stem prefix: `star*` or `gal*` (which covers `galaxy*`).
pub fn label_from_file_name(path: &Path) -> Option<Label> {
    let stem = path.file_stem()?.to_str()?.to_ascii_lowercase();
    if stem.starts_with("star") {
        Some(Label::Star)
    } else if stem.starts_with("gal") {
        Some(Label::Galaxy)
    } else {
        None
    }
}

fn is_cutout_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str()) || GRID_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Scan a directory (non-recursive) for cutout files, sorted by path.
pub fn scan_directory(dir: &Path) -> Result<Vec<ManifestEntry>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_file() && is_cutout_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let label = label_from_file_name(&path).ok_or_else(|| {
                Error::input(
                    path.display().to_string(),
                    "file name starts with neither 'star' nor 'gal'",
                )
            })?;
            Ok(ManifestEntry { path, label })
        })
        .collect()
}

/// Read one cutout file into a grid.
pub fn read_cutout(entry: &ManifestEntry) -> Result<Cutout> {
    let id = entry.id();
    let ext = entry
        .path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let grid = if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        read_image_grid(&entry.path, &id)?
    } else if GRID_EXTENSIONS.contains(&ext.as_str()) {
        let text = fs::read_to_string(&entry.path).map_err(|e| Error::input(&id, e.to_string()))?;
        parse_text_grid(&text, &id)?
    } else {
        return Err(Error::input(&id, format!("unsupported extension '{ext}'")));
    };

    Ok(Cutout {
        id,
        label: entry.label,
        grid,
    })
}

fn read_image_grid(path: &Path, id: &str) -> Result<Vec<Vec<f64>>> {
    use image::ColorType;

    let img = image::open(path).map_err(|e| Error::input(id, e.to_string()))?;
    if img.width() as usize != GRID_SIDE || img.height() as usize != GRID_SIDE {
        return Err(Error::input(
            id,
            format!(
                "image is {}x{}, expected {GRID_SIDE}x{GRID_SIDE}",
                img.width(),
                img.height()
            ),
        ));
    }

    let flat: Vec<f64> = match img.color() {
        ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => img
            .to_luma16()
            .pixels()
            .map(|p| f64::from(p.0[0]))
            .collect(),
        ColorType::Rgb32F | ColorType::Rgba32F => img
            .to_luma32f()
            .pixels()
            .map(|p| f64::from(p.0[0]))
            .collect(),
        _ => img
            .to_luma8()
            .pixels()
            .map(|p| f64::from(p.0[0]))
            .collect(),
    };

    Ok(flat.chunks(GRID_SIDE).map(<[f64]>::to_vec).collect())
}

/// Parse a numeric grid: one row per non-empty line, values separated by commas or whitespace.
pub fn parse_text_grid(text: &str, id: &str) -> Result<Vec<Vec<f64>>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .map(|(row, line)| {
            line.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|field| !field.is_empty())
                .map(|field| {
                    field.parse::<f64>().map_err(|_| {
                        Error::input(id, format!("row {row}: '{field}' is not a number"))
                    })
                })
                .collect()
        })
        .collect()
}

/// Materialized corpus in its fixed (shuffled) row order
#[derive(Debug, Clone)]
pub struct Corpus {
    ids: Vec<String>,
    samples: Vec<FlattenedSample>,
    shuffle_seed: u64,
}

impl Corpus {
    /// Validate cutouts and apply the one-time seeded shuffle.
    pub fn from_cutouts(cutouts: Vec<Cutout>, shuffle_seed: u64) -> Result<Self> {
        if cutouts.is_empty() {
            return Err(Error::input("corpus", "no cutouts found"));
        }

        let mut rows = Vec::with_capacity(cutouts.len());
        for cutout in cutouts {
            let sample = cutout.flatten()?;
            rows.push((cutout.id, sample));
        }
        shuffle_in_place(&mut rows, shuffle_seed);
        let (ids, samples) = rows.into_iter().unzip();

        Ok(Self {
            ids,
            samples,
            shuffle_seed,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[FlattenedSample] {
        &self.samples
    }

    /// Sample identities, aligned with [`Corpus::samples`]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn shuffle_seed(&self) -> u64 {
        self.shuffle_seed
    }

    /// `(stars, galaxies)`
    pub fn label_counts(&self) -> (usize, usize) {
        let galaxies = self
            .samples
            .iter()
            .filter(|s| s.label == Label::Galaxy)
            .count();
        (self.samples.len() - galaxies, galaxies)
    }
}

/// Read every entry (in parallel) and build the shuffled corpus.
pub fn load_corpus(entries: &[ManifestEntry], shuffle_seed: u64) -> Result<Corpus> {
    let cutouts: Vec<Cutout> = entries
        .par_iter()
        .map(read_cutout)
        .collect::<Result<Vec<_>>>()?;

    let corpus = Corpus::from_cutouts(cutouts, shuffle_seed)?;
    let (stars, galaxies) = corpus.label_counts();
    info!(
        "Loaded {} cutouts ({} stars, {} galaxies), shuffle seed {}",
        corpus.len(),
        stars,
        galaxies,
        shuffle_seed
    );
    Ok(corpus)
}
