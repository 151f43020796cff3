//! Cutout and flattened-sample types.
//!
//! A cutout is a fixed 20x20 grid of pixel intensities with a class label.
//! Every downstream stage works on the row-major flattening of that grid,
//! so the vector length is fixed at [`VECTOR_LEN`] everywhere.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Side length of a cutout grid in pixels
pub const GRID_SIDE: usize = 20;

/// Flattened vector length (GRID_SIDE x GRID_SIDE)
pub const VECTOR_LEN: usize = GRID_SIDE * GRID_SIDE;

/// Object class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Star,
    Galaxy,
}

impl Label {
    /// Integer code used in persisted tables (0 = star, 1 = galaxy)
    pub fn code(self) -> u8 {
        match self {
            Label::Star => 0,
            Label::Galaxy => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Label::Star => "star",
            Label::Galaxy => "galaxy",
        }
    }

    /// Parse a manifest label token.
    ///
    /// Both `gal` and `galaxy` denote the galaxy class; numeric codes are
    /// accepted too. Matching is case-insensitive.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "star" | "0" => Some(Label::Star),
            "galaxy" | "gal" | "1" => Some(Label::Galaxy),
            _ => None,
        }
    }
}

impl TryFrom<i64> for Label {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Label::Star),
            1 => Ok(Label::Galaxy),
            other => Err(Error::Config(format!(
                "label {other} is outside {{0, 1}}"
            ))),
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One labeled cutout grid, as handed over by the cutout source
#[derive(Debug, Clone, PartialEq)]
pub struct Cutout {
    /// Stable identity (manifest path) used in error messages
    pub id: String,
    pub label: Label,
    /// Row-major pixel rows
    pub grid: Vec<Vec<f64>>,
}

impl Cutout {
    /// Flatten the grid row-major, validating shape and finiteness.
    pub fn flatten(&self) -> Result<FlattenedSample> {
        if self.grid.len() != GRID_SIDE {
            return Err(Error::input(
                &self.id,
                format!("expected {GRID_SIDE} rows, found {}", self.grid.len()),
            ));
        }
        let mut values = Vec::with_capacity(VECTOR_LEN);
        for (row_idx, row) in self.grid.iter().enumerate() {
            if row.len() != GRID_SIDE {
                return Err(Error::input(
                    &self.id,
                    format!(
                        "row {row_idx} has {} columns, expected {GRID_SIDE}",
                        row.len()
                    ),
                ));
            }
            values.extend_from_slice(row);
        }
        FlattenedSample::new(&self.id, self.label, values)
    }
}

/// `(label, 400 intensities)` in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedSample {
    pub label: Label,
    pub values: Vec<f64>,
}

impl FlattenedSample {
    /// Build a sample, rejecting wrong lengths and non-finite values.
    ///
    /// `id` is only used to name the sample in the error.
    pub fn new(id: &str, label: Label, values: Vec<f64>) -> Result<Self> {
        if values.len() != VECTOR_LEN {
            return Err(Error::input(
                id,
                format!("expected {VECTOR_LEN} values, found {}", values.len()),
            ));
        }
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            return Err(Error::input(
                id,
                format!("pixel {pos} is not finite ({})", values[pos]),
            ));
        }
        Ok(Self { label, values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(value: f64) -> Vec<Vec<f64>> {
        vec![vec![value; GRID_SIDE]; GRID_SIDE]
    }

    #[test]
    fn test_label_tokens() {
        assert_eq!(Label::from_token("star"), Some(Label::Star));
        assert_eq!(Label::from_token("Galaxy"), Some(Label::Galaxy));
        assert_eq!(Label::from_token("gal"), Some(Label::Galaxy));
        assert_eq!(Label::from_token(" 1 "), Some(Label::Galaxy));
        assert_eq!(Label::from_token("qso"), None);
    }

    #[test]
    fn test_label_codes() {
        assert_eq!(Label::try_from(0).unwrap(), Label::Star);
        assert_eq!(Label::try_from(1).unwrap(), Label::Galaxy);
        assert!(matches!(Label::try_from(2), Err(Error::Config(_))));
        assert_eq!(Label::Galaxy.code(), 1);
    }

    #[test]
    fn test_flatten_is_row_major() {
        let mut g = grid(0.0);
        g[0][1] = 7.0;
        g[1][0] = 9.0;
        let cutout = Cutout {
            id: "a".into(),
            label: Label::Star,
            grid: g,
        };
        let flat = cutout.flatten().unwrap();
        assert_eq!(flat.values.len(), VECTOR_LEN);
        assert_eq!(flat.values[1], 7.0);
        assert_eq!(flat.values[GRID_SIDE], 9.0);
    }

    #[test]
    fn test_flatten_rejects_wrong_shape() {
        let mut g = grid(1.0);
        g[3].pop();
        let cutout = Cutout {
            id: "short_row".into(),
            label: Label::Galaxy,
            grid: g,
        };
        let err = cutout.flatten().unwrap_err();
        assert!(matches!(err, Error::InputFormat { ref sample, .. } if sample == "short_row"));
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut values = vec![1.0; VECTOR_LEN];
        values[10] = f64::NAN;
        assert!(FlattenedSample::new("nan", Label::Star, values).is_err());
    }
}
