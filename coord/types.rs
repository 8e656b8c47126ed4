//! # Observation Matrices and Facets
//!
//! Every component of the engine consumes the same input: an R×C numeric matrix whose
//! rows and columns each carry a unique string key. Absent or invalid cells hold the
//! [`MISSING`] sentinel. This module owns that contract and nothing else; parsing,
//! standardization and cleansing happen upstream.
//!
//! - Keys are validated once, at construction. Every derived matrix (submatrices,
//!   transposes, appended matrices) goes back through the same validation.
//! - The missing mask is always derived from the values and never stored separately,
//!   so the two can not drift apart.

use ahash::AHashMap;
use ndarray::{Array2, ArrayView1, Axis, concatenate};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sentinel for absent observations and for coordinates that could not be estimated.
pub const MISSING: f64 = f64::NAN;

/// Returns true when a cell or coordinate holds the missing sentinel (any non-finite value).
#[inline]
pub fn is_missing(value: f64) -> bool {
    !value.is_finite()
}

/// One of the two axes of the observation matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Facet {
    Rows,
    Columns,
}

impl Facet {
    pub const BOTH: [Facet; 2] = [Facet::Rows, Facet::Columns];

    pub fn opposite(self) -> Self {
        match self {
            Self::Rows => Self::Columns,
            Self::Columns => Self::Rows,
        }
    }

    /// The ndarray axis that enumerates the entities of this facet.
    pub fn axis(self) -> Axis {
        match self {
            Self::Rows => Axis(0),
            Self::Columns => Axis(1),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Rows => "row",
            Self::Columns => "column",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Malformed-input errors. These are always fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatrixError {
    #[error(
        "Matrix has shape {rows}x{cols} but {row_keys} row keys and {col_keys} column keys were supplied."
    )]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        row_keys: usize,
        col_keys: usize,
    },
    #[error("The {facet} key '{key}' appears more than once. Keys must be unique within a facet.")]
    DuplicateKey { facet: Facet, key: String },
    #[error("An observation matrix needs at least one row and one column.")]
    Empty,
    #[error("The {facet} key '{key}' does not exist in this matrix.")]
    UnknownKey { facet: Facet, key: String },
    #[error("Index {index} is out of range for the {facet} facet of length {len}.")]
    IndexOutOfRange { facet: Facet, index: usize, len: usize },
    #[error("Matrices can not be joined: {0}")]
    Incompatible(String),
}

/// A validated, immutable R×C observation matrix with keyed facets.
#[derive(Debug, Clone)]
pub struct ObservationMatrix {
    values: Array2<f64>,
    row_keys: Vec<String>,
    col_keys: Vec<String>,
    row_lookup: AHashMap<String, usize>,
    col_lookup: AHashMap<String, usize>,
}

impl ObservationMatrix {
    /// Builds a matrix whose missing cells are already non-finite (NaN or infinite).
    pub fn new(
        values: Array2<f64>,
        row_keys: Vec<String>,
        col_keys: Vec<String>,
    ) -> Result<Self, MatrixError> {
        let (rows, cols) = values.dim();
        if rows == 0 || cols == 0 {
            return Err(MatrixError::Empty);
        }
        if row_keys.len() != rows || col_keys.len() != cols {
            return Err(MatrixError::ShapeMismatch {
                rows,
                cols,
                row_keys: row_keys.len(),
                col_keys: col_keys.len(),
            });
        }

        let row_lookup = build_lookup(&row_keys, Facet::Rows)?;
        let col_lookup = build_lookup(&col_keys, Facet::Columns)?;

        let mut values = values;
        values.mapv_inplace(|v| if is_missing(v) { MISSING } else { v });

        Ok(Self {
            values,
            row_keys,
            col_keys,
            row_lookup,
            col_lookup,
        })
    }

    /// Builds a matrix where cells equal to `marker` (e.g. `-999.0`) denote missing data.
    pub fn with_marker(
        values: Array2<f64>,
        row_keys: Vec<String>,
        col_keys: Vec<String>,
        marker: f64,
    ) -> Result<Self, MatrixError> {
        let converted = values.mapv(|v| if v == marker { MISSING } else { v });
        Self::new(converted, row_keys, col_keys)
    }

    /// Builds a matrix with generated keys `R0..` and `C0..`. Mostly useful for tests.
    pub fn from_values(values: Array2<f64>) -> Result<Self, MatrixError> {
        let (rows, cols) = values.dim();
        let row_keys = (0..rows).map(|i| format!("R{i}")).collect();
        let col_keys = (0..cols).map(|j| format!("C{j}")).collect();
        Self::new(values, row_keys, col_keys)
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_cols(&self) -> usize {
        self.values.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn len(&self, facet: Facet) -> usize {
        self.values.len_of(facet.axis())
    }

    pub fn row_keys(&self) -> &[String] {
        &self.row_keys
    }

    pub fn col_keys(&self) -> &[String] {
        &self.col_keys
    }

    pub fn keys(&self, facet: Facet) -> &[String] {
        match facet {
            Facet::Rows => &self.row_keys,
            Facet::Columns => &self.col_keys,
        }
    }

    pub fn index_of(&self, facet: Facet, key: &str) -> Option<usize> {
        match facet {
            Facet::Rows => self.row_lookup.get(key).copied(),
            Facet::Columns => self.col_lookup.get(key).copied(),
        }
    }

    /// Like [`index_of`](Self::index_of) but unknown keys are an error.
    pub fn require_index(&self, facet: Facet, key: &str) -> Result<usize, MatrixError> {
        self.index_of(facet, key)
            .ok_or_else(|| MatrixError::UnknownKey {
                facet,
                key: key.to_string(),
            })
    }

    /// One entity's observations: a row for `Facet::Rows`, a column for `Facet::Columns`.
    pub fn entity(&self, facet: Facet, index: usize) -> ArrayView1<'_, f64> {
        self.values.index_axis(facet.axis(), index)
    }

    pub fn is_observed(&self, row: usize, col: usize) -> bool {
        !is_missing(self.values[[row, col]])
    }

    /// True where the sentinel appears.
    pub fn missing_mask(&self) -> Array2<bool> {
        self.values.mapv(is_missing)
    }

    pub fn observed_count(&self) -> usize {
        self.values.iter().filter(|v| !is_missing(**v)).count()
    }

    /// Observation counts per entity of `facet`.
    pub fn observed_counts(&self, facet: Facet) -> Vec<usize> {
        self.values
            .axis_iter(facet.axis())
            .map(|lane| lane.iter().filter(|v| !is_missing(**v)).count())
            .collect()
    }

    /// A new matrix holding only the listed entities of `facet`, in the given order.
    pub fn select(&self, facet: Facet, indices: &[usize]) -> Result<Self, MatrixError> {
        let len = self.len(facet);
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(MatrixError::IndexOutOfRange { facet, index, len });
        }
        let values = self.values.select(facet.axis(), indices);
        let picked: Vec<String> = indices
            .iter()
            .map(|&i| self.keys(facet)[i].clone())
            .collect();
        match facet {
            Facet::Rows => Self::new(values, picked, self.col_keys.clone()),
            Facet::Columns => Self::new(values, self.row_keys.clone(), picked),
        }
    }

    /// Same selection as [`select`](Self::select), addressed by key.
    pub fn select_keys(&self, facet: Facet, keys: &[String]) -> Result<Self, MatrixError> {
        let indices = keys
            .iter()
            .map(|key| self.require_index(facet, key))
            .collect::<Result<Vec<_>, _>>()?;
        self.select(facet, &indices)
    }

    pub fn transpose(&self) -> Self {
        Self {
            values: self.values.t().to_owned(),
            row_keys: self.col_keys.clone(),
            col_keys: self.row_keys.clone(),
            row_lookup: self.col_lookup.clone(),
            col_lookup: self.row_lookup.clone(),
        }
    }

    /// Replaces cell values, keeping keys. Non-finite cells become missing.
    pub fn with_values(&self, values: Array2<f64>) -> Result<Self, MatrixError> {
        if values.dim() != self.values.dim() {
            let (rows, cols) = values.dim();
            return Err(MatrixError::ShapeMismatch {
                rows,
                cols,
                row_keys: self.row_keys.len(),
                col_keys: self.col_keys.len(),
            });
        }
        Self::new(values, self.row_keys.clone(), self.col_keys.clone())
    }

    /// Joins `other` to the right of this matrix. Both must list the same row keys in the
    /// same order; the combined column keys must stay unique.
    pub fn append_columns(&self, other: &ObservationMatrix) -> Result<Self, MatrixError> {
        if self.row_keys != other.row_keys {
            return Err(MatrixError::Incompatible(
                "row keys differ between the two matrices".to_string(),
            ));
        }
        let values = concatenate(Axis(1), &[self.values.view(), other.values.view()])
            .map_err(|err| MatrixError::Incompatible(err.to_string()))?;
        let mut col_keys = self.col_keys.clone();
        col_keys.extend(other.col_keys.iter().cloned());
        Self::new(values, self.row_keys.clone(), col_keys)
    }
}

fn build_lookup(keys: &[String], facet: Facet) -> Result<AHashMap<String, usize>, MatrixError> {
    let mut lookup = AHashMap::with_capacity(keys.len());
    for (idx, key) in keys.iter().enumerate() {
        if lookup.insert(key.clone(), idx).is_some() {
            return Err(MatrixError::DuplicateKey {
                facet,
                key: key.clone(),
            });
        }
    }
    Ok(lookup)
}
