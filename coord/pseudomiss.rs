//! # Pseudo-Missingness
//!
//! A pseudo-missing mask withholds a reproducible subset of observed cells so that the
//! solver's estimates for those cells can be compared with the values it never saw. The
//! mask is always disjoint from the true missing mask, which it never alters: a mask is
//! stored alongside the matrix and only combined with it when a solve asks which cells
//! are usable.

use crate::types::{Facet, MISSING, MatrixError, ObservationMatrix, is_missing};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PseudoMissError {
    #[error("The pseudo-missing fraction must lie in [0, 1); got {0}.")]
    InvalidFraction(f64),

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error("The mask has shape {found:?} but the matrix has shape {expected:?}.")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Expanded column {expanded} refers to original column {column}, but only {n_cols} columns exist.")]
    ExpansionOutOfRange {
        expanded: usize,
        column: usize,
        n_cols: usize,
    },
}

/// Which cells are eligible for random withholding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MaskScope {
    #[default]
    All,
    /// Only cells in the named rows.
    Rows(Vec<String>),
    /// Only cells in the named columns.
    Columns(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudoMissConfig {
    /// Share of eligible observed cells to withhold.
    pub fraction: f64,
    pub seed: u64,
    pub scope: MaskScope,
}

impl Default for PseudoMissConfig {
    fn default() -> Self {
        Self {
            fraction: 0.1,
            seed: 1,
            scope: MaskScope::All,
        }
    }
}

/// The three ways of choosing withheld cells.
#[derive(Debug, Clone, PartialEq)]
pub enum PseudoMissSpec {
    Random(PseudoMissConfig),
    /// Explicit `(row key, column key)` pairs.
    Cells(Vec<(String, String)>),
    /// Every cell in the cross product of the named rows and columns.
    Range { rows: Vec<String>, cols: Vec<String> },
}

/// Maps each column of an expanded matrix back to the original column it was derived
/// from, e.g. when one categorical column is split into several indicator columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnExpansion {
    sources: Vec<usize>,
}

impl ColumnExpansion {
    pub fn new(sources: Vec<usize>) -> Self {
        Self { sources }
    }

    /// Builds the mapping from the original key of every expanded column.
    pub fn from_source_keys(
        original: &ObservationMatrix,
        source_keys: &[String],
    ) -> Result<Self, PseudoMissError> {
        let sources = source_keys
            .iter()
            .map(|key| original.require_index(Facet::Columns, key))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sources })
    }

    pub fn expanded_len(&self) -> usize {
        self.sources.len()
    }

    pub fn source_of(&self, expanded: usize) -> Option<usize> {
        self.sources.get(expanded).copied()
    }
}

/// Cells withheld from a solve. `true` marks a withheld cell.
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoMissMask {
    withheld: Array2<bool>,
    seed: Option<u64>,
}

impl PseudoMissMask {
    /// A mask that withholds nothing.
    pub fn empty(shape: (usize, usize)) -> Self {
        Self {
            withheld: Array2::from_elem(shape, false),
            seed: None,
        }
    }

    pub fn build(matrix: &ObservationMatrix, spec: &PseudoMissSpec) -> Result<Self, PseudoMissError> {
        match spec {
            PseudoMissSpec::Random(config) => Self::random(matrix, config),
            PseudoMissSpec::Cells(cells) => Self::from_cells(matrix, cells),
            PseudoMissSpec::Range { rows, cols } => Self::from_range(matrix, rows, cols),
        }
    }

    /// Withholds `round(fraction * eligible)` observed cells drawn without replacement.
    ///
    /// Eligible cells are enumerated in row-major order before sampling, so the same seed
    /// and matrix always give the same mask.
    pub fn random(
        matrix: &ObservationMatrix,
        config: &PseudoMissConfig,
    ) -> Result<Self, PseudoMissError> {
        if !(0.0..1.0).contains(&config.fraction) {
            return Err(PseudoMissError::InvalidFraction(config.fraction));
        }

        let (rows_in_scope, cols_in_scope) = scope_filter(matrix, &config.scope)?;
        let candidates: Vec<(usize, usize)> = matrix
            .values()
            .indexed_iter()
            .filter(|((r, c), v)| !is_missing(**v) && rows_in_scope[*r] && cols_in_scope[*c])
            .map(|(cell, _)| cell)
            .collect();

        let amount = (config.fraction * candidates.len() as f64).round() as usize;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut withheld = Array2::from_elem(matrix.shape(), false);
        for pick in index::sample(&mut rng, candidates.len(), amount).into_iter() {
            withheld[candidates[pick]] = true;
        }

        log::debug!(
            "Withheld {amount} of {} eligible cells (seed {})",
            candidates.len(),
            config.seed
        );
        Ok(Self {
            withheld,
            seed: Some(config.seed),
        })
    }

    /// Withholds the listed cells. Cells that are already missing are skipped.
    pub fn from_cells(
        matrix: &ObservationMatrix,
        cells: &[(String, String)],
    ) -> Result<Self, PseudoMissError> {
        let mut withheld = Array2::from_elem(matrix.shape(), false);
        for (row_key, col_key) in cells {
            let r = matrix.require_index(Facet::Rows, row_key)?;
            let c = matrix.require_index(Facet::Columns, col_key)?;
            if matrix.is_observed(r, c) {
                withheld[[r, c]] = true;
            }
        }
        Ok(Self {
            withheld,
            seed: None,
        })
    }

    /// Withholds every observed cell at the intersection of the named rows and columns.
    pub fn from_range(
        matrix: &ObservationMatrix,
        rows: &[String],
        cols: &[String],
    ) -> Result<Self, PseudoMissError> {
        let row_idx = resolve(matrix, Facet::Rows, rows)?;
        let col_idx = resolve(matrix, Facet::Columns, cols)?;
        let mut withheld = Array2::from_elem(matrix.shape(), false);
        for &r in &row_idx {
            for &c in &col_idx {
                if matrix.is_observed(r, c) {
                    withheld[[r, c]] = true;
                }
            }
        }
        Ok(Self {
            withheld,
            seed: None,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.withheld.dim()
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn as_array(&self) -> &Array2<bool> {
        &self.withheld
    }

    pub fn count(&self) -> usize {
        self.withheld.iter().filter(|&&w| w).count()
    }

    pub fn is_withheld(&self, row: usize, col: usize) -> bool {
        self.withheld.get((row, col)).copied().unwrap_or(false)
    }

    /// Withheld `(row, column)` indices in row-major order.
    pub fn cells(&self) -> Vec<(usize, usize)> {
        self.withheld
            .indexed_iter()
            .filter(|(_, w)| **w)
            .map(|(cell, _)| cell)
            .collect()
    }

    /// A copy of `matrix` with every withheld cell replaced by the missing sentinel.
    pub fn apply(&self, matrix: &ObservationMatrix) -> Result<ObservationMatrix, PseudoMissError> {
        self.check_shape(matrix)?;
        let mut values = matrix.values().clone();
        values.zip_mut_with(&self.withheld, |v, &w| {
            if w {
                *v = MISSING;
            }
        });
        Ok(matrix.with_values(values)?)
    }

    /// Carries the mask over to the column-expanded matrix `expanded`: an expanded cell is
    /// withheld when its source cell was and the cell is observed in `expanded`.
    pub fn expand_columns(
        &self,
        expansion: &ColumnExpansion,
        expanded: &ObservationMatrix,
    ) -> Result<Self, PseudoMissError> {
        let (n_rows, n_cols) = self.shape();
        if let Some((expanded, &column)) = expansion
            .sources
            .iter()
            .enumerate()
            .find(|(_, c)| **c >= n_cols)
        {
            return Err(PseudoMissError::ExpansionOutOfRange {
                expanded,
                column,
                n_cols,
            });
        }
        let shape = (n_rows, expansion.expanded_len());
        if expanded.shape() != shape {
            return Err(PseudoMissError::ShapeMismatch {
                expected: expanded.shape(),
                found: shape,
            });
        }
        let values = expanded.values();
        let mut dropped = 0usize;
        let withheld = Array2::from_shape_fn(shape, |(r, j)| {
            let source = self.withheld[[r, expansion.sources[j]]];
            if source && is_missing(values[[r, j]]) {
                dropped += 1;
                return false;
            }
            source
        });
        if dropped > 0 {
            log::debug!("{dropped} withheld cells are missing in the expanded matrix and were released");
        }
        Ok(Self {
            withheld,
            seed: self.seed,
        })
    }

    pub fn check_shape(&self, matrix: &ObservationMatrix) -> Result<(), PseudoMissError> {
        if self.shape() != matrix.shape() {
            return Err(PseudoMissError::ShapeMismatch {
                expected: matrix.shape(),
                found: self.shape(),
            });
        }
        Ok(())
    }
}

/// Cells a solve may use: observed and not withheld.
pub fn usable_mask(matrix: &ObservationMatrix, withheld: Option<&PseudoMissMask>) -> Array2<bool> {
    let mut usable = matrix.values().mapv(|v| !is_missing(v));
    if let Some(mask) = withheld {
        usable.zip_mut_with(mask.as_array(), |u, &w| *u = *u && !w);
    }
    usable
}

fn resolve(
    matrix: &ObservationMatrix,
    facet: Facet,
    keys: &[String],
) -> Result<Vec<usize>, PseudoMissError> {
    keys.iter()
        .map(|key| matrix.require_index(facet, key).map_err(PseudoMissError::from))
        .collect()
}

fn scope_filter(
    matrix: &ObservationMatrix,
    scope: &MaskScope,
) -> Result<(Vec<bool>, Vec<bool>), PseudoMissError> {
    let mut rows = vec![true; matrix.n_rows()];
    let mut cols = vec![true; matrix.n_cols()];
    match scope {
        MaskScope::All => {}
        MaskScope::Rows(keys) => {
            rows.fill(false);
            for idx in resolve(matrix, Facet::Rows, keys)? {
                rows[idx] = true;
            }
        }
        MaskScope::Columns(keys) => {
            cols.fill(false);
            for idx in resolve(matrix, Facet::Columns, keys)? {
                cols[idx] = true;
            }
        }
    }
    Ok((rows, cols))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn matrix_with_gaps() -> ObservationMatrix {
        let values = Array2::from_shape_fn((12, 10), |(r, c)| {
            if (r + 2 * c) % 7 == 0 {
                f64::NAN
            } else {
                (r * 10 + c) as f64
            }
        });
        ObservationMatrix::from_values(values).unwrap()
    }

    #[test]
    fn same_seed_same_cells_and_new_seed_new_cells() {
        let matrix = matrix_with_gaps();
        let config = PseudoMissConfig::default();
        let a = PseudoMissMask::random(&matrix, &config).unwrap();
        let b = PseudoMissMask::random(&matrix, &config).unwrap();
        assert_eq!(a, b);

        let c = PseudoMissMask::random(
            &matrix,
            &PseudoMissConfig {
                seed: 2,
                ..config.clone()
            },
        )
        .unwrap();
        assert_ne!(a.cells(), c.cells());

        let expected = (0.1 * matrix.observed_count() as f64).round() as usize;
        assert_eq!(a.count(), expected);
    }

    #[test]
    fn withheld_cells_never_overlap_missing_cells() {
        let matrix = matrix_with_gaps();
        let mask = PseudoMissMask::random(
            &matrix,
            &PseudoMissConfig {
                fraction: 0.6,
                seed: 9,
                scope: MaskScope::All,
            },
        )
        .unwrap();
        let missing = matrix.missing_mask();
        for (r, c) in mask.cells() {
            assert!(!missing[[r, c]]);
        }

        let applied = mask.apply(&matrix).unwrap();
        assert_eq!(
            applied.observed_count(),
            matrix.observed_count() - mask.count()
        );
        // The original matrix is untouched.
        assert_eq!(matrix.missing_mask(), missing);
    }

    #[test]
    fn scope_restricts_the_draw() {
        let matrix = matrix_with_gaps();
        let mask = PseudoMissMask::random(
            &matrix,
            &PseudoMissConfig {
                fraction: 0.5,
                seed: 4,
                scope: MaskScope::Columns(vec!["C3".into(), "C8".into()]),
            },
        )
        .unwrap();
        assert!(mask.count() > 0);
        assert!(mask.cells().iter().all(|&(_, c)| c == 3 || c == 8));
    }

    #[test]
    fn explicit_cells_and_ranges_skip_missing_cells() {
        let values = array![[1.0, f64::NAN], [3.0, 4.0]];
        let matrix = ObservationMatrix::from_values(values).unwrap();

        let cells = PseudoMissMask::from_cells(
            &matrix,
            &[("R0".into(), "C1".into()), ("R1".into(), "C0".into())],
        )
        .unwrap();
        assert_eq!(cells.cells(), vec![(1, 0)]);

        let range = PseudoMissMask::build(
            &matrix,
            &PseudoMissSpec::Range {
                rows: vec!["R0".into(), "R1".into()],
                cols: vec!["C1".into()],
            },
        )
        .unwrap();
        assert_eq!(range.cells(), vec![(1, 1)]);

        let err = PseudoMissMask::from_cells(&matrix, &[("R9".into(), "C0".into())]).unwrap_err();
        assert!(matches!(
            err,
            PseudoMissError::Matrix(MatrixError::UnknownKey { .. })
        ));
    }

    #[test]
    fn fraction_outside_unit_interval_is_rejected() {
        let matrix = matrix_with_gaps();
        let err = PseudoMissMask::random(
            &matrix,
            &PseudoMissConfig {
                fraction: 1.0,
                ..PseudoMissConfig::default()
            },
        )
        .unwrap_err();
        assert_eq!(err, PseudoMissError::InvalidFraction(1.0));
    }

    #[test]
    fn expansion_follows_source_columns() {
        let values = array![[1.0, 2.0], [3.0, 4.0]];
        let matrix = ObservationMatrix::from_values(values).unwrap();
        let mask = PseudoMissMask::from_cells(&matrix, &[("R1".into(), "C0".into())]).unwrap();

        let expansion =
            ColumnExpansion::from_source_keys(&matrix, &["C0".into(), "C0".into(), "C1".into()])
                .unwrap();
        let wide = ObservationMatrix::from_values(array![[1.0, 1.5, 2.0], [3.0, 3.5, 4.0]]).unwrap();
        let expanded = mask.expand_columns(&expansion, &wide).unwrap();
        assert_eq!(expanded.shape(), (2, 3));
        assert_eq!(expanded.cells(), vec![(1, 0), (1, 1)]);

        let bad = ColumnExpansion::new(vec![0, 5]);
        assert!(matches!(
            mask.expand_columns(&bad, &wide),
            Err(PseudoMissError::ExpansionOutOfRange { column: 5, .. })
        ));
        assert!(matches!(
            mask.expand_columns(&expansion, &matrix),
            Err(PseudoMissError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn expansion_releases_cells_missing_in_the_expanded_matrix() {
        let values = array![[1.0, 2.0], [3.0, 4.0]];
        let matrix = ObservationMatrix::from_values(values).unwrap();
        let mask = PseudoMissMask::from_cells(&matrix, &[("R1".into(), "C0".into())]).unwrap();

        let expansion = ColumnExpansion::new(vec![0, 0, 1]);
        let wide =
            ObservationMatrix::from_values(array![[1.0, 1.5, 2.0], [3.0, f64::NAN, 4.0]]).unwrap();
        let expanded = mask.expand_columns(&expansion, &wide).unwrap();
        assert_eq!(expanded.cells(), vec![(1, 0)]);

        let usable = usable_mask(&wide, Some(&expanded));
        assert_eq!(usable, array![[true, true, true], [false, false, true]]);
    }

    #[test]
    fn usable_mask_excludes_missing_and_withheld() {
        let values = array![[1.0, f64::NAN], [3.0, 4.0]];
        let matrix = ObservationMatrix::from_values(values).unwrap();
        let mask = PseudoMissMask::from_cells(&matrix, &[("R1".into(), "C1".into())]).unwrap();
        let usable = usable_mask(&matrix, Some(&mask));
        assert_eq!(usable, array![[true, false], [true, false]]);
    }
}
