//! # Cell Variance and Standard Errors
//!
//! Turns the residuals of a fit into two per-cell uncertainty measures.
//!
//! **Expected absolute residual (EAR).** Absolute residuals are log-transformed and
//! smoothed by a second, two-dimensional ALS pass. A two-dimensional dot product can
//! represent `ln|r| ≈ a_row + b_col`, i.e. a multiplicative row-by-column spread model.
//! Because `E[ln|r|]` sits below `ln E|r|` by a constant for Gaussian residuals, the
//! constant is added back before fitting, so `exp(estimate)` is an EAR rather than a
//! geometric mean. Residuals of columns with known bounds can be inflated near the
//! bounds, where the modeled success probability makes the raw residual understate the
//! spread.
//!
//! **Standard error (SE).** `SE = k * EAR / f`, where `k` counts the facets whose entity
//! was freely estimated and `f` combines `sqrt(n / D - 1)` over those facets (`n` being
//! the entity's usable observations). The combination rule is pluggable. At `n <= D` the
//! term is zero and SE is infinite: an exactly determined entity carries no information
//! about its own error.

use crate::als::{AlsSolver, SolverConfig, SolverError, SolverResult};
use crate::progress::{SolverProgressObserver, SolverStage};
use crate::types::{Facet, MISSING, MatrixError, ObservationMatrix, is_missing};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// `ln E|r| - E[ln|r|]` for zero-mean Gaussian residuals: `ln sqrt(2/pi) + (gamma + ln 2) / 2`.
pub const LOG_ABS_BIAS: f64 = 0.409_4;

/// Dimensionality of the EAR and SE passes.
pub const ERROR_NDIM: usize = 2;

/// Smallest residual floor, used when every residual is zero.
const MIN_RESIDUAL_FLOOR: f64 = 1e-12;

/// Success probabilities are clamped to this distance from the bounds.
const PROBABILITY_CLAMP: f64 = 0.01;

#[derive(Error, Debug)]
pub enum VarianceError {
    #[error("The fit has shape {found:?} but the matrix has shape {expected:?}.")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Column '{key}' has invalid bounds [{min}, {max}]; max must exceed min.")]
    InvalidBounds { key: String, min: f64, max: f64 },

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Solver(#[from] SolverError),
}

/// Known scale bounds of a column, e.g. `0..1` for dichotomous items.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricBounds {
    pub min: f64,
    pub max: f64,
}

/// Combines the per-facet information terms of one cell into a single divisor.
pub trait SeRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// `terms` holds `sqrt(n / D - 1)` for each freely estimated facet and is never empty.
    fn combine(&self, terms: &[f64]) -> f64;
}

/// The less informed facet limits the cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeakestFacet;

impl SeRule for WeakestFacet {
    fn name(&self) -> &'static str {
        "weakest-facet"
    }

    fn combine(&self, terms: &[f64]) -> f64 {
        terms.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

/// Both facets contribute equally on a log scale.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometricMean;

impl SeRule for GeometricMean {
    fn name(&self) -> &'static str {
        "geometric-mean"
    }

    fn combine(&self, terms: &[f64]) -> f64 {
        terms.iter().product::<f64>().powf(1.0 / terms.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SeRuleKind {
    #[default]
    WeakestFacet,
    GeometricMean,
}

impl SeRuleKind {
    pub fn rule(self) -> &'static dyn SeRule {
        match self {
            Self::WeakestFacet => &WeakestFacet,
            Self::GeometricMean => &GeometricMean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceConfig {
    pub se_rule: SeRuleKind,
    /// Upper limit of the bounded-data inflation factor.
    pub inflation_cap: f64,
    /// Absolute residuals are floored at this fraction of their mean before taking logs.
    pub residual_floor_fraction: f64,
    /// Also fit two-dimensional SE coordinates for banking.
    pub fit_se_coords: bool,
    /// Per-column bounds keyed by column key. Columns without bounds are not inflated.
    pub bounds: BTreeMap<String, MetricBounds>,
}

impl Default for VarianceConfig {
    fn default() -> Self {
        Self {
            se_rule: SeRuleKind::WeakestFacet,
            inflation_cap: 4.0,
            residual_floor_fraction: 0.01,
            fit_se_coords: true,
            bounds: BTreeMap::new(),
        }
    }
}

/// Per-cell EAR and SE, plus the error coordinates that reproduce them.
#[derive(Debug, Clone)]
pub struct ErrorEstimates {
    pub row_keys: Vec<String>,
    pub col_keys: Vec<String>,
    pub ear: Array2<f64>,
    pub se: Array2<f64>,
    pub ear_row_coords: Array2<f64>,
    pub ear_col_coords: Array2<f64>,
    pub se_row_coords: Option<Array2<f64>>,
    pub se_col_coords: Option<Array2<f64>>,
    pub rule: SeRuleKind,
}

impl ErrorEstimates {
    fn keyed(keys: &[String], coords: &Array2<f64>) -> BTreeMap<String, Vec<f64>> {
        keys.iter()
            .zip(coords.rows())
            .map(|(key, row)| (key.clone(), row.to_vec()))
            .collect()
    }

    fn keys(&self, facet: Facet) -> &[String] {
        match facet {
            Facet::Rows => &self.row_keys,
            Facet::Columns => &self.col_keys,
        }
    }

    pub fn ear_coordinate_map(&self, facet: Facet) -> BTreeMap<String, Vec<f64>> {
        let coords = match facet {
            Facet::Rows => &self.ear_row_coords,
            Facet::Columns => &self.ear_col_coords,
        };
        Self::keyed(self.keys(facet), coords)
    }

    /// Empty when SE coordinates were not fitted.
    pub fn se_coordinate_map(&self, facet: Facet) -> BTreeMap<String, Vec<f64>> {
        let coords = match facet {
            Facet::Rows => self.se_row_coords.as_ref(),
            Facet::Columns => self.se_col_coords.as_ref(),
        };
        coords.map_or_else(BTreeMap::new, |c| Self::keyed(self.keys(facet), c))
    }
}

/// `sqrt(n / D - 1)`, zero once `n <= D`.
pub fn facet_information(observations: usize, ndim: usize) -> f64 {
    if ndim == 0 || observations <= ndim {
        0.0
    } else {
        (observations as f64 / ndim as f64 - 1.0).sqrt()
    }
}

/// Standard error of one cell.
///
/// A facet whose entity was anchored does not contribute; with both anchored the cell is
/// fully determined by the bank and its SE is zero. A contributing entity with no more
/// observations than dimensions makes the SE infinite whatever the EAR.
pub fn standard_error(
    ear: f64,
    row: Option<usize>,
    col: Option<usize>,
    ndim: usize,
    rule: &dyn SeRule,
) -> f64 {
    let terms: Vec<f64> = [row, col]
        .into_iter()
        .flatten()
        .map(|n| facet_information(n, ndim))
        .collect();
    if terms.is_empty() {
        return 0.0;
    }
    let divisor = rule.combine(&terms);
    if divisor <= 0.0 {
        f64::INFINITY
    } else if is_missing(ear) {
        MISSING
    } else {
        terms.len() as f64 * ear / divisor
    }
}

/// Fills cells the EAR pass could not estimate.
///
/// A cell takes the mean EAR of its column, else of its row, else `fallback`. Returns the
/// number of cells filled.
pub fn fill_missing_ear(ear: &mut Array2<f64>, fallback: f64) -> usize {
    let finite_mean = |lane: ndarray::ArrayView1<f64>| {
        let (sum, count) = lane
            .iter()
            .filter(|v| !is_missing(**v))
            .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
        (count > 0).then_some(sum / count as f64)
    };
    let col_means: Vec<Option<f64>> = ear.columns().into_iter().map(finite_mean).collect();
    let row_means: Vec<Option<f64>> = ear.rows().into_iter().map(finite_mean).collect();

    let mut filled = 0usize;
    for ((r, c), value) in ear.indexed_iter_mut() {
        if is_missing(*value) {
            *value = col_means[c].or(row_means[r]).unwrap_or(fallback);
            filled += 1;
        }
    }
    filled
}

/// Residual multiplier for a bounded column at modeled value `estimate`.
pub fn inflation_factor(estimate: f64, bounds: MetricBounds, cap: f64) -> f64 {
    let span = bounds.max - bounds.min;
    let p = ((estimate - bounds.min) / span).clamp(PROBABILITY_CLAMP, 1.0 - PROBABILITY_CLAMP);
    (0.5 / (p * (1.0 - p)).sqrt()).min(cap)
}

pub struct ErrorEstimator<'a> {
    config: &'a VarianceConfig,
    solver: &'a SolverConfig,
    observer: Option<&'a mut dyn SolverProgressObserver>,
}

impl<'a> ErrorEstimator<'a> {
    /// `solver` supplies tolerance, sweep budget and seed for the error passes; its
    /// dimensionality is replaced by two.
    pub fn new(config: &'a VarianceConfig, solver: &'a SolverConfig) -> Self {
        Self {
            config,
            solver,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: &'a mut dyn SolverProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn run(
        mut self,
        matrix: &ObservationMatrix,
        fit: &SolverResult,
    ) -> Result<ErrorEstimates, VarianceError> {
        if fit.estimates.dim() != matrix.shape() {
            return Err(VarianceError::ShapeMismatch {
                expected: matrix.shape(),
                found: fit.estimates.dim(),
            });
        }
        let config = self.config;
        let passes = if config.fit_se_coords { 2 } else { 1 };
        let mut observer = self.observer.take();
        if let Some(obs) = observer.as_deref_mut() {
            obs.on_stage_start(SolverStage::ErrorModel, passes);
        }

        // Absolute residuals, inflated for bounded columns.
        let mut abs = fit.residuals(matrix).mapv(f64::abs);
        for (key, bounds) in &config.bounds {
            if bounds.max <= bounds.min || !bounds.max.is_finite() || !bounds.min.is_finite() {
                return Err(VarianceError::InvalidBounds {
                    key: key.clone(),
                    min: bounds.min,
                    max: bounds.max,
                });
            }
            let Some(c) = matrix.index_of(Facet::Columns, key) else {
                log::debug!("No column '{key}' in this matrix; its bounds are ignored");
                continue;
            };
            for r in 0..matrix.n_rows() {
                let residual = abs[[r, c]];
                if !is_missing(residual) {
                    let factor =
                        inflation_factor(fit.estimates[[r, c]], *bounds, config.inflation_cap);
                    abs[[r, c]] = residual * factor;
                }
            }
        }

        let finite: Vec<f64> = abs.iter().copied().filter(|v| !is_missing(*v)).collect();
        let mean_abs = if finite.is_empty() {
            0.0
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        };
        let floor = (config.residual_floor_fraction * mean_abs).max(MIN_RESIDUAL_FLOOR);
        let log_abs = abs.mapv(|v| {
            if is_missing(v) {
                MISSING
            } else {
                v.max(floor).ln() + LOG_ABS_BIAS
            }
        });

        let error_solver = SolverConfig {
            ndim: ERROR_NDIM,
            ..self.solver.clone()
        };
        let ear_fit = AlsSolver::new(&error_solver).run(&matrix.with_values(log_abs)?)?;
        let mut ear = ear_fit.estimates.mapv(f64::exp);
        let fallback = if finite.is_empty() { MISSING } else { mean_abs };
        let filled = fill_missing_ear(&mut ear, fallback);
        if filled > 0 {
            log::debug!("{filled} cells took a row or column mean EAR");
        }
        if let Some(obs) = observer.as_deref_mut() {
            obs.on_stage_advance(SolverStage::ErrorModel, 1);
        }

        let rule = config.se_rule.rule();
        let ndim = fit.ndim;
        let se = Array2::from_shape_fn(matrix.shape(), |(r, c)| {
            let row = (!fit.row_anchored[r]).then_some(fit.row_observations[r]);
            let col = (!fit.col_anchored[c]).then_some(fit.col_observations[c]);
            standard_error(ear[[r, c]], row, col, ndim, rule)
        });

        let (se_row_coords, se_col_coords) = if config.fit_se_coords {
            let log_se = se.mapv(|v| if v > 0.0 && v.is_finite() { v.ln() } else { MISSING });
            let se_fit = AlsSolver::new(&error_solver).run(&matrix.with_values(log_se)?)?;
            if let Some(obs) = observer.as_deref_mut() {
                obs.on_stage_advance(SolverStage::ErrorModel, 2);
            }
            (Some(se_fit.row_coords), Some(se_fit.col_coords))
        } else {
            (None, None)
        };

        if let Some(obs) = observer.as_deref_mut() {
            obs.on_stage_finish(SolverStage::ErrorModel);
        }

        let infinite = se.iter().filter(|v| v.is_infinite()).count();
        if infinite > 0 {
            log::warn!("{infinite} cells have an infinite standard error (observations do not exceed dimensions)");
        }
        log::info!(
            "Error model fitted ({} rule, mean absolute residual {:.4})",
            rule.name(),
            mean_abs
        );

        Ok(ErrorEstimates {
            row_keys: matrix.row_keys().to_vec(),
            col_keys: matrix.col_keys().to_vec(),
            ear,
            se,
            ear_row_coords: ear_fit.row_coords,
            ear_col_coords: ear_fit.col_coords,
            se_row_coords,
            se_col_coords,
            rule: config.se_rule,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn standard_error_grows_toward_and_diverges_at_the_dimensionality() {
        let rule = WeakestFacet;
        let ndim = 2;
        let mut previous = 0.0;
        for n in (3..=40).rev() {
            let se = standard_error(0.5, Some(n), Some(50), ndim, &rule);
            assert!(se > previous, "SE at n={n} is {se}, previous {previous}");
            previous = se;
        }
        assert_eq!(standard_error(0.5, Some(2), Some(50), ndim, &rule), f64::INFINITY);
        assert_eq!(standard_error(0.5, Some(1), Some(50), ndim, &rule), f64::INFINITY);
        // An unestimated entity has no EAR either; its SE is still infinite.
        assert_eq!(standard_error(f64::NAN, Some(2), Some(50), ndim, &rule), f64::INFINITY);
        assert!(standard_error(f64::NAN, Some(3), Some(50), ndim, &rule).is_nan());
    }

    #[test]
    fn unestimated_ear_cells_take_column_then_row_means() {
        let mut ear = ndarray::array![
            [f64::NAN, 2.0, f64::NAN],
            [1.0, 4.0, f64::NAN],
            [3.0, f64::NAN, f64::NAN]
        ];
        assert_eq!(fill_missing_ear(&mut ear, 9.0), 5);
        assert_abs_diff_eq!(ear[[0, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ear[[2, 1]], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ear[[0, 2]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ear[[1, 2]], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(ear[[2, 2]], 3.0, epsilon = 1e-12);

        let mut empty = Array2::from_elem((2, 2), f64::NAN);
        fill_missing_ear(&mut empty, 9.0);
        assert!(empty.iter().all(|&v| v == 9.0));
    }

    #[test]
    fn entities_at_the_dimensionality_get_infinite_standard_errors() {
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let rows = Array2::from_shape_fn((30, 1), |_| normal.sample(&mut rng));
        let cols = Array2::from_shape_fn((12, 1), |_| normal.sample(&mut rng));
        let mut values = rows.dot(&cols.t()).mapv(|v| v + 0.1 * normal.sample(&mut rng));
        // Row 0 has exactly D observations. Row 1 has one more, which is still too few
        // for the two-dimensional EAR pass.
        for c in 1..12 {
            values[[0, c]] = f64::NAN;
        }
        for c in 2..12 {
            values[[1, c]] = f64::NAN;
        }
        let matrix = ObservationMatrix::from_values(values).unwrap();
        let solver = SolverConfig {
            ndim: 1,
            ..SolverConfig::default()
        };
        let fit = AlsSolver::new(&solver).run(&matrix).unwrap();
        assert_eq!(&fit.row_observations[..2], &[1, 2]);
        assert!(fit.row_coords.row(0).iter().all(|v| v.is_nan()));

        let config = VarianceConfig::default();
        let errors = ErrorEstimator::new(&config, &solver).run(&matrix, &fit).unwrap();
        assert!(errors.se.row(0).iter().all(|&v| v == f64::INFINITY));
        assert!(errors.ear.iter().all(|v| v.is_finite() && *v > 0.0));
        assert!(
            errors
                .se
                .rows()
                .into_iter()
                .skip(1)
                .all(|row| row.iter().all(|v| v.is_finite() && *v > 0.0))
        );
    }

    #[test]
    fn anchored_facets_drop_out_of_the_standard_error() {
        let rule = WeakestFacet;
        assert_eq!(standard_error(0.5, None, None, 2, &rule), 0.0);

        let one_free = standard_error(0.5, None, Some(10), 2, &rule);
        assert_abs_diff_eq!(one_free, 0.5 / 2.0, epsilon = 1e-12);

        let both_free = standard_error(0.5, Some(10), Some(10), 2, &rule);
        assert_abs_diff_eq!(both_free, 2.0 * 0.5 / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn geometric_mean_is_never_stricter_than_weakest_facet() {
        for (rows, cols) in [(5, 50), (20, 20), (100, 8)] {
            let weakest = standard_error(1.0, Some(rows), Some(cols), 3, &WeakestFacet);
            let geometric = standard_error(1.0, Some(rows), Some(cols), 3, &GeometricMean);
            assert!(geometric <= weakest + 1e-12);
        }
        assert_eq!(SeRuleKind::GeometricMean.rule().name(), "geometric-mean");
    }

    #[test]
    fn inflation_is_neutral_mid_scale_and_capped_at_the_bounds() {
        let bounds = MetricBounds { min: 0.0, max: 1.0 };
        assert_abs_diff_eq!(inflation_factor(0.5, bounds, 4.0), 1.0, epsilon = 1e-12);
        assert!(inflation_factor(0.9, bounds, 4.0) > 1.0);
        assert_eq!(inflation_factor(1.5, bounds, 4.0), 4.0);
        assert_eq!(inflation_factor(-3.0, bounds, 2.0), 2.0);
    }

    #[test]
    fn ear_follows_row_specific_noise() {
        let mut rng = StdRng::seed_from_u64(31);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let rows = Array2::from_shape_fn((60, 2), |_| normal.sample(&mut rng));
        let cols = Array2::from_shape_fn((25, 2), |_| normal.sample(&mut rng));
        let mut values = rows.dot(&cols.t());
        for ((r, _), v) in values.indexed_iter_mut() {
            let sd = if r < 30 { 0.05 } else { 0.5 };
            *v += sd * normal.sample(&mut rng);
        }
        let matrix = ObservationMatrix::from_values(values).unwrap();
        let solver = SolverConfig {
            ndim: 2,
            ..SolverConfig::default()
        };
        let fit = AlsSolver::new(&solver).run(&matrix).unwrap();

        let config = VarianceConfig::default();
        let errors = ErrorEstimator::new(&config, &solver).run(&matrix, &fit).unwrap();

        let quiet = errors.ear.slice(ndarray::s![..30, ..]).mean().unwrap();
        let noisy = errors.ear.slice(ndarray::s![30.., ..]).mean().unwrap();
        assert!(noisy > 4.0 * quiet, "quiet {quiet}, noisy {noisy}");
        assert!(errors.se.iter().all(|v| v.is_finite() && *v > 0.0));
        assert_eq!(errors.ear_coordinate_map(Facet::Rows).len(), 60);
        assert_eq!(errors.se_coordinate_map(Facet::Columns).len(), 25);
    }

    #[test]
    fn mismatched_fit_is_rejected() {
        let matrix = ObservationMatrix::from_values(Array2::from_elem((4, 4), 1.0)).unwrap();
        let other = ObservationMatrix::from_values(Array2::from_elem((5, 4), 1.0)).unwrap();
        let solver = SolverConfig {
            ndim: 1,
            ..SolverConfig::default()
        };
        let fit = AlsSolver::new(&solver).run(&other).unwrap();
        let config = VarianceConfig::default();
        assert!(matches!(
            ErrorEstimator::new(&config, &solver).run(&matrix, &fit),
            Err(VarianceError::ShapeMismatch { .. })
        ));
    }
}
