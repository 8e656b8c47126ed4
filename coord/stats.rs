//! # Objectivity Statistics
//!
//! Three numbers score how well a solution at some dimensionality generalizes:
//!
//! - **Accuracy**: Pearson correlation between withheld cells and their estimates. With
//!   no pseudo-missing mask it falls back to the in-sample correlation over observed cells.
//! - **Stability**: the columns are split into two random halves, each half is solved
//!   independently, and the resulting row coordinates are compared. The second half's
//!   coordinates are first aligned onto the first's by least squares (the two solutions
//!   are only identified up to an invertible transform). Both are then projected on the
//!   principal axes of the first half and the per-axis correlations are averaged over
//!   all D axes. An axis with no variance in the first half contributes zero, so a
//!   dimension the data does not support lowers the score.
//! - **Objectivity**: `sqrt(accuracy * stability)`, negated when either input is
//!   negative so that a bad solution never scores as a good one.

use crate::als::{AlsSolver, SolverConfig, SolverError, SolverResult};
use crate::pseudomiss::{PseudoMissMask, usable_mask};
use crate::types::{Facet, MISSING, ObservationMatrix, is_missing};
use ndarray::{Array2, Axis};
use ndarray_linalg::{Eigh, LeastSquaresSvd, UPLO};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Principal-axis variances below this fraction of the largest count as unsupported.
const SUPPORT_TOLERANCE: f64 = 1e-12;

/// The statistic a search maximizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SelectionCriterion {
    #[default]
    Objectivity,
    Accuracy,
    Stability,
}

/// Statistics for one solution. `None` means the statistic could not be computed
/// (too few withheld cells, too few columns to split, zero variance).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObjectivityStats {
    pub accuracy: Option<f64>,
    pub stability: Option<f64>,
    pub objectivity: Option<f64>,
}

impl ObjectivityStats {
    pub fn new(accuracy: Option<f64>, stability: Option<f64>) -> Self {
        let objectivity = match (accuracy, stability) {
            (Some(a), Some(s)) => Some(objectivity(a, s)),
            _ => None,
        };
        Self {
            accuracy,
            stability,
            objectivity,
        }
    }

    pub fn value(&self, criterion: SelectionCriterion) -> Option<f64> {
        match criterion {
            SelectionCriterion::Objectivity => self.objectivity,
            SelectionCriterion::Accuracy => self.accuracy,
            SelectionCriterion::Stability => self.stability,
        }
    }
}

/// A fit together with its statistics.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub fit: SolverResult,
    pub stats: ObjectivityStats,
}

/// Pearson correlation over the positions where both inputs are finite, clamped to
/// `[-1, 1]`.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter(|(x, y)| !is_missing(**x) && !is_missing(**y))
        .map(|(x, y)| (*x, *y))
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

pub fn objectivity(accuracy: f64, stability: f64) -> f64 {
    let magnitude = (accuracy * stability).abs().sqrt();
    if accuracy < 0.0 || stability < 0.0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Correlation between true and estimated values of withheld cells, or of all observed
/// cells when nothing is withheld.
pub fn accuracy(
    matrix: &ObservationMatrix,
    withheld: Option<&PseudoMissMask>,
    estimates: &Array2<f64>,
) -> Option<f64> {
    let values = matrix.values();
    let use_mask = withheld.filter(|mask| mask.count() > 0);
    let (truth, predicted): (Vec<f64>, Vec<f64>) = values
        .indexed_iter()
        .filter(|((r, c), v)| {
            !is_missing(**v)
                && use_mask.is_none_or(|mask| mask.is_withheld(*r, *c))
        })
        .map(|((r, c), v)| (*v, estimates[[r, c]]))
        .unzip();
    pearson(&truth, &predicted)
}

/// Split-half stability of the row coordinates at `config.ndim` dimensions.
///
/// Withheld cells are hidden from both halves. Returns `Ok(None)` when a half has no
/// more columns than dimensions or too few rows survive in both halves.
pub fn stability(
    matrix: &ObservationMatrix,
    withheld: Option<&PseudoMissMask>,
    config: &SolverConfig,
    split_seed: u64,
) -> Result<Option<f64>, SolverError> {
    let ndim = config.ndim;
    let n_cols = matrix.n_cols();
    let half = n_cols / 2;
    if half <= ndim || n_cols - half <= ndim {
        return Ok(None);
    }

    let visible = match withheld {
        Some(mask) if mask.count() > 0 => {
            let usable = usable_mask(matrix, Some(mask));
            let mut values = matrix.values().clone();
            values.zip_mut_with(&usable, |v, &u| {
                if !u {
                    *v = MISSING;
                }
            });
            matrix.with_values(values)?
        }
        _ => matrix.clone(),
    };

    let mut order: Vec<usize> = (0..n_cols).collect();
    let mut rng = StdRng::seed_from_u64(split_seed);
    order.shuffle(&mut rng);
    let (first, second) = order.split_at(half);

    let first_fit = AlsSolver::new(config).run(&visible.select(Facet::Columns, first)?)?;
    let second_fit = AlsSolver::new(config).run(&visible.select(Facet::Columns, second)?)?;

    let shared: Vec<usize> = (0..matrix.n_rows())
        .filter(|&r| {
            first_fit.row_coords.row(r).iter().all(|v| !is_missing(*v))
                && second_fit.row_coords.row(r).iter().all(|v| !is_missing(*v))
        })
        .collect();
    if shared.len() <= ndim + 1 {
        return Ok(None);
    }

    let target = first_fit.row_coords.select(Axis(0), &shared);
    let source = second_fit.row_coords.select(Axis(0), &shared);
    let transform = match source.least_squares(&target) {
        Ok(fit) => fit.solution,
        Err(err) => {
            log::debug!("Split-half alignment failed at {ndim}D: {err}");
            return Ok(None);
        }
    };
    let aligned = source.dot(&transform);
    Ok(axis_agreement(&target, &aligned))
}

/// Mean correlation of `target` and `aligned` along the principal axes of `target`,
/// counting axes without variance as zero.
fn axis_agreement(target: &Array2<f64>, aligned: &Array2<f64>) -> Option<f64> {
    let ndim = target.ncols();
    let mean = target.mean_axis(Axis(0))?;
    let centered = target - &mean;
    let covariance = centered.t().dot(&centered) / target.nrows() as f64;
    let (variances, axes) = match covariance.eigh(UPLO::Lower) {
        Ok(decomposition) => decomposition,
        Err(err) => {
            log::debug!("Principal axes failed at {ndim}D: {err}");
            return None;
        }
    };
    let largest = variances.iter().copied().fold(0.0_f64, f64::max);
    if largest <= 0.0 {
        return None;
    }

    let total: f64 = (0..ndim)
        .filter(|&k| variances[k] > largest * SUPPORT_TOLERANCE)
        .filter_map(|k| {
            let axis = axes.column(k);
            pearson(&target.dot(&axis).to_vec(), &aligned.dot(&axis).to_vec())
        })
        .sum();
    Some(total / ndim as f64)
}

/// Fits `matrix` with `withheld` hidden and scores the fit.
pub fn assess(
    matrix: &ObservationMatrix,
    withheld: Option<&PseudoMissMask>,
    config: &SolverConfig,
    split_seed: u64,
) -> Result<Assessment, SolverError> {
    let fit = AlsSolver::new(config)
        .with_optional_pseudo_missing(withheld)
        .run(matrix)?;
    let accuracy = accuracy(matrix, withheld, &fit.estimates);
    let stability = stability(matrix, withheld, config, split_seed)?;
    let stats = ObjectivityStats::new(accuracy, stability);
    log::debug!(
        "{}D assessment: accuracy {:?}, stability {:?}, objectivity {:?}",
        config.ndim,
        stats.accuracy,
        stats.stability,
        stats.objectivity
    );
    Ok(Assessment { fit, stats })
}
