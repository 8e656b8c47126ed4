//! Least-squares solve for a single entity's coordinate vector.
//!
//! Given the opposite facet's coordinates (held fixed) and one entity's observations,
//! find the D-vector whose dot products with the opposite coordinates best reproduce
//! the observations. Entities with no more usable observations than dimensions can not
//! be located and are reported as under-determined; the caller decides what to do with
//! them (the ALS solver writes the missing sentinel and carries on).
//!
//! A system with enough observations whose partners span fewer than D directions still
//! has a unique minimum-norm solution, and that is what is returned. Only a system with
//! no usable direction at all is an error.

use crate::types::is_missing;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, LeastSquaresSvd, UPLO};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Singular values below this fraction of the largest one are treated as zero.
const RANK_TOLERANCE: f64 = 1e-7;

/// How each observation is weighted when solving an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum ObservationWeighting {
    /// Every usable observation counts equally.
    #[default]
    Uniform,
    /// Observations whose opposite-facet partner has a coordinate norm more than
    /// `sd_threshold` standard deviations above the mean norm are down-weighted in
    /// proportion to how far they exceed that ceiling.
    DampLargePartners { sd_threshold: f64 },
}

#[derive(Error, Debug)]
pub enum CellSolveError {
    #[error(
        "Entity has {valid} usable observations for {ndim} dimensions; more observations than dimensions are required."
    )]
    UnderDetermined { valid: usize, ndim: usize },

    #[error("Local system has rank {rank} for {ndim} dimensions; no direction can be estimated.")]
    RankDeficient { rank: usize, ndim: usize },

    #[error("Least-squares solution contains non-finite values.")]
    NonFinite,

    #[error("Least-squares solve failed: {0}")]
    Linalg(#[from] LinalgError),
}

/// Per-partner weights for one phase, computed once from the opposite facet.
///
/// Partners whose coordinates hold the sentinel get weight zero so they drop out of
/// every solve.
pub fn partner_weights(opposite: ArrayView2<f64>, weighting: ObservationWeighting) -> Array1<f64> {
    let norms: Vec<Option<f64>> = opposite
        .rows()
        .into_iter()
        .map(|row| {
            if row.iter().any(|v| is_missing(*v)) {
                None
            } else {
                Some(row.dot(&row).sqrt())
            }
        })
        .collect();

    let base = norms.iter().map(|n| if n.is_some() { 1.0 } else { 0.0 });

    match weighting {
        ObservationWeighting::Uniform => base.collect(),
        ObservationWeighting::DampLargePartners { sd_threshold } => {
            let finite: Vec<f64> = norms.iter().flatten().copied().collect();
            let Some((mean, sd)) = mean_and_sd(&finite) else {
                return base.collect();
            };
            let ceiling = mean + sd_threshold * sd;
            norms
                .iter()
                .map(|norm| match norm {
                    None => 0.0,
                    Some(n) if *n > ceiling && *n > 0.0 => ceiling / n,
                    Some(_) => 1.0,
                })
                .collect()
        }
    }
}

/// Solves one entity.
///
/// * `opposite`: opposite-facet coordinates, shape `[n_partners, ndim]`.
/// * `observations`: this entity's cells against each partner.
/// * `usable`: false for cells that are missing or deliberately withheld.
/// * `weights`: per-partner weights from [`partner_weights`].
pub fn solve_entity(
    opposite: ArrayView2<f64>,
    observations: ArrayView1<f64>,
    usable: ArrayView1<bool>,
    weights: ArrayView1<f64>,
) -> Result<Array1<f64>, CellSolveError> {
    let ndim = opposite.ncols();
    debug_assert_eq!(opposite.nrows(), observations.len());
    debug_assert_eq!(usable.len(), observations.len());
    debug_assert_eq!(weights.len(), observations.len());

    let valid: Vec<usize> = (0..observations.len())
        .filter(|&j| usable[j] && !is_missing(observations[j]) && weights[j] > 0.0)
        .collect();

    if valid.len() <= ndim {
        return Err(CellSolveError::UnderDetermined {
            valid: valid.len(),
            ndim,
        });
    }

    let mut design = Array2::<f64>::zeros((valid.len(), ndim));
    let mut target = Array1::<f64>::zeros(valid.len());
    for (slot, &j) in valid.iter().enumerate() {
        let scale = weights[j].sqrt();
        design
            .row_mut(slot)
            .assign(&opposite.row(j).mapv(|v| v * scale));
        target[slot] = observations[j] * scale;
    }

    let fit = design.least_squares(&target)?;
    let floor = fit.singular_values.first().copied().unwrap_or(0.0) * RANK_TOLERANCE;
    let rank = fit.singular_values.iter().filter(|&&s| s > floor).count();
    if rank == 0 {
        return Err(CellSolveError::RankDeficient { rank, ndim });
    }
    let solution = if rank < ndim {
        minimum_norm_solution(&design, &target, rank)?
    } else {
        fit.solution
    };
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(CellSolveError::NonFinite);
    }
    Ok(solution)
}

/// Least-squares solution restricted to the `rank` strongest directions of `design`.
fn minimum_norm_solution(
    design: &Array2<f64>,
    target: &Array1<f64>,
    rank: usize,
) -> Result<Array1<f64>, CellSolveError> {
    let gram = design.t().dot(design);
    let rhs = design.t().dot(target);
    // Eigenvalues come back in ascending order.
    let (values, vectors) = gram.eigh(UPLO::Lower)?;
    let mut solution = Array1::<f64>::zeros(design.ncols());
    for k in values.len().saturating_sub(rank)..values.len() {
        let lambda = values[k];
        if lambda <= 0.0 {
            continue;
        }
        let direction = vectors.column(k);
        solution.scaled_add(direction.dot(&rhs) / lambda, &direction);
    }
    Ok(solution)
}

pub(crate) fn mean_and_sd(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}
