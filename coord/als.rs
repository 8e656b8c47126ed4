//! # Alternating Least Squares
//!
//! The solver locates every row entity and every column entity in a shared
//! D-dimensional space such that the dot product of a row vector with a column vector
//! reproduces the observed cell. It alternates two phases per sweep:
//!
//! 1.  **Row phase:** with column coordinates held fixed, each unanchored row is solved
//!     independently by the cell solver. Rows are data-parallel within the phase.
//! 2.  **Column phase:** the same for columns, against the freshly updated rows. The
//!     phase boundary is a hard barrier.
//!
//! After each sweep one facet may be re-orthonormalized (QR, with the triangular factor
//! pushed into the other facet so that estimates are unchanged), which pins down the
//! otherwise free rotation of the solution. A divergence check after each phase can
//! "jolt" a facet with bounded uniform noise. The loop stops when the relative change of
//! the combined coordinate arrays drops below the tolerance or the sweep budget runs
//! out. Non-convergence is reported, never raised.

use crate::anchor::{AnchorError, AnchorSet};
use crate::cell::{self, CellSolveError, ObservationWeighting};
use crate::progress::{SolverProgressObserver, SolverStage};
use crate::pseudomiss::{PseudoMissMask, usable_mask};
use crate::types::{Facet, MISSING, MatrixError, ObservationMatrix, is_missing};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use ndarray_linalg::QR;
use ndarray_linalg::error::LinalgError;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Half-width of the uniform distribution used for random starting coordinates.
const START_SPREAD: f64 = 1.0;

/// Which facet, if any, is re-orthonormalized after every sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Conditioning {
    None,
    OrthonormalRows,
    #[default]
    OrthonormalColumns,
}

impl Conditioning {
    pub fn target(self) -> Option<Facet> {
        match self {
            Self::None => None,
            Self::OrthonormalRows => Some(Facet::Rows),
            Self::OrthonormalColumns => Some(Facet::Columns),
        }
    }
}

/// Divergence recovery settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoltConfig {
    /// An entity whose vector length exceeds the facet mean by this many standard
    /// deviations marks the facet as diverging.
    pub sd_threshold: f64,
    /// Noise half-width as a fraction of the facet's mean vector length.
    pub noise_scale: f64,
    /// Jolts allowed per run; further divergence is only reported.
    pub max_jolts: usize,
}

impl Default for JoltConfig {
    fn default() -> Self {
        Self {
            sd_threshold: 5.0,
            noise_scale: 0.1,
            max_jolts: 3,
        }
    }
}

/// Settings for one ALS run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub ndim: usize,
    /// Relative change of the combined coordinate arrays below which a sweep counts as
    /// converged.
    pub tolerance: f64,
    pub max_sweeps: usize,
    pub conditioning: Conditioning,
    pub jolt: Option<JoltConfig>,
    pub weighting: ObservationWeighting,
    /// Seed for random starting coordinates and jolt noise.
    pub seed: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            ndim: 2,
            tolerance: 1e-5,
            max_sweeps: 100,
            conditioning: Conditioning::default(),
            jolt: Some(JoltConfig::default()),
            weighting: ObservationWeighting::Uniform,
            seed: 1,
        }
    }
}

impl SolverConfig {
    pub fn with_ndim(&self, ndim: usize) -> Self {
        Self {
            ndim,
            ..self.clone()
        }
    }

    pub fn with_seed(&self, seed: u64) -> Self {
        Self {
            seed,
            ..self.clone()
        }
    }
}

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Dimensionality must be at least 1.")]
    ZeroDimensions,

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error("Pseudo-missing mask has shape {found:?} but the matrix has shape {expected:?}.")]
    MaskShape {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Starter coordinates for the {facet} facet have shape {found:?}; expected {expected:?}.")]
    StarterShape {
        facet: Facet,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("The {facet} anchors are {found}-dimensional but the solve is {expected}-dimensional.")]
    AnchorDimension {
        facet: Facet,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Anchor(#[from] AnchorError),

    #[error("Orthonormal conditioning of the {facet} facet failed: {source}")]
    Conditioning {
        facet: Facet,
        #[source]
        source: LinalgError,
    },
}

/// One line of the per-sweep change log.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRecord {
    pub sweep: usize,
    pub change: f64,
    pub jolted_rows: bool,
    pub jolted_cols: bool,
    pub under_determined_rows: usize,
    pub under_determined_cols: usize,
}

/// Non-fatal conditions surfaced at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverWarning {
    UnderDetermined { facet: Facet, count: usize },
    DivergenceUnresolved { jolts: usize },
    NotConverged { sweeps: usize, last_change: f64 },
}

impl fmt::Display for SolverWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnderDetermined { facet, count } => write!(
                f,
                "{count} {facet} entities had too few observations and were left unestimated"
            ),
            Self::DivergenceUnresolved { jolts } => write!(
                f,
                "coordinates kept diverging after {jolts} jolts; large coordinates were kept"
            ),
            Self::NotConverged {
                sweeps,
                last_change,
            } => write!(
                f,
                "no convergence after {sweeps} sweeps (last relative change {last_change:.3e})"
            ),
        }
    }
}

/// Everything one ALS run produces. Arrays never alias the inputs.
#[derive(Debug, Clone)]
pub struct SolverResult {
    pub ndim: usize,
    pub seed: u64,
    pub row_keys: Vec<String>,
    pub col_keys: Vec<String>,
    /// Shape `[n_rows, ndim]`; under-determined rows hold the sentinel.
    pub row_coords: Array2<f64>,
    /// Shape `[n_cols, ndim]`; under-determined columns hold the sentinel.
    pub col_coords: Array2<f64>,
    /// Shape `[n_rows, n_cols]`, for every cell including missing ones.
    pub estimates: Array2<f64>,
    pub sweeps: Vec<SweepRecord>,
    pub converged: bool,
    pub warnings: Vec<SolverWarning>,
    pub row_anchored: Vec<bool>,
    pub col_anchored: Vec<bool>,
    /// Usable observations per row (missing and withheld cells excluded).
    pub row_observations: Vec<usize>,
    pub col_observations: Vec<usize>,
}

impl SolverResult {
    pub fn coords(&self, facet: Facet) -> &Array2<f64> {
        match facet {
            Facet::Rows => &self.row_coords,
            Facet::Columns => &self.col_coords,
        }
    }

    pub fn keys(&self, facet: Facet) -> &[String] {
        match facet {
            Facet::Rows => &self.row_keys,
            Facet::Columns => &self.col_keys,
        }
    }

    pub fn anchored(&self, facet: Facet) -> &[bool] {
        match facet {
            Facet::Rows => &self.row_anchored,
            Facet::Columns => &self.col_anchored,
        }
    }

    pub fn observations(&self, facet: Facet) -> &[usize] {
        match facet {
            Facet::Rows => &self.row_observations,
            Facet::Columns => &self.col_observations,
        }
    }

    pub fn index_of(&self, facet: Facet, key: &str) -> Option<usize> {
        self.keys(facet).iter().position(|k| k == key)
    }

    pub fn sweeps_used(&self) -> usize {
        self.sweeps.len()
    }

    pub fn final_change(&self) -> f64 {
        self.sweeps.last().map_or(f64::INFINITY, |record| record.change)
    }

    /// Entities of `facet` left at the sentinel.
    pub fn under_determined(&self, facet: Facet) -> usize {
        self.coords(facet)
            .rows()
            .into_iter()
            .filter(|row| row.iter().any(|v| is_missing(*v)))
            .count()
    }

    /// Keyed copy of one facet's coordinates, sentinel rows included.
    pub fn coordinate_map(&self, facet: Facet) -> BTreeMap<String, Vec<f64>> {
        self.keys(facet)
            .iter()
            .zip(self.coords(facet).rows())
            .map(|(key, row)| (key.clone(), row.to_vec()))
            .collect()
    }

    /// Observed minus estimated, missing wherever either side is missing.
    pub fn residuals(&self, matrix: &ObservationMatrix) -> Array2<f64> {
        let mut residuals = matrix.values().clone();
        residuals.zip_mut_with(&self.estimates, |obs, est| {
            *obs = if is_missing(*obs) || is_missing(*est) {
                MISSING
            } else {
                *obs - *est
            };
        });
        residuals
    }
}

/// Builder for one ALS run.
pub struct AlsSolver<'a> {
    config: &'a SolverConfig,
    anchors: Option<&'a AnchorSet>,
    withheld: Option<&'a PseudoMissMask>,
    starter_rows: Option<&'a Array2<f64>>,
    starter_cols: Option<&'a Array2<f64>>,
    observer: Option<&'a mut dyn SolverProgressObserver>,
}

impl<'a> AlsSolver<'a> {
    pub fn new(config: &'a SolverConfig) -> Self {
        Self {
            config,
            anchors: None,
            withheld: None,
            starter_rows: None,
            starter_cols: None,
            observer: None,
        }
    }

    pub fn with_anchors(mut self, anchors: &'a AnchorSet) -> Self {
        self.anchors = Some(anchors);
        self
    }

    /// Cells marked in `mask` are treated as missing for the whole run.
    pub fn with_pseudo_missing(mut self, mask: &'a PseudoMissMask) -> Self {
        self.withheld = Some(mask);
        self
    }

    pub fn with_optional_pseudo_missing(mut self, mask: Option<&'a PseudoMissMask>) -> Self {
        self.withheld = mask;
        self
    }

    /// Caller-supplied starting coordinates, shape `[entities, ndim]`.
    pub fn with_starter(mut self, facet: Facet, coords: &'a Array2<f64>) -> Self {
        match facet {
            Facet::Rows => self.starter_rows = Some(coords),
            Facet::Columns => self.starter_cols = Some(coords),
        }
        self
    }

    pub fn with_observer(mut self, observer: &'a mut dyn SolverProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn run(mut self, matrix: &ObservationMatrix) -> Result<SolverResult, SolverError> {
        let config = self.config;
        let ndim = config.ndim;
        if ndim == 0 {
            return Err(SolverError::ZeroDimensions);
        }
        if let Some(mask) = self.withheld {
            if mask.shape() != matrix.shape() {
                return Err(SolverError::MaskShape {
                    expected: matrix.shape(),
                    found: mask.shape(),
                });
            }
        }

        let usable = usable_mask(matrix, self.withheld);
        let row_observations = count_usable(&usable, Facet::Rows);
        let col_observations = count_usable(&usable, Facet::Columns);

        // --- INIT ---
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut rows = self.starting_coordinates(Facet::Rows, matrix.n_rows(), &mut rng)?;
        let mut cols = self.starting_coordinates(Facet::Columns, matrix.n_cols(), &mut rng)?;
        let row_fixed = apply_anchors(Facet::Rows, matrix, self.anchors, ndim, &mut rows)?;
        let col_fixed = apply_anchors(Facet::Columns, matrix, self.anchors, ndim, &mut cols)?;

        let any_fixed = row_fixed.iter().chain(col_fixed.iter()).any(|&fixed| fixed);
        let conditioning = match config.conditioning.target() {
            Some(facet) if any_fixed => {
                log::debug!("Skipping {facet} conditioning because anchored entities are held fixed");
                None
            }
            other => other,
        };
        if let Some(facet) = conditioning {
            (rows, cols) = condition(facet, rows, cols)?;
        }

        log::debug!(
            "Starting {}-dimensional ALS on a {}x{} matrix ({} fixed rows, {} fixed columns)",
            ndim,
            matrix.n_rows(),
            matrix.n_cols(),
            row_fixed.iter().filter(|&&f| f).count(),
            col_fixed.iter().filter(|&&f| f).count(),
        );

        let mut observer = self.observer.take();
        if let Some(obs) = observer.as_deref_mut() {
            obs.on_stage_start(SolverStage::Sweeps, config.max_sweeps);
        }

        let mut sweeps = Vec::with_capacity(config.max_sweeps.min(256));
        let mut converged = false;
        let mut jolts = 0usize;
        let mut divergence_unresolved = false;

        for sweep in 1..=config.max_sweeps {
            // --- SOLVE_FACET_A ---
            let row_phase = solve_phase(
                Facet::Rows,
                matrix,
                &usable,
                &cols,
                &rows,
                &row_fixed,
                config.weighting,
            );
            let mut next_rows = row_phase.coords;
            let jolted_rows = maybe_jolt(
                Facet::Rows,
                &mut next_rows,
                &row_fixed,
                config.jolt.as_ref(),
                &mut jolts,
                &mut divergence_unresolved,
                &mut rng,
            );

            // --- SOLVE_FACET_B ---
            let col_phase = solve_phase(
                Facet::Columns,
                matrix,
                &usable,
                &next_rows,
                &cols,
                &col_fixed,
                config.weighting,
            );
            let mut next_cols = col_phase.coords;
            let jolted_cols = maybe_jolt(
                Facet::Columns,
                &mut next_cols,
                &col_fixed,
                config.jolt.as_ref(),
                &mut jolts,
                &mut divergence_unresolved,
                &mut rng,
            );

            if let Some(facet) = conditioning {
                (next_rows, next_cols) = condition(facet, next_rows, next_cols)?;
            }

            // --- CHECK_CONVERGENCE ---
            let change = relative_change(&[(&rows, &next_rows), (&cols, &next_cols)]);
            rows = next_rows;
            cols = next_cols;

            log::debug!(
                "Sweep {sweep}: relative change {change:.3e}, under-determined rows {}, columns {}",
                row_phase.under_determined,
                col_phase.under_determined
            );
            sweeps.push(SweepRecord {
                sweep,
                change,
                jolted_rows,
                jolted_cols,
                under_determined_rows: row_phase.under_determined,
                under_determined_cols: col_phase.under_determined,
            });

            if let Some(obs) = observer.as_deref_mut() {
                obs.on_stage_advance(SolverStage::Sweeps, sweep);
            }

            if !jolted_rows && !jolted_cols && change < config.tolerance {
                converged = true;
                break;
            }
            if all_missing(&rows) && all_missing(&cols) {
                log::debug!("Sweep {sweep}: no entity could be estimated; stopping");
                break;
            }
        }

        if let Some(obs) = observer.as_deref_mut() {
            obs.on_stage_finish(SolverStage::Sweeps);
        }

        // --- DONE ---
        let estimates = rows.dot(&cols.t());
        let mut result = SolverResult {
            ndim,
            seed: config.seed,
            row_keys: matrix.row_keys().to_vec(),
            col_keys: matrix.col_keys().to_vec(),
            row_coords: rows,
            col_coords: cols,
            estimates,
            sweeps,
            converged,
            warnings: Vec::new(),
            row_anchored: row_fixed,
            col_anchored: col_fixed,
            row_observations,
            col_observations,
        };

        for facet in Facet::BOTH {
            let count = result.under_determined(facet);
            if count > 0 {
                result
                    .warnings
                    .push(SolverWarning::UnderDetermined { facet, count });
            }
        }
        if divergence_unresolved {
            result
                .warnings
                .push(SolverWarning::DivergenceUnresolved { jolts });
        }
        if !converged {
            result.warnings.push(SolverWarning::NotConverged {
                sweeps: result.sweeps_used(),
                last_change: result.final_change(),
            });
        }
        for warning in &result.warnings {
            log::warn!("ALS ({ndim}D): {warning}");
        }
        log::info!(
            "ALS ({}D) finished after {} sweeps, converged: {}, final change {:.3e}",
            ndim,
            result.sweeps_used(),
            converged,
            result.final_change()
        );

        Ok(result)
    }

    fn starting_coordinates(
        &self,
        facet: Facet,
        n: usize,
        rng: &mut StdRng,
    ) -> Result<Array2<f64>, SolverError> {
        let ndim = self.config.ndim;
        // Always draw, so a starter for one facet does not shift the other facet's stream.
        let random = random_coordinates(n, ndim, rng);
        let starter = match facet {
            Facet::Rows => self.starter_rows,
            Facet::Columns => self.starter_cols,
        };
        match starter {
            None => Ok(random),
            Some(coords) if coords.dim() == (n, ndim) => Ok(coords.clone()),
            Some(coords) => Err(SolverError::StarterShape {
                facet,
                expected: (n, ndim),
                found: coords.dim(),
            }),
        }
    }
}

struct PhaseOutcome {
    coords: Array2<f64>,
    under_determined: usize,
}

fn random_coordinates(n: usize, ndim: usize, rng: &mut StdRng) -> Array2<f64> {
    let spread = Uniform::new(-START_SPREAD, START_SPREAD);
    Array2::from_shape_fn((n, ndim), |_| rng.sample(spread))
}

fn count_usable(usable: &Array2<bool>, facet: Facet) -> Vec<usize> {
    usable
        .axis_iter(facet.axis())
        .map(|lane| lane.iter().filter(|&&u| u).count())
        .collect()
}

fn apply_anchors(
    facet: Facet,
    matrix: &ObservationMatrix,
    anchors: Option<&AnchorSet>,
    ndim: usize,
    coords: &mut Array2<f64>,
) -> Result<Vec<bool>, SolverError> {
    let mut fixed = vec![false; coords.nrows()];
    let Some(facet_anchors) = anchors.and_then(|set| set.get(facet)) else {
        return Ok(fixed);
    };
    if facet_anchors.ndim() != ndim {
        return Err(SolverError::AnchorDimension {
            facet,
            expected: ndim,
            found: facet_anchors.ndim(),
        });
    }

    let mut matched = 0usize;
    for (idx, key) in matrix.keys(facet).iter().enumerate() {
        if let Some(vector) = facet_anchors.get(key) {
            coords.row_mut(idx).assign(&ArrayView1::from(vector));
            fixed[idx] = facet_anchors.is_fixed(key);
            matched += 1;
        }
    }
    log::debug!(
        "Matched {matched} of {} {facet} anchors to the matrix",
        facet_anchors.len()
    );
    Ok(fixed)
}

fn solve_phase(
    facet: Facet,
    matrix: &ObservationMatrix,
    usable: &Array2<bool>,
    opposite: &Array2<f64>,
    current: &Array2<f64>,
    fixed: &[bool],
    weighting: ObservationWeighting,
) -> PhaseOutcome {
    let weights = cell::partner_weights(opposite.view(), weighting);
    let axis = facet.axis();

    let solved: Vec<Option<Result<Array1<f64>, CellSolveError>>> = (0..current.nrows())
        .into_par_iter()
        .map(|idx| {
            if fixed[idx] {
                return None;
            }
            Some(cell::solve_entity(
                opposite.view(),
                matrix.entity(facet, idx),
                usable.index_axis(axis, idx),
                weights.view(),
            ))
        })
        .collect();

    let mut coords = current.clone();
    let mut under_determined = 0usize;
    for (idx, outcome) in solved.into_iter().enumerate() {
        match outcome {
            None => {}
            Some(Ok(vector)) => coords.row_mut(idx).assign(&vector),
            Some(Err(err)) => {
                if let CellSolveError::Linalg(inner) = &err {
                    log::debug!("{facet} {idx}: least-squares failure treated as under-determined: {inner}");
                }
                coords.row_mut(idx).fill(MISSING);
                under_determined += 1;
            }
        }
    }

    PhaseOutcome {
        coords,
        under_determined,
    }
}

fn maybe_jolt(
    facet: Facet,
    coords: &mut Array2<f64>,
    fixed: &[bool],
    jolt: Option<&JoltConfig>,
    jolts: &mut usize,
    divergence_unresolved: &mut bool,
    rng: &mut StdRng,
) -> bool {
    let Some(jolt) = jolt else {
        return false;
    };
    if !is_divergent(coords, fixed, jolt.sd_threshold) {
        return false;
    }
    if *jolts >= jolt.max_jolts {
        *divergence_unresolved = true;
        return false;
    }
    log::debug!("Divergent {facet} coordinates detected; jolting");
    *coords = jolt_coordinates(coords, fixed, jolt.noise_scale, rng);
    *jolts += 1;
    true
}

fn finite_norms(coords: &Array2<f64>, fixed: &[bool]) -> Vec<f64> {
    coords
        .rows()
        .into_iter()
        .zip(fixed)
        .filter(|(row, fixed)| !**fixed && row.iter().all(|v| !is_missing(*v)))
        .map(|(row, _)| row.dot(&row).sqrt())
        .collect()
}

/// True when some unanchored entity's vector length is an outlier within its facet.
pub fn is_divergent(coords: &Array2<f64>, fixed: &[bool], sd_threshold: f64) -> bool {
    let norms = finite_norms(coords, fixed);
    if norms.len() < 3 {
        return false;
    }
    match cell::mean_and_sd(&norms) {
        Some((mean, sd)) if sd > 0.0 => norms.iter().any(|&n| n > mean + sd_threshold * sd),
        _ => false,
    }
}

/// Returns a perturbed copy of `coords`. Fixed and unestimated entities are copied as-is.
pub fn jolt_coordinates<R: Rng + ?Sized>(
    coords: &Array2<f64>,
    fixed: &[bool],
    noise_scale: f64,
    rng: &mut R,
) -> Array2<f64> {
    let norms = finite_norms(coords, fixed);
    let mean_norm = if norms.is_empty() {
        1.0
    } else {
        norms.iter().sum::<f64>() / norms.len() as f64
    };
    let amplitude = (noise_scale * mean_norm).abs().max(f64::EPSILON);
    let noise = Uniform::new_inclusive(-amplitude, amplitude);

    let mut jolted = coords.clone();
    for (mut row, &is_fixed) in jolted.rows_mut().into_iter().zip(fixed) {
        if is_fixed || row.iter().any(|v| is_missing(*v)) {
            continue;
        }
        row.mapv_inplace(|v| v + rng.sample(noise));
    }
    jolted
}

/// Orthonormalizes the target facet with a thin QR and pushes the triangular factor into
/// the partner facet, leaving every estimate unchanged.
fn condition(
    target: Facet,
    rows: Array2<f64>,
    cols: Array2<f64>,
) -> Result<(Array2<f64>, Array2<f64>), SolverError> {
    let (mut conditioned, mut partner) = match target {
        Facet::Rows => (rows, cols),
        Facet::Columns => (cols, rows),
    };
    let ndim = conditioned.ncols();
    let valid: Vec<usize> = conditioned
        .rows()
        .into_iter()
        .enumerate()
        .filter(|(_, row)| row.iter().all(|v| !is_missing(*v)))
        .map(|(idx, _)| idx)
        .collect();

    if valid.len() >= ndim {
        let block = conditioned.select(Axis(0), &valid);
        let (q, r) = block.qr().map_err(|source| SolverError::Conditioning {
            facet: target,
            source,
        })?;
        let mut q = q.slice(s![.., ..ndim]).to_owned();
        let mut r = r.slice(s![..ndim, ..ndim]).to_owned();

        let scale = r.diag().iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let singular = r
            .diag()
            .iter()
            .any(|v| v.abs() <= scale * 1e-12 || !v.is_finite());
        if !singular {
            for k in 0..ndim {
                if r[[k, k]] < 0.0 {
                    q.column_mut(k).mapv_inplace(|v| -v);
                    r.row_mut(k).mapv_inplace(|v| -v);
                }
            }
            for (slot, &idx) in valid.iter().enumerate() {
                conditioned.row_mut(idx).assign(&q.row(slot));
            }
            let rt = r.t();
            for mut row in partner.rows_mut() {
                if row.iter().any(|v| is_missing(*v)) {
                    continue;
                }
                let updated = row.dot(&rt);
                row.assign(&updated);
            }
        } else {
            log::debug!("Skipping {target} conditioning: coordinates are rank deficient");
        }
    }

    Ok(match target {
        Facet::Rows => (conditioned, partner),
        Facet::Columns => (partner, conditioned),
    })
}

/// Relative change between two sweeps' coordinates.
///
/// Infinite when an entity moved between estimated and unestimated, or when no entity
/// is estimated on either side.
fn relative_change(pairs: &[(&Array2<f64>, &Array2<f64>)]) -> f64 {
    let mut delta = 0.0;
    let mut base = 0.0;
    let mut compared = 0usize;
    for (previous, next) in pairs {
        for (&a, &b) in previous.iter().zip(next.iter()) {
            match (is_missing(a), is_missing(b)) {
                (true, true) => continue,
                (false, false) => {}
                _ => return f64::INFINITY,
            }
            delta += (b - a) * (b - a);
            base += a * a;
            compared += 1;
        }
    }
    if compared == 0 {
        f64::INFINITY
    } else if base > 0.0 {
        (delta / base).sqrt()
    } else if delta == 0.0 {
        0.0
    } else {
        f64::INFINITY
    }
}

fn all_missing(coords: &Array2<f64>) -> bool {
    coords.iter().all(|v| is_missing(*v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{FacetAnchors, RefreshPolicy};
    use rand_distr::{Distribution, Normal};

    fn generating_coords(n: usize, ndim: usize, rng: &mut StdRng) -> Array2<f64> {
        let normal = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((n, ndim), |_| normal.sample(rng))
    }

    fn exact_matrix(rows: usize, cols: usize, ndim: usize, seed: u64) -> ObservationMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let r = generating_coords(rows, ndim, &mut rng);
        let c = generating_coords(cols, ndim, &mut rng);
        ObservationMatrix::from_values(r.dot(&c.t())).unwrap()
    }

    fn precise_config(ndim: usize) -> SolverConfig {
        SolverConfig {
            ndim,
            tolerance: 1e-12,
            max_sweeps: 200,
            jolt: None,
            ..SolverConfig::default()
        }
    }

    #[test]
    fn exact_low_rank_data_is_reproduced() {
        let matrix = exact_matrix(50, 20, 2, 11);
        let config = precise_config(2);
        let result = AlsSolver::new(&config).run(&matrix).unwrap();

        assert!(result.converged, "sweeps: {:?}", result.sweeps);
        let max_error = result
            .estimates
            .iter()
            .zip(matrix.values().iter())
            .map(|(e, x)| (e - x).abs())
            .fold(0.0_f64, f64::max);
        assert!(max_error < 1e-6, "max reconstruction error {max_error}");
    }

    #[test]
    fn orthonormal_conditioning_holds_after_the_run() {
        let matrix = exact_matrix(30, 12, 3, 5);
        let config = precise_config(3);
        let result = AlsSolver::new(&config).run(&matrix).unwrap();
        let gram = result.col_coords.t().dot(&result.col_coords);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn entities_with_too_few_observations_get_the_sentinel() {
        let full = exact_matrix(30, 12, 2, 3);
        let mut values = full.values().clone();
        for j in 2..12 {
            values[[0, j]] = f64::NAN;
        }
        for j in 1..12 {
            values[[1, j]] = f64::NAN;
        }
        let matrix = full.with_values(values).unwrap();
        let config = precise_config(2);
        let result = AlsSolver::new(&config).run(&matrix).unwrap();

        assert!(result.row_coords.row(0).iter().all(|v| v.is_nan()));
        assert!(result.row_coords.row(1).iter().all(|v| v.is_nan()));
        assert!(result.estimates.row(0).iter().all(|v| v.is_nan()));
        assert!(
            result
                .row_coords
                .rows()
                .into_iter()
                .skip(2)
                .all(|row| row.iter().all(|v| v.is_finite()))
        );
        assert!(result.warnings.contains(&SolverWarning::UnderDetermined {
            facet: Facet::Rows,
            count: 2
        }));
        assert_eq!(result.row_observations[0], 2);
    }

    #[test]
    fn anchored_entities_are_bit_identical_after_the_run() {
        let matrix = exact_matrix(40, 10, 2, 21);
        let config = precise_config(2);
        let first = AlsSolver::new(&config).run(&matrix).unwrap();

        let mut anchors = FacetAnchors::new(2);
        for j in 0..5 {
            let shifted: Vec<f64> = first.col_coords.row(j).iter().map(|v| v + 0.123).collect();
            anchors.insert(matrix.col_keys()[j].clone(), shifted).unwrap();
        }
        let set = AnchorSet::for_facet(Facet::Columns, anchors.clone());
        let anchored = AlsSolver::new(&config.with_seed(99))
            .with_anchors(&set)
            .run(&matrix)
            .unwrap();

        for j in 0..5 {
            let expected = anchors.get(&matrix.col_keys()[j]).unwrap();
            for (got, want) in anchored.col_coords.row(j).iter().zip(expected) {
                assert_eq!(got.to_bits(), want.to_bits());
            }
            assert!(anchored.col_anchored[j]);
        }
        assert!(!anchored.col_anchored[7]);

        let refreshed_set =
            AnchorSet::for_facet(Facet::Columns, anchors.with_refresh(RefreshPolicy::All));
        let refreshed = AlsSolver::new(&config)
            .with_anchors(&refreshed_set)
            .run(&matrix)
            .unwrap();
        assert!(refreshed.col_anchored.iter().all(|&a| !a));
    }

    #[test]
    fn anchor_dimension_mismatch_is_fatal() {
        let matrix = exact_matrix(10, 6, 2, 1);
        let mut anchors = FacetAnchors::new(3);
        anchors.insert("C0", vec![0.0, 1.0, 2.0]).unwrap();
        let set = AnchorSet::for_facet(Facet::Columns, anchors);
        let config = precise_config(2);
        let err = AlsSolver::new(&config)
            .with_anchors(&set)
            .run(&matrix)
            .unwrap_err();
        assert!(matches!(
            err,
            SolverError::AnchorDimension {
                expected: 2,
                found: 3,
                ..
            }
        ));
    }

    #[test]
    fn exhausted_sweep_budget_is_reported_not_raised() {
        let matrix = exact_matrix(20, 8, 2, 8);
        let config = SolverConfig {
            tolerance: 0.0,
            max_sweeps: 2,
            ..precise_config(2)
        };
        let result = AlsSolver::new(&config).run(&matrix).unwrap();
        assert!(!result.converged);
        assert_eq!(result.sweeps_used(), 2);
        assert!(
            result
                .warnings
                .iter()
                .any(|w| matches!(w, SolverWarning::NotConverged { sweeps: 2, .. }))
        );
    }

    #[test]
    fn identical_seeds_give_identical_runs() {
        let full = exact_matrix(25, 10, 2, 4);
        let mut values = full.values().clone();
        values[[3, 4]] = f64::NAN;
        values[[7, 1]] = f64::NAN;
        let matrix = full.with_values(values).unwrap();
        let config = SolverConfig {
            ndim: 2,
            ..SolverConfig::default()
        };
        let a = AlsSolver::new(&config).run(&matrix).unwrap();
        let b = AlsSolver::new(&config).run(&matrix).unwrap();
        assert_eq!(a.row_coords, b.row_coords);
        assert_eq!(a.col_coords, b.col_coords);
    }

    #[test]
    fn jolt_is_a_pure_transformation_that_skips_fixed_entities() {
        let coords = Array2::from_shape_fn((6, 2), |(i, j)| (i + j) as f64);
        let fixed = vec![true, false, false, false, false, true];
        let mut rng = StdRng::seed_from_u64(0);
        let jolted = jolt_coordinates(&coords, &fixed, 0.5, &mut rng);

        assert_eq!(coords, Array2::from_shape_fn((6, 2), |(i, j)| (i + j) as f64));
        assert_eq!(jolted.row(0), coords.row(0));
        assert_eq!(jolted.row(5), coords.row(5));
        assert_ne!(jolted.row(2), coords.row(2));
    }

    #[test]
    fn outlying_norms_are_divergent() {
        let mut coords = Array2::from_elem((30, 2), 1.0);
        assert!(!is_divergent(&coords, &vec![false; 30], 4.0));
        coords[[4, 0]] = 1e6;
        assert!(is_divergent(&coords, &vec![false; 30], 4.0));
        let mut fixed = vec![false; 30];
        fixed[4] = true;
        assert!(!is_divergent(&coords, &fixed, 4.0));
    }

    #[test]
    fn a_solution_with_nothing_estimated_is_not_converged() {
        // Two observations per row at D = 2: every row is under-determined, and the
        // columns then have no estimated partners left.
        let values = Array2::from_shape_fn((5, 2), |(r, c)| (r + 2 * c) as f64 + 1.0);
        let matrix = ObservationMatrix::from_values(values).unwrap();
        let result = AlsSolver::new(&precise_config(2)).run(&matrix).unwrap();

        assert!(!result.converged);
        assert_eq!(result.sweeps_used(), 1);
        assert_eq!(result.final_change(), f64::INFINITY);
        assert_eq!(result.under_determined(Facet::Rows), 5);
        assert_eq!(result.under_determined(Facet::Columns), 2);
        assert!(
            result
                .warnings
                .iter()
                .any(|w| matches!(w, SolverWarning::NotConverged { sweeps: 1, .. }))
        );
    }

    #[test]
    fn losing_an_estimate_counts_as_change() {
        let before = Array2::from_elem((3, 2), 1.0);
        let mut after = before.clone();
        assert_eq!(relative_change(&[(&before, &after)]), 0.0);

        after.row_mut(1).fill(MISSING);
        assert_eq!(relative_change(&[(&before, &after)]), f64::INFINITY);
        assert_eq!(relative_change(&[(&after, &before)]), f64::INFINITY);

        let empty = Array2::from_elem((3, 2), MISSING);
        assert_eq!(relative_change(&[(&empty, &empty)]), f64::INFINITY);
    }

    #[test]
    fn divergent_rows_are_jolted_up_to_the_cap() {
        let full = exact_matrix(30, 12, 2, 13);
        let mut values = full.values().clone();
        values.row_mut(0).mapv_inplace(|v| v * 1e4);
        let matrix = full.with_values(values).unwrap();
        let config = SolverConfig {
            max_sweeps: 20,
            jolt: Some(JoltConfig {
                sd_threshold: 3.0,
                noise_scale: 0.1,
                max_jolts: 1,
            }),
            ..precise_config(2)
        };
        let result = AlsSolver::new(&config).run(&matrix).unwrap();

        assert!(result.sweeps[0].jolted_rows, "{:?}", result.sweeps);
        let jolted: usize = result
            .sweeps
            .iter()
            .map(|record| usize::from(record.jolted_rows) + usize::from(record.jolted_cols))
            .sum();
        assert_eq!(jolted, 1);
        assert!(result.sweeps_used() > 1);
        assert!(
            result
                .warnings
                .contains(&SolverWarning::DivergenceUnresolved { jolts: 1 })
        );
        assert!(result.estimates.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn damped_weighting_changes_the_fit_only_around_large_partners() {
        let full = exact_matrix(30, 12, 2, 17);
        let mut rng = StdRng::seed_from_u64(5);
        let noise = Normal::new(0.0, 0.2).unwrap();
        let noisy = full.values().mapv(|v| v + noise.sample(&mut rng));

        let mut outlying = noisy.clone();
        outlying.row_mut(0).mapv_inplace(|v| v * 50.0);
        let outlying = full.with_values(outlying).unwrap();
        let uniform = SolverConfig {
            tolerance: 1e-8,
            max_sweeps: 50,
            ..precise_config(2)
        };
        let damped = SolverConfig {
            weighting: ObservationWeighting::DampLargePartners { sd_threshold: 3.0 },
            ..uniform.clone()
        };
        let plain = AlsSolver::new(&uniform).run(&outlying).unwrap();
        let weighted = AlsSolver::new(&damped).run(&outlying).unwrap();
        assert_ne!(plain.col_coords, weighted.col_coords);

        // No norm in 30 rows or 12 columns can sit six deviations above the mean.
        let calm = full.with_values(noisy).unwrap();
        let lenient = SolverConfig {
            weighting: ObservationWeighting::DampLargePartners { sd_threshold: 6.0 },
            ..uniform.clone()
        };
        let plain = AlsSolver::new(&uniform).run(&calm).unwrap();
        let weighted = AlsSolver::new(&lenient).run(&calm).unwrap();
        assert_eq!(plain.col_coords, weighted.col_coords);
    }

    #[test]
    fn surplus_dimensions_on_exact_data_keep_every_entity() {
        let matrix = exact_matrix(30, 12, 2, 19);
        let result = AlsSolver::new(&precise_config(3)).run(&matrix).unwrap();

        assert_eq!(result.under_determined(Facet::Rows), 0);
        assert_eq!(result.under_determined(Facet::Columns), 0);
        let max_error = result
            .estimates
            .iter()
            .zip(matrix.values().iter())
            .map(|(e, x)| (e - x).abs())
            .fold(0.0_f64, f64::max);
        assert!(max_error < 1e-6, "max reconstruction error {max_error}");
    }
}
