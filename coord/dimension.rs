//! # Dimensionality Selection
//!
//! Fits the matrix at several candidate dimensionalities, scores each fit on withheld
//! cells and split-half stability, and keeps the dimensionality with the best score.
//!
//! Two search modes are available. Brute force evaluates every candidate and is the
//! safe default. Bisection assumes the score rises and then falls as D grows and tries
//! pairs of neighbouring candidates to follow the slope, which is cheaper but can settle
//! on a local peak when the curve is bumpy. Either way the reported D is the best one
//! actually evaluated.
//!
//! Homogenizing replaces the matrix by a symmetric matrix of mean cross-products between
//! the entities of the smaller facet before searching. Optionally, the coordinates found
//! on that matrix are then used as anchors to recover full coordinates on the original.

use crate::als::{AlsSolver, SolverConfig, SolverError, SolverResult};
use crate::anchor::{AnchorError, AnchorSet, FacetAnchors};
use crate::progress::{SolverProgressObserver, SolverStage};
use crate::pseudomiss::{MaskScope, PseudoMissConfig, PseudoMissError, PseudoMissMask};
use crate::stats::{self, ObjectivityStats, SelectionCriterion};
use crate::types::{Facet, MISSING, MatrixError, ObservationMatrix, is_missing};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc;
use std::thread;
use thiserror::Error;

/// Score differences below this are treated as no difference when judging the curve.
const FLAT_SPREAD: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SearchMode {
    #[default]
    BruteForce,
    Bisection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Homogenize {
    #[default]
    Off,
    /// Search and fit on the cross-product matrix only.
    Reduce,
    /// Search on the cross-product matrix, then anchor the original matrix's smaller
    /// facet on the result and fit it at the chosen dimensionality.
    ReduceAndRecover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub candidates: Vec<usize>,
    pub mode: SearchMode,
    pub criterion: SelectionCriterion,
    pub homogenize: Homogenize,
    pub pseudo_missing: PseudoMissConfig,
    /// Best objectivity below this is flagged as not confirmed.
    pub min_objectivity: f64,
    /// Seed for the column split of the stability statistic.
    pub split_seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidates: (1..=6).collect(),
            mode: SearchMode::BruteForce,
            criterion: SelectionCriterion::Objectivity,
            homogenize: Homogenize::Off,
            pseudo_missing: PseudoMissConfig::default(),
            min_objectivity: 0.5,
            split_seed: 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("No candidate dimensionalities were given.")]
    EmptyCandidates,

    #[error("Candidate dimensionality {0} is invalid; candidates must be at least 1.")]
    InvalidCandidate(usize),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    PseudoMiss(#[from] PseudoMissError),

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Anchor(#[from] AnchorError),
}

/// One row of the per-dimension statistics table.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionStats {
    pub ndim: usize,
    pub accuracy: Option<f64>,
    pub stability: Option<f64>,
    pub objectivity: Option<f64>,
    pub sweeps: usize,
    pub converged: bool,
    pub final_change: f64,
}

impl DimensionStats {
    fn from_fit(fit: &SolverResult, stats: ObjectivityStats) -> Self {
        Self {
            ndim: fit.ndim,
            accuracy: stats.accuracy,
            stability: stats.stability,
            objectivity: stats.objectivity,
            sweeps: fit.sweeps_used(),
            converged: fit.converged,
            final_change: fit.final_change(),
        }
    }

    pub fn stats(&self) -> ObjectivityStats {
        ObjectivityStats {
            accuracy: self.accuracy,
            stability: self.stability,
            objectivity: self.objectivity,
        }
    }

    pub fn score(&self, criterion: SelectionCriterion) -> Option<f64> {
        self.stats().value(criterion)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchWarning {
    FlatObjectivity { spread: f64 },
    NonUnimodal,
    UndefinedStatistics { ndim: usize },
    ObjectiveSolutionNotConfirmed { best: Option<f64>, threshold: f64 },
}

impl fmt::Display for SearchWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlatObjectivity { spread } => write!(
                f,
                "the score barely changes across candidates (spread {spread:.2e}); the choice of dimensionality is weakly supported"
            ),
            Self::NonUnimodal => write!(
                f,
                "the score rises again after falling; a bisection search may have missed the best dimensionality"
            ),
            Self::UndefinedStatistics { ndim } => {
                write!(f, "statistics could not be computed at {ndim} dimensions")
            }
            Self::ObjectiveSolutionNotConfirmed { best, threshold } => match best {
                Some(best) => write!(
                    f,
                    "best objectivity {best:.3} is below the threshold {threshold:.3}; objective solution not confirmed"
                ),
                None => write!(f, "no candidate produced an objectivity score"),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DimensionSearchResult {
    pub ndim: usize,
    /// Evaluated candidates in ascending order of D.
    pub table: Vec<DimensionStats>,
    /// Final fit at the chosen D without any withheld cells.
    pub fit: SolverResult,
    pub warnings: Vec<SearchWarning>,
    pub objectivity_confirmed: bool,
    /// Set when `fit` was computed on the cross-product matrix rather than the input.
    pub homogenized: bool,
}

impl DimensionSearchResult {
    pub fn stats_for(&self, ndim: usize) -> Option<&DimensionStats> {
        self.table.iter().find(|row| row.ndim == ndim)
    }
}

pub struct DimensionSelector<'a> {
    search: &'a SearchConfig,
    solver: &'a SolverConfig,
    observer: Option<&'a mut dyn SolverProgressObserver>,
}

impl<'a> DimensionSelector<'a> {
    pub fn new(search: &'a SearchConfig, solver: &'a SolverConfig) -> Self {
        Self {
            search,
            solver,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: &'a mut dyn SolverProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn run(mut self, matrix: &ObservationMatrix) -> Result<DimensionSearchResult, SearchError> {
        let candidates = validated_candidates(&self.search.candidates)?;

        let homogenized = match self.search.homogenize {
            Homogenize::Off => None,
            Homogenize::Reduce | Homogenize::ReduceAndRecover => Some(homogenize(matrix)?),
        };
        let working = homogenized.as_ref().map_or(matrix, |(h, _)| h);

        let mut mask_config = self.search.pseudo_missing.clone();
        if homogenized.is_some() && mask_config.scope != MaskScope::All {
            log::warn!("Pseudo-missing scope is ignored on a homogenized matrix; withholding from all cells");
            mask_config.scope = MaskScope::All;
        }
        let mask = PseudoMissMask::random(working, &mask_config)?;
        log::info!(
            "Searching {} candidate dimensionalities ({:?}, {:?}) with {} withheld cells",
            candidates.len(),
            self.search.mode,
            self.search.criterion,
            mask.count()
        );

        let mut observer = self.observer.take();
        if let Some(obs) = observer.as_deref_mut() {
            obs.on_stage_start(SolverStage::DimensionSearch, candidates.len());
        }

        let (search, solver) = (self.search, self.solver);
        let table = match search.mode {
            SearchMode::BruteForce => brute_force(
                search,
                solver,
                working,
                &mask,
                &candidates,
                observer.as_deref_mut(),
            )?,
            SearchMode::Bisection => bisect(
                search,
                solver,
                working,
                &mask,
                &candidates,
                observer.as_deref_mut(),
            )?,
        };

        if let Some(obs) = observer.as_deref_mut() {
            obs.on_stage_finish(SolverStage::DimensionSearch);
        }

        let criterion = self.search.criterion;
        let chosen = choose(&table, criterion).unwrap_or(candidates[0]);
        let mut warnings = curve_warnings(&table, criterion);
        let best_objectivity = table
            .iter()
            .find(|row| row.ndim == chosen)
            .and_then(|row| row.objectivity);
        let objectivity_confirmed =
            best_objectivity.is_some_and(|value| value >= self.search.min_objectivity);
        if !objectivity_confirmed {
            warnings.push(SearchWarning::ObjectiveSolutionNotConfirmed {
                best: best_objectivity,
                threshold: self.search.min_objectivity,
            });
        }
        for warning in &warnings {
            log::warn!("Dimensionality search: {warning}");
        }

        let config = self.solver.with_ndim(chosen);
        let (fit, fit_is_homogenized) = match (&homogenized, self.search.homogenize) {
            (Some((reduced, facet)), Homogenize::ReduceAndRecover) => {
                let reduced_fit = AlsSolver::new(&config).run(reduced)?;
                let anchors = recovery_anchors(&reduced_fit, *facet)?;
                let fit = AlsSolver::new(&config).with_anchors(&anchors).run(matrix)?;
                (fit, false)
            }
            (Some((reduced, _)), _) => (AlsSolver::new(&config).run(reduced)?, true),
            (None, _) => (AlsSolver::new(&config).run(matrix)?, false),
        };

        log::info!(
            "Selected {chosen} dimensions (objectivity {:?}, confirmed: {objectivity_confirmed})",
            best_objectivity
        );

        Ok(DimensionSearchResult {
            ndim: chosen,
            table,
            fit,
            warnings,
            objectivity_confirmed,
            homogenized: fit_is_homogenized,
        })
    }
}

fn evaluate(
    search: &SearchConfig,
    solver: &SolverConfig,
    matrix: &ObservationMatrix,
    mask: &PseudoMissMask,
    ndim: usize,
) -> Result<DimensionStats, SearchError> {
    let config = solver.with_ndim(ndim);
    let assessment = stats::assess(matrix, Some(mask), &config, search.split_seed)?;
    Ok(DimensionStats::from_fit(&assessment.fit, assessment.stats))
}

/// Evaluates every candidate in parallel. Finished candidates are reported from the
/// calling thread as they complete; the table comes back in candidate order.
fn brute_force<'o>(
    search: &SearchConfig,
    solver: &SolverConfig,
    matrix: &ObservationMatrix,
    mask: &PseudoMissMask,
    candidates: &[usize],
    mut observer: Option<&mut (dyn SolverProgressObserver + 'o)>,
) -> Result<Vec<DimensionStats>, SearchError> {
    let (finished, done) = mpsc::channel::<usize>();
    thread::scope(|scope| {
        let worker = scope.spawn(move || {
            candidates
                .par_iter()
                .map_with(finished, |finished, &ndim| {
                    let row = evaluate(search, solver, matrix, mask, ndim);
                    finished.send(ndim).ok();
                    row
                })
                .collect::<Result<Vec<_>, _>>()
        });
        for (count, ndim) in done.iter().enumerate() {
            log::debug!("Candidate {ndim}D evaluated");
            if let Some(obs) = observer.as_deref_mut() {
                obs.on_stage_advance(SolverStage::DimensionSearch, count + 1);
            }
        }
        worker
            .join()
            .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
    })
}

/// Follows the score slope between neighbouring candidates. Every evaluated candidate is
/// kept, so the caller picks the best D seen rather than the last one tried.
fn bisect<'o>(
    search: &SearchConfig,
    solver: &SolverConfig,
    matrix: &ObservationMatrix,
    mask: &PseudoMissMask,
    candidates: &[usize],
    mut observer: Option<&mut (dyn SolverProgressObserver + 'o)>,
) -> Result<Vec<DimensionStats>, SearchError> {
    let criterion = search.criterion;
    let mut seen: BTreeMap<usize, DimensionStats> = BTreeMap::new();
    let mut score_at =
        |idx: usize, seen: &mut BTreeMap<usize, DimensionStats>| -> Result<f64, SearchError> {
            let ndim = candidates[idx];
            if !seen.contains_key(&ndim) {
                let row = evaluate(search, solver, matrix, mask, ndim)?;
                seen.insert(ndim, row);
                if let Some(obs) = observer.as_deref_mut() {
                    obs.on_stage_advance(SolverStage::DimensionSearch, seen.len());
                }
            }
            Ok(seen
                .get(&ndim)
                .and_then(|row| row.score(criterion))
                .unwrap_or(f64::NEG_INFINITY))
        };

    let (mut lo, mut hi) = (0usize, candidates.len() - 1);
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        let here = score_at(mid, &mut seen)?;
        let next = score_at(mid + 1, &mut seen)?;
        if next > here {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    score_at(lo, &mut seen)?;
    score_at(hi, &mut seen)?;

    log::debug!(
        "Bisection evaluated {} of {} candidates",
        seen.len(),
        candidates.len()
    );
    Ok(seen.into_values().collect())
}

fn validated_candidates(candidates: &[usize]) -> Result<Vec<usize>, SearchError> {
    if candidates.is_empty() {
        return Err(SearchError::EmptyCandidates);
    }
    if let Some(&bad) = candidates.iter().find(|&&d| d == 0) {
        return Err(SearchError::InvalidCandidate(bad));
    }
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    Ok(sorted)
}

/// Highest-scoring dimensionality; ties go to the smaller D.
pub fn choose(table: &[DimensionStats], criterion: SelectionCriterion) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for row in table {
        let Some(score) = row.score(criterion) else {
            continue;
        };
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((row.ndim, score)),
        }
    }
    best.map(|(ndim, _)| ndim)
}

/// Warnings about the shape of the score curve. `table` must be sorted by D.
pub fn curve_warnings(table: &[DimensionStats], criterion: SelectionCriterion) -> Vec<SearchWarning> {
    let mut warnings: Vec<SearchWarning> = table
        .iter()
        .filter(|row| row.score(criterion).is_none())
        .map(|row| SearchWarning::UndefinedStatistics { ndim: row.ndim })
        .collect();

    let scores: Vec<f64> = table.iter().filter_map(|row| row.score(criterion)).collect();
    if scores.len() >= 2 {
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        if max - min < FLAT_SPREAD {
            warnings.push(SearchWarning::FlatObjectivity { spread: max - min });
        }

        let mut falling = false;
        for pair in scores.windows(2) {
            let step = pair[1] - pair[0];
            if step < -FLAT_SPREAD {
                falling = true;
            } else if step > FLAT_SPREAD && falling {
                warnings.push(SearchWarning::NonUnimodal);
                break;
            }
        }
    }
    warnings
}

/// Mean cross-products between the entities of the smaller facet, over the cells both
/// entities observe. Returns the square matrix and the facet it was built along.
///
/// Both axes of the result carry the smaller facet's keys. Pairs with no shared
/// observation are missing.
pub fn homogenize(matrix: &ObservationMatrix) -> Result<(ObservationMatrix, Facet), MatrixError> {
    let facet = if matrix.n_cols() <= matrix.n_rows() {
        Facet::Columns
    } else {
        Facet::Rows
    };
    let n = matrix.len(facet);

    let entries: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|j| {
            let a = matrix.entity(facet, j);
            (0..n)
                .map(|k| {
                    let b = matrix.entity(facet, k);
                    let (sum, count) = a.iter().zip(b.iter()).fold(
                        (0.0, 0usize),
                        |(sum, count), (&x, &y)| {
                            if is_missing(x) || is_missing(y) {
                                (sum, count)
                            } else {
                                (sum + x * y, count + 1)
                            }
                        },
                    );
                    if count == 0 {
                        MISSING
                    } else {
                        sum / count as f64
                    }
                })
                .collect()
        })
        .collect();

    let values = Array2::from_shape_fn((n, n), |(j, k)| entries[j][k]);
    let keys = matrix.keys(facet).to_vec();
    log::info!(
        "Homogenized a {}x{} matrix into a {n}x{n} {facet} cross-product matrix",
        matrix.n_rows(),
        matrix.n_cols()
    );
    Ok((ObservationMatrix::new(values, keys.clone(), keys)?, facet))
}

/// Anchors for `facet` of the original matrix, taken from the column coordinates of a
/// fit on its cross-product matrix.
fn recovery_anchors(reduced_fit: &SolverResult, facet: Facet) -> Result<AnchorSet, SearchError> {
    let mut anchors = FacetAnchors::new(reduced_fit.ndim);
    for (key, row) in reduced_fit
        .col_keys
        .iter()
        .zip(reduced_fit.col_coords.rows())
    {
        if row.iter().any(|v| is_missing(*v)) {
            continue;
        }
        anchors.insert(key.clone(), row.to_vec())?;
    }
    Ok(AnchorSet::for_facet(facet, anchors))
}
