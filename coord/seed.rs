//! # Seed Selection
//!
//! At a fixed dimensionality, ALS can settle into a poor local solution depending on
//! where it starts. The seed selector runs independent attempts from successive seeds,
//! scores each with the same statistics as the dimensionality search, and keeps the first
//! attempt whose score clears the threshold. Attempts run in parallel batches sized to the
//! rayon pool; within a batch the lowest attempt number wins, so the outcome does not
//! depend on thread count.

use crate::als::{AlsSolver, SolverConfig, SolverError, SolverResult};
use crate::anchor::AnchorSet;
use crate::progress::{SolverProgressObserver, SolverStage};
use crate::pseudomiss::{PseudoMissConfig, PseudoMissError, PseudoMissMask};
use crate::stats::{self, ObjectivityStats, SelectionCriterion};
use crate::types::ObservationMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub max_attempts: usize,
    /// An attempt whose score reaches this value ends the search.
    pub min_correlation: f64,
    pub first_seed: u64,
    /// Withheld cells for scoring accuracy; `None` scores in-sample.
    pub pseudo_missing: Option<PseudoMissConfig>,
    pub criterion: SelectionCriterion,
    pub split_seed: u64,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_correlation: 0.9,
            first_seed: 1,
            pseudo_missing: Some(PseudoMissConfig::default()),
            criterion: SelectionCriterion::Objectivity,
            split_seed: 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("The seed search needs at least one attempt.")]
    NoAttempts,

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    PseudoMiss(#[from] PseudoMissError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedAttempt {
    pub attempt: usize,
    pub seed: u64,
    pub stats: ObjectivityStats,
    pub sweeps: usize,
    pub converged: bool,
}

#[derive(Debug, Clone)]
pub struct SeedSearchResult {
    pub best_seed: u64,
    pub best: SeedAttempt,
    /// Fit from the chosen seed with nothing withheld.
    pub fit: SolverResult,
    /// Every attempt made, in attempt order.
    pub attempts: Vec<SeedAttempt>,
    pub objectivity_confirmed: bool,
}

pub struct SeedSelector<'a> {
    config: &'a SeedConfig,
    solver: &'a SolverConfig,
    anchors: Option<&'a AnchorSet>,
    observer: Option<&'a mut dyn SolverProgressObserver>,
}

impl<'a> SeedSelector<'a> {
    pub fn new(config: &'a SeedConfig, solver: &'a SolverConfig) -> Self {
        Self {
            config,
            solver,
            anchors: None,
            observer: None,
        }
    }

    pub fn with_anchors(mut self, anchors: &'a AnchorSet) -> Self {
        self.anchors = Some(anchors);
        self
    }

    pub fn with_observer(mut self, observer: &'a mut dyn SolverProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn run(mut self, matrix: &ObservationMatrix) -> Result<SeedSearchResult, SeedError> {
        let config = self.config;
        if config.max_attempts == 0 {
            return Err(SeedError::NoAttempts);
        }
        let mask = config
            .pseudo_missing
            .as_ref()
            .map(|pm| PseudoMissMask::random(matrix, pm))
            .transpose()?;

        let mut observer = self.observer.take();
        if let Some(obs) = observer.as_deref_mut() {
            obs.on_stage_start(SolverStage::SeedSearch, config.max_attempts);
        }

        let batch = rayon::current_num_threads().max(1);
        let (solver, anchors) = (self.solver, self.anchors);
        let mut attempts: Vec<SeedAttempt> = Vec::new();
        let mut best: Option<(SeedAttempt, SolverResult)> = None;
        let mut winner: Option<(SeedAttempt, SolverResult)> = None;

        let mut start = 0usize;
        while start < config.max_attempts && winner.is_none() {
            let end = (start + batch).min(config.max_attempts);
            let outcomes = (start..end)
                .into_par_iter()
                .map(|attempt| run_attempt(config, solver, anchors, matrix, mask.as_ref(), attempt))
                .collect::<Result<Vec<_>, _>>()?;

            for (attempt, fit) in outcomes {
                attempts.push(attempt.clone());
                let score = attempt.stats.value(config.criterion);
                if winner.is_none() && score.is_some_and(|s| s >= config.min_correlation) {
                    winner = Some((attempt.clone(), fit.clone()));
                }
                let improves = match (&best, score) {
                    (None, _) => true,
                    (Some((current, _)), Some(s)) => current
                        .stats
                        .value(config.criterion)
                        .is_none_or(|c| s > c),
                    (Some(_), None) => false,
                };
                if improves {
                    best = Some((attempt, fit));
                }
            }

            if let Some(obs) = observer.as_deref_mut() {
                obs.on_stage_advance(SolverStage::SeedSearch, end);
            }
            start = end;
        }

        if let Some(obs) = observer.as_deref_mut() {
            obs.on_stage_finish(SolverStage::SeedSearch);
        }

        let objectivity_confirmed = winner.is_some();
        let Some((chosen, fit)) = winner.or(best) else {
            return Err(SeedError::NoAttempts);
        };
        if !objectivity_confirmed {
            log::warn!(
                "No seed out of {} reached {:.3}; keeping seed {} (score {:?}); objective solution not confirmed",
                attempts.len(),
                config.min_correlation,
                chosen.seed,
                chosen.stats.value(config.criterion)
            );
        } else {
            log::info!(
                "Seed {} accepted after {} attempts (score {:?})",
                chosen.seed,
                attempts.len(),
                chosen.stats.value(config.criterion)
            );
        }

        let fit = if mask.is_some() {
            let unmasked = solver.with_seed(chosen.seed);
            let mut run = AlsSolver::new(&unmasked);
            if let Some(anchors) = anchors {
                run = run.with_anchors(anchors);
            }
            run.run(matrix)?
        } else {
            fit
        };

        Ok(SeedSearchResult {
            best_seed: chosen.seed,
            best: chosen,
            fit,
            attempts,
            objectivity_confirmed,
        })
    }
}

fn run_attempt(
    config: &SeedConfig,
    solver: &SolverConfig,
    anchors: Option<&AnchorSet>,
    matrix: &ObservationMatrix,
    mask: Option<&PseudoMissMask>,
    attempt: usize,
) -> Result<(SeedAttempt, SolverResult), SolverError> {
    let seed = config.first_seed.wrapping_add(attempt as u64);
    let seeded = solver.with_seed(seed);
    let mut run = AlsSolver::new(&seeded).with_optional_pseudo_missing(mask);
    if let Some(anchors) = anchors {
        run = run.with_anchors(anchors);
    }
    let fit = run.run(matrix)?;

    let accuracy = stats::accuracy(matrix, mask, &fit.estimates);
    let stability = stats::stability(matrix, mask, &seeded, config.split_seed)?;
    let attempt = SeedAttempt {
        attempt,
        seed,
        stats: ObjectivityStats::new(accuracy, stability),
        sweeps: fit.sweeps_used(),
        converged: fit.converged,
    };
    log::debug!("Seed attempt {attempt:?}");
    Ok((attempt, fit))
}
