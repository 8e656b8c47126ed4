//! Progress reporting for long fits.
//!
//! Each stage counts finished units (sweeps, candidate dimensionalities, seeds, error
//! passes) against an upper bound. A solve that converges early finishes short of it.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SolverStage {
    Sweeps,
    DimensionSearch,
    SeedSearch,
    ErrorModel,
}

impl SolverStage {
    /// What one step of this stage counts.
    pub fn unit(self) -> &'static str {
        match self {
            Self::Sweeps => "sweeps",
            Self::DimensionSearch => "candidates",
            Self::SeedSearch => "seeds",
            Self::ErrorModel => "passes",
        }
    }
}

impl fmt::Display for SolverStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sweeps => "ALS",
            Self::DimensionSearch => "dimensionality search",
            Self::SeedSearch => "seed search",
            Self::ErrorModel => "error model",
        })
    }
}

/// Receives progress from the solver and the searches built on it.
pub trait SolverProgressObserver {
    fn on_stage_start(&mut self, _stage: SolverStage, _total: usize) {}
    fn on_stage_advance(&mut self, _stage: SolverStage, _done: usize) {}
    fn on_stage_finish(&mut self, _stage: SolverStage) {}
}
