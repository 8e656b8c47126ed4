//! Constructs: named scales built by summing the coordinate vectors of a chosen subset of
//! one facet's entities.
//!
//! A construct behaves like one more entity of its facet. Its score against an entity of
//! the opposite facet is the dot product of the two vectors, exactly like a cell estimate.
//! Its EAR and SE coordinates are solved as if it were a virtual column (or row) whose
//! per-cell error is the root-sum-square of its members' errors.

use super::store::{Bank, BankError, CoordKind};
use crate::als::SolverResult;
use crate::cell::{self, ObservationWeighting};
use crate::types::{Facet, MISSING, is_missing};
use crate::variance::{ERROR_NDIM, ErrorEstimates};
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

/// Where constructs draw coordinates from.
#[derive(Debug, Clone, Copy)]
pub enum ConstructSource<'a> {
    Bank(&'a Bank),
    Fit {
        fit: &'a SolverResult,
        errors: Option<&'a ErrorEstimates>,
    },
}

impl ConstructSource<'_> {
    pub fn ndim(&self) -> usize {
        match self {
            Self::Bank(bank) => bank.ndim,
            Self::Fit { fit, .. } => fit.ndim,
        }
    }

    /// Keyed vectors of one kind for `facet`. Empty when the source has none.
    pub fn coordinates(&self, facet: Facet, kind: CoordKind) -> BTreeMap<String, Vec<f64>> {
        match self {
            Self::Bank(bank) => bank.facet(facet).coords(kind).clone(),
            Self::Fit { fit, errors } => match kind {
                CoordKind::Entity => fit.coordinate_map(facet),
                CoordKind::Ear => errors.map_or_else(BTreeMap::new, |e| e.ear_coordinate_map(facet)),
                CoordKind::Se => errors.map_or_else(BTreeMap::new, |e| e.se_coordinate_map(facet)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Construct {
    pub label: String,
    pub facet: Facet,
    pub members: Vec<String>,
    pub coords: Vec<f64>,
    pub ear_coords: Option<Vec<f64>>,
    pub se_coords: Option<Vec<f64>>,
}

/// Scores of a construct against every entity of the opposite facet, keyed in sorted
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstructScores {
    pub keys: Vec<String>,
    pub estimates: Vec<f64>,
    pub ear: Option<Vec<f64>>,
    pub se: Option<Vec<f64>>,
}

impl ConstructScores {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.keys
            .iter()
            .position(|k| k == key)
            .map(|idx| self.estimates[idx])
    }
}

/// Sums the coordinates of `members` (entities of `facet`) into a construct.
///
/// Every member must exist in the source with finite coordinates. Error coordinates are
/// derived when the source carries them for the members and the opposite facet.
pub fn build_construct(
    source: &ConstructSource<'_>,
    facet: Facet,
    members: &[String],
    label: impl Into<String>,
) -> Result<Construct, BankError> {
    let label = label.into();
    if members.is_empty() {
        return Err(BankError::EmptyConstruct { label });
    }

    let entity = source.coordinates(facet, CoordKind::Entity);
    let missing: Vec<String> = members
        .iter()
        .filter(|key| !entity.contains_key(*key))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(BankError::MissingKeys {
            facet,
            kind: CoordKind::Entity,
            keys: missing,
        });
    }

    let mut coords = vec![0.0; source.ndim()];
    for key in members {
        let vector = &entity[key];
        if vector.iter().any(|v| is_missing(*v)) {
            return Err(BankError::NonFinite {
                facet,
                key: key.clone(),
            });
        }
        for (sum, v) in coords.iter_mut().zip(vector) {
            *sum += v;
        }
    }

    let ear_coords = combined_error_coords(source, facet, members, CoordKind::Ear);
    let se_coords = combined_error_coords(source, facet, members, CoordKind::Se);
    log::info!(
        "Built construct '{label}' from {} {facet} entities (error coordinates: {})",
        members.len(),
        ear_coords.is_some()
    );

    Ok(Construct {
        label,
        facet,
        members: members.to_vec(),
        coords,
        ear_coords,
        se_coords,
    })
}

/// Solves the construct's error vector against the opposite facet's error coordinates so
/// that `exp(a . e) ≈ sqrt(sum_j exp(2 a . b_j))` for every opposite entity `a`.
fn combined_error_coords(
    source: &ConstructSource<'_>,
    facet: Facet,
    members: &[String],
    kind: CoordKind,
) -> Option<Vec<f64>> {
    let own = source.coordinates(facet, kind);
    let opposite = source.coordinates(facet.opposite(), kind);
    let member_vectors: Vec<&Vec<f64>> = members.iter().filter_map(|key| own.get(key)).collect();
    if member_vectors.len() != members.len() || opposite.is_empty() {
        return None;
    }

    let partners: Vec<&Vec<f64>> = opposite
        .values()
        .filter(|v| v.iter().all(|x| !is_missing(*x)))
        .collect();
    let partner_coords = Array2::from_shape_fn((partners.len(), ERROR_NDIM), |(i, k)| partners[i][k]);
    let target: Array1<f64> = partners
        .iter()
        .map(|a| {
            let total: f64 = member_vectors
                .iter()
                .map(|b| (2.0 * dot(a, b)).exp())
                .sum();
            if total > 0.0 && total.is_finite() {
                0.5 * total.ln()
            } else {
                MISSING
            }
        })
        .collect();
    let usable = target.mapv(|t| !is_missing(t));
    let weights = cell::partner_weights(partner_coords.view(), ObservationWeighting::Uniform);

    match cell::solve_entity(
        partner_coords.view(),
        target.view(),
        usable.view(),
        weights.view(),
    ) {
        Ok(solution) => Some(solution.to_vec()),
        Err(err) => {
            log::warn!("Could not derive {kind} for a {facet} construct: {err}");
            None
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl Construct {
    /// Scores this construct against every opposite-facet entity known to `source`.
    pub fn score(&self, source: &ConstructSource<'_>) -> ConstructScores {
        let opposite = self.facet.opposite();
        let entity = source.coordinates(opposite, CoordKind::Entity);
        let keys: Vec<String> = entity.keys().cloned().collect();
        let estimates = entity.values().map(|a| dot(a, &self.coords)).collect();

        let via = |own: &Option<Vec<f64>>, kind: CoordKind| -> Option<Vec<f64>> {
            let own = own.as_ref()?;
            let partners = source.coordinates(opposite, kind);
            Some(
                keys.iter()
                    .map(|key| {
                        partners
                            .get(key)
                            .map_or(MISSING, |a| dot(a, own).exp())
                    })
                    .collect(),
            )
        };

        ConstructScores {
            ear: via(&self.ear_coords, CoordKind::Ear),
            se: via(&self.se_coords, CoordKind::Se),
            keys,
            estimates,
        }
    }
}
