//! Bank persistence and anchoring.

use super::construct::Construct;
use crate::als::SolverResult;
use crate::anchor::{AnchorError, FacetAnchors, RefreshPolicy};
use crate::types::{Facet, ObservationMatrix, is_missing};
use crate::variance::{ERROR_NDIM, ErrorEstimates};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Custom error type for bank loading, saving, and anchoring.
#[derive(Error, Debug)]
pub enum BankError {
    #[error("Failed to read or write bank file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML bank file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize bank to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The bank is {stored}-dimensional but {requested} dimensions were requested.")]
    DimensionMismatch { stored: usize, requested: usize },
    #[error("Banked {facet} {kind} for '{key}' have length {found}; expected {expected}.")]
    VectorLength {
        facet: Facet,
        kind: CoordKind,
        key: String,
        expected: usize,
        found: usize,
    },
    #[error("The bank has no {facet} {kind} for: {keys:?}")]
    MissingKeys {
        facet: Facet,
        kind: CoordKind,
        keys: Vec<String>,
    },
    #[error("The {facet} '{key}' has no finite coordinates to use.")]
    NonFinite { facet: Facet, key: String },
    #[error("Construct '{label}' has no members.")]
    EmptyConstruct { label: String },
    #[error(transparent)]
    Anchor(#[from] AnchorError),
    #[error("The shared bank lock was poisoned by a panicking writer.")]
    Poisoned,
}

/// The three kinds of banked vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordKind {
    Entity,
    Ear,
    Se,
}

impl CoordKind {
    /// Expected vector length for a bank of dimensionality `ndim`.
    pub fn length(self, ndim: usize) -> usize {
        match self {
            Self::Entity => ndim,
            Self::Ear | Self::Se => ERROR_NDIM,
        }
    }
}

impl fmt::Display for CoordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Entity => "coordinates",
            Self::Ear => "EAR coordinates",
            Self::Se => "SE coordinates",
        })
    }
}

/// Everything banked for one facet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacetBank {
    /// Entity keys in the order they were first banked.
    pub labels: Vec<String>,
    pub ent_coord: BTreeMap<String, Vec<f64>>,
    pub ear_coord: BTreeMap<String, Vec<f64>>,
    pub se_coord: BTreeMap<String, Vec<f64>>,
}

impl FacetBank {
    pub fn coords(&self, kind: CoordKind) -> &BTreeMap<String, Vec<f64>> {
        match kind {
            CoordKind::Entity => &self.ent_coord,
            CoordKind::Ear => &self.ear_coord,
            CoordKind::Se => &self.se_coord,
        }
    }

    fn coords_mut(&mut self, kind: CoordKind) -> &mut BTreeMap<String, Vec<f64>> {
        match kind {
            CoordKind::Entity => &mut self.ent_coord,
            CoordKind::Ear => &mut self.ear_coord,
            CoordKind::Se => &mut self.se_coord,
        }
    }

    fn note_label(&mut self, key: &str) {
        if !self.ent_coord.contains_key(key) && !self.labels.iter().any(|l| l == key) {
            self.labels.push(key.to_string());
        }
    }
}

/// Error-coordinate maps accompanying a save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorMaps {
    pub ear: BTreeMap<String, Vec<f64>>,
    pub se: BTreeMap<String, Vec<f64>>,
}

impl ErrorMaps {
    pub fn from_estimates(errors: &ErrorEstimates, facet: Facet) -> Self {
        Self {
            ear: errors.ear_coordinate_map(facet),
            se: errors.se_coordinate_map(facet),
        }
    }
}

/// A persisted coordinate system.
///
/// `facet0` holds row entities and `facet1` column entities. The parameter blocks are
/// opaque strings recorded for upstream preprocessing; the engine only carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bank {
    pub ndim: usize,
    #[serde(default)]
    pub shape: Option<(usize, usize)>,
    #[serde(default)]
    pub facet0: FacetBank,
    #[serde(default)]
    pub facet1: FacetBank,
    #[serde(default)]
    pub step_coord: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    pub std_params: BTreeMap<String, String>,
    #[serde(default)]
    pub parse_params: BTreeMap<String, String>,
    #[serde(default)]
    pub equate_params: BTreeMap<String, String>,
}

impl Bank {
    pub fn new(ndim: usize) -> Self {
        Self {
            ndim,
            shape: None,
            facet0: FacetBank::default(),
            facet1: FacetBank::default(),
            step_coord: BTreeMap::new(),
            std_params: BTreeMap::new(),
            parse_params: BTreeMap::new(),
            equate_params: BTreeMap::new(),
        }
    }

    /// Snapshots a fit (and optionally its error model) into a new bank.
    pub fn from_fit(fit: &SolverResult, errors: Option<&ErrorEstimates>) -> Result<Self, BankError> {
        let mut bank = Self::new(fit.ndim);
        bank.merge_fit(fit, errors)?;
        Ok(bank)
    }

    /// Saves both facets of a fit into this bank. `shape` becomes the fitted matrix's shape.
    pub fn merge_fit(
        &mut self,
        fit: &SolverResult,
        errors: Option<&ErrorEstimates>,
    ) -> Result<(), BankError> {
        self.require_ndim(fit.ndim)?;
        for facet in Facet::BOTH {
            let error_maps = errors.map(|e| ErrorMaps::from_estimates(e, facet));
            self.save(facet, &fit.coordinate_map(facet), error_maps.as_ref())?;
        }
        self.shape = Some((fit.row_keys.len(), fit.col_keys.len()));
        Ok(())
    }

    pub fn facet(&self, facet: Facet) -> &FacetBank {
        match facet {
            Facet::Rows => &self.facet0,
            Facet::Columns => &self.facet1,
        }
    }

    fn facet_mut(&mut self, facet: Facet) -> &mut FacetBank {
        match facet {
            Facet::Rows => &mut self.facet0,
            Facet::Columns => &mut self.facet1,
        }
    }

    pub fn contains(&self, facet: Facet, key: &str) -> bool {
        self.facet(facet).ent_coord.contains_key(key)
    }

    pub fn require_ndim(&self, requested: usize) -> Result<(), BankError> {
        if self.ndim != requested {
            return Err(BankError::DimensionMismatch {
                stored: self.ndim,
                requested,
            });
        }
        Ok(())
    }

    /// Checks that every stored vector has the length its kind requires.
    pub fn validate(&self) -> Result<(), BankError> {
        for facet in Facet::BOTH {
            for kind in [CoordKind::Entity, CoordKind::Ear, CoordKind::Se] {
                let expected = kind.length(self.ndim);
                for (key, vector) in self.facet(facet).coords(kind) {
                    if vector.len() != expected {
                        return Err(BankError::VectorLength {
                            facet,
                            kind,
                            key: key.clone(),
                            expected,
                            found: vector.len(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Loads a bank from a TOML file and validates its vector lengths.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, BankError> {
        let toml_string = fs::read_to_string(path)?;
        let bank: Self = toml::from_str(&toml_string)?;
        bank.validate()?;
        log::info!(
            "Loaded {}-dimensional bank with {} row and {} column entities",
            bank.ndim,
            bank.facet0.ent_coord.len(),
            bank.facet1.ent_coord.len()
        );
        Ok(bank)
    }

    /// Saves the bank to a file in a human-readable TOML format.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), BankError> {
        self.validate()?;
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Stores entity coordinates (and optionally error coordinates) for `facet`.
    ///
    /// Each saved entity is replaced whole: error coordinates not supplied for a re-saved
    /// entity are dropped rather than left pointing at stale coordinates. Vectors holding
    /// the missing sentinel are skipped. Returns the number of entities stored.
    pub fn save(
        &mut self,
        facet: Facet,
        coords: &BTreeMap<String, Vec<f64>>,
        errors: Option<&ErrorMaps>,
    ) -> Result<usize, BankError> {
        let ndim = self.ndim;
        let mut checks = vec![(CoordKind::Entity, coords)];
        if let Some(errors) = errors {
            checks.push((CoordKind::Ear, &errors.ear));
            checks.push((CoordKind::Se, &errors.se));
        }
        for (kind, map) in checks {
            let expected = kind.length(ndim);
            for (key, vector) in map {
                if vector.len() != expected {
                    return Err(BankError::VectorLength {
                        facet,
                        kind,
                        key: key.clone(),
                        expected,
                        found: vector.len(),
                    });
                }
            }
        }

        let target = self.facet_mut(facet);
        let mut stored = 0usize;
        let mut skipped = 0usize;
        for (key, vector) in coords {
            if !is_finite_vector(vector) {
                skipped += 1;
                continue;
            }
            target.note_label(key);
            target.ent_coord.insert(key.clone(), vector.clone());
            for kind in [CoordKind::Ear, CoordKind::Se] {
                let supplied = errors.and_then(|e| match kind {
                    CoordKind::Ear => e.ear.get(key),
                    _ => e.se.get(key),
                });
                match supplied.filter(|v| is_finite_vector(v)) {
                    Some(v) => {
                        target.coords_mut(kind).insert(key.clone(), v.clone());
                    }
                    None => {
                        target.coords_mut(kind).remove(key);
                    }
                }
            }
            stored += 1;
        }
        if skipped > 0 {
            log::warn!("Skipped {skipped} {facet} entities without finite coordinates when banking");
        }
        log::debug!("Banked {stored} {facet} entities");
        Ok(stored)
    }

    fn missing_keys<'k>(
        &self,
        facet: Facet,
        keys: impl IntoIterator<Item = &'k String>,
    ) -> Vec<String> {
        keys.into_iter()
            .filter(|key| !self.contains(facet, key))
            .cloned()
            .collect()
    }

    fn anchors_from(
        &self,
        facet: Facet,
        keys: &[String],
        ndim: usize,
    ) -> Result<FacetAnchors, BankError> {
        self.require_ndim(ndim)?;
        let missing = self.missing_keys(facet, keys);
        if !missing.is_empty() {
            return Err(BankError::MissingKeys {
                facet,
                kind: CoordKind::Entity,
                keys: missing,
            });
        }
        let mut anchors = FacetAnchors::new(ndim);
        for key in keys {
            if let Some(vector) = self.facet(facet).ent_coord.get(key) {
                anchors.insert(key.clone(), vector.clone())?;
            }
        }
        Ok(anchors)
    }

    /// Anchors for `subset` (or every banked entity of `facet`), all held fixed.
    ///
    /// A dimensionality mismatch or a requested key the bank lacks is an error.
    pub fn get_anchors(
        &self,
        facet: Facet,
        subset: Option<&[String]>,
        ndim: usize,
    ) -> Result<FacetAnchors, BankError> {
        let keys: Vec<String> = match subset {
            Some(keys) => keys.to_vec(),
            None => self.facet(facet).ent_coord.keys().cloned().collect(),
        };
        self.anchors_from(facet, &keys, ndim)
    }

    /// Every banked entity of `facet` as an anchor, with `subset` marked for
    /// re-estimation.
    pub fn refresh(
        &self,
        facet: Facet,
        subset: &[String],
        ndim: usize,
    ) -> Result<FacetAnchors, BankError> {
        let missing = self.missing_keys(facet, subset);
        if !missing.is_empty() {
            return Err(BankError::MissingKeys {
                facet,
                kind: CoordKind::Entity,
                keys: missing,
            });
        }
        let anchors = self.get_anchors(facet, None, ndim)?;
        Ok(anchors.with_refresh(RefreshPolicy::Only(subset.iter().cloned().collect())))
    }

    /// Anchors for the entities of `facet` that appear in both the bank and `matrix`.
    pub fn anchors_for_matrix(
        &self,
        facet: Facet,
        matrix: &ObservationMatrix,
        ndim: usize,
    ) -> Result<FacetAnchors, BankError> {
        let shared: Vec<String> = matrix
            .keys(facet)
            .iter()
            .filter(|key| self.contains(facet, key))
            .cloned()
            .collect();
        log::info!(
            "{} of {} {facet} entities are anchored from the bank",
            shared.len(),
            matrix.len(facet)
        );
        self.anchors_from(facet, &shared, ndim)
    }

    /// Persists a construct as an entity of its facet under its label.
    pub fn store_construct(&mut self, construct: &Construct) -> Result<(), BankError> {
        let coords = BTreeMap::from([(construct.label.clone(), construct.coords.clone())]);
        let mut errors = ErrorMaps::default();
        if let Some(ear) = &construct.ear_coords {
            errors.ear.insert(construct.label.clone(), ear.clone());
        }
        if let Some(se) = &construct.se_coords {
            errors.se.insert(construct.label.clone(), se.clone());
        }
        self.save(construct.facet, &coords, Some(&errors))?;
        Ok(())
    }
}

fn is_finite_vector(vector: &[f64]) -> bool {
    vector.iter().all(|v| !is_missing(*v))
}

/// A bank shared between threads: many concurrent readers, one writer at a time.
///
/// Writes run against a copy that replaces the bank only when the write succeeds, so
/// readers never observe a half-applied update.
#[derive(Debug, Clone)]
pub struct SharedBank {
    inner: Arc<RwLock<Bank>>,
}

impl SharedBank {
    pub fn new(bank: Bank) -> Self {
        Self {
            inner: Arc::new(RwLock::new(bank)),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&Bank) -> R) -> Result<R, BankError> {
        let guard = self.inner.read().map_err(|_| BankError::Poisoned)?;
        Ok(f(&guard))
    }

    pub fn write<R>(
        &self,
        f: impl FnOnce(&mut Bank) -> Result<R, BankError>,
    ) -> Result<R, BankError> {
        let mut guard = self.inner.write().map_err(|_| BankError::Poisoned)?;
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        *guard = draft;
        Ok(out)
    }

    pub fn snapshot(&self) -> Result<Bank, BankError> {
        self.read(Bank::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_bank() -> Bank {
        let mut bank = Bank::new(2);
        let coords = BTreeMap::from([
            ("item1".to_string(), vec![0.5, -1.0]),
            ("item2".to_string(), vec![1.5, 0.25]),
            ("broken".to_string(), vec![f64::NAN, 0.0]),
        ]);
        let errors = ErrorMaps {
            ear: BTreeMap::from([("item1".to_string(), vec![-1.0, 0.2])]),
            se: BTreeMap::new(),
        };
        bank.save(Facet::Columns, &coords, Some(&errors)).unwrap();
        bank.std_params.insert("item1".into(), "mean=0;sd=1".into());
        bank
    }

    #[test]
    fn save_skips_sentinel_vectors_and_records_labels() {
        let bank = sample_bank();
        assert_eq!(bank.facet1.ent_coord.len(), 2);
        assert!(!bank.contains(Facet::Columns, "broken"));
        assert_eq!(bank.facet1.labels, vec!["item1".to_string(), "item2".to_string()]);
        assert_eq!(bank.facet1.ear_coord.len(), 1);
    }

    #[test]
    fn resaving_without_errors_drops_stale_error_coordinates() {
        let mut bank = sample_bank();
        let coords = BTreeMap::from([("item1".to_string(), vec![0.0, 1.0])]);
        bank.save(Facet::Columns, &coords, None).unwrap();
        assert!(bank.facet1.ear_coord.is_empty());
        assert_eq!(bank.facet1.labels.len(), 2);
    }

    #[test]
    fn toml_round_trip_preserves_the_bank() {
        let bank = sample_bank();
        let file = NamedTempFile::new().unwrap();
        bank.save_to_path(file.path()).unwrap();
        let loaded = Bank::load_from_path(file.path()).unwrap();
        assert_eq!(loaded, bank);
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        let bank = sample_bank();
        let err = bank.get_anchors(Facet::Columns, None, 3).unwrap_err();
        assert!(matches!(
            err,
            BankError::DimensionMismatch {
                stored: 2,
                requested: 3
            }
        ));

        let mut wrong = Bank::new(2);
        let coords = BTreeMap::from([("x".to_string(), vec![1.0, 2.0, 3.0])]);
        assert!(matches!(
            wrong.save(Facet::Rows, &coords, None),
            Err(BankError::VectorLength { found: 3, .. })
        ));
    }

    #[test]
    fn missing_keys_are_fatal() {
        let bank = sample_bank();
        let subset = vec!["item1".to_string(), "nope".to_string()];
        match bank.get_anchors(Facet::Columns, Some(&subset), 2) {
            Err(BankError::MissingKeys { keys, .. }) => assert_eq!(keys, vec!["nope".to_string()]),
            other => panic!("expected missing keys, got {other:?}"),
        }
        assert!(bank.refresh(Facet::Columns, &subset, 2).is_err());
    }

    #[test]
    fn refresh_marks_only_the_subset_for_re_estimation() {
        let bank = sample_bank();
        let anchors = bank
            .refresh(Facet::Columns, &["item2".to_string()], 2)
            .unwrap();
        assert!(anchors.is_fixed("item1"));
        assert!(!anchors.is_fixed("item2"));
        assert_eq!(anchors.len(), 2);
    }

    #[test]
    fn failed_shared_writes_leave_the_bank_untouched() {
        let shared = SharedBank::new(sample_bank());
        let result = shared.write(|bank| {
            bank.std_params.clear();
            bank.require_ndim(5)
        });
        assert!(result.is_err());
        let count = shared.read(|bank| bank.std_params.len()).unwrap();
        assert_eq!(count, 1);

        shared
            .write(|bank| {
                bank.equate_params.insert("origin".into(), "form A".into());
                Ok(())
            })
            .unwrap();
        assert_eq!(shared.snapshot().unwrap().equate_params.len(), 1);
    }
}
