//! Anchors: coordinate vectors held fixed during a solve so that a new analysis lands in
//! an existing coordinate system.

use crate::types::{Facet, is_missing};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnchorError {
    #[error("Anchor '{key}' has {found} coordinates but the anchor set is {expected}-dimensional.")]
    DimensionMismatch {
        key: String,
        expected: usize,
        found: usize,
    },
    #[error("Anchor '{key}' contains non-finite coordinates.")]
    NonFinite { key: String },
}

/// Which anchored entities are re-estimated instead of held fixed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Every anchor is held fixed.
    #[default]
    None,
    /// Anchors only seed the starting coordinates; everything is re-estimated.
    All,
    /// The named anchors are re-estimated; the rest stay fixed.
    Only(BTreeSet<String>),
}

/// Anchor coordinates for one facet.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetAnchors {
    ndim: usize,
    coords: BTreeMap<String, Vec<f64>>,
    refresh: RefreshPolicy,
}

impl FacetAnchors {
    pub fn new(ndim: usize) -> Self {
        Self {
            ndim,
            coords: BTreeMap::new(),
            refresh: RefreshPolicy::None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, coords: Vec<f64>) -> Result<(), AnchorError> {
        let key = key.into();
        if coords.len() != self.ndim {
            return Err(AnchorError::DimensionMismatch {
                key,
                expected: self.ndim,
                found: coords.len(),
            });
        }
        if coords.iter().any(|v| is_missing(*v)) {
            return Err(AnchorError::NonFinite { key });
        }
        self.coords.insert(key, coords);
        Ok(())
    }

    pub fn with_refresh(mut self, refresh: RefreshPolicy) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn refresh(&self) -> &RefreshPolicy {
        &self.refresh
    }

    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.coords.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.coords.keys()
    }

    /// True when `key` is anchored and must not be re-estimated.
    pub fn is_fixed(&self, key: &str) -> bool {
        if !self.coords.contains_key(key) {
            return false;
        }
        match &self.refresh {
            RefreshPolicy::None => true,
            RefreshPolicy::All => false,
            RefreshPolicy::Only(keys) => !keys.contains(key),
        }
    }
}

/// Anchors for either or both facets of a solve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchorSet {
    pub rows: Option<FacetAnchors>,
    pub cols: Option<FacetAnchors>,
}

impl AnchorSet {
    pub fn for_facet(facet: Facet, anchors: FacetAnchors) -> Self {
        let mut set = Self::default();
        set.set(facet, anchors);
        set
    }

    pub fn get(&self, facet: Facet) -> Option<&FacetAnchors> {
        match facet {
            Facet::Rows => self.rows.as_ref(),
            Facet::Columns => self.cols.as_ref(),
        }
    }

    pub fn set(&mut self, facet: Facet, anchors: FacetAnchors) {
        match facet {
            Facet::Rows => self.rows = Some(anchors),
            Facet::Columns => self.cols = Some(anchors),
        }
    }
}
