//! # Coordinate Bank
//!
//! A bank persists the coordinates of a finished analysis so that later analyses can be
//! placed in the same coordinate system. Banked entities present in a new matrix are
//! passed to the solver as anchors and held fixed; only the new entities are estimated.
//!
//! - [`store`] owns the TOML file format, anchor retrieval and refresh, and the
//!   reader/writer wrapper for concurrent use.
//! - [`construct`] builds summed scales from banked or freshly fitted entities.

pub mod construct;
pub mod store;

pub use construct::{Construct, ConstructScores, ConstructSource, build_construct};
pub use store::{Bank, BankError, CoordKind, ErrorMaps, FacetBank, SharedBank};
