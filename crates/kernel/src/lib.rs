//! OCME kernel: a multi-resolution grid of cells holding a triangle mesh that
//! does not fit in memory, with ingestion, edit/commit and an impostor
//! hierarchy for coarse display.
//!
//! # Invariants
//! - Dependence is symmetric, and dependent cells include each other's scale range.
//! - A vertex has exactly one owned slot; every other copy is a ghost one step away.
//! - Every face sits in the cell of its box minimum at its level, and each
//!   same-level cell it overlaps covers it and depends on its cell.
//! - Only the selection of an open edit is written back; its dependents stay locked.

pub mod cell;
pub mod check;
pub mod commit;
pub mod config;
pub mod edit;
pub mod elements;
pub mod error;
pub mod hierarchy;
pub mod impostor;
pub mod ingest;
pub mod ocme;

pub use cell::{AttributeKind, Cell, CellAttribute};
pub use commit::CommitReport;
pub use config::OcmeConfig;
pub use edit::EditMesh;
pub use elements::{
    BORDERS, BorderIndex, COLOR_ATTRIBUTE, EXTERNALS, FACES, OFace, OVertex, VERTICES, chain_name,
    element_types,
};
pub use error::OcmeError;
pub use impostor::{DecodedSample, Impostor, ImpostorSample};
pub use ocme::{CellSetChanges, OCME_TABLE_KEY, Ocme, OcmeStats};
