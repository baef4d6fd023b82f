use std::collections::{BTreeMap, BTreeSet};

use ocme_common::{Box4, CellKey};
use serde::{Deserialize, Serialize};

use crate::elements::{BORDERS, EXTERNALS, FACES, VERTICES, chain_name};

/// Which element chain an attribute runs parallel to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    Vertex,
    Face,
}

/// A named per-vertex or per-face chain of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellAttribute {
    pub chain: String,
    pub type_name: String,
    pub kind: AttributeKind,
}

/// One grid cell: its element chains, bounds and dependency set.
///
/// Edit markers are per-edit generation numbers so a new edit never has to
/// reset the previous one's flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub key: CellKey,
    /// Box of every face assigned to or overlapping this cell.
    pub bbox: Box4,
    /// Cells sharing vertices or overlapping faces with this one. Symmetric.
    pub dependence_set: BTreeSet<CellKey>,
    pub attributes: BTreeMap<String, CellAttribute>,
    #[serde(skip)]
    pub(crate) selected_gen: u64,
    #[serde(skip)]
    pub(crate) locked_gen: u64,
    #[serde(skip)]
    pub(crate) deleted_faces: BTreeSet<u32>,
    #[serde(skip)]
    pub(crate) deleted_vertices: BTreeSet<u32>,
}

impl Cell {
    pub fn new(key: CellKey) -> Self {
        Self {
            key,
            bbox: Box4::default(),
            dependence_set: BTreeSet::new(),
            attributes: BTreeMap::new(),
            selected_gen: 0,
            locked_gen: 0,
            deleted_faces: BTreeSet::new(),
            deleted_vertices: BTreeSet::new(),
        }
    }

    pub fn face_chain(&self) -> String {
        chain_name(&self.key, FACES)
    }

    pub fn vertex_chain(&self) -> String {
        chain_name(&self.key, VERTICES)
    }

    pub fn border_chain(&self) -> String {
        chain_name(&self.key, BORDERS)
    }

    pub fn ext_chain(&self) -> String {
        chain_name(&self.key, EXTERNALS)
    }

    /// Every chain owned by this cell, element chains first.
    pub fn chain_names(&self) -> Vec<String> {
        let mut names = vec![
            self.face_chain(),
            self.vertex_chain(),
            self.border_chain(),
            self.ext_chain(),
        ];
        names.extend(self.attributes.values().map(|a| a.chain.clone()));
        names
    }

    pub fn attribute_chains(&self, kind: AttributeKind) -> Vec<String> {
        self.attributes
            .values()
            .filter(|a| a.kind == kind)
            .map(|a| a.chain.clone())
            .collect()
    }

    pub fn is_selected(&self, generation: u64) -> bool {
        generation != 0 && self.selected_gen == generation
    }

    pub fn is_locked(&self, generation: u64) -> bool {
        generation != 0 && self.locked_gen == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_chain_names() {
        let mut cell = Cell::new(CellKey::new(1, 0, 0, 0));
        cell.attributes.insert(
            "Color4b".into(),
            CellAttribute {
                chain: "1.0.0.0.Color4b".into(),
                type_name: "Color4b".into(),
                kind: AttributeKind::Vertex,
            },
        );
        assert_eq!(
            cell.chain_names(),
            vec!["1.0.0.0.f", "1.0.0.0.v", "1.0.0.0.b", "1.0.0.0.e", "1.0.0.0.Color4b"]
        );
        assert_eq!(cell.attribute_chains(AttributeKind::Face), Vec::<String>::new());
    }

    #[test]
    fn generation_markers() {
        let mut cell = Cell::new(CellKey::default());
        assert!(!cell.is_locked(0));
        cell.locked_gen = 3;
        assert!(cell.is_locked(3));
        assert!(!cell.is_locked(4));
        assert!(!cell.is_selected(3));
    }
}
