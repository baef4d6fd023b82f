//! Element types stored in cell chains.

use ocme_common::{Color4b, GIndex};
use ocme_stream::{EnvError, TypeRegistry};
use serde::{Deserialize, Serialize};

/// Chain suffix of a cell's faces.
pub const FACES: &str = "f";
/// Chain suffix of a cell's vertex slots.
pub const VERTICES: &str = "v";
/// Chain suffix of a cell's border entries.
pub const BORDERS: &str = "b";
/// Chain suffix of a cell's external-reference table.
pub const EXTERNALS: &str = "e";
/// Name of the per-vertex colour attribute.
pub const COLOR_ATTRIBUTE: &str = "Color4b";

/// Name of the chain holding `elem` for the cell `key`: `"{x}.{y}.{z}.{h}.{elem}"`.
pub fn chain_name(key: &ocme_common::CellKey, elem: &str) -> String {
    format!("{key}.{elem}")
}

/// A triangle as three local vertex slot indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OFace {
    pub v: [u32; 3],
}

impl OFace {
    pub fn new(v: [u32; 3]) -> Self {
        Self { v }
    }
}

/// A vertex slot: either the owned copy of a vertex or a ghost pointing at
/// an entry of the cell's external-reference table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OVertex {
    Owned { p: [f32; 3] },
    External { r: u32 },
}

impl Default for OVertex {
    fn default() -> Self {
        OVertex::Owned { p: [0.0; 3] }
    }
}

impl OVertex {
    pub fn is_external(&self) -> bool {
        matches!(self, OVertex::External { .. })
    }
}

/// Marks a slot as one copy of a vertex shared between cells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BorderIndex {
    /// Local vertex slot.
    pub vi: u32,
    /// Process-wide border id shared by every copy.
    pub bi: u64,
}

/// Registry with every element type the store writes.
pub fn element_types() -> Result<TypeRegistry, EnvError> {
    let mut types = TypeRegistry::new();
    bind_element_types(&mut types)?;
    Ok(types)
}

pub(crate) fn bind_element_types(types: &mut TypeRegistry) -> Result<(), EnvError> {
    types.bind::<OFace>("OFace")?;
    types.bind::<OVertex>("OVertex")?;
    types.bind::<BorderIndex>("BorderIndex")?;
    types.bind::<GIndex>("GIndex")?;
    types.bind::<Color4b>(COLOR_ATTRIBUTE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocme_common::CellKey;

    #[test]
    fn chain_names_follow_key() {
        let k = CellKey::new(-1, 2, 0, -3);
        assert_eq!(chain_name(&k, FACES), "-1.2.0.-3.f");
        assert_eq!(chain_name(&k, COLOR_ATTRIBUTE), "-1.2.0.-3.Color4b");
    }

    #[test]
    fn registry_binds_all_element_types() {
        let types = element_types().unwrap();
        for name in ["OFace", "OVertex", "BorderIndex", "GIndex", "Color4b"] {
            assert!(types.contains(name));
        }
        assert_eq!(types.name_of::<OVertex>(), Some("OVertex"));
    }
}
