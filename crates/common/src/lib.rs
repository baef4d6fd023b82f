//! Shared types for the out-of-core mesh environment: cell keys, global
//! indices, scale ranges, boxes and the input mesh handed over by importers.

pub mod mesh;
pub mod types;

pub use mesh::{longest_edge, triangle_normal, Color4b, TriMesh, GREY};
pub use types::{
    cell_size, compute_level, overlapping_keys, Box3, Box4, CellKey, GIndex, ScaleRange,
    MAX_LEVEL, MIN_LEVEL,
};
