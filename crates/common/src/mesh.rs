use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::types::Box3;

/// RGBA colour with 8 bits per channel.
pub type Color4b = [u8; 4];

/// Neutral grey used when a mesh carries no colour.
pub const GREY: Color4b = [128, 128, 128, 255];

/// An in-memory indexed triangle mesh handed over by an importer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriMesh {
    pub positions: Vec<Vec3>,
    pub faces: Vec<[u32; 3]>,
    /// Optional per-vertex colours, same length as `positions` when present.
    pub colors: Option<Vec<Color4b>>,
}

impl TriMesh {
    pub fn new(positions: Vec<Vec3>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            positions,
            faces,
            colors: None,
        }
    }

    pub fn with_colors(mut self, colors: Vec<Color4b>) -> Self {
        self.colors = Some(colors);
        self
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn face_points(&self, f: usize) -> [Vec3; 3] {
        let [a, b, c] = self.faces[f];
        [
            self.positions[a as usize],
            self.positions[b as usize],
            self.positions[c as usize],
        ]
    }

    pub fn bbox(&self) -> Box3 {
        Box3::from_points(&self.positions)
    }

    /// A regular `nx` x `ny` grid of quads split into triangles, lying in the
    /// plane `z = z0`, spaced by `step` and starting at `origin`.
    pub fn grid(origin: Vec3, nx: usize, ny: usize, step: f32) -> Self {
        let mut positions = Vec::with_capacity((nx + 1) * (ny + 1));
        for j in 0..=ny {
            for i in 0..=nx {
                positions.push(origin + Vec3::new(i as f32 * step, j as f32 * step, 0.0));
            }
        }
        let row = (nx + 1) as u32;
        let mut faces = Vec::with_capacity(nx * ny * 2);
        for j in 0..ny as u32 {
            for i in 0..nx as u32 {
                let v0 = j * row + i;
                let v1 = v0 + 1;
                let v2 = v0 + row;
                let v3 = v2 + 1;
                faces.push([v0, v1, v3]);
                faces.push([v0, v3, v2]);
            }
        }
        Self::new(positions, faces)
    }
}

/// Unit normal of a triangle, or zero for a degenerate one.
pub fn triangle_normal(p: &[Vec3; 3]) -> Vec3 {
    (p[1] - p[0]).cross(p[2] - p[0]).normalize_or_zero()
}

/// Length of the longest edge of a triangle.
pub fn longest_edge(p: &[Vec3; 3]) -> f32 {
    p[0].distance(p[1])
        .max(p[1].distance(p[2]))
        .max(p[2].distance(p[0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_counts() {
        let m = TriMesh::grid(Vec3::ZERO, 3, 2, 1.0);
        assert_eq!(m.vertex_count(), 12);
        assert_eq!(m.face_count(), 12);
        let b = m.bbox();
        assert_eq!(b.max, Vec3::new(3.0, 2.0, 0.0));
    }

    #[test]
    fn triangle_helpers() {
        let p = [Vec3::ZERO, Vec3::X, Vec3::Y];
        assert_eq!(triangle_normal(&p), Vec3::Z);
        assert!((longest_edge(&p) - 2f32.sqrt()).abs() < 1e-6);
    }
}
