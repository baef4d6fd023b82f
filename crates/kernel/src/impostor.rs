//! Per-cell level-of-detail proxies.
//!
//! An impostor is a sparse 8x8x8 grid of quantized point samples over the
//! cell's cube. Leaf samples come from the cell's own faces; inner nodes
//! re-bin the samples of their present children.

use std::collections::BTreeMap;

use glam::Vec3;
use ocme_common::{Box3, Color4b};
use serde::{Deserialize, Serialize};

/// Voxels per axis.
pub const GRID_SIDE: u32 = 8;
/// Voxels per impostor.
pub const VOXEL_COUNT: usize = (GRID_SIDE * GRID_SIDE * GRID_SIDE) as usize;

/// One quantized sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpostorSample {
    /// `x + 8 * y + 64 * z`.
    pub voxel: u16,
    /// Position inside the voxel, 0..=255 per axis.
    pub offset: [u8; 3],
    pub normal: [i8; 3],
    pub color: Color4b,
}

/// A sample decoded back to world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSample {
    pub position: Vec3,
    pub normal: Vec3,
    pub color: Color4b,
}

impl ImpostorSample {
    fn voxel_coords(&self) -> Vec3 {
        let v = self.voxel as u32;
        Vec3::new(
            (v % GRID_SIDE) as f32,
            ((v / GRID_SIDE) % GRID_SIDE) as f32,
            (v / (GRID_SIDE * GRID_SIDE)) as f32,
        )
    }

    pub fn decode(&self, cube: &Box3) -> DecodedSample {
        let vs = voxel_size(cube);
        let offset = Vec3::new(
            self.offset[0] as f32,
            self.offset[1] as f32,
            self.offset[2] as f32,
        ) / 255.0;
        DecodedSample {
            position: cube.min + vs * (self.voxel_coords() + offset),
            normal: Vec3::new(
                self.normal[0] as f32,
                self.normal[1] as f32,
                self.normal[2] as f32,
            ) / 127.0,
            color: self.color,
        }
    }
}

fn voxel_size(cube: &Box3) -> Vec3 {
    (cube.max - cube.min) / GRID_SIDE as f32
}

#[derive(Debug, Clone, Copy, Default)]
struct Accum {
    pos: Vec3,
    normal: Vec3,
    color: [f32; 4],
    count: u32,
}

fn voxel_of(p: Vec3, cube: &Box3) -> u16 {
    let vs = voxel_size(cube);
    let max = (GRID_SIDE - 1) as f32;
    let c = ((p - cube.min) / vs).floor().clamp(Vec3::ZERO, Vec3::splat(max));
    (c.x as u32 + GRID_SIDE * (c.y as u32 + GRID_SIDE * c.z as u32)) as u16
}

fn accumulate(grid: &mut BTreeMap<u16, Accum>, cube: &Box3, s: &DecodedSample) {
    let a = grid.entry(voxel_of(s.position, cube)).or_default();
    a.pos += s.position;
    a.normal += s.normal;
    for (acc, c) in a.color.iter_mut().zip(s.color) {
        *acc += c as f32;
    }
    a.count += 1;
}

fn quantize(grid: &BTreeMap<u16, Accum>, cube: &Box3) -> Vec<ImpostorSample> {
    let vs = voxel_size(cube);
    grid.iter()
        .filter(|(_, a)| a.count > 0)
        .map(|(&voxel, a)| {
            let n = a.count as f32;
            let proto = ImpostorSample {
                voxel,
                offset: [0; 3],
                normal: [0; 3],
                color: [0; 4],
            };
            let base = cube.min + vs * proto.voxel_coords();
            let local = ((a.pos / n - base) / vs).clamp(Vec3::ZERO, Vec3::ONE) * 255.0;
            let normal = a.normal.normalize_or_zero() * 127.0;
            ImpostorSample {
                offset: [
                    local.x.round() as u8,
                    local.y.round() as u8,
                    local.z.round() as u8,
                ],
                normal: [
                    normal.x.round() as i8,
                    normal.y.round() as i8,
                    normal.z.round() as i8,
                ],
                color: a.color.map(|c| (c / n).round().clamp(0.0, 255.0) as u8),
                ..proto
            }
        })
        .collect()
}

/// Level-of-detail node for one cell key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Impostor {
    /// Direct samples merged with the re-binned samples of present children.
    pub samples: Vec<ImpostorSample>,
    /// Samples of the cell's own faces.
    pub direct_samples: Vec<ImpostorSample>,
    /// Fraction of voxels holding a direct sample.
    pub direct_occupancy: f32,
    pub child_occupancy: [f32; 8],
    /// `max(mean child occupancy over 8 slots, direct occupancy)`, in `[0, 1]`.
    pub occupancy: f32,
    pub non_empty_children: u8,
    pub dirty: bool,
    /// Build pass that last finalized this node.
    pub stamp: u64,
    #[serde(skip)]
    accum: BTreeMap<u16, Accum>,
}

impl Impostor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one face sample; takes effect at the next finalize.
    pub fn add_sample(&mut self, cube: &Box3, position: Vec3, normal: Vec3, color: Color4b) {
        let s = DecodedSample {
            position,
            normal,
            color,
        };
        accumulate(&mut self.accum, cube, &s);
    }

    /// Forget every direct sample, finalized or pending.
    pub fn reset_direct(&mut self) {
        self.direct_samples.clear();
        self.accum.clear();
        self.direct_occupancy = 0.0;
    }

    pub fn has_pending(&self) -> bool {
        !self.accum.is_empty()
    }

    /// Fold pending samples into the direct samples.
    fn finalize_direct(&mut self, cube: &Box3) {
        if self.accum.is_empty() {
            return;
        }
        for s in &self.direct_samples {
            accumulate(&mut self.accum, cube, &s.decode(cube));
        }
        self.direct_samples = quantize(&self.accum, cube);
        self.accum.clear();
        self.direct_occupancy = self.direct_samples.len() as f32 / VOXEL_COUNT as f32;
    }

    /// Rebuild `samples` from the direct samples and the given child samples.
    pub(crate) fn finalize(&mut self, cube: &Box3, child_samples: &[DecodedSample], stamp: u64) {
        self.finalize_direct(cube);
        let mut merged = BTreeMap::new();
        for s in &self.direct_samples {
            accumulate(&mut merged, cube, &s.decode(cube));
        }
        for s in child_samples {
            accumulate(&mut merged, cube, s);
        }
        self.samples = quantize(&merged, cube);
        self.update_occupancy();
        self.dirty = false;
        self.stamp = stamp;
    }

    pub(crate) fn set_child(&mut self, bit: u8, occupancy: f32, non_empty: bool) {
        self.child_occupancy[bit as usize] = occupancy;
        if non_empty {
            self.non_empty_children |= 1 << bit;
        } else {
            self.non_empty_children &= !(1 << bit);
        }
        self.update_occupancy();
    }

    pub(crate) fn clear_child(&mut self, bit: u8) {
        self.set_child(bit, 0.0, false);
    }

    fn update_occupancy(&mut self) {
        let mean = self.child_occupancy.iter().sum::<f32>() / 8.0;
        self.occupancy = mean.max(self.direct_occupancy).clamp(0.0, 1.0);
    }

    pub fn has_child(&self, bit: u8) -> bool {
        self.non_empty_children & (1 << bit) != 0
    }

    /// Nothing to draw and no children to aggregate.
    pub fn is_empty(&self) -> bool {
        self.direct_samples.is_empty() && self.accum.is_empty() && self.non_empty_children == 0
    }

    pub fn decoded_samples(&self, cube: &Box3) -> Vec<DecodedSample> {
        self.samples.iter().map(|s| s.decode(cube)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_cube() -> Box3 {
        Box3::new(Vec3::ZERO, Vec3::ONE)
    }

    #[test]
    fn samples_in_one_voxel_merge() {
        let cube = unit_cube();
        let mut imp = Impostor::new();
        imp.add_sample(&cube, Vec3::new(0.01, 0.01, 0.01), Vec3::Z, [255, 0, 0, 255]);
        imp.add_sample(&cube, Vec3::new(0.03, 0.03, 0.03), Vec3::Z, [0, 0, 255, 255]);
        imp.add_sample(&cube, Vec3::new(0.9, 0.9, 0.9), Vec3::X, [10, 10, 10, 255]);
        imp.finalize(&cube, &[], 1);

        assert_eq!(imp.direct_samples.len(), 2);
        assert_eq!(imp.samples.len(), 2);
        assert!((imp.direct_occupancy - 2.0 / 512.0).abs() < 1e-6);
        assert_eq!(imp.occupancy, imp.direct_occupancy);
        assert_eq!(imp.stamp, 1);

        let d = imp.decoded_samples(&cube);
        let first = d.iter().find(|s| s.position.x < 0.5).unwrap();
        assert!((first.position - Vec3::splat(0.02)).length() < 0.01);
        assert_eq!(first.color, [128, 0, 128, 255]);
        assert!((first.normal - Vec3::Z).length() < 0.01);
    }

    #[test]
    fn incremental_samples_keep_previous_ones() {
        let cube = unit_cube();
        let mut imp = Impostor::new();
        imp.add_sample(&cube, Vec3::splat(0.1), Vec3::Y, [1, 2, 3, 4]);
        imp.finalize(&cube, &[], 1);
        imp.add_sample(&cube, Vec3::splat(0.7), Vec3::Y, [1, 2, 3, 4]);
        imp.finalize(&cube, &[], 2);
        assert_eq!(imp.direct_samples.len(), 2);

        imp.reset_direct();
        imp.finalize(&cube, &[], 3);
        assert!(imp.samples.is_empty());
        assert_eq!(imp.occupancy, 0.0);
    }

    #[test]
    fn child_occupancy_folds_into_parent() {
        let mut parent = Impostor::new();
        parent.set_child(5, 0.5, true);
        assert!(parent.has_child(5));
        assert!((parent.occupancy - 0.5 / 8.0).abs() < 1e-6);
        parent.clear_child(5);
        assert_eq!(parent.non_empty_children, 0);
        assert!(parent.is_empty());
    }

    #[test]
    fn voxel_indexing() {
        let cube = Box3::new(Vec3::splat(-4.0), Vec3::splat(4.0));
        assert_eq!(voxel_of(Vec3::splat(-4.0), &cube), 0);
        assert_eq!(voxel_of(Vec3::new(3.9, -4.0, -4.0), &cube), 7);
        assert_eq!(voxel_of(Vec3::new(-4.0, -4.0, 3.9), &cube), 448);
        assert_eq!(voxel_of(Vec3::splat(100.0), &cube), 511);
    }
}
