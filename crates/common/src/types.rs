use glam::{DVec3, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest resolution level a cell key may use.
pub const MIN_LEVEL: i32 = -60;
/// Highest resolution level a cell key may use.
pub const MAX_LEVEL: i32 = 60;

/// Edge length of a cell at level `h`: `2^h`, or `2^-|h|` for negative levels.
pub fn cell_size(h: i32) -> f64 {
    2f64.powi(h)
}

/// Address of one cell in the multi-resolution grid.
///
/// Ordering is lexicographic on `(x, y, z, h)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CellKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub h: i32,
}

impl CellKey {
    pub fn new(x: i32, y: i32, z: i32, h: i32) -> Self {
        Self { x, y, z, h }
    }

    /// Key of the cell at level `h` containing `p`.
    ///
    /// Division happens in f64 so re-deriving a key from a stored f32
    /// position always yields the same key.
    pub fn containing(p: Vec3, h: i32) -> Self {
        let cs = cell_size(h);
        let p = p.as_dvec3();
        Self {
            x: (p.x / cs).floor() as i32,
            y: (p.y / cs).floor() as i32,
            z: (p.z / cs).floor() as i32,
            h,
        }
    }

    /// The enclosing cell one level up.
    pub fn parent(&self) -> Self {
        Self {
            x: self.x >> 1,
            y: self.y >> 1,
            z: self.z >> 1,
            h: self.h + 1,
        }
    }

    /// The 8 cells one level down, ordered by [`CellKey::child_bit`].
    pub fn children(&self) -> [CellKey; 8] {
        let mut out = [CellKey::default(); 8];
        for (bit, slot) in out.iter_mut().enumerate() {
            let bit = bit as i32;
            *slot = CellKey {
                x: (self.x << 1) + (bit & 1),
                y: (self.y << 1) + ((bit >> 1) & 1),
                z: (self.z << 1) + ((bit >> 2) & 1),
                h: self.h - 1,
            };
        }
        out
    }

    /// Position (0..8) of this key among its parent's children.
    pub fn child_bit(&self) -> u8 {
        ((self.x & 1) | ((self.y & 1) << 1) | ((self.z & 1) << 2)) as u8
    }

    /// Lift this key to a coarser level `h >= self.h`.
    pub fn lifted(&self, h: i32) -> Self {
        debug_assert!(h >= self.h);
        let s = (h - self.h).min(31) as u32;
        Self {
            x: self.x >> s,
            y: self.y >> s,
            z: self.z >> s,
            h,
        }
    }

    /// True when one cell's cube contains the other's.
    pub fn same_region(&self, other: &CellKey) -> bool {
        let h = self.h.max(other.h);
        let a = self.lifted(h);
        let b = other.lifted(h);
        a.x == b.x && a.y == b.y && a.z == b.z
    }

    /// World-space cube covered by this cell.
    pub fn cube(&self) -> Box3 {
        let cs = cell_size(self.h);
        let min = DVec3::new(self.x as f64, self.y as f64, self.z as f64) * cs;
        Box3 {
            min: min.as_vec3(),
            max: (min + DVec3::splat(cs)).as_vec3(),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.x, self.y, self.z, self.h)
    }
}

/// Global address of a vertex or face: owning cell plus local index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct GIndex {
    pub ck: CellKey,
    pub i: u32,
}

impl GIndex {
    pub fn new(ck: CellKey, i: u32) -> Self {
        Self { ck, i }
    }
}

/// Inclusive range of resolution levels.
///
/// An empty range has `min > max`; adding to it yields exactly the added level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleRange {
    pub min: i32,
    pub max: i32,
}

impl Default for ScaleRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl ScaleRange {
    pub const EMPTY: ScaleRange = ScaleRange {
        min: i32::MAX,
        max: i32::MIN,
    };

    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    pub fn single(h: i32) -> Self {
        Self { min: h, max: h }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn add(&mut self, h: i32) {
        self.min = self.min.min(h);
        self.max = self.max.max(h);
    }

    /// Extend to include `other`. Returns true when the range grew.
    pub fn add_range(&mut self, other: &ScaleRange) -> bool {
        if other.is_empty() {
            return false;
        }
        let before = *self;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        before != *self
    }

    pub fn includes(&self, h: i32) -> bool {
        h >= self.min && h <= self.max
    }

    pub fn contains_range(&self, other: &ScaleRange) -> bool {
        other.is_empty() || (self.min <= other.min && self.max >= other.max)
    }

    pub fn clamp(&self, h: i32) -> i32 {
        if self.is_empty() {
            h
        } else {
            h.clamp(self.min, self.max)
        }
    }
}

/// Axis-aligned box. Starts empty (`min > max`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box3 {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Box3 {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Box3 {
    pub const EMPTY: Box3 = Box3 {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: &[Vec3]) -> Self {
        let mut b = Self::EMPTY;
        for p in points {
            b.add_point(*p);
        }
        b
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn add_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn add_box(&mut self, other: &Box3) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn contains_box(&self, other: &Box3) -> bool {
        other.is_empty()
            || (self.min.cmple(other.min).all() && self.max.cmpge(other.max).all())
    }

    pub fn overlaps(&self, other: &Box3) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min.cmple(other.max).all()
            && other.min.cmple(self.max).all()
    }

    pub fn diag(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            (self.max - self.min).length()
        }
    }

    /// Grow the box by `d` on every side.
    pub fn offset(&self, d: f32) -> Box3 {
        if self.is_empty() {
            return *self;
        }
        Box3 {
            min: self.min - Vec3::splat(d),
            max: self.max + Vec3::splat(d),
        }
    }
}

/// A box paired with the scale range of the geometry that shaped it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Box4 {
    pub bbox3: Box3,
    pub sr: ScaleRange,
}

impl Box4 {
    /// Extend with a face box of scale range `sr`. Returns true if anything grew.
    pub fn add(&mut self, b: &Box3, sr: &ScaleRange) -> bool {
        let before = *self;
        self.bbox3.add_box(b);
        self.sr.add_range(sr);
        before != *self
    }

    pub fn is_empty(&self) -> bool {
        self.bbox3.is_empty()
    }
}

/// Resolution level for a feature of length `l`:
/// `floor(log2(side_factor * l))`, clamped to the valid level range.
pub fn compute_level(side_factor: f32, l: f32) -> i32 {
    let scaled = side_factor as f64 * l as f64;
    if scaled.is_nan() || scaled <= 0.0 || scaled.is_infinite() {
        return MIN_LEVEL;
    }
    (scaled.log2().floor() as i32).clamp(MIN_LEVEL, MAX_LEVEL)
}

/// Keys at level `h` touched by `b` grown by 5% of its diagonal.
pub fn overlapping_keys(b: &Box3, h: i32) -> Vec<CellKey> {
    let bo = b.offset(b.diag() * 0.05);
    let lo = CellKey::containing(bo.min, h);
    let hi = CellKey::containing(bo.max, h);
    let mut out = Vec::new();
    for x in lo.x..=hi.x {
        for y in lo.y..=hi.y {
            for z in lo.z..=hi.z {
                out.push(CellKey::new(x, y, z, h));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_key_basic() {
        let k = CellKey::containing(Vec3::new(0.5, 1.5, -0.5), 0);
        assert_eq!(k, CellKey::new(0, 1, -1, 0));

        let k = CellKey::containing(Vec3::new(5.0, 0.0, 0.0), 2);
        assert_eq!(k, CellKey::new(1, 0, 0, 2));

        let k = CellKey::containing(Vec3::new(0.3, 0.0, 0.0), -2);
        assert_eq!(k, CellKey::new(1, 0, 0, -2));
    }

    #[test]
    fn cell_key_rederivation_is_stable() {
        let points = [
            Vec3::new(0.1, 0.2, 0.3),
            Vec3::new(-17.25, 3.5, 1e-3),
            Vec3::new(1024.0, -1024.0, 7.77),
        ];
        for p in points {
            for h in -5..6 {
                let k = CellKey::containing(p, h);
                let stored: [f32; 3] = p.into();
                assert_eq!(k, CellKey::containing(Vec3::from(stored), h));
                assert!(k.cube().contains_box(&Box3::from_points(&[p])));
            }
        }
    }

    #[test]
    fn parent_child_roundtrip() {
        let k = CellKey::new(-3, 4, 5, 1);
        let p = k.parent();
        assert_eq!(p, CellKey::new(-2, 2, 2, 2));
        let children = p.children();
        assert!(children.contains(&k));
        assert_eq!(children[k.child_bit() as usize], k);
        for c in children {
            assert_eq!(c.parent(), p);
        }
    }

    #[test]
    fn same_region_across_levels() {
        let fine = CellKey::new(5, 2, 0, 0);
        assert!(fine.same_region(&CellKey::new(1, 0, 0, 2)));
        assert!(!fine.same_region(&CellKey::new(0, 0, 0, 2)));
        assert!(fine.same_region(&fine));
    }

    #[test]
    fn compute_level_values() {
        assert_eq!(compute_level(1.0, 1.0), 0);
        assert_eq!(compute_level(1.0, 1.99), 0);
        assert_eq!(compute_level(1.0, 2.0), 1);
        assert_eq!(compute_level(50.0, 0.01), -1);
        assert_eq!(compute_level(1.0, 0.0), MIN_LEVEL);
    }

    #[test]
    fn scale_range_ops() {
        let mut sr = ScaleRange::EMPTY;
        assert!(sr.is_empty());
        sr.add(3);
        assert_eq!(sr, ScaleRange::single(3));
        assert!(sr.add_range(&ScaleRange::new(1, 2)));
        assert!(!sr.add_range(&ScaleRange::new(2, 3)));
        assert_eq!(sr, ScaleRange::new(1, 3));
        assert_eq!(sr.clamp(7), 3);
        assert!(sr.includes(2));
    }

    #[test]
    fn overlapping_keys_spans_boundary() {
        let b = Box3::new(Vec3::new(0.2, 0.1, 0.5), Vec3::new(1.6, 0.85, 0.5));
        let keys = overlapping_keys(&b, 0);
        assert_eq!(
            keys,
            vec![CellKey::new(0, 0, 0, 0), CellKey::new(1, 0, 0, 0)]
        );
    }
}
