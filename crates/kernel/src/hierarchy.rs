use std::collections::{BTreeMap, BTreeSet};

use ocme_common::{CellKey, MAX_LEVEL, triangle_normal};

use crate::error::OcmeError;
use crate::impostor::DecodedSample;
use crate::ocme::Ocme;

impl Ocme {
    /// Recompute the direct samples of each cell from its faces.
    pub fn fill_samples(&mut self, keys: &[CellKey]) -> Result<(), OcmeError> {
        for key in keys {
            if !self.cells.contains_key(key) {
                continue;
            }
            let faces = self.faces(key)?.to_vec()?;
            let mut samples = Vec::with_capacity(faces.len());
            for f in &faces {
                let pts = [
                    self.vertex_position(key, f.v[0])?,
                    self.vertex_position(key, f.v[1])?,
                    self.vertex_position(key, f.v[2])?,
                ];
                let color = self.face_color(key, f)?;
                samples.push(((pts[0] + pts[1] + pts[2]) / 3.0, triangle_normal(&pts), color));
            }
            let cube = key.cube();
            let imp = self.impostors.entry(*key).or_default();
            imp.reset_direct();
            for (centroid, normal, color) in samples {
                imp.add_sample(&cube, centroid, normal, color);
            }
        }
        Ok(())
    }

    /// Build the hierarchy bottom-up from the given nodes.
    pub fn build_impostors_hierarchy(&mut self, from: &[CellKey]) -> Result<(), OcmeError> {
        self.build_hierarchy(from, false)
    }

    /// As [`Ocme::build_impostors_hierarchy`], but above a parent that is
    /// neither dirty nor new the propagation stops.
    pub fn build_impostors_hierarchy_partial(&mut self, from: &[CellKey]) -> Result<(), OcmeError> {
        self.build_hierarchy(from, true)
    }

    fn build_hierarchy(&mut self, from: &[CellKey], partial: bool) -> Result<(), OcmeError> {
        let _span =
            tracing::info_span!("build_impostors_hierarchy", nodes = from.len(), partial).entered();
        self.build_stamp += 1;
        let stamp = self.build_stamp;
        let min_occupancy = self.config.impostor_min_occupancy;

        let mut levels: BTreeMap<i32, BTreeSet<CellKey>> = BTreeMap::new();
        for k in from {
            if self.cells.contains_key(k) || self.impostors.contains_key(k) {
                levels.entry(k.h).or_default().insert(*k);
            }
        }

        let mut finalized = 0usize;
        let mut roots = 0usize;
        while let Some((h, keys)) = levels.pop_first() {
            let mut parents: BTreeMap<CellKey, bool> = BTreeMap::new();
            for key in keys {
                let Some((occupancy, non_empty)) = self.finalize_node(&key, stamp) else {
                    continue;
                };
                finalized += 1;
                if h >= MAX_LEVEL {
                    roots += 1;
                    continue;
                }
                let parent = key.parent();
                let is_new = !self.impostors.contains_key(&parent);
                if is_new && !non_empty {
                    continue;
                }
                self.impostors
                    .entry(parent)
                    .or_default()
                    .set_child(key.child_bit(), occupancy, non_empty);
                *parents.entry(parent).or_insert(false) |= is_new;
            }

            for (parent, is_new) in parents {
                let Some(imp) = self.impostors.get(&parent) else {
                    continue;
                };
                if imp.occupancy < min_occupancy {
                    self.finalize_node(&parent, stamp);
                    roots += 1;
                } else if !partial || is_new || imp.dirty {
                    levels.entry(parent.h).or_default().insert(parent);
                } else {
                    self.finalize_node(&parent, stamp);
                }
            }
        }
        tracing::debug!(finalized, roots, stamp, "impostor hierarchy built");
        Ok(())
    }

    /// Finalize one node from its direct samples and its present children.
    /// Empty nodes without a cell are dropped. Returns the node's occupancy
    /// and whether it holds samples.
    fn finalize_node(&mut self, key: &CellKey, stamp: u64) -> Option<(f32, bool)> {
        let child_samples: Vec<DecodedSample> = match self.impostors.get(key) {
            Some(imp) => key
                .children()
                .iter()
                .filter(|c| imp.has_child(c.child_bit()))
                .filter_map(|c| self.impostors.get(c).map(|ci| ci.decoded_samples(&c.cube())))
                .flatten()
                .collect(),
            None if self.cells.contains_key(key) => Vec::new(),
            None => return None,
        };
        let imp = self.impostors.entry(*key).or_default();
        imp.finalize(&key.cube(), &child_samples, stamp);
        let result = (imp.occupancy, !imp.samples.is_empty());
        if imp.is_empty() && !self.cells.contains_key(key) {
            self.impostors.remove(key);
        }
        Some(result)
    }

    /// Top-down invalidation after the given cells changed or were removed.
    ///
    /// Removed cells lose their direct samples and their parent's child bit.
    /// A parent turns dirty once at least half of its non-empty children
    /// changed; dirty parents propagate to their own parent.
    pub fn clear_impostors(&mut self, keys: &[CellKey]) {
        let mut level: BTreeMap<CellKey, u8> = BTreeMap::new();
        for k in keys {
            if self.cells.contains_key(k) {
                self.impostors.entry(*k).or_default().dirty = true;
            } else {
                self.drop_impostor(*k);
            }
            *level.entry(k.parent()).or_default() |= 1 << k.child_bit();
        }

        while !level.is_empty() {
            let mut next: BTreeMap<CellKey, u8> = BTreeMap::new();
            for (parent, mask) in level {
                let Some(imp) = self.impostors.get_mut(&parent) else {
                    continue;
                };
                let total = (imp.non_empty_children | mask).count_ones();
                if imp.dirty || mask.count_ones() * 2 < total {
                    continue;
                }
                imp.dirty = true;
                *next.entry(parent.parent()).or_default() |= 1 << parent.child_bit();
            }
            level = next;
        }
    }

    /// Forget the direct samples of a removed cell. A node left empty is
    /// dropped and unlinked from its parent, which may go the same way.
    fn drop_impostor(&mut self, mut key: CellKey) {
        loop {
            if let Some(imp) = self.impostors.get_mut(&key) {
                imp.reset_direct();
                imp.dirty = true;
                if !imp.is_empty() {
                    return;
                }
                self.impostors.remove(&key);
            }
            let parent = key.parent();
            let Some(p) = self.impostors.get_mut(&parent) else {
                return;
            };
            p.clear_child(key.child_bit());
            if !p.is_empty() || self.cells.contains_key(&parent) {
                return;
            }
            key = parent;
        }
    }

    /// Nodes no present parent aggregates.
    pub fn roots(&self) -> Vec<CellKey> {
        self.impostors
            .iter()
            .filter(|(k, imp)| {
                !imp.is_empty()
                    && self
                        .impostors
                        .get(&k.parent())
                        .is_none_or(|p| !p.has_child(k.child_bit()))
            })
            .map(|(k, _)| *k)
            .collect()
    }

    /// Decoded samples of every root, for a coarse overview of the store.
    pub fn root_samples(&self) -> Vec<(CellKey, Vec<DecodedSample>)> {
        self.roots()
            .into_iter()
            .map(|k| (k, self.impostor_samples(&k)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use ocme_common::{CellKey, MAX_LEVEL, TriMesh};
    use ocme_persist::MemoryStore;

    use crate::config::OcmeConfig;
    use crate::impostor::VOXEL_COUNT;
    use crate::ocme::Ocme;
    use crate::ocme::fixtures::{memory_ocme, unit_config};

    fn small_triangle(at: Vec3) -> TriMesh {
        TriMesh::new(
            vec![
                at + Vec3::splat(0.1),
                at + Vec3::new(0.4, 0.1, 0.1),
                at + Vec3::new(0.1, 0.4, 0.1),
            ],
            vec![[0, 1, 2]],
        )
    }

    #[test]
    fn parent_occupancy_is_mean_of_children() {
        let mut ocme = memory_ocme();
        ocme.add_mesh(&small_triangle(Vec3::ZERO)).unwrap();

        let leaf = CellKey::new(0, 0, 0, -2);
        let parent = leaf.parent();
        let leaf_imp = ocme.impostor(&leaf).unwrap();
        assert_eq!(leaf_imp.samples.len(), 1);
        assert!((leaf_imp.occupancy - 1.0 / VOXEL_COUNT as f32).abs() < 1e-9);
        let leaf_occupancy = leaf_imp.occupancy;

        let p = ocme.impostor(&parent).unwrap();
        assert_eq!(p.non_empty_children.count_ones(), 1);
        assert!(p.has_child(leaf.child_bit()));
        assert!((p.occupancy - leaf_occupancy / 8.0).abs() < 1e-9);
        assert_eq!(p.samples.len(), 1);
        assert!(!p.dirty);

        // Below the minimum occupancy the parent ends the hierarchy.
        assert_eq!(ocme.roots(), vec![parent]);
        assert_eq!(ocme.root_samples()[0].1.len(), 1);
    }

    #[test]
    fn zero_threshold_reaches_the_top_level() {
        let config = OcmeConfig {
            impostor_min_occupancy: 0.0,
            ..unit_config()
        };
        let mut ocme = Ocme::create(Box::new(MemoryStore::new()), config).unwrap();
        ocme.add_mesh(&small_triangle(Vec3::ZERO)).unwrap();
        assert_eq!(ocme.roots(), vec![CellKey::new(0, 0, 0, MAX_LEVEL)]);
    }

    #[test]
    fn fill_samples_matches_ingest() {
        let mut ocme = memory_ocme();
        ocme.add_mesh(&small_triangle(Vec3::ZERO)).unwrap();
        let leaf = CellKey::new(0, 0, 0, -2);
        let before = ocme.impostor(&leaf).unwrap().direct_samples.clone();
        ocme.fill_samples(&[leaf]).unwrap();
        ocme.build_impostors_hierarchy(&[leaf]).unwrap();
        assert_eq!(ocme.impostor(&leaf).unwrap().direct_samples, before);
    }

    #[test]
    fn partial_rebuild_revisits_only_dirty_branches() {
        let mut ocme = memory_ocme();
        ocme.add_mesh(&small_triangle(Vec3::ZERO)).unwrap();
        let a = CellKey::new(0, 0, 0, -2);
        let pa = a.parent();
        let stamp_a = ocme.impostor(&pa).unwrap().stamp;

        ocme.add_mesh(&small_triangle(Vec3::splat(10.0))).unwrap();
        assert_eq!(ocme.impostor(&pa).unwrap().stamp, stamp_a);

        ocme.clear_impostors(&[a]);
        assert!(ocme.impostor(&a).unwrap().dirty);
        assert!(ocme.impostor(&pa).unwrap().dirty);
        ocme.fill_samples(&[a]).unwrap();
        ocme.build_impostors_hierarchy_partial(&[a]).unwrap();
        assert!(ocme.impostor(&pa).unwrap().stamp > stamp_a);
        assert!(!ocme.impostor(&pa).unwrap().dirty);
    }

    #[test]
    fn removing_a_cell_prunes_its_branch() {
        let mut ocme = memory_ocme();
        ocme.add_mesh(&small_triangle(Vec3::ZERO)).unwrap();
        let leaf = CellKey::new(0, 0, 0, -2);
        assert!(ocme.remove_cell(leaf).unwrap());
        assert!(ocme.impostor(&leaf).is_none());
        assert!(ocme.impostor(&leaf.parent()).is_none());
        assert!(ocme.roots().is_empty());
    }
}
