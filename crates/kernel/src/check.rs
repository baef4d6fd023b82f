//! Consistency checks over the whole store.

use ocme_common::{Box3, CellKey, overlapping_keys};

use crate::cell::AttributeKind;
use crate::elements::OVertex;
use crate::error::OcmeError;
use crate::ocme::Ocme;

fn violation(msg: String) -> OcmeError {
    tracing::warn!(%msg, "invariant violated");
    OcmeError::Invariant(msg)
}

impl Ocme {
    /// Run every check; the first violation is returned.
    pub fn check_all(&mut self) -> Result<(), OcmeError> {
        let _span = tracing::info_span!("check_all", cells = self.cells.len()).entered();
        self.check_dependence_symmetry()?;
        self.check_scale_ranges()?;
        self.check_referential_integrity()?;
        self.check_dependence_property()?;
        Ok(())
    }

    /// Every dependence is recorded on both ends, between existing cells.
    pub fn check_dependence_symmetry(&self) -> Result<(), OcmeError> {
        for (key, cell) in &self.cells {
            for d in &cell.dependence_set {
                if *d == *key {
                    return Err(violation(format!("{key} depends on itself")));
                }
                match self.cells.get(d) {
                    None => return Err(violation(format!("{key} depends on missing {d}"))),
                    Some(other) if !other.dependence_set.contains(key) => {
                        return Err(violation(format!("{key} -> {d} is not mirrored")));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Dependent cells include each other's scale range.
    pub fn check_scale_ranges(&self) -> Result<(), OcmeError> {
        for (key, cell) in &self.cells {
            for d in &cell.dependence_set {
                let Some(other) = self.cells.get(d) else {
                    continue;
                };
                if !cell.bbox.sr.contains_range(&other.bbox.sr) {
                    return Err(violation(format!(
                        "scale range of {key} ({}..{}) misses {d} ({}..{})",
                        cell.bbox.sr.min, cell.bbox.sr.max, other.bbox.sr.min, other.bbox.sr.max
                    )));
                }
            }
        }
        Ok(())
    }

    /// Face corners, ghosts, ext entries, border entries and attribute
    /// chains all point at existing elements; ext entries are one step.
    pub fn check_referential_integrity(&mut self) -> Result<(), OcmeError> {
        let keys: Vec<CellKey> = self.cells.keys().copied().collect();
        for key in &keys {
            let vcount = self.vertex_count(key);
            let fcount = self.face_count(key);
            for (j, f) in self.faces(key)?.to_vec()?.iter().enumerate() {
                if f.v.iter().any(|&v| v as usize >= vcount) {
                    return Err(violation(format!("face {j} of {key} has corners {:?}", f.v)));
                }
            }
            let ext = self.externals(key)?.to_vec()?;
            for (i, v) in self.vertices(key)?.to_vec()?.iter().enumerate() {
                if let OVertex::External { r } = v {
                    if *r as usize >= ext.len() {
                        return Err(violation(format!("ghost {i} of {key} names ext entry {r}")));
                    }
                }
            }
            for (r, o) in ext.iter().enumerate() {
                if !self.cell_ref(key)?.dependence_set.contains(&o.ck) {
                    return Err(violation(format!(
                        "ext entry {r} of {key} names {} outside its dependence set",
                        o.ck
                    )));
                }
                if o.i as usize >= self.vertex_count(&o.ck) {
                    return Err(violation(format!("ext entry {r} of {key} names {}:{}", o.ck, o.i)));
                }
                if self.vertices(&o.ck)?.get(o.i)?.is_external() {
                    return Err(violation(format!(
                        "ext entry {r} of {key} names ghost {}:{}",
                        o.ck, o.i
                    )));
                }
            }
            for b in self.borders(key)?.to_vec()? {
                if b.vi as usize >= vcount {
                    return Err(violation(format!("border entry of {key} names slot {}", b.vi)));
                }
            }
            let cell = self.cell_ref(key)?;
            let attrs: Vec<(String, usize)> = cell
                .attributes
                .values()
                .map(|a| {
                    let n = match a.kind {
                        AttributeKind::Vertex => vcount,
                        AttributeKind::Face => fcount,
                    };
                    (a.chain.clone(), n)
                })
                .collect();
            for (chain, n) in attrs {
                if self.env.chain_len(&chain) != Some(n) {
                    return Err(violation(format!("attribute chain {chain} is not {n} long")));
                }
            }
        }
        Ok(())
    }

    /// Each face lies in its cell's box at a level of its cell's range, and
    /// every other existing same-level cell it overlaps covers it and
    /// depends on its cell.
    pub fn check_dependence_property(&mut self) -> Result<(), OcmeError> {
        let keys: Vec<CellKey> = self.cells.keys().copied().collect();
        for key in &keys {
            if !self.cell_ref(key)?.bbox.sr.includes(key.h) && self.face_count(key) > 0 {
                return Err(violation(format!("{key} holds faces outside its scale range")));
            }
            for tri in self.cell_triangles(key)? {
                let fbox = Box3::from_points(&tri);
                if !self.cell_ref(key)?.bbox.bbox3.contains_box(&fbox) {
                    return Err(violation(format!("{key} box misses one of its faces")));
                }
                for ok in overlapping_keys(&fbox, key.h) {
                    if ok == *key {
                        continue;
                    }
                    let Some(other) = self.cells.get(&ok) else {
                        continue;
                    };
                    if !other.dependence_set.contains(key) || !other.bbox.bbox3.contains_box(&fbox) {
                        return Err(violation(format!("{ok} overlaps a face of {key} unlinked")));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use ocme_common::{CellKey, GIndex, ScaleRange, TriMesh};

    use crate::elements::OVertex;
    use crate::error::OcmeError;
    use crate::ocme::fixtures::{memory_ocme, strip};

    const A: CellKey = CellKey { x: 0, y: 0, z: 0, h: 0 };
    const B: CellKey = CellKey { x: 1, y: 0, z: 0, h: 0 };

    #[test]
    fn one_sided_dependence_is_reported() {
        let mut ocme = memory_ocme();
        ocme.add_mesh(&strip(2)).unwrap();
        ocme.check_all().unwrap();
        ocme.cell_mut(&B).unwrap().dependence_set.remove(&A);
        assert!(matches!(
            ocme.check_dependence_symmetry(),
            Err(OcmeError::Invariant(_))
        ));
    }

    #[test]
    fn narrower_dependent_range_is_reported() {
        let mut ocme = memory_ocme();
        ocme.add_mesh(&strip(2)).unwrap();
        ocme.cell_mut(&B).unwrap().bbox.sr = ScaleRange::new(0, 2);
        assert!(ocme.check_scale_ranges().is_err());
    }

    #[test]
    fn ghost_of_a_ghost_is_reported() {
        let mut ocme = memory_ocme();
        ocme.add_mesh(&TriMesh::grid(Vec3::new(0.1, 0.1, 0.5), 2, 1, 1.0))
            .unwrap();
        ocme.check_referential_integrity().unwrap();

        // Point B's first ghost at another ghost instead of its owner.
        let ghost = (0..ocme.vertex_count(&B) as u32)
            .find(|&i| ocme.vertices(&B).unwrap().get(i).unwrap().is_external())
            .unwrap();
        let OVertex::External { r } = ocme.vertices(&B).unwrap().get(ghost).unwrap() else {
            unreachable!()
        };
        ocme.externals(&B).unwrap().set(r, GIndex::new(B, ghost)).unwrap();
        assert!(ocme.check_referential_integrity().is_err());
    }

    #[test]
    fn face_outside_its_cell_box_is_reported() {
        let mut ocme = memory_ocme();
        ocme.add_mesh(&strip(1)).unwrap();
        ocme.vertices(&A)
            .unwrap()
            .set(0, OVertex::Owned { p: [-3.0, 0.1, 0.3] })
            .unwrap();
        assert!(ocme.check_dependence_property().is_err());
    }
}
