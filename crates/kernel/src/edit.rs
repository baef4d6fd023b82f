//! Extraction of an editable working mesh from a set of cells.
//!
//! # Invariants
//! - One mesh vertex per conceptual vertex: ghosts resolve to their owner.
//! - Elements of cells outside the selection are locked and never written back.
//! - A session pins every chain of its closure until commit or abort.

use std::collections::{BTreeSet, HashMap};

use glam::Vec3;
use ocme_common::{CellKey, Color4b, GIndex, GREY, ScaleRange};

use crate::elements::COLOR_ATTRIBUTE;
use crate::error::OcmeError;
use crate::ocme::Ocme;

/// Flat triangle mesh handed to the host for editing.
///
/// Carries the hidden global indices that map each element back to the
/// cell slot it came from. Elements added by the host have no global index.
#[derive(Debug, Clone, Default)]
pub struct EditMesh {
    pub(crate) positions: Vec<Vec3>,
    pub(crate) faces: Vec<[u32; 3]>,
    pub(crate) colors: Vec<Color4b>,
    pub(crate) vertex_deleted: Vec<bool>,
    pub(crate) face_deleted: Vec<bool>,
    pub(crate) vertex_locked: Vec<bool>,
    pub(crate) face_locked: Vec<bool>,
    pub(crate) vertex_gindex: Vec<Option<GIndex>>,
    pub(crate) face_gindex: Vec<Option<GIndex>>,
    pub(crate) has_colors: bool,
    pub(crate) scale_range: ScaleRange,
    pub(crate) selection: Vec<CellKey>,
    pub(crate) generation: u64,
}

impl EditMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn position(&self, v: u32) -> Option<Vec3> {
        self.positions.get(v as usize).copied()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn face(&self, f: u32) -> Option<[u32; 3]> {
        self.faces.get(f as usize).copied()
    }

    pub fn faces(&self) -> &[[u32; 3]] {
        &self.faces
    }

    pub fn color(&self, v: u32) -> Option<Color4b> {
        self.colors.get(v as usize).copied()
    }

    pub fn is_vertex_deleted(&self, v: u32) -> bool {
        self.vertex_deleted.get(v as usize).copied().unwrap_or(true)
    }

    pub fn is_face_deleted(&self, f: u32) -> bool {
        self.face_deleted.get(f as usize).copied().unwrap_or(true)
    }

    pub fn is_vertex_locked(&self, v: u32) -> bool {
        self.vertex_locked.get(v as usize).copied().unwrap_or(false)
    }

    pub fn is_face_locked(&self, f: u32) -> bool {
        self.face_locked.get(f as usize).copied().unwrap_or(false)
    }

    pub fn vertex_gindex(&self, v: u32) -> Option<GIndex> {
        self.vertex_gindex.get(v as usize).copied().flatten()
    }

    pub fn face_gindex(&self, f: u32) -> Option<GIndex> {
        self.face_gindex.get(f as usize).copied().flatten()
    }

    pub fn scale_range(&self) -> ScaleRange {
        self.scale_range
    }

    pub fn selection(&self) -> &[CellKey] {
        &self.selection
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Faces neither deleted nor locked.
    pub fn live_face_count(&self) -> usize {
        (0..self.faces.len())
            .filter(|&f| !self.face_deleted[f] && !self.face_locked[f])
            .count()
    }

    fn check_vertex(&self, v: u32) -> Result<usize, OcmeError> {
        let i = v as usize;
        if i >= self.positions.len() || self.vertex_deleted[i] {
            return Err(OcmeError::InvalidIndex {
                kind: "vertex",
                index: v,
            });
        }
        Ok(i)
    }

    fn check_face(&self, f: u32) -> Result<usize, OcmeError> {
        let i = f as usize;
        if i >= self.faces.len() || self.face_deleted[i] {
            return Err(OcmeError::InvalidIndex {
                kind: "face",
                index: f,
            });
        }
        Ok(i)
    }

    /// Append a new, unassigned vertex.
    pub fn add_vertex(&mut self, p: Vec3) -> u32 {
        self.add_vertex_with_color(p, GREY)
    }

    pub fn add_vertex_with_color(&mut self, p: Vec3, color: Color4b) -> u32 {
        let v = self.positions.len() as u32;
        self.positions.push(p);
        self.colors.push(color);
        self.vertex_deleted.push(false);
        self.vertex_locked.push(false);
        self.vertex_gindex.push(None);
        v
    }

    /// Append a new face over live vertices.
    pub fn add_face(&mut self, v: [u32; 3]) -> Result<u32, OcmeError> {
        for &vi in &v {
            self.check_vertex(vi)?;
        }
        let f = self.faces.len() as u32;
        self.faces.push(v);
        self.face_deleted.push(false);
        self.face_locked.push(false);
        self.face_gindex.push(None);
        Ok(f)
    }

    pub fn move_vertex(&mut self, v: u32, p: Vec3) -> Result<(), OcmeError> {
        let i = self.check_vertex(v)?;
        if self.vertex_locked[i] {
            return Err(OcmeError::Locked {
                kind: "vertex",
                index: v,
            });
        }
        self.positions[i] = p;
        Ok(())
    }

    pub fn set_color(&mut self, v: u32, color: Color4b) -> Result<(), OcmeError> {
        let i = self.check_vertex(v)?;
        if self.vertex_locked[i] {
            return Err(OcmeError::Locked {
                kind: "vertex",
                index: v,
            });
        }
        self.colors[i] = color;
        self.has_colors = true;
        Ok(())
    }

    pub fn delete_face(&mut self, f: u32) -> Result<(), OcmeError> {
        let i = self.check_face(f)?;
        if self.face_locked[i] {
            return Err(OcmeError::Locked {
                kind: "face",
                index: f,
            });
        }
        self.face_deleted[i] = true;
        Ok(())
    }

    /// Flag a vertex deleted. Faces still using it are dropped at commit.
    pub fn delete_vertex(&mut self, v: u32) -> Result<(), OcmeError> {
        let i = self.check_vertex(v)?;
        if self.vertex_locked[i] {
            return Err(OcmeError::Locked {
                kind: "vertex",
                index: v,
            });
        }
        self.vertex_deleted[i] = true;
        Ok(())
    }

    /// Clear the deletion flag of a vertex.
    pub fn restore_vertex(&mut self, v: u32) -> Result<(), OcmeError> {
        let i = v as usize;
        if i >= self.positions.len() || !self.vertex_deleted[i] {
            return Err(OcmeError::InvalidIndex {
                kind: "vertex",
                index: v,
            });
        }
        self.vertex_deleted[i] = false;
        Ok(())
    }

    /// Clear the deletion flag of a face whose corners are all live.
    pub fn restore_face(&mut self, f: u32) -> Result<(), OcmeError> {
        let i = f as usize;
        if i >= self.faces.len() || !self.face_deleted[i] {
            return Err(OcmeError::InvalidIndex {
                kind: "face",
                index: f,
            });
        }
        for vi in self.faces[i] {
            self.check_vertex(vi)?;
        }
        self.face_deleted[i] = false;
        Ok(())
    }

    /// Take back the last vertex, if the host added it and no face uses it.
    pub fn pop_vertex(&mut self) -> Option<(Vec3, Color4b)> {
        let last = self.positions.len().checked_sub(1)?;
        if self.vertex_gindex[last].is_some()
            || self.faces.iter().any(|f| f.contains(&(last as u32)))
        {
            return None;
        }
        self.vertex_deleted.pop();
        self.vertex_locked.pop();
        self.vertex_gindex.pop();
        let color = self.colors.pop()?;
        let p = self.positions.pop()?;
        Some((p, color))
    }

    /// Take back the last face, if the host added it.
    pub fn pop_face(&mut self) -> Option<[u32; 3]> {
        let last = self.faces.len().checked_sub(1)?;
        if self.face_gindex[last].is_some() {
            return None;
        }
        self.face_deleted.pop();
        self.face_locked.pop();
        self.face_gindex.pop();
        self.faces.pop()
    }

    /// Drop deleted elements, renumbering the rest. Hidden indices follow
    /// their elements; faces over deleted vertices are dropped too.
    pub fn compact(&mut self) {
        let mut remap = vec![None; self.positions.len()];
        let mut w = 0usize;
        for (i, slot) in remap.iter_mut().enumerate() {
            if self.vertex_deleted[i] {
                continue;
            }
            self.positions.swap(w, i);
            self.colors.swap(w, i);
            self.vertex_locked.swap(w, i);
            self.vertex_gindex.swap(w, i);
            *slot = Some(w as u32);
            w += 1;
        }
        self.positions.truncate(w);
        self.colors.truncate(w);
        self.vertex_locked.truncate(w);
        self.vertex_gindex.truncate(w);
        self.vertex_deleted = vec![false; w];

        let mut wf = 0usize;
        for i in 0..self.faces.len() {
            let mapped = self.faces[i].map(|v| remap[v as usize]);
            if self.face_deleted[i] || mapped.iter().any(Option::is_none) {
                continue;
            }
            self.faces[wf] = mapped.map(|v| v.unwrap_or_default());
            self.face_locked.swap(wf, i);
            self.face_gindex.swap(wf, i);
            wf += 1;
        }
        self.faces.truncate(wf);
        self.face_locked.truncate(wf);
        self.face_gindex.truncate(wf);
        self.face_deleted = vec![false; wf];
    }
}

/// Bookkeeping of the open edit session.
#[derive(Debug, Clone)]
pub(crate) struct EditState {
    pub generation: u64,
    pub selection: BTreeSet<CellKey>,
    pub closure: BTreeSet<CellKey>,
    pub locked: BTreeSet<CellKey>,
    /// Non-locked faces handed out, for the commit-time diff.
    pub edited_faces: BTreeSet<GIndex>,
    /// Non-locked vertex owners handed out.
    pub edited_vertices: BTreeSet<GIndex>,
    pub scale_range: ScaleRange,
}

impl Ocme {
    /// Open an edit session on the selected cells with the configured
    /// memory ceiling.
    pub fn edit(&mut self, selected: &[CellKey]) -> Result<EditMesh, OcmeError> {
        let ceiling = self.config.edit_memory_ceiling;
        self.edit_with_ceiling(selected, ceiling)
    }

    /// Open an edit session: extend the selection, lock its dependents, pin
    /// the closure and extract a flat mesh.
    ///
    /// Fails with [`OcmeError::Capacity`] without loading anything when the
    /// closure's working set exceeds `memory_ceiling`.
    pub fn edit_with_ceiling(
        &mut self,
        selected: &[CellKey],
        memory_ceiling: usize,
    ) -> Result<EditMesh, OcmeError> {
        let _span = tracing::info_span!("edit", selected = selected.len()).entered();
        self.ensure_idle()?;

        let mut selection = BTreeSet::new();
        for key in selected {
            self.cell_ref(key)?;
            selection.insert(*key);
        }
        // Cells covering the same region at another level join the selection.
        for key in selected {
            let deps: Vec<CellKey> = self.cell_ref(key)?.dependence_set.iter().copied().collect();
            for d in deps {
                if d.h != key.h && d.same_region(key) {
                    selection.insert(d);
                }
            }
        }

        let mut closure = selection.clone();
        for key in &selection {
            closure.extend(self.cell_ref(key)?.dependence_set.iter().copied());
        }
        let locked: BTreeSet<CellKey> = closure.difference(&selection).copied().collect();

        let needed: usize = closure
            .iter()
            .filter_map(|k| self.cells.get(k))
            .flat_map(|c| c.chain_names())
            .map(|name| self.env.chain_bytes(&name))
            .sum();
        if needed > memory_ceiling {
            tracing::warn!(needed, memory_ceiling, "edit declined");
            return Err(OcmeError::Capacity {
                needed,
                ceiling: memory_ceiling,
            });
        }

        self.generation += 1;
        let generation = self.generation;
        let mut scale_range = ScaleRange::EMPTY;
        for key in &closure {
            let cell = self.cell_mut(key)?;
            if selection.contains(key) {
                cell.selected_gen = generation;
                scale_range.add_range(&cell.bbox.sr);
            } else {
                cell.locked_gen = generation;
            }
        }
        if let Err(e) = self.pin(&closure) {
            self.unpin(&closure);
            return Err(e);
        }

        let mut state = EditState {
            generation,
            selection,
            closure,
            locked,
            edited_faces: BTreeSet::new(),
            edited_vertices: BTreeSet::new(),
            scale_range,
        };
        let mesh = match self.extract(&mut state) {
            Ok(mesh) => mesh,
            Err(e) => {
                self.unpin(&state.closure);
                return Err(e);
            }
        };
        tracing::info!(
            generation,
            vertices = mesh.vertex_count(),
            faces = mesh.face_count(),
            closure = state.closure.len(),
            "edit opened"
        );
        self.session = Some(state);
        Ok(mesh)
    }

    fn extract(&mut self, state: &mut EditState) -> Result<EditMesh, OcmeError> {
        let mut mesh = EditMesh {
            scale_range: state.scale_range,
            selection: state.selection.iter().copied().collect(),
            generation: state.generation,
            ..EditMesh::default()
        };
        let mut by_owner: HashMap<GIndex, u32> = HashMap::new();

        let closure: Vec<CellKey> = state.closure.iter().copied().collect();
        for key in &closure {
            let cell_locked = state.locked.contains(key);
            mesh.has_colors |= self.has_attribute(key, COLOR_ATTRIBUTE);

            let n = self.vertex_count(key) as u32;
            let mut local = Vec::with_capacity(n as usize);
            for i in 0..n {
                let owner = self.owner_of(key, i)?;
                local.push(self.mesh_vertex(&mut mesh, &mut by_owner, state, owner)?);
            }

            let faces = self.faces(key)?.to_vec()?;
            for (j, f) in faces.iter().enumerate() {
                let g = GIndex::new(*key, j as u32);
                mesh.faces.push(f.v.map(|v| local[v as usize]));
                mesh.face_deleted.push(false);
                mesh.face_locked.push(cell_locked);
                mesh.face_gindex.push(Some(g));
                if !cell_locked {
                    state.edited_faces.insert(g);
                }
            }
        }
        Ok(mesh)
    }

    /// Mesh index of a conceptual vertex, adding it on first sight.
    fn mesh_vertex(
        &mut self,
        mesh: &mut EditMesh,
        by_owner: &mut HashMap<GIndex, u32>,
        state: &mut EditState,
        owner: GIndex,
    ) -> Result<u32, OcmeError> {
        if let Some(&v) = by_owner.get(&owner) {
            return Ok(v);
        }
        let p = self.owned_position(owner)?;
        let color = self.vertex_color(&owner.ck, owner.i)?.unwrap_or(GREY);
        let locked = !state.selection.contains(&owner.ck);
        let v = mesh.positions.len() as u32;
        mesh.positions.push(p);
        mesh.colors.push(color);
        mesh.vertex_deleted.push(false);
        mesh.vertex_locked.push(locked);
        mesh.vertex_gindex.push(Some(owner));
        if !locked {
            state.edited_vertices.insert(owner);
        }
        by_owner.insert(owner, v);
        Ok(v)
    }

    /// Discard the open session; nothing is written back.
    pub fn abort_edit(&mut self) -> Result<(), OcmeError> {
        let state = self
            .session
            .take()
            .ok_or(OcmeError::InvalidState("no edit session is open"))?;
        self.unpin(&state.closure);
        tracing::info!(generation = state.generation, "edit aborted");
        Ok(())
    }

    fn pin(&mut self, keys: &BTreeSet<CellKey>) -> Result<(), OcmeError> {
        for key in keys {
            let names = self.cell_ref(key)?.chain_names();
            for name in names {
                self.env.load_all_dyn(&name)?;
            }
        }
        Ok(())
    }

    /// Release the pins taken by an edit. Cells removed since are skipped.
    pub(crate) fn unpin(&mut self, keys: &BTreeSet<CellKey>) {
        for key in keys {
            let Some(cell) = self.cells.get(key) else {
                continue;
            };
            for name in cell.chain_names() {
                if let Err(e) = self.env.free_all_dyn(&name) {
                    tracing::warn!(%key, chain = name, error = %e, "failed to release chain");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle_mesh() -> EditMesh {
        let mut m = EditMesh::default();
        let a = m.add_vertex(Vec3::ZERO);
        let b = m.add_vertex(Vec3::X);
        let c = m.add_vertex(Vec3::Y);
        let d = m.add_vertex(Vec3::Z);
        m.add_face([a, b, c]).unwrap();
        m.add_face([a, c, d]).unwrap();
        m
    }

    #[test]
    fn host_helpers_respect_deletion() {
        let mut m = triangle_mesh();
        m.delete_face(0).unwrap();
        assert!(m.delete_face(0).is_err());
        m.delete_vertex(3).unwrap();
        assert!(matches!(
            m.add_face([0, 1, 3]),
            Err(OcmeError::InvalidIndex { kind: "vertex", .. })
        ));
        assert!(m.move_vertex(3, Vec3::ONE).is_err());
    }

    #[test]
    fn locked_elements_refuse_edits() {
        let mut m = triangle_mesh();
        m.vertex_locked[1] = true;
        m.face_locked[1] = true;
        assert!(matches!(
            m.move_vertex(1, Vec3::ONE),
            Err(OcmeError::Locked { kind: "vertex", index: 1 })
        ));
        assert!(matches!(m.delete_face(1), Err(OcmeError::Locked { .. })));
        assert_eq!(m.live_face_count(), 1);
    }

    #[test]
    fn restore_and_pop_take_back_host_edits() {
        let mut m = triangle_mesh();
        m.delete_vertex(3).unwrap();
        m.delete_face(1).unwrap();
        assert!(m.restore_face(1).is_err());
        m.restore_vertex(3).unwrap();
        m.restore_face(1).unwrap();
        assert_eq!(m.live_face_count(), 2);
        assert!(m.restore_face(1).is_err());

        // Vertex 3 is used by face 1, so it cannot be popped first.
        assert!(m.pop_vertex().is_none());
        assert_eq!(m.pop_face(), Some([0, 2, 3]));
        assert_eq!(m.pop_vertex(), Some((Vec3::Z, GREY)));
        assert_eq!(m.vertex_count(), 3);
        assert_eq!(m.face_count(), 1);
    }

    #[test]
    fn compact_renumbers_and_drops_dangling_faces() {
        let mut m = triangle_mesh();
        m.vertex_gindex[2] = Some(GIndex::new(CellKey::default(), 7));
        m.delete_vertex(1).unwrap();
        m.compact();
        assert_eq!(m.vertex_count(), 3);
        assert_eq!(m.faces(), &[[0, 1, 2]]);
        assert_eq!(m.position(1), Some(Vec3::Y));
        assert_eq!(m.vertex_gindex(1), Some(GIndex::new(CellKey::default(), 7)));
        assert!(!m.is_face_deleted(0));
    }
}
