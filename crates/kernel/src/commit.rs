//! Writing an edited mesh back into its cells.
//!
//! # Invariants
//! - Faces keep their level while it stays inside the edit's scale range;
//!   new faces take the level of their longest edge clamped to the range of
//!   the committed mesh.
//! - A vertex changes owner only when it leaves the cell of its owner's level.
//!   The old slot turns into a ghost so faces holding it stay valid.
//! - External references stay one step: every ext entry names an owned slot.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use glam::Vec3;
use ocme_common::{Box3, CellKey, Color4b, GIndex, GREY, ScaleRange, longest_edge};
use ocme_stream::build_remap;

use crate::cell::AttributeKind;
use crate::edit::{EditMesh, EditState};
use crate::elements::{BorderIndex, OFace, OVertex};
use crate::error::OcmeError;
use crate::ocme::{CellSetChanges, Ocme};

/// What a commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub vertices_added: usize,
    pub vertices_updated: usize,
    pub vertices_moved: usize,
    pub vertices_deleted: usize,
    pub faces_added: usize,
    pub faces_updated: usize,
    pub faces_moved: usize,
    pub faces_deleted: usize,
    pub cells_removed: usize,
    pub changes: CellSetChanges,
}

/// Outcome of compacting one cell.
struct Compaction {
    faces_removed: usize,
    vertices_removed: usize,
    /// Old to new slot, when vertex slots were dropped.
    vertex_remap: Option<Vec<Option<u32>>>,
    changed: bool,
}

/// Ghost slot of each owner, per cell.
type GhostTables = HashMap<CellKey, HashMap<GIndex, u32>>;

impl Ocme {
    /// Commit an edited mesh and close the session.
    ///
    /// The mesh must come from the open session: a mesh of an earlier
    /// generation is rejected with [`OcmeError::StaleEdit`] and the session
    /// stays open. Any other failure closes the session.
    pub fn commit(&mut self, mesh: &EditMesh) -> Result<CommitReport, OcmeError> {
        let _span = tracing::info_span!(
            "commit",
            vertices = mesh.vertex_count(),
            faces = mesh.face_count()
        )
        .entered();
        match &self.session {
            None => return Err(OcmeError::InvalidState("no edit session is open")),
            Some(s) if s.generation != mesh.generation => {
                return Err(OcmeError::StaleEdit {
                    expected: s.generation,
                    found: mesh.generation,
                });
            }
            Some(_) => {}
        }
        let Some(state) = self.session.take() else {
            return Err(OcmeError::InvalidState("no edit session is open"));
        };

        self.begin_op();
        let result = self.apply_commit(&state, mesh);
        self.unpin(&state.closure);
        match result {
            Ok(report) => {
                tracing::info!(
                    generation = state.generation,
                    faces_added = report.faces_added,
                    faces_deleted = report.faces_deleted,
                    vertices_moved = report.vertices_moved,
                    cells_removed = report.cells_removed,
                    "edit committed"
                );
                Ok(report)
            }
            Err(e) => {
                for cell in self.cells.values_mut() {
                    cell.deleted_faces.clear();
                    cell.deleted_vertices.clear();
                }
                self.end_op();
                tracing::warn!(generation = state.generation, error = %e, "commit failed");
                Err(e)
            }
        }
    }

    fn apply_commit(
        &mut self,
        state: &EditState,
        mesh: &EditMesh,
    ) -> Result<CommitReport, OcmeError> {
        let mut report = CommitReport::default();
        let sr = self.commit_scale_range(state, mesh);
        tracing::debug!(min = sr.min, max = sr.max, "commit scale range");

        self.mark_deletions(state, mesh, &mut report)?;
        let (owners, changed) = self.commit_vertices(mesh, sr, &mut report)?;
        self.commit_faces(state, mesh, sr, &owners, &changed, &mut report)?;

        let changed_owners: HashSet<GIndex> = owners
            .iter()
            .zip(&changed)
            .filter(|(_, c)| **c)
            .filter_map(|(o, _)| *o)
            .collect();
        self.refresh_locked_faces(state, &changed_owners)?;

        let mut worklist: BTreeSet<CellKey> = state.closure.clone();
        worklist.extend(self.op_changes.added.iter().copied());
        worklist.extend(self.op_changes.touched.iter().copied());
        let cleaned = self.compact_cells(&mut worklist)?;

        report.cells_removed = self.remove_empty_cells(&worklist, &cleaned)?;
        worklist.retain(|k| self.cells.contains_key(k));
        self.rebuild_borders(&worklist)?;

        let changes = self.end_op();
        let live = changes.live();
        let mut cleared = live.clone();
        cleared.extend_from_slice(&changes.removed);
        self.clear_impostors(&cleared);
        self.fill_samples(&live)?;
        self.build_impostors_hierarchy_partial(&live)?;
        report.changes = changes;
        Ok(report)
    }

    /// Level range of the committed faces, falling back to the edit's range.
    fn commit_scale_range(&self, state: &EditState, mesh: &EditMesh) -> ScaleRange {
        let mut lengths = Vec::new();
        for (f, v) in mesh.faces.iter().enumerate() {
            if mesh.face_deleted[f] || v.iter().any(|&v| mesh.vertex_deleted[v as usize]) {
                continue;
            }
            let [a, b, c] = v.map(|v| mesh.positions[v as usize]);
            lengths.extend([a.distance(b), b.distance(c), c.distance(a)]);
        }
        let sr = self.scale_range_of_lengths(&mut lengths);
        if !sr.is_empty() {
            sr
        } else if !state.scale_range.is_empty() {
            state.scale_range
        } else {
            ScaleRange::single(0)
        }
    }

    /// Flag every handed-out element missing from the mesh as deleted.
    fn mark_deletions(
        &mut self,
        state: &EditState,
        mesh: &EditMesh,
        report: &mut CommitReport,
    ) -> Result<(), OcmeError> {
        let live_faces: HashSet<GIndex> = (0..mesh.faces.len())
            .filter(|&f| {
                !mesh.face_deleted[f]
                    && !mesh.faces[f].iter().any(|&v| mesh.vertex_deleted[v as usize])
            })
            .filter_map(|f| mesh.face_gindex[f])
            .collect();
        let live_vertices: HashSet<GIndex> = (0..mesh.positions.len())
            .filter(|&v| !mesh.vertex_deleted[v])
            .filter_map(|v| mesh.vertex_gindex[v])
            .collect();

        for g in &state.edited_faces {
            if !live_faces.contains(g) {
                self.cell_mut(&g.ck)?.deleted_faces.insert(g.i);
                self.note_touched(g.ck);
                report.faces_deleted += 1;
            }
        }
        for g in &state.edited_vertices {
            if !live_vertices.contains(g) {
                self.cell_mut(&g.ck)?.deleted_vertices.insert(g.i);
                self.note_touched(g.ck);
                report.vertices_deleted += 1;
            }
        }
        Ok(())
    }

    /// Write back every live vertex. Returns the owner of each mesh vertex
    /// and whether its position or colour changed.
    fn commit_vertices(
        &mut self,
        mesh: &EditMesh,
        sr: ScaleRange,
        report: &mut CommitReport,
    ) -> Result<(Vec<Option<GIndex>>, Vec<bool>), OcmeError> {
        let n = mesh.positions.len();
        let mut owners = vec![None; n];
        let mut changed = vec![false; n];
        for v in 0..n {
            if mesh.vertex_deleted[v] {
                continue;
            }
            if mesh.vertex_locked[v] {
                owners[v] = mesh.vertex_gindex[v];
                continue;
            }
            let p = mesh.positions[v];
            let color = mesh.has_colors.then(|| mesh.colors[v]);
            let owner = match mesh.vertex_gindex[v] {
                None => {
                    let key = CellKey::containing(p, sr.max);
                    self.ensure_cell(key)?;
                    let i = self.push_vertex(key, OVertex::Owned { p: p.into() }, color)?;
                    self.extend_cell_box(key, &Box3::from_points(&[p]), &ScaleRange::single(sr.max))?;
                    self.note_touched(key);
                    report.vertices_added += 1;
                    changed[v] = true;
                    GIndex::new(key, i)
                }
                Some(g) => {
                    let (owner, c) = self.commit_vertex(g, p, color, report)?;
                    changed[v] = c;
                    owner
                }
            };
            owners[v] = Some(owner);
        }
        Ok((owners, changed))
    }

    fn commit_vertex(
        &mut self,
        g: GIndex,
        p: Vec3,
        color: Option<Color4b>,
        report: &mut CommitReport,
    ) -> Result<(GIndex, bool), OcmeError> {
        let old = self.owned_position(g)?;
        let h = g.ck.h;
        let target = CellKey::containing(p, h);
        if target == CellKey::containing(old, h) {
            let mut changed = false;
            if old != p {
                self.vertices(&g.ck)?.set(g.i, OVertex::Owned { p: p.into() })?;
                report.vertices_updated += 1;
                changed = true;
            }
            if let Some(c) = color {
                if self.vertex_color(&g.ck, g.i)?.unwrap_or(GREY) != c {
                    self.set_vertex_color(&g.ck, g.i, c)?;
                    changed = true;
                }
            }
            if changed {
                self.note_touched(g.ck);
            }
            return Ok((g, changed));
        }

        // The vertex left its owner's cell: the target takes ownership,
        // reusing a ghost of it when there is one.
        self.ensure_cell(target)?;
        let slot = match self.ghost_slot(&target, g)? {
            Some(j) => {
                self.vertices(&target)?.set(j, OVertex::Owned { p: p.into() })?;
                j
            }
            None => self.push_vertex(target, OVertex::Owned { p: p.into() }, None)?,
        };
        self.copy_attributes(AttributeKind::Vertex, &g.ck, g.i, &target, slot)?;
        if let Some(c) = color {
            self.set_vertex_color(&target, slot, c)?;
        }
        self.extend_cell_box(target, &Box3::from_points(&[p]), &ScaleRange::single(h))?;

        let moved = GIndex::new(target, slot);
        let r = self.externals(&g.ck)?.push(moved)?;
        self.vertices(&g.ck)?.set(g.i, OVertex::External { r })?;

        let dependents: Vec<CellKey> = self.cell_ref(&g.ck)?.dependence_set.iter().copied().collect();
        self.create_dependence(g.ck, target)?;
        for d in dependents {
            if d == target {
                continue;
            }
            let ext = self.externals(&d)?.to_vec()?;
            let mut rebound = false;
            for (r, e) in ext.iter().enumerate() {
                if *e == g {
                    self.externals(&d)?.set(r as u32, moved)?;
                    rebound = true;
                }
            }
            if rebound {
                self.create_dependence(d, target)?;
                self.note_touched(d);
            }
        }
        self.note_touched(g.ck);
        self.note_touched(target);
        report.vertices_moved += 1;
        tracing::trace!(from = %g.ck, to = %target, "vertex moved");
        Ok((moved, true))
    }

    /// Slot of the ghost of `owner` in `key`, if any.
    fn ghost_slot(&mut self, key: &CellKey, owner: GIndex) -> Result<Option<u32>, OcmeError> {
        let ext = self.externals(key)?.to_vec()?;
        let refs: HashSet<u32> = ext
            .iter()
            .enumerate()
            .filter(|(_, e)| **e == owner)
            .map(|(r, _)| r as u32)
            .collect();
        if refs.is_empty() {
            return Ok(None);
        }
        let verts = self.vertices(key)?.to_vec()?;
        Ok(verts.iter().position(|v| matches!(v, OVertex::External { r } if refs.contains(r))).map(|i| i as u32))
    }

    fn ghost_table(&mut self, key: &CellKey) -> Result<HashMap<GIndex, u32>, OcmeError> {
        let ext = self.externals(key)?.to_vec()?;
        let verts = self.vertices(key)?.to_vec()?;
        let mut table = HashMap::new();
        for (i, v) in verts.iter().enumerate() {
            if let OVertex::External { r } = v {
                if let Some(o) = ext.get(*r as usize) {
                    table.entry(*o).or_insert(i as u32);
                }
            }
        }
        Ok(table)
    }

    /// Write back every live, unlocked face.
    fn commit_faces(
        &mut self,
        state: &EditState,
        mesh: &EditMesh,
        sr: ScaleRange,
        owners: &[Option<GIndex>],
        changed: &[bool],
        report: &mut CommitReport,
    ) -> Result<(), OcmeError> {
        let mut ghosts = GhostTables::new();
        for f in 0..mesh.faces.len() {
            if mesh.face_deleted[f] || mesh.face_locked[f] {
                continue;
            }
            let corners = mesh.faces[f];
            let Some(o) = corners
                .iter()
                .map(|&v| owners[v as usize])
                .collect::<Option<Vec<GIndex>>>()
            else {
                continue;
            };
            let pts = corners.map(|v| mesh.positions[v as usize]);
            let fbox = Box3::from_points(&pts);
            let existing = mesh.face_gindex[f];
            let level = match existing {
                Some(g) if state.scale_range.includes(g.ck.h) => g.ck.h,
                _ => sr.clamp(self.compute_level(longest_edge(&pts))),
            };
            let key = CellKey::containing(fbox.min, level);
            self.ensure_cell(key)?;

            let mut local = [0u32; 3];
            for c in 0..3 {
                let color = mesh.has_colors.then(|| mesh.colors[corners[c] as usize]);
                local[c] = self.resolve_corner(&mut ghosts, key, o[c], color)?;
            }
            let face = OFace::new(local);
            let mut touched = corners.iter().any(|&v| changed[v as usize]);
            match existing {
                Some(g) if g.ck == key => {
                    if self.faces(&key)?.get(g.i)? != face {
                        self.faces(&key)?.set(g.i, face)?;
                        report.faces_updated += 1;
                        touched = true;
                    }
                }
                Some(g) => {
                    let j = self.push_face(key, face)?;
                    self.copy_attributes(AttributeKind::Face, &g.ck, g.i, &key, j)?;
                    self.cell_mut(&g.ck)?.deleted_faces.insert(g.i);
                    self.note_touched(g.ck);
                    report.faces_moved += 1;
                    touched = true;
                }
                None => {
                    self.push_face(key, face)?;
                    report.faces_added += 1;
                    touched = true;
                }
            }
            let fsr = ScaleRange::single(level);
            if self.extend_cell_box(key, &fbox, &fsr)? || touched {
                self.note_touched(key);
            }
            self.extend_overlapping(key, &fbox, &fsr)?;
        }
        Ok(())
    }

    /// Local slot of `owner` in `key`, pushing a ghost when the cell has none.
    fn resolve_corner(
        &mut self,
        ghosts: &mut GhostTables,
        key: CellKey,
        owner: GIndex,
        color: Option<Color4b>,
    ) -> Result<u32, OcmeError> {
        if owner.ck == key {
            return Ok(owner.i);
        }
        if !ghosts.contains_key(&key) {
            let table = self.ghost_table(&key)?;
            ghosts.insert(key, table);
        }
        if let Some(j) = ghosts.get(&key).and_then(|t| t.get(&owner)).copied() {
            if let Some(c) = color {
                if self.vertex_color(&key, j)?.unwrap_or(GREY) != c {
                    self.set_vertex_color(&key, j, c)?;
                }
            }
            return Ok(j);
        }
        let j = self.push_ghost(key, owner)?;
        ghosts.entry(key).or_default().insert(owner, j);
        Ok(j)
    }

    /// Locked faces keep their slots but follow the vertices they share with
    /// the selection; grow their cells' boxes accordingly.
    fn refresh_locked_faces(
        &mut self,
        state: &EditState,
        changed_owners: &HashSet<GIndex>,
    ) -> Result<(), OcmeError> {
        if changed_owners.is_empty() {
            return Ok(());
        }
        for key in &state.locked {
            if !self.cells.contains_key(key) {
                continue;
            }
            let faces = self.faces(key)?.to_vec()?;
            let fsr = ScaleRange::single(key.h);
            let mut refreshed = false;
            for f in &faces {
                let mut hit = false;
                for &v in &f.v {
                    hit |= changed_owners.contains(&self.owner_of(key, v)?);
                }
                if !hit {
                    continue;
                }
                let pts = [
                    self.vertex_position(key, f.v[0])?,
                    self.vertex_position(key, f.v[1])?,
                    self.vertex_position(key, f.v[2])?,
                ];
                let fbox = Box3::from_points(&pts);
                self.extend_cell_box(*key, &fbox, &fsr)?;
                self.extend_overlapping(*key, &fbox, &fsr)?;
                refreshed = true;
            }
            if refreshed {
                self.note_touched(*key);
            }
        }
        Ok(())
    }

    /// Compact every cell of the worklist, cascading slot renumbering into
    /// the ext tables of dependents. Returns the cells that lost elements.
    pub(crate) fn compact_cells(
        &mut self,
        worklist: &mut BTreeSet<CellKey>,
    ) -> Result<BTreeSet<CellKey>, OcmeError> {
        let mut queue: VecDeque<CellKey> = worklist.iter().copied().collect();
        let mut queued: HashSet<CellKey> = worklist.iter().copied().collect();
        let mut cleaned = BTreeSet::new();
        while let Some(key) = queue.pop_front() {
            queued.remove(&key);
            let Some(outcome) = self.compact_cell(key)? else {
                continue;
            };
            if !outcome.changed {
                continue;
            }
            self.note_touched(key);
            if outcome.faces_removed > 0 || outcome.vertices_removed > 0 {
                cleaned.insert(key);
            }
            if let Some(remap) = outcome.vertex_remap {
                for d in self.rebind_dependents(key, &remap)? {
                    worklist.insert(d);
                    if queued.insert(d) {
                        queue.push_back(d);
                    }
                }
            }
        }
        Ok(cleaned)
    }

    /// Drop deleted faces and vertex slots, faces over dropped slots, ghosts
    /// no face uses or whose owner is gone, and unused ext entries.
    fn compact_cell(&mut self, key: CellKey) -> Result<Option<Compaction>, OcmeError> {
        let Some(cell) = self.cells.get_mut(&key) else {
            return Ok(None);
        };
        let mut dead_vertices = std::mem::take(&mut cell.deleted_vertices);
        let mut dead_faces = std::mem::take(&mut cell.deleted_faces);
        let faces = self.faces(&key)?.to_vec()?;
        let verts = self.vertices(&key)?.to_vec()?;
        let ext = self.externals(&key)?.to_vec()?;

        for (i, v) in verts.iter().enumerate() {
            let OVertex::External { r } = v else {
                continue;
            };
            let dangling = match ext.get(*r as usize) {
                None => true,
                Some(o) => match self.cells.get(&o.ck) {
                    None => true,
                    Some(c) => {
                        c.deleted_vertices.contains(&o.i) || o.i as usize >= self.vertex_count(&o.ck)
                    }
                },
            };
            if dangling {
                dead_vertices.insert(i as u32);
            }
        }
        for (j, f) in faces.iter().enumerate() {
            if f.v.iter().any(|v| dead_vertices.contains(v)) {
                dead_faces.insert(j as u32);
            }
        }
        let mut used = vec![false; verts.len()];
        for (j, f) in faces.iter().enumerate() {
            if dead_faces.contains(&(j as u32)) {
                continue;
            }
            for &v in &f.v {
                if let Some(u) = used.get_mut(v as usize) {
                    *u = true;
                }
            }
        }
        for (i, v) in verts.iter().enumerate() {
            if v.is_external() && !used[i] {
                dead_vertices.insert(i as u32);
            }
        }
        let mut ext_used = vec![false; ext.len()];
        for (i, v) in verts.iter().enumerate() {
            if let OVertex::External { r } = v {
                if !dead_vertices.contains(&(i as u32)) {
                    if let Some(u) = ext_used.get_mut(*r as usize) {
                        *u = true;
                    }
                }
            }
        }
        let dead_ext: Vec<u32> = (0..ext.len() as u32).filter(|&r| !ext_used[r as usize]).collect();
        if dead_vertices.is_empty() && dead_faces.is_empty() && dead_ext.is_empty() {
            return Ok(Some(Compaction {
                faces_removed: 0,
                vertices_removed: 0,
                vertex_remap: None,
                changed: false,
            }));
        }

        let dead_faces: Vec<u32> = dead_faces.into_iter().collect();
        let dead_vertices: Vec<u32> = dead_vertices.into_iter().collect();
        let vremap = build_remap(verts.len(), &dead_vertices);
        let eremap = build_remap(ext.len(), &dead_ext);

        let cell = self.cell_ref(&key)?;
        let face_attrs = cell.attribute_chains(AttributeKind::Face);
        let vertex_attrs = cell.attribute_chains(AttributeKind::Vertex);

        if !dead_faces.is_empty() {
            self.faces(&key)?.compact(&dead_faces)?;
            for chain in &face_attrs {
                self.env.compact_dyn(chain, &dead_faces)?;
            }
        }
        if !dead_vertices.is_empty() {
            let kept = self.faces(&key)?.to_vec()?;
            let mut chain = self.faces(&key)?;
            for (j, f) in kept.iter().enumerate() {
                let v = f.v.map(|v| vremap[v as usize].unwrap_or_default());
                chain.set(j as u32, OFace::new(v))?;
            }
            self.vertices(&key)?.compact(&dead_vertices)?;
            for chain in &vertex_attrs {
                self.env.compact_dyn(chain, &dead_vertices)?;
            }
        }
        if !dead_ext.is_empty() {
            let kept = self.vertices(&key)?.to_vec()?;
            let mut chain = self.vertices(&key)?;
            for (i, v) in kept.iter().enumerate() {
                if let OVertex::External { r } = v {
                    let r = eremap[*r as usize].unwrap_or_default();
                    chain.set(i as u32, OVertex::External { r })?;
                }
            }
            self.externals(&key)?.compact(&dead_ext)?;
        }
        tracing::trace!(
            %key,
            faces = dead_faces.len(),
            vertices = dead_vertices.len(),
            externals = dead_ext.len(),
            "cell compacted"
        );
        Ok(Some(Compaction {
            faces_removed: dead_faces.len(),
            vertices_removed: dead_vertices.len(),
            vertex_remap: (!dead_vertices.is_empty()).then_some(vremap),
            changed: true,
        }))
    }

    /// Follow a compaction of `key` in the ext tables of its dependents.
    /// Ghosts of dropped slots are flagged; returns the cells that got some.
    fn rebind_dependents(
        &mut self,
        key: CellKey,
        remap: &[Option<u32>],
    ) -> Result<Vec<CellKey>, OcmeError> {
        let dependents: Vec<CellKey> = self.cell_ref(&key)?.dependence_set.iter().copied().collect();
        let mut flagged = Vec::new();
        for d in dependents {
            let ext = self.externals(&d)?.to_vec()?;
            let mut dead_refs = HashSet::new();
            for (r, e) in ext.iter().enumerate() {
                if e.ck != key {
                    continue;
                }
                match remap.get(e.i as usize).copied().flatten() {
                    Some(n) if n == e.i => {}
                    Some(n) => self.externals(&d)?.set(r as u32, GIndex::new(key, n))?,
                    None => {
                        dead_refs.insert(r as u32);
                    }
                }
            }
            if dead_refs.is_empty() {
                continue;
            }
            let verts = self.vertices(&d)?.to_vec()?;
            let cell = self.cell_mut(&d)?;
            for (i, v) in verts.iter().enumerate() {
                if matches!(v, OVertex::External { r } if dead_refs.contains(r)) {
                    cell.deleted_vertices.insert(i as u32);
                }
            }
            flagged.push(d);
        }
        Ok(flagged)
    }

    /// Remove worklist cells left without elements, along with empty
    /// neighbours of the cells that lost elements. A cell that a face of a
    /// same-level neighbour still reaches into is kept.
    pub(crate) fn remove_empty_cells(
        &mut self,
        worklist: &BTreeSet<CellKey>,
        cleaned: &BTreeSet<CellKey>,
    ) -> Result<usize, OcmeError> {
        let mut candidates = worklist.clone();
        for key in cleaned {
            if let Some(cell) = self.cells.get(key) {
                candidates.extend(cell.dependence_set.iter().copied());
            }
        }
        let mut removed = 0;
        for key in &candidates {
            if !self.cells.contains_key(key) || !self.is_cell_empty(key) {
                continue;
            }
            if self.is_overlapped(key)? {
                continue;
            }
            removed += usize::from(self.drop_cell(*key)?);
        }
        Ok(removed)
    }

    fn is_cell_empty(&self, key: &CellKey) -> bool {
        self.face_count(key) == 0 && self.vertex_count(key) == 0
    }

    /// Rewrite the border chains of `cells`: one entry per slot of a vertex
    /// present in more than one cell, sharing one id across copies.
    pub(crate) fn rebuild_borders(&mut self, cells: &BTreeSet<CellKey>) -> Result<(), OcmeError> {
        let mut region: BTreeSet<CellKey> = cells.clone();
        for key in cells {
            region.extend(self.cell_ref(key)?.dependence_set.iter().copied());
        }
        region.retain(|k| self.cells.contains_key(k));

        let mut shared: HashSet<GIndex> = HashSet::new();
        let mut ids: HashMap<GIndex, u64> = HashMap::new();
        let mut slot_owners: HashMap<CellKey, Vec<(GIndex, bool)>> = HashMap::new();
        for key in &region {
            let verts = self.vertices(key)?.to_vec()?;
            let ext = self.externals(key)?.to_vec()?;
            let owners: Vec<(GIndex, bool)> = verts
                .iter()
                .enumerate()
                .map(|(i, v)| match v {
                    OVertex::Owned { .. } => (GIndex::new(*key, i as u32), false),
                    OVertex::External { r } => (
                        ext.get(*r as usize).copied().unwrap_or(GIndex::new(*key, i as u32)),
                        true,
                    ),
                })
                .collect();
            for (o, ghost) in &owners {
                if *ghost {
                    shared.insert(*o);
                }
            }
            for b in self.borders(key)?.to_vec()? {
                if let Some((o, _)) = owners.get(b.vi as usize) {
                    ids.entry(*o).or_insert(b.bi);
                }
            }
            slot_owners.insert(*key, owners);
        }

        for key in cells {
            let Some(owners) = slot_owners.get(key) else {
                continue;
            };
            let mut entries = Vec::new();
            for (i, (o, ghost)) in owners.iter().enumerate() {
                if !*ghost && !shared.contains(o) {
                    continue;
                }
                let bi = *ids.entry(*o).or_insert_with(|| {
                    let bi = self.next_border_id;
                    self.next_border_id += 1;
                    bi
                });
                entries.push(BorderIndex { vi: i as u32, bi });
            }
            let mut chain = self.borders(key)?;
            if chain.to_vec()? != entries {
                chain.resize(0)?;
                chain.extend(entries)?;
            }
        }
        Ok(())
    }
}
