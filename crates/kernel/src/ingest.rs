use std::collections::BTreeMap;

use ocme_common::{Box3, CellKey, GIndex, ScaleRange, TriMesh, longest_edge, triangle_normal};

use crate::elements::{BorderIndex, OFace, OVertex};
use crate::error::OcmeError;
use crate::ocme::{CellSetChanges, Ocme};

/// Copies of one input vertex, by cell.
#[derive(Default)]
struct VertexCopies {
    owner: Option<GIndex>,
    slots: BTreeMap<CellKey, u32>,
}

impl Ocme {
    /// Insert a mesh into the store.
    ///
    /// Every face goes to the cell of its box minimum at the level of its
    /// longest edge, clamped to the mesh's scale range. The first copy of a
    /// vertex owns it; copies in other cells are ghosts. Returns the cells
    /// added and touched, after rebuilding their impostors.
    pub fn add_mesh(&mut self, mesh: &TriMesh) -> Result<CellSetChanges, OcmeError> {
        let _span = tracing::info_span!(
            "add_mesh",
            vertices = mesh.vertex_count(),
            faces = mesh.face_count()
        )
        .entered();
        self.ensure_idle()?;
        if let Some(colors) = &mesh.colors {
            if colors.len() != mesh.vertex_count() {
                return Err(OcmeError::InvalidIndex {
                    kind: "colour",
                    index: colors.len() as u32,
                });
            }
        }
        if let Some(fi) = mesh
            .faces
            .iter()
            .position(|f| f.iter().any(|&v| v as usize >= mesh.vertex_count()))
        {
            return Err(OcmeError::InvalidIndex {
                kind: "face",
                index: fi as u32,
            });
        }
        self.begin_op();

        let sr = self.scale_range_of_mesh(mesh);
        let mut copies: Vec<VertexCopies> = Vec::with_capacity(mesh.vertex_count());
        copies.resize_with(mesh.vertex_count(), VertexCopies::default);

        for (fi, face) in mesh.faces.iter().enumerate() {
            let pts = mesh.face_points(fi);
            let fbox = Box3::from_points(&pts);
            let level = sr.clamp(self.compute_level(longest_edge(&pts)));
            let key = CellKey::containing(fbox.min, level);
            self.ensure_cell(key)?;

            let mut local = [0u32; 3];
            for (corner, &vi) in face.iter().enumerate() {
                local[corner] = self.copy_vertex_into(mesh, &mut copies, vi, key)?;
            }
            self.push_face(key, OFace::new(local))?;

            let fsr = ScaleRange::single(level);
            self.extend_cell_box(key, &fbox, &fsr)?;
            self.note_touched(key);

            let color = self.face_color(&key, &OFace::new(local))?;
            let centroid = (pts[0] + pts[1] + pts[2]) / 3.0;
            self.impostors.entry(key).or_default().add_sample(
                &key.cube(),
                centroid,
                triangle_normal(&pts),
                color,
            );

            self.extend_overlapping(key, &fbox, &fsr)?;
        }

        // Unreferenced vertices land in the cell of their position at the
        // coarsest level of the mesh.
        let point_level = if sr.is_empty() { 0 } else { sr.max };
        for (vi, c) in copies.iter_mut().enumerate() {
            if c.owner.is_some() {
                continue;
            }
            let p = mesh.positions[vi];
            let key = CellKey::containing(p, point_level);
            self.ensure_cell(key)?;
            let color = mesh.colors.as_ref().map(|cs| cs[vi]);
            let i = self.push_vertex(key, OVertex::Owned { p: p.into() }, color)?;
            c.owner = Some(GIndex::new(key, i));
            c.slots.insert(key, i);
            self.extend_cell_box(key, &Box3::from_points(&[p]), &ScaleRange::single(point_level))?;
            self.note_touched(key);
        }

        for c in &copies {
            if c.slots.len() < 2 {
                continue;
            }
            let bi = self.next_border_id;
            self.next_border_id += 1;
            for (key, &vi) in &c.slots {
                self.borders(key)?.push(BorderIndex { vi, bi })?;
            }
        }

        let changes = self.end_op();
        let live = changes.live();
        self.build_impostors_hierarchy(&live)?;
        tracing::info!(
            added = changes.added.len(),
            touched = changes.touched.len(),
            "mesh added"
        );
        Ok(changes)
    }

    /// Local slot of input vertex `vi` in `key`, creating the owned copy or a
    /// ghost on first use.
    fn copy_vertex_into(
        &mut self,
        mesh: &TriMesh,
        copies: &mut [VertexCopies],
        vi: u32,
        key: CellKey,
    ) -> Result<u32, OcmeError> {
        let c = &mut copies[vi as usize];
        if let Some(&slot) = c.slots.get(&key) {
            return Ok(slot);
        }
        let slot = match c.owner {
            None => {
                let p = mesh.positions[vi as usize];
                let color = mesh.colors.as_ref().map(|cs| cs[vi as usize]);
                let i = self.push_vertex(key, OVertex::Owned { p: p.into() }, color)?;
                c.owner = Some(GIndex::new(key, i));
                i
            }
            Some(owner) => self.push_ghost(key, owner)?,
        };
        c.slots.insert(key, slot);
        Ok(slot)
    }
}
