use std::collections::{BTreeMap, BTreeSet, VecDeque};

use glam::Vec3;
use ocme_common::{
    Box3, CellKey, Color4b, GIndex, GREY, ScaleRange, TriMesh, compute_level, overlapping_keys,
};
use ocme_persist::{KvStore, cbor_deserialize, cbor_serialize};
use ocme_stream::{CacheStats, ChainMut, Element, OocEnv, TypeRegistry};
use serde::{Deserialize, Serialize};

use crate::cell::{AttributeKind, Cell, CellAttribute};
use crate::config::OcmeConfig;
use crate::edit::EditState;
use crate::elements::{BorderIndex, COLOR_ATTRIBUTE, OFace, OVertex, bind_element_types, chain_name};
use crate::error::OcmeError;
use crate::impostor::{DecodedSample, Impostor};

/// Store key of the OCME table.
pub const OCME_TABLE_KEY: &str = "__ocme_table__";

/// Current schema version of the OCME table.
const OCME_SCHEMA_VERSION: u32 = 1;

/// Cells added, removed and modified by an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellSetChanges {
    pub added: Vec<CellKey>,
    pub removed: Vec<CellKey>,
    pub touched: Vec<CellKey>,
}

impl CellSetChanges {
    /// Sort and deduplicate; removed cells drop out of the other lists.
    pub fn normalized(mut self) -> Self {
        for list in [&mut self.added, &mut self.removed, &mut self.touched] {
            list.sort_unstable();
            list.dedup();
        }
        let removed: BTreeSet<CellKey> = self.removed.iter().copied().collect();
        self.added.retain(|k| !removed.contains(k));
        self.touched.retain(|k| !removed.contains(k));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.touched.is_empty()
    }

    /// Added and touched cells, sorted.
    pub fn live(&self) -> Vec<CellKey> {
        let set: BTreeSet<CellKey> = self.added.iter().chain(&self.touched).copied().collect();
        set.into_iter().collect()
    }

    fn merge(&mut self, other: &CellSetChanges) {
        self.added.extend_from_slice(&other.added);
        self.removed.extend_from_slice(&other.removed);
        self.touched.extend_from_slice(&other.touched);
    }
}

/// Counters over the whole store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcmeStats {
    pub cells: usize,
    pub faces: usize,
    pub vertices: usize,
    pub externals: usize,
    pub border_entries: usize,
    pub dependence_entries: usize,
    pub impostors: usize,
    pub chains: usize,
    pub chunks: usize,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OcmeTable {
    schema_version: u32,
    side_factor: f32,
    next_border_id: u64,
    build_stamp: u64,
    cells: Vec<Cell>,
    impostors: Vec<(CellKey, Impostor)>,
}

/// The out-of-core mesh store.
///
/// Geometry lives in per-cell chains inside an [`OocEnv`]; the cell registry,
/// dependency graph and impostor hierarchy are kept in memory and written to
/// the OCME table on save. Single writer only.
pub struct Ocme {
    pub(crate) env: OocEnv,
    pub(crate) config: OcmeConfig,
    pub(crate) cells: BTreeMap<CellKey, Cell>,
    pub(crate) impostors: BTreeMap<CellKey, Impostor>,
    pub(crate) next_border_id: u64,
    pub(crate) build_stamp: u64,
    pub(crate) generation: u64,
    pub(crate) session: Option<EditState>,
    /// Changes of the running operation.
    pub(crate) op_changes: CellSetChanges,
    recording: Option<CellSetChanges>,
}

impl Ocme {
    /// Create an empty store.
    pub fn create(store: Box<dyn KvStore>, config: OcmeConfig) -> Result<Self, OcmeError> {
        let mut env = OocEnv::create(store, config.env_params())?;
        bind_element_types(env.types_mut())?;
        tracing::info!(side_factor = config.side_factor, "created OCME store");
        Ok(Self::with_env(env, config))
    }

    /// Reopen a store written by [`Ocme::save`] or [`Ocme::close`].
    pub fn open(store: Box<dyn KvStore>, config: OcmeConfig) -> Result<Self, OcmeError> {
        Self::open_with_types(store, config, TypeRegistry::new())
    }

    /// Reopen a store whose cells carry attributes of extra element types.
    pub fn open_with_types(
        store: Box<dyn KvStore>,
        mut config: OcmeConfig,
        mut types: TypeRegistry,
    ) -> Result<Self, OcmeError> {
        let _span = tracing::info_span!("ocme_open").entered();
        bind_element_types(&mut types)?;
        let raw = store
            .get(OCME_TABLE_KEY)?
            .ok_or_else(|| OcmeError::Corruption(format!("{OCME_TABLE_KEY} missing")))?;
        let table: OcmeTable = cbor_deserialize(&raw)?;
        if table.schema_version != OCME_SCHEMA_VERSION {
            return Err(OcmeError::Corruption(format!(
                "OCME table schema v{}, expected v{OCME_SCHEMA_VERSION}",
                table.schema_version
            )));
        }
        let env = OocEnv::open(store, config.env_params(), types)?;
        if table.side_factor != config.side_factor {
            tracing::debug!(
                stored = table.side_factor,
                requested = config.side_factor,
                "keeping stored side factor"
            );
            config.side_factor = table.side_factor;
        }
        let mut ocme = Self::with_env(env, config);
        ocme.next_border_id = table.next_border_id;
        ocme.build_stamp = table.build_stamp;
        ocme.cells = table.cells.into_iter().map(|c| (c.key, c)).collect();
        ocme.impostors = table.impostors.into_iter().collect();
        tracing::info!(cells = ocme.cells.len(), "opened OCME store");
        Ok(ocme)
    }

    fn with_env(env: OocEnv, config: OcmeConfig) -> Self {
        Self {
            env,
            config,
            cells: BTreeMap::new(),
            impostors: BTreeMap::new(),
            next_border_id: 0,
            build_stamp: 0,
            generation: 0,
            session: None,
            op_changes: CellSetChanges::default(),
            recording: None,
        }
    }

    /// Write the OCME table and flush the environment.
    pub fn save(&mut self) -> Result<(), OcmeError> {
        let table = OcmeTable {
            schema_version: OCME_SCHEMA_VERSION,
            side_factor: self.config.side_factor,
            next_border_id: self.next_border_id,
            build_stamp: self.build_stamp,
            cells: self.cells.values().cloned().collect(),
            impostors: self
                .impostors
                .iter()
                .map(|(k, i)| (*k, i.clone()))
                .collect(),
        };
        let bytes = cbor_serialize(&table)?;
        self.env.store_mut().put(OCME_TABLE_KEY, &bytes)?;
        self.env.flush()?;
        tracing::debug!(cells = self.cells.len(), "OCME store saved");
        Ok(())
    }

    /// Save and hand the store back. An open edit session is discarded.
    pub fn close(mut self) -> Result<Box<dyn KvStore>, OcmeError> {
        if self.session.is_some() {
            self.abort_edit()?;
        }
        self.save()?;
        Ok(self.env.close()?)
    }

    pub fn config(&self) -> &OcmeConfig {
        &self.config
    }

    pub fn env(&self) -> &OocEnv {
        &self.env
    }

    pub fn is_editing(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn ensure_idle(&self) -> Result<(), OcmeError> {
        if self.session.is_some() {
            return Err(OcmeError::InvalidState("an edit session is open"));
        }
        Ok(())
    }

    /// Register an attribute element type under a persisted name.
    pub fn bind_type<T: Element>(&mut self, name: &str) -> Result<(), OcmeError> {
        Ok(self.env.bind_type::<T>(name)?)
    }

    // ---- levels and keys ----

    pub fn compute_level(&self, l: f32) -> i32 {
        compute_level(self.config.side_factor, l)
    }

    pub fn compute_cell_key(&self, p: Vec3, h: i32) -> CellKey {
        CellKey::containing(p, h)
    }

    /// Level range of a mesh from its edge lengths (or the distances between
    /// consecutive vertices for a point cloud): 15th to 70th percentile.
    pub fn scale_range_of_mesh(&self, mesh: &TriMesh) -> ScaleRange {
        let mut lengths: Vec<f32> = if mesh.faces.is_empty() {
            mesh.positions
                .windows(2)
                .map(|w| w[0].distance(w[1]))
                .collect()
        } else {
            (0..mesh.face_count())
                .flat_map(|f| {
                    let [a, b, c] = mesh.face_points(f);
                    [a.distance(b), b.distance(c), c.distance(a)]
                })
                .collect()
        };
        self.scale_range_of_lengths(&mut lengths)
    }

    pub(crate) fn scale_range_of_lengths(&self, lengths: &mut Vec<f32>) -> ScaleRange {
        lengths.retain(|l| l.is_finite() && *l > 0.0);
        if lengths.is_empty() {
            return ScaleRange::EMPTY;
        }
        lengths.sort_by(f32::total_cmp);
        let at = |pct: usize| lengths[(lengths.len() * pct / 100).min(lengths.len() - 1)];
        let lo = self.compute_level(at(15));
        let hi = self.compute_level(at(70));
        ScaleRange::new(lo.min(hi), lo.max(hi))
    }

    // ---- change recording ----

    /// Start collecting cell-set changes across operations.
    pub fn record_changes(&mut self) {
        self.recording = Some(CellSetChanges::default());
    }

    /// Stop collecting and return everything seen since [`Ocme::record_changes`].
    pub fn stop_recording(&mut self) -> CellSetChanges {
        self.recording.take().unwrap_or_default().normalized()
    }

    pub(crate) fn begin_op(&mut self) {
        self.op_changes = CellSetChanges::default();
    }

    pub(crate) fn end_op(&mut self) -> CellSetChanges {
        let changes = std::mem::take(&mut self.op_changes).normalized();
        if let Some(rec) = self.recording.as_mut() {
            rec.merge(&changes);
        }
        changes
    }

    pub(crate) fn note_touched(&mut self, key: CellKey) {
        self.op_changes.touched.push(key);
    }

    // ---- cells ----

    pub fn cell(&self, key: &CellKey) -> Option<&Cell> {
        self.cells.get(key)
    }

    pub fn cell_keys(&self) -> impl Iterator<Item = &CellKey> {
        self.cells.keys()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// The cell at `key`, creating it with empty chains when `create` is set.
    pub fn get_cell(&mut self, key: CellKey, create: bool) -> Result<Option<&Cell>, OcmeError> {
        if create {
            self.ensure_cell(key)?;
        }
        Ok(self.cells.get(&key))
    }

    /// Create the cell if needed. Returns true when it was created.
    pub(crate) fn ensure_cell(&mut self, key: CellKey) -> Result<bool, OcmeError> {
        if self.cells.contains_key(&key) {
            return Ok(false);
        }
        let cell = Cell::new(key);
        self.env.get_or_create_chain::<OFace>(&cell.face_chain())?;
        self.env.get_or_create_chain::<OVertex>(&cell.vertex_chain())?;
        self.env.get_or_create_chain::<BorderIndex>(&cell.border_chain())?;
        self.env.get_or_create_chain::<GIndex>(&cell.ext_chain())?;
        self.cells.insert(key, cell);
        self.op_changes.added.push(key);
        tracing::debug!(%key, "cell created");
        Ok(true)
    }

    pub(crate) fn cell_ref(&self, key: &CellKey) -> Result<&Cell, OcmeError> {
        self.cells.get(key).ok_or(OcmeError::CellNotFound(*key))
    }

    pub(crate) fn cell_mut(&mut self, key: &CellKey) -> Result<&mut Cell, OcmeError> {
        self.cells.get_mut(key).ok_or(OcmeError::CellNotFound(*key))
    }

    /// Drop a cell with its chains, unlink it from its dependents and clear
    /// its part of the impostor hierarchy. Returns whether it existed.
    ///
    /// Ghosts of its vertices go with every face using them, and neighbours
    /// left empty are removed too. When faces of a same-level neighbour
    /// still reach into the cell, it stays as an empty cell linked to them.
    pub fn remove_cell(&mut self, key: CellKey) -> Result<bool, OcmeError> {
        self.ensure_idle()?;
        if !self.cells.contains_key(&key) {
            return Ok(false);
        }
        let _span = tracing::debug_span!("remove_cell", %key).entered();
        self.begin_op();
        let result = self.remove_cell_cascading(key);
        let changes = self.end_op();
        let live = changes.live();
        let mut cleared = live.clone();
        cleared.extend_from_slice(&changes.removed);
        self.clear_impostors(&cleared);
        result?;
        self.fill_samples(&live)?;
        self.build_impostors_hierarchy_partial(&live)?;
        Ok(true)
    }

    fn remove_cell_cascading(&mut self, key: CellKey) -> Result<(), OcmeError> {
        let dependents = self.cell_ref(&key)?.dependence_set.clone();
        self.drop_cell(key)?;

        let mut worklist = dependents.clone();
        let cleaned = self.compact_cells(&mut worklist)?;
        for d in dependents.iter().filter(|d| d.h == key.h) {
            if !self.cells.contains_key(d) {
                continue;
            }
            for tri in self.cell_triangles(d)? {
                let fbox = Box3::from_points(&tri);
                if overlapping_keys(&fbox, d.h).contains(&key) {
                    self.extend_overlapping(*d, &fbox, &ScaleRange::single(d.h))?;
                }
            }
        }
        if self.cells.contains_key(&key) {
            self.op_changes.added.retain(|k| *k != key);
            self.op_changes.removed.retain(|k| *k != key);
            self.note_touched(key);
            tracing::debug!(%key, "cell kept empty under neighbour faces");
        }

        self.remove_empty_cells(&worklist, &cleaned)?;
        worklist.retain(|k| self.cells.contains_key(k));
        self.rebuild_borders(&worklist)
    }

    pub(crate) fn drop_cell(&mut self, key: CellKey) -> Result<bool, OcmeError> {
        let Some(cell) = self.cells.remove(&key) else {
            return Ok(false);
        };
        for name in cell.chain_names() {
            self.env.remove_chain(&name)?;
        }
        for dep in &cell.dependence_set {
            if let Some(other) = self.cells.get_mut(dep) {
                other.dependence_set.remove(&key);
            }
        }
        if let Some(imp) = self.impostors.get_mut(&key) {
            imp.reset_direct();
            if imp.is_empty() {
                self.impostors.remove(&key);
            }
        }
        self.op_changes.removed.push(key);
        tracing::debug!(%key, "cell removed");
        Ok(true)
    }

    /// Link two cells both ways, merging their scale ranges and propagating
    /// the growth through the dependency graph.
    pub fn create_dependence(&mut self, a: CellKey, b: CellKey) -> Result<(), OcmeError> {
        if a == b {
            return Ok(());
        }
        let sr_a = self.cell_ref(&a)?.bbox.sr;
        let sr_b = self.cell_ref(&b)?.bbox.sr;
        let new_a = self.cell_mut(&a)?.dependence_set.insert(b);
        let new_b = self.cell_mut(&b)?.dependence_set.insert(a);
        let mut queue = VecDeque::new();
        if self.cell_mut(&a)?.bbox.sr.add_range(&sr_b) {
            queue.push_back(a);
        }
        if self.cell_mut(&b)?.bbox.sr.add_range(&sr_a) {
            queue.push_back(b);
        }
        if new_a || new_b {
            tracing::trace!(%a, %b, "dependence created");
        }
        self.propagate_scale_range(queue);
        Ok(())
    }

    /// Grow the scale range of every dependent until each edge's two ends
    /// include each other's range.
    pub(crate) fn propagate_scale_range(&mut self, mut queue: VecDeque<CellKey>) {
        while let Some(k) = queue.pop_front() {
            let Some(cell) = self.cells.get(&k) else {
                continue;
            };
            let sr = cell.bbox.sr;
            let deps: Vec<CellKey> = cell.dependence_set.iter().copied().collect();
            for d in deps {
                if let Some(other) = self.cells.get_mut(&d) {
                    if other.bbox.sr.add_range(&sr) {
                        queue.push_back(d);
                    }
                }
            }
        }
    }

    /// Existing or potential keys at level `h` overlapped by `b` grown by 5%
    /// of its diagonal.
    pub fn overlapping_cells(&self, b: &Box3, h: i32) -> Vec<CellKey> {
        overlapping_keys(b, h)
    }

    /// Extend the boxes of every other same-level cell overlapped by a face
    /// and link them to the face's cell.
    pub(crate) fn extend_overlapping(
        &mut self,
        key: CellKey,
        fbox: &Box3,
        fsr: &ScaleRange,
    ) -> Result<(), OcmeError> {
        for ok in overlapping_keys(fbox, key.h) {
            if ok == key {
                continue;
            }
            self.ensure_cell(ok)?;
            if self.extend_cell_box(ok, fbox, fsr)? {
                self.note_touched(ok);
            }
            self.create_dependence(key, ok)?;
        }
        Ok(())
    }

    /// Whether a face of a same-level dependent reaches into `key`.
    pub(crate) fn is_overlapped(&mut self, key: &CellKey) -> Result<bool, OcmeError> {
        let dependents: Vec<CellKey> = self
            .cell_ref(key)?
            .dependence_set
            .iter()
            .filter(|d| d.h == key.h)
            .copied()
            .collect();
        for d in dependents {
            for tri in self.cell_triangles(&d)? {
                if overlapping_keys(&Box3::from_points(&tri), d.h).contains(key) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Grow a cell's box, pushing any scale range growth to its dependents.
    pub(crate) fn extend_cell_box(
        &mut self,
        key: CellKey,
        b: &Box3,
        sr: &ScaleRange,
    ) -> Result<bool, OcmeError> {
        let before = self.cell_ref(&key)?.bbox.sr;
        let changed = self.cell_mut(&key)?.bbox.add(b, sr);
        if self.cell_ref(&key)?.bbox.sr != before {
            self.propagate_scale_range(VecDeque::from([key]));
        }
        Ok(changed)
    }

    // ---- chain access ----

    pub(crate) fn faces(&mut self, key: &CellKey) -> Result<ChainMut<'_, OFace>, OcmeError> {
        Ok(self.env.chain::<OFace>(&chain_name(key, crate::elements::FACES))?)
    }

    pub(crate) fn vertices(&mut self, key: &CellKey) -> Result<ChainMut<'_, OVertex>, OcmeError> {
        Ok(self
            .env
            .chain::<OVertex>(&chain_name(key, crate::elements::VERTICES))?)
    }

    pub(crate) fn borders(
        &mut self,
        key: &CellKey,
    ) -> Result<ChainMut<'_, BorderIndex>, OcmeError> {
        Ok(self
            .env
            .chain::<BorderIndex>(&chain_name(key, crate::elements::BORDERS))?)
    }

    pub(crate) fn externals(&mut self, key: &CellKey) -> Result<ChainMut<'_, GIndex>, OcmeError> {
        Ok(self
            .env
            .chain::<GIndex>(&chain_name(key, crate::elements::EXTERNALS))?)
    }

    pub fn face_count(&self, key: &CellKey) -> usize {
        self.env
            .chain_len(&chain_name(key, crate::elements::FACES))
            .unwrap_or(0)
    }

    pub fn vertex_count(&self, key: &CellKey) -> usize {
        self.env
            .chain_len(&chain_name(key, crate::elements::VERTICES))
            .unwrap_or(0)
    }

    /// Owner of the vertex in slot `i` of `key`.
    pub(crate) fn owner_of(&mut self, key: &CellKey, i: u32) -> Result<GIndex, OcmeError> {
        match self.vertices(key)?.get(i)? {
            OVertex::Owned { .. } => Ok(GIndex::new(*key, i)),
            OVertex::External { r } => Ok(self.externals(key)?.get(r)?),
        }
    }

    /// Position held by an owned slot.
    pub(crate) fn owned_position(&mut self, g: GIndex) -> Result<Vec3, OcmeError> {
        match self.vertices(&g.ck)?.get(g.i)? {
            OVertex::Owned { p } => Ok(Vec3::from(p)),
            OVertex::External { .. } => Err(OcmeError::Corruption(format!(
                "external reference to {}:{} is not one step",
                g.ck, g.i
            ))),
        }
    }

    /// Position of slot `i` of `key`, resolving ghosts.
    pub(crate) fn vertex_position(&mut self, key: &CellKey, i: u32) -> Result<Vec3, OcmeError> {
        let owner = self.owner_of(key, i)?;
        self.owned_position(owner)
    }

    /// Append a vertex slot, keeping per-vertex attributes aligned.
    pub(crate) fn push_vertex(
        &mut self,
        key: CellKey,
        slot: OVertex,
        color: Option<Color4b>,
    ) -> Result<u32, OcmeError> {
        let i = self.vertices(&key)?.push(slot)?;
        self.sync_attributes(&key, AttributeKind::Vertex)?;
        if let Some(color) = color {
            self.set_vertex_color(&key, i, color)?;
        }
        Ok(i)
    }

    /// Append a ghost of `owner` to `key` and link the two cells.
    pub(crate) fn push_ghost(&mut self, key: CellKey, owner: GIndex) -> Result<u32, OcmeError> {
        let r = self.externals(&key)?.push(owner)?;
        let color = self.vertex_color(&owner.ck, owner.i)?;
        let i = self.push_vertex(key, OVertex::External { r }, color)?;
        self.create_dependence(key, owner.ck)?;
        Ok(i)
    }

    /// Append a face, keeping per-face attributes aligned.
    pub(crate) fn push_face(&mut self, key: CellKey, face: OFace) -> Result<u32, OcmeError> {
        let i = self.faces(&key)?.push(face)?;
        self.sync_attributes(&key, AttributeKind::Face)?;
        Ok(i)
    }

    pub(crate) fn sync_attributes(
        &mut self,
        key: &CellKey,
        kind: AttributeKind,
    ) -> Result<(), OcmeError> {
        let cell = self.cell_ref(key)?;
        let chains = cell.attribute_chains(kind);
        if chains.is_empty() {
            return Ok(());
        }
        let n = match kind {
            AttributeKind::Vertex => self.vertex_count(key),
            AttributeKind::Face => self.face_count(key),
        };
        for chain in chains {
            if self.env.chain_len(&chain) != Some(n) {
                self.env.resize_dyn(&chain, n)?;
            }
        }
        Ok(())
    }

    // ---- attributes ----

    /// Add a per-vertex or per-face attribute chain of `T` to a cell, sized to
    /// the current element count. Adding an existing attribute is a no-op.
    pub fn add_attribute<T: Element>(
        &mut self,
        key: CellKey,
        name: &str,
        kind: AttributeKind,
    ) -> Result<(), OcmeError> {
        let cell = self.cell_ref(&key)?;
        if cell.attributes.contains_key(name) {
            return Ok(());
        }
        let chain = chain_name(&key, name);
        let type_name = self
            .env
            .types()
            .name_of::<T>()
            .map(str::to_owned)
            .ok_or_else(|| ocme_stream::EnvError::UnboundType(std::any::type_name::<T>().into()))?;
        self.env.create_chain::<T>(&chain)?;
        self.cell_mut(&key)?.attributes.insert(
            name.to_owned(),
            CellAttribute {
                chain,
                type_name,
                kind,
            },
        );
        self.sync_attributes(&key, kind)
    }

    pub fn has_attribute(&self, key: &CellKey, name: &str) -> bool {
        self.cells
            .get(key)
            .is_some_and(|c| c.attributes.contains_key(name))
    }

    /// Typed handle on a cell's attribute chain.
    pub fn attribute<T: Element>(
        &mut self,
        key: &CellKey,
        name: &str,
    ) -> Result<ChainMut<'_, T>, OcmeError> {
        let chain = self
            .cell_ref(key)?
            .attributes
            .get(name)
            .map(|a| a.chain.clone())
            .ok_or_else(|| ocme_stream::EnvError::NotFound(chain_name(key, name)))?;
        Ok(self.env.chain::<T>(&chain)?)
    }

    pub(crate) fn vertex_color(&mut self, key: &CellKey, i: u32) -> Result<Option<Color4b>, OcmeError> {
        if !self.has_attribute(key, COLOR_ATTRIBUTE) {
            return Ok(None);
        }
        Ok(Some(self.attribute::<Color4b>(key, COLOR_ATTRIBUTE)?.get(i)?))
    }

    pub(crate) fn set_vertex_color(
        &mut self,
        key: &CellKey,
        i: u32,
        color: Color4b,
    ) -> Result<(), OcmeError> {
        if !self.has_attribute(key, COLOR_ATTRIBUTE) {
            self.add_attribute::<Color4b>(*key, COLOR_ATTRIBUTE, AttributeKind::Vertex)?;
        }
        self.attribute::<Color4b>(key, COLOR_ATTRIBUTE)?.set(i, color)?;
        Ok(())
    }

    /// Copy every attribute of element `i` in `from` to element `j` in `to`,
    /// creating missing attribute chains on the target.
    pub(crate) fn copy_attributes(
        &mut self,
        kind: AttributeKind,
        from: &CellKey,
        i: u32,
        to: &CellKey,
        j: u32,
    ) -> Result<(), OcmeError> {
        let attrs: Vec<(String, CellAttribute)> = self
            .cell_ref(from)?
            .attributes
            .iter()
            .filter(|(_, a)| a.kind == kind)
            .map(|(n, a)| (n.clone(), a.clone()))
            .collect();
        for (name, attr) in attrs {
            if !self.has_attribute(to, &name) {
                let chain = chain_name(to, &name);
                if !self.env.contains_chain(&chain) {
                    self.env.create_chain_dyn(&chain, &attr.type_name)?;
                }
                self.cell_mut(to)?.attributes.insert(
                    name.clone(),
                    CellAttribute {
                        chain,
                        type_name: attr.type_name.clone(),
                        kind,
                    },
                );
                self.sync_attributes(to, kind)?;
            }
            let target = chain_name(to, &name);
            self.env.copy_element_dyn(&attr.chain, i, &target, Some(j))?;
        }
        Ok(())
    }

    // ---- read-only extraction ----

    /// World-space triangles of one cell.
    pub fn cell_triangles(&mut self, key: &CellKey) -> Result<Vec<[Vec3; 3]>, OcmeError> {
        self.cell_ref(key)?;
        let faces = self.faces(key)?.to_vec()?;
        let mut out = Vec::with_capacity(faces.len());
        for f in faces {
            out.push([
                self.vertex_position(key, f.v[0])?,
                self.vertex_position(key, f.v[1])?,
                self.vertex_position(key, f.v[2])?,
            ]);
        }
        Ok(out)
    }

    pub fn impostor(&self, key: &CellKey) -> Option<&Impostor> {
        self.impostors.get(key)
    }

    pub fn impostor_keys(&self) -> impl Iterator<Item = &CellKey> {
        self.impostors.keys()
    }

    /// Decoded samples of one impostor node.
    pub fn impostor_samples(&self, key: &CellKey) -> Vec<DecodedSample> {
        self.impostors
            .get(key)
            .map(|imp| imp.decoded_samples(&key.cube()))
            .unwrap_or_default()
    }

    /// Mean colour of a face's corners, grey without a colour attribute.
    pub(crate) fn face_color(&mut self, key: &CellKey, face: &OFace) -> Result<Color4b, OcmeError> {
        if !self.has_attribute(key, COLOR_ATTRIBUTE) {
            return Ok(GREY);
        }
        let mut sum = [0u32; 4];
        for &vi in &face.v {
            let c = self.attribute::<Color4b>(key, COLOR_ATTRIBUTE)?.get(vi)?;
            for (s, c) in sum.iter_mut().zip(c) {
                *s += c as u32;
            }
        }
        Ok(sum.map(|s| ((s + 1) / 3) as u8))
    }

    pub fn stats(&mut self) -> Result<OcmeStats, OcmeError> {
        let keys: Vec<CellKey> = self.cells.keys().copied().collect();
        let mut stats = OcmeStats {
            cells: keys.len(),
            impostors: self.impostors.len(),
            chains: self.env.chain_count(),
            chunks: self.env.chunk_count(),
            ..OcmeStats::default()
        };
        for key in &keys {
            let cell = self.cell_ref(key)?;
            stats.dependence_entries += cell.dependence_set.len();
            stats.faces += self.face_count(key);
            let (bc, ec) = (
                self.env.chain_len(&cell.border_chain()).unwrap_or(0),
                self.env.chain_len(&cell.ext_chain()).unwrap_or(0),
            );
            stats.border_entries += bc;
            stats.externals += ec;
            stats.vertices += self.vertex_count(key);
        }
        stats.cache = self.env.cache_stats();
        Ok(stats)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use glam::Vec3;
    use ocme_common::TriMesh;
    use ocme_persist::MemoryStore;

    use super::Ocme;
    use crate::config::OcmeConfig;

    pub(crate) fn unit_config() -> OcmeConfig {
        OcmeConfig {
            side_factor: 1.0,
            ..OcmeConfig::default()
        }
    }

    pub(crate) fn memory_ocme() -> Ocme {
        Ocme::create(Box::new(MemoryStore::new()), unit_config()).unwrap()
    }

    /// `n` disjoint triangles stacked along z, each reaching from cell
    /// x = 0 into cell x = 1 at level 0.
    pub(crate) fn strip(n: usize) -> TriMesh {
        let mut positions = Vec::new();
        let mut faces = Vec::new();
        for i in 0..n {
            let z = 0.3 + i as f32 * 0.04;
            let b = positions.len() as u32;
            positions.extend([
                Vec3::new(0.2, 0.1, z),
                Vec3::new(1.6, 0.1, z),
                Vec3::new(0.9, 0.85, z),
            ]);
            faces.push([b, b + 1, b + 2]);
        }
        TriMesh::new(positions, faces)
    }
}
