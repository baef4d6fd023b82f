use glam::Vec3;
use ocme_common::{CellKey, Color4b, GREY};
use ocme_kernel::{CommitReport, EditMesh, Ocme, OcmeError};

use crate::editor::{EditCommand, History};

/// Where a session is in the edit/commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Editing,
    Committing,
}

/// Errors from edit sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is {actual:?}, expected {expected:?}")]
    WrongState {
        expected: SessionState,
        actual: SessionState,
    },
    #[error("store is busy with another edit")]
    StoreBusy,
    #[error(transparent)]
    Ocme(#[from] OcmeError),
}

/// Host side of the edit/commit protocol.
///
/// Walks Idle → Editing → Committing → Idle around one working mesh and
/// records every mesh edit so it can be undone before commit. The store is
/// passed into each call that touches it, and must not be edited through
/// any other path while the session is open.
#[derive(Debug)]
pub struct EditSession {
    state: SessionState,
    mesh: Option<EditMesh>,
    history: History,
}

impl EditSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            mesh: None,
            history: History::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The working mesh while editing.
    pub fn mesh(&self) -> Option<&EditMesh> {
        self.mesh.as_ref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    fn ensure_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state != expected {
            return Err(SessionError::WrongState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut EditMesh, &mut History), SessionError> {
        self.ensure_state(SessionState::Editing)?;
        let mesh = self.mesh.as_mut().ok_or(SessionError::WrongState {
            expected: SessionState::Editing,
            actual: SessionState::Idle,
        })?;
        Ok((mesh, &mut self.history))
    }

    fn mesh_mut(&mut self) -> Result<&mut EditMesh, SessionError> {
        Ok(self.parts()?.0)
    }

    /// Open an edit over `selected` and take its working mesh.
    pub fn begin(&mut self, ocme: &mut Ocme, selected: &[CellKey]) -> Result<&EditMesh, SessionError> {
        self.ensure_state(SessionState::Idle)?;
        if ocme.is_editing() {
            return Err(SessionError::StoreBusy);
        }
        let mesh = ocme.edit(selected)?;
        tracing::info!(
            cells = selected.len(),
            vertices = mesh.vertex_count(),
            faces = mesh.face_count(),
            "session editing"
        );
        self.history.clear();
        self.state = SessionState::Editing;
        Ok(self.mesh.insert(mesh))
    }

    fn record(&mut self, cmd: EditCommand) -> Result<(), SessionError> {
        let (mesh, history) = self.parts()?;
        history.apply(mesh, cmd)?;
        Ok(())
    }

    pub fn add_vertex(&mut self, p: Vec3) -> Result<u32, SessionError> {
        self.add_vertex_with_color(p, GREY)
    }

    pub fn add_vertex_with_color(&mut self, p: Vec3, color: Color4b) -> Result<u32, SessionError> {
        let v = self.mesh_mut()?.vertex_count() as u32;
        self.record(EditCommand::AddVertex { v, p, color })?;
        Ok(v)
    }

    pub fn add_face(&mut self, v: [u32; 3]) -> Result<u32, SessionError> {
        let f = self.mesh_mut()?.face_count() as u32;
        self.record(EditCommand::AddFace { f, v })?;
        Ok(f)
    }

    pub fn move_vertex(&mut self, v: u32, p: Vec3) -> Result<(), SessionError> {
        let old = self
            .mesh_mut()?
            .position(v)
            .ok_or(OcmeError::InvalidIndex { kind: "vertex", index: v })?;
        self.record(EditCommand::MoveVertex { v, old, new: p })
    }

    /// Move a vertex by `d`.
    pub fn translate_vertex(&mut self, v: u32, d: Vec3) -> Result<(), SessionError> {
        let old = self
            .mesh_mut()?
            .position(v)
            .ok_or(OcmeError::InvalidIndex { kind: "vertex", index: v })?;
        self.move_vertex(v, old + d)
    }

    pub fn set_color(&mut self, v: u32, color: Color4b) -> Result<(), SessionError> {
        let old = self
            .mesh_mut()?
            .color(v)
            .ok_or(OcmeError::InvalidIndex { kind: "vertex", index: v })?;
        self.record(EditCommand::SetColor { v, old, new: color })
    }

    pub fn delete_face(&mut self, f: u32) -> Result<(), SessionError> {
        self.record(EditCommand::DeleteFace { f })
    }

    pub fn delete_vertex(&mut self, v: u32) -> Result<(), SessionError> {
        self.record(EditCommand::DeleteVertex { v })
    }

    /// Undo the last mesh edit. Returns true if an operation was undone.
    pub fn undo(&mut self) -> Result<bool, SessionError> {
        let (mesh, history) = self.parts()?;
        Ok(history.undo(mesh)?)
    }

    /// Redo the last undone edit. Returns true if an operation was redone.
    pub fn redo(&mut self) -> Result<bool, SessionError> {
        let (mesh, history) = self.parts()?;
        Ok(history.redo(mesh)?)
    }

    /// Compact the working mesh. Renumbering invalidates the history, so
    /// it is cleared.
    pub fn compact(&mut self) -> Result<(), SessionError> {
        self.mesh_mut()?.compact();
        self.history.clear();
        Ok(())
    }

    /// Write the working mesh back and return to Idle.
    ///
    /// If the store keeps the edit open after a failed commit, the session
    /// stays in Editing with its mesh and history.
    pub fn commit(&mut self, ocme: &mut Ocme) -> Result<CommitReport, SessionError> {
        self.ensure_state(SessionState::Editing)?;
        let Some(mesh) = self.mesh.take() else {
            self.state = SessionState::Idle;
            return Err(SessionError::WrongState {
                expected: SessionState::Editing,
                actual: SessionState::Idle,
            });
        };
        self.state = SessionState::Committing;
        match ocme.commit(&mesh) {
            Ok(report) => {
                self.state = SessionState::Idle;
                self.history.clear();
                tracing::info!(
                    faces_added = report.faces_added,
                    faces_deleted = report.faces_deleted,
                    vertices_moved = report.vertices_moved,
                    "session committed"
                );
                Ok(report)
            }
            Err(e) if ocme.is_editing() => {
                self.state = SessionState::Editing;
                self.mesh = Some(mesh);
                Err(e.into())
            }
            Err(e) => {
                tracing::warn!(error = %e, "commit failed, session closed");
                self.state = SessionState::Idle;
                self.history.clear();
                Err(e.into())
            }
        }
    }

    /// Drop the working mesh without writing anything back.
    pub fn abort(&mut self, ocme: &mut Ocme) -> Result<(), SessionError> {
        self.ensure_state(SessionState::Editing)?;
        self.mesh = None;
        self.history.clear();
        self.state = SessionState::Idle;
        if ocme.is_editing() {
            ocme.abort_edit()?;
        }
        Ok(())
    }
}

impl Default for EditSession {
    fn default() -> Self {
        Self::new()
    }
}
