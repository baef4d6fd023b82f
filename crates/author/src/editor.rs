use glam::Vec3;
use ocme_common::Color4b;
use ocme_kernel::{EditMesh, OcmeError};

/// An edit of the working mesh that can be applied and reversed.
///
/// Each command carries enough context to undo itself.
#[derive(Debug, Clone, PartialEq)]
pub enum EditCommand {
    /// Append a vertex. Undo = take it back.
    AddVertex { v: u32, p: Vec3, color: Color4b },
    /// Take back the last vertex. Undo = append it again.
    RemoveVertex { v: u32, p: Vec3, color: Color4b },
    /// Append a face. Undo = take it back.
    AddFace { f: u32, v: [u32; 3] },
    /// Take back the last face. Undo = append it again.
    RemoveFace { f: u32, v: [u32; 3] },
    /// Move a vertex. Undo = restore the old position.
    MoveVertex { v: u32, old: Vec3, new: Vec3 },
    /// Recolour a vertex. Undo = restore the old colour.
    SetColor { v: u32, old: Color4b, new: Color4b },
    /// Flag a face deleted. Undo = clear the flag.
    DeleteFace { f: u32 },
    RestoreFace { f: u32 },
    /// Flag a vertex deleted. Undo = clear the flag.
    DeleteVertex { v: u32 },
    RestoreVertex { v: u32 },
}

impl EditCommand {
    /// Produce the inverse command (for undo).
    pub fn inverse(&self) -> Self {
        match *self {
            Self::AddVertex { v, p, color } => Self::RemoveVertex { v, p, color },
            Self::RemoveVertex { v, p, color } => Self::AddVertex { v, p, color },
            Self::AddFace { f, v } => Self::RemoveFace { f, v },
            Self::RemoveFace { f, v } => Self::AddFace { f, v },
            Self::MoveVertex { v, old, new } => Self::MoveVertex { v, old: new, new: old },
            Self::SetColor { v, old, new } => Self::SetColor { v, old: new, new: old },
            Self::DeleteFace { f } => Self::RestoreFace { f },
            Self::RestoreFace { f } => Self::DeleteFace { f },
            Self::DeleteVertex { v } => Self::RestoreVertex { v },
            Self::RestoreVertex { v } => Self::DeleteVertex { v },
        }
    }
}

/// Apply a command to the mesh.
///
/// Appends and removals only touch the tail of the mesh, so a command
/// replayed out of stack order fails instead of renumbering elements.
pub fn apply_command(mesh: &mut EditMesh, cmd: &EditCommand) -> Result<(), OcmeError> {
    match *cmd {
        EditCommand::AddVertex { v, p, color } => {
            expect_index("vertex", v, mesh.vertex_count())?;
            mesh.add_vertex_with_color(p, color);
        }
        EditCommand::RemoveVertex { v, .. } => {
            expect_index("vertex", v + 1, mesh.vertex_count())?;
            mesh.pop_vertex()
                .ok_or(OcmeError::InvalidIndex { kind: "vertex", index: v })?;
        }
        EditCommand::AddFace { f, v } => {
            expect_index("face", f, mesh.face_count())?;
            mesh.add_face(v)?;
        }
        EditCommand::RemoveFace { f, .. } => {
            expect_index("face", f + 1, mesh.face_count())?;
            mesh.pop_face()
                .ok_or(OcmeError::InvalidIndex { kind: "face", index: f })?;
        }
        EditCommand::MoveVertex { v, new, .. } => mesh.move_vertex(v, new)?,
        EditCommand::SetColor { v, new, .. } => mesh.set_color(v, new)?,
        EditCommand::DeleteFace { f } => mesh.delete_face(f)?,
        EditCommand::RestoreFace { f } => mesh.restore_face(f)?,
        EditCommand::DeleteVertex { v } => mesh.delete_vertex(v)?,
        EditCommand::RestoreVertex { v } => mesh.restore_vertex(v)?,
    }
    Ok(())
}

fn expect_index(kind: &'static str, index: u32, count: usize) -> Result<(), OcmeError> {
    if index as usize != count {
        return Err(OcmeError::InvalidIndex { kind, index });
    }
    Ok(())
}

/// Undo/redo stacks over the working mesh.
///
/// Every edit is reversible via `undo()` and re-applicable via `redo()`.
#[derive(Debug, Default)]
pub struct History {
    undo_stack: Vec<EditCommand>,
    redo_stack: Vec<EditCommand>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a command and push it to the undo stack.
    pub fn apply(&mut self, mesh: &mut EditMesh, cmd: EditCommand) -> Result<(), OcmeError> {
        apply_command(mesh, &cmd)?;
        self.undo_stack.push(cmd);
        self.redo_stack.clear();
        Ok(())
    }

    /// Undo the last edit. Returns true if an operation was undone.
    pub fn undo(&mut self, mesh: &mut EditMesh) -> Result<bool, OcmeError> {
        let Some(cmd) = self.undo_stack.pop() else {
            return Ok(false);
        };
        if let Err(e) = apply_command(mesh, &cmd.inverse()) {
            self.undo_stack.push(cmd);
            return Err(e);
        }
        self.redo_stack.push(cmd);
        Ok(true)
    }

    /// Redo the last undone edit. Returns true if an operation was redone.
    pub fn redo(&mut self, mesh: &mut EditMesh) -> Result<bool, OcmeError> {
        let Some(cmd) = self.redo_stack.pop() else {
            return Ok(false);
        };
        if let Err(e) = apply_command(mesh, &cmd) {
            self.redo_stack.push(cmd);
            return Err(e);
        }
        self.undo_stack.push(cmd);
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    /// Number of operations on the undo stack.
    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of operations on the redo stack.
    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocme_common::GREY;

    fn mesh() -> EditMesh {
        let mut m = EditMesh::default();
        m.add_vertex(Vec3::ZERO);
        m.add_vertex(Vec3::X);
        m.add_vertex(Vec3::Y);
        m.add_face([0, 1, 2]).unwrap();
        m
    }

    #[test]
    fn inverse_is_an_involution() {
        let cmds = [
            EditCommand::AddVertex { v: 3, p: Vec3::Z, color: GREY },
            EditCommand::AddFace { f: 1, v: [0, 1, 3] },
            EditCommand::MoveVertex { v: 0, old: Vec3::ZERO, new: Vec3::ONE },
            EditCommand::SetColor { v: 0, old: GREY, new: [255, 0, 0, 255] },
            EditCommand::DeleteFace { f: 0 },
            EditCommand::DeleteVertex { v: 2 },
        ];
        for c in cmds {
            assert_ne!(c.inverse(), c);
            assert_eq!(c.inverse().inverse(), c);
        }
    }

    #[test]
    fn add_and_undo() {
        let mut m = mesh();
        let mut h = History::new();
        h.apply(&mut m, EditCommand::AddVertex { v: 3, p: Vec3::Z, color: GREY })
            .unwrap();
        h.apply(&mut m, EditCommand::AddFace { f: 1, v: [0, 2, 3] })
            .unwrap();
        assert_eq!(m.face_count(), 2);

        assert!(h.undo(&mut m).unwrap());
        assert!(h.undo(&mut m).unwrap());
        assert_eq!(m.vertex_count(), 3);
        assert_eq!(m.face_count(), 1);

        assert!(h.redo(&mut m).unwrap());
        assert!(h.redo(&mut m).unwrap());
        assert_eq!(m.face(1), Some([0, 2, 3]));
    }

    #[test]
    fn move_and_undo() {
        let mut m = mesh();
        let mut h = History::new();
        h.apply(&mut m, EditCommand::MoveVertex { v: 1, old: Vec3::X, new: Vec3::ONE })
            .unwrap();
        assert_eq!(m.position(1), Some(Vec3::ONE));
        h.undo(&mut m).unwrap();
        assert_eq!(m.position(1), Some(Vec3::X));
    }

    #[test]
    fn delete_vertex_and_undo_restores_its_face() {
        let mut m = mesh();
        let mut h = History::new();
        h.apply(&mut m, EditCommand::DeleteFace { f: 0 }).unwrap();
        h.apply(&mut m, EditCommand::DeleteVertex { v: 2 }).unwrap();
        assert_eq!(m.live_face_count(), 0);

        h.undo(&mut m).unwrap();
        h.undo(&mut m).unwrap();
        assert!(!m.is_vertex_deleted(2));
        assert_eq!(m.live_face_count(), 1);
    }

    #[test]
    fn redo_cleared_on_new_edit() {
        let mut m = mesh();
        let mut h = History::new();
        h.apply(&mut m, EditCommand::DeleteFace { f: 0 }).unwrap();
        h.undo(&mut m).unwrap();
        assert!(h.can_redo());

        h.apply(&mut m, EditCommand::MoveVertex { v: 0, old: Vec3::ZERO, new: Vec3::ONE })
            .unwrap();
        assert!(!h.can_redo());
        assert_eq!(h.undo_count(), 1);
    }

    #[test]
    fn undo_empty_returns_false() {
        let mut m = mesh();
        let mut h = History::new();
        assert!(!h.undo(&mut m).unwrap());
        assert!(!h.redo(&mut m).unwrap());
    }

    #[test]
    fn failed_apply_is_not_recorded() {
        let mut m = mesh();
        let mut h = History::new();
        assert!(h.apply(&mut m, EditCommand::DeleteFace { f: 7 }).is_err());
        assert!(h
            .apply(&mut m, EditCommand::AddVertex { v: 9, p: Vec3::Z, color: GREY })
            .is_err());
        assert!(!h.can_undo());
    }

    #[test]
    fn out_of_order_removal_fails() {
        let mut m = mesh();
        assert!(apply_command(&mut m, &EditCommand::RemoveFace { f: 0, v: [0, 1, 2] }).is_ok());
        // Vertex 0 is not the last one.
        assert!(apply_command(&mut m, &EditCommand::RemoveVertex { v: 0, p: Vec3::ZERO, color: GREY })
            .is_err());
    }
}
