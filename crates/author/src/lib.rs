//! Host-side editing of an OCME store: a session that walks the edit/commit
//! protocol and keeps undo/redo history over the working mesh.
//!
//! # Invariants
//! - Every mesh edit recorded by a session is reversible until commit.
//! - A session holds at most one working mesh, and only while Editing.

pub mod editor;
pub mod session;

pub use editor::{EditCommand, History, apply_command};
pub use session::{EditSession, SessionError, SessionState};
