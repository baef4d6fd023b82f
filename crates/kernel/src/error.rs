use ocme_common::CellKey;
use ocme_persist::StoreError;
use ocme_stream::EnvError;

/// Errors from OCME operations.
#[derive(Debug, thiserror::Error)]
pub enum OcmeError {
    #[error("cell not found: {0}")]
    CellNotFound(CellKey),
    #[error("edit needs {needed} bytes, ceiling is {ceiling}")]
    Capacity { needed: usize, ceiling: usize },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("stale edit: mesh generation {found}, session generation {expected}")]
    StaleEdit { expected: u64, found: u64 },
    #[error("{kind} {index} is locked")]
    Locked { kind: &'static str, index: u32 },
    #[error("{kind} index {index} out of range")]
    InvalidIndex { kind: &'static str, index: u32 },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("environment error: {0}")]
    Env(#[from] EnvError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
