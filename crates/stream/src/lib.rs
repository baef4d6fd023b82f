//! Streaming: chunked out-of-core containers paged through a bounded cache.
//!
//! # Invariants
//! - Resident chunk memory stays within the budget unless only pinned chunks remain.
//! - An evicted chunk is written before it is freed if it is dirty or was never persisted.
//! - Every full chunk holds exactly `chunk_len` elements; only the last chunk grows.
//! - The allocation table describes every chain, so an environment reopens to the same contents.

mod cache;
mod chain;
mod env;

pub use cache::{CachePolicy, CacheStats, ChunkAddr};
pub use chain::{Chain, ChainMut, Element, build_remap, chunk_len_for};
pub use env::{ALLOCATION_TABLE_KEY, ChainRecord, EnvError, EnvParams, OocEnv, TypeRegistry};
