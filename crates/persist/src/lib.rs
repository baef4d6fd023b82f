//! Persistence: opaque key-value backends and the codecs used on top of them.
//!
//! # Invariants
//! - Values are stored and returned byte-for-byte; the store never interprets them.
//! - Directory stores verify every value against its SHA-256 manifest entry (fail closed).
//! - Schema version mismatches are rejected at open.

pub mod codec;
pub mod store;

pub use codec::{cbor_deserialize, cbor_serialize, sha256_hex, zstd_compress, zstd_decompress};
pub use store::{DirStore, IntegrityManifest, KvStore, MemoryStore, StoreError, StoreMeta};
