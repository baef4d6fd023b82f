//! Key-value backends for chunk payloads and tables.
//!
//! Layout of a [`DirStore`] directory:
//! ```text
//! store.meta.json        - metadata and schema version
//! values/
//!   <key>.zst            - one zstd-compressed file per key
//! integrity/
//!   manifest.json        - sha256 of every value file
//! ```

use crate::codec::{sha256_hex, zstd_compress, zstd_decompress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Current on-disk schema version of [`DirStore`].
const STORE_SCHEMA_VERSION: u32 = 1;

const META_FILE: &str = "store.meta.json";

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed for {key}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("invalid key {0:?}: only [A-Za-z0-9._-] are allowed")]
    InvalidKey(String),
}

/// Opaque byte store addressed by string keys.
///
/// Any ordered or hashed embedded store that can get, put, delete and test
/// keys is a valid backend.
pub trait KvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    /// Remove a key. Returns whether it existed.
    fn delete(&mut self, key: &str) -> Result<bool, StoreError>;
    fn exists(&self, key: &str) -> Result<bool, StoreError>;
    /// All keys, sorted.
    fn keys(&self) -> Result<Vec<String>, StoreError>;
    /// Make pending writes durable.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<S: KvStore + ?Sized> KvStore for Box<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).put(key, value)
    }
    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        (**self).exists(key)
    }
    fn keys(&self) -> Result<Vec<String>, StoreError> {
        (**self).keys()
    }
    fn flush(&mut self) -> Result<(), StoreError> {
        (**self).flush()
    }
}

/// Volatile store kept in a sorted map.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Total payload bytes held.
    pub fn byte_size(&self) -> usize {
        self.values.values().map(Vec::len).sum()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.values.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.values.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.remove(key).is_some())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.values.keys().cloned().collect())
    }
}

/// Metadata stored in store.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub schema_version: u32,
    pub value_count: u64,
}

/// sha256 of every value file, keyed by store key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: BTreeMap<String, String>,
}

/// Directory-backed store with schema versioning and integrity checking.
///
/// Values are compressed on write and verified against the manifest on read;
/// a mismatch is reported, never repaired. The manifest and metadata are
/// rewritten by [`KvStore::flush`].
pub struct DirStore {
    root: PathBuf,
    meta: StoreMeta,
    manifest: IntegrityManifest,
    dirty: bool,
}

impl DirStore {
    /// Whether `path` already holds a store. Unlike [`DirStore::open`],
    /// this writes nothing.
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().join(META_FILE).is_file()
    }

    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("values"))?;
        std::fs::create_dir_all(root.join("integrity"))?;

        let meta_path = root.join(META_FILE);
        let manifest_path = root.join("integrity").join("manifest.json");

        let (meta, manifest) = if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.schema_version != STORE_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.schema_version,
                    expected_version: STORE_SCHEMA_VERSION,
                });
            }
            let manifest: IntegrityManifest = if manifest_path.exists() {
                serde_json::from_reader(std::fs::File::open(&manifest_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, manifest)
        } else {
            let meta = StoreMeta {
                schema_version: STORE_SCHEMA_VERSION,
                value_count: 0,
            };
            let manifest = IntegrityManifest::default();
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&manifest_path)?, &manifest)?;
            (meta, manifest)
        };

        tracing::debug!(root = %root.display(), values = meta.value_count, "opened dir store");
        Ok(Self {
            root,
            meta,
            manifest,
            dirty: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    /// Re-hash every value file and compare with the manifest.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        for (key, expected) in &self.manifest.entries {
            let data = std::fs::read(self.value_path(key))?;
            let actual = sha256_hex(&data);
            if &actual != expected {
                return Err(StoreError::IntegrityMismatch {
                    key: key.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root.join("values").join(format!("{key}.zst"))
    }

    fn save_meta(&self) -> Result<(), StoreError> {
        let path = self.root.join(META_FILE);
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.meta)?;
        Ok(())
    }

    fn save_manifest(&self) -> Result<(), StoreError> {
        let path = self.root.join("integrity").join("manifest.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.manifest)?;
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_owned()))
    }
}

impl KvStore for DirStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        let Some(expected) = self.manifest.entries.get(key) else {
            return Ok(None);
        };
        let compressed = match std::fs::read(self.value_path(key)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let actual = sha256_hex(&compressed);
        if &actual != expected {
            return Err(StoreError::IntegrityMismatch {
                key: key.to_owned(),
                expected: expected.clone(),
                actual,
            });
        }
        Ok(Some(zstd_decompress(&compressed)?))
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let compressed = zstd_compress(value)?;
        std::fs::write(self.value_path(key), &compressed)?;
        tracing::trace!(key, bytes = compressed.len(), "dir store put");
        self.manifest
            .entries
            .insert(key.to_owned(), sha256_hex(&compressed));
        self.meta.value_count = self.manifest.entries.len() as u64;
        self.dirty = true;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        if self.manifest.entries.remove(key).is_none() {
            return Ok(false);
        }
        match std::fs::remove_file(self.value_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.meta.value_count = self.manifest.entries.len() as u64;
        self.dirty = true;
        Ok(true)
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        Ok(self.manifest.entries.contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.manifest.entries.keys().cloned().collect())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.dirty {
            self.save_meta()?;
            self.save_manifest()?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &mut dyn KvStore) {
        assert_eq!(store.get("a").unwrap(), None);
        store.put("a", b"hello").unwrap();
        store.put("0.0.0.0.f_1", &[1, 2, 3]).unwrap();
        assert!(store.exists("a").unwrap());
        assert_eq!(store.get("a").unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(
            store.keys().unwrap(),
            vec!["0.0.0.0.f_1".to_string(), "a".to_string()]
        );
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(!store.exists("a").unwrap());
    }

    #[test]
    fn memory_store_basic() {
        let mut store = MemoryStore::new();
        exercise(&mut store);
        assert_eq!(store.len(), 1);
        assert_eq!(store.byte_size(), 3);
    }

    #[test]
    fn dir_store_basic() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = DirStore::open(tmp.path().join("db")).unwrap();
        exercise(&mut store);
        store.flush().unwrap();
        assert_eq!(store.meta().value_count, 1);
        assert!(store.root().join("values").is_dir());
        assert!(store.root().join("integrity").is_dir());
    }

    #[test]
    fn dir_store_reopen_preserves_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db");
        {
            let mut store = DirStore::open(&path).unwrap();
            store.put("-1.2.3.0.v_0", &[9; 100]).unwrap();
            store.flush().unwrap();
        }
        let store = DirStore::open(&path).unwrap();
        assert_eq!(store.get("-1.2.3.0.v_0").unwrap(), Some(vec![9; 100]));
        store.verify_integrity().unwrap();
    }

    #[test]
    fn dir_store_rejects_bad_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = DirStore::open(tmp.path().join("db")).unwrap();
        assert!(matches!(
            store.put("../escape", b"x"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(store.get(""), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn dir_store_fail_closed_on_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db");
        let mut store = DirStore::open(&path).unwrap();
        store.put("k", b"payload").unwrap();
        store.flush().unwrap();

        let file = path.join("values").join("k.zst");
        let mut data = std::fs::read(&file).unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xff;
        }
        std::fs::write(&file, &data).unwrap();

        let store = DirStore::open(&path).unwrap();
        assert!(store.verify_integrity().is_err());
        assert!(matches!(
            store.get("k"),
            Err(StoreError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn exists_only_after_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db");
        assert!(!DirStore::exists(&path));
        assert!(!path.exists());
        let _store = DirStore::open(&path).unwrap();
        assert!(DirStore::exists(&path));
    }

    #[test]
    fn schema_mismatch_fail_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db");
        let _store = DirStore::open(&path).unwrap();

        let meta_path = path.join("store.meta.json");
        let mut meta: StoreMeta =
            serde_json::from_reader(std::fs::File::open(&meta_path).unwrap()).unwrap();
        meta.schema_version = 999;
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path).unwrap(), &meta).unwrap();

        match DirStore::open(&path) {
            Err(StoreError::SchemaMismatch {
                file_version,
                expected_version,
            }) => {
                assert_eq!(file_version, 999);
                assert_eq!(expected_version, STORE_SCHEMA_VERSION);
            }
            Err(e) => panic!("expected SchemaMismatch, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }
}
