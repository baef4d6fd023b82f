use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ocme_persist::{KvStore, StoreError, cbor_deserialize, cbor_serialize};
use serde::{Deserialize, Serialize};

use crate::cache::{CachePolicy, CacheStats, ChunkAddr, chunk_key};
use crate::chain::{AnyChain, Chain, ChainMut, ChunkIo, Element};

/// Store key holding the allocation table.
pub const ALLOCATION_TABLE_KEY: &str = "__ooc_allocation_table__";

/// Current schema version of the allocation table.
const ALLOCATION_SCHEMA_VERSION: u32 = 1;

/// Errors from the storage environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("chain not found: {0}")]
    NotFound(String),
    #[error("chain already exists: {0}")]
    AlreadyExists(String),
    #[error("chain {chain} holds {found}, requested {expected}")]
    TypeMismatch {
        chain: String,
        expected: String,
        found: String,
    },
    #[error("element type {0} is not bound")]
    UnboundType(String),
    #[error("type name {0} is already bound to a different type")]
    TypeRebind(String),
    #[error("stored type {0} has no binding")]
    UnknownType(String),
    #[error("type {name} has size {bound} but the store recorded {stored}")]
    SizeMismatch {
        name: String,
        bound: usize,
        stored: usize,
    },
    #[error("index {index} out of bounds for chain {chain} of length {len}")]
    IndexOutOfBounds {
        chain: String,
        index: usize,
        len: usize,
    },
    #[error("store already holds an allocation table")]
    AlreadyInitialized,
    #[error("allocation table schema v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Sizing of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvParams {
    /// Target payload size of one chunk.
    pub block_size_bytes: usize,
    /// Memory allowed for resident chunks.
    pub cache_budget_bytes: usize,
}

impl Default for EnvParams {
    fn default() -> Self {
        Self {
            block_size_bytes: 64 * 1024,
            cache_budget_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Persisted description of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub name: String,
    pub type_name: String,
    pub len: u64,
    pub chunk_len: u64,
    /// On-disk byte size per chunk, 0 when never written.
    pub chunk_sizes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BindingRecord {
    name: String,
    size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AllocationTable {
    schema_version: u32,
    block_size_bytes: u64,
    bindings: Vec<BindingRecord>,
    chains: Vec<ChainRecord>,
}

type OpenChainFn = fn(&ChainRecord) -> Box<dyn AnyChain>;

fn open_chain<T: Element>(rec: &ChainRecord) -> Box<dyn AnyChain> {
    Box::new(Chain::<T>::from_record(rec))
}

struct TypeBinding {
    size: usize,
    type_id: TypeId,
    open: OpenChainFn,
}

/// Element types known to an environment, by persisted name.
#[derive(Default)]
pub struct TypeRegistry {
    by_name: BTreeMap<String, TypeBinding>,
    by_type: HashMap<TypeId, String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `name`. Binding the same pair twice is a no-op;
    /// reusing either half with something else is an error.
    pub fn bind<T: Element>(&mut self, name: &str) -> Result<(), EnvError> {
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.by_name.get(name) {
            return if existing.type_id == type_id {
                Ok(())
            } else {
                Err(EnvError::TypeRebind(name.to_owned()))
            };
        }
        if self.by_type.contains_key(&type_id) {
            return Err(EnvError::TypeRebind(name.to_owned()));
        }
        self.by_name.insert(
            name.to_owned(),
            TypeBinding {
                size: std::mem::size_of::<T>(),
                type_id,
                open: open_chain::<T>,
            },
        );
        self.by_type.insert(type_id, name.to_owned());
        Ok(())
    }

    pub fn name_of<T: Element>(&self) -> Option<&str> {
        self.by_type.get(&TypeId::of::<T>()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    fn records(&self) -> Vec<BindingRecord> {
        self.by_name
            .iter()
            .map(|(name, b)| BindingRecord {
                name: name.clone(),
                size: b.size as u64,
            })
            .collect()
    }
}

/// Storage environment: a key-value store, the chains it holds, the shared
/// chunk cache and the element type bindings.
///
/// Single writer only; every accessor takes `&mut self` because any read may
/// page chunks in or out.
pub struct OocEnv {
    store: Box<dyn KvStore>,
    chains: BTreeMap<String, Box<dyn AnyChain>>,
    cache: CachePolicy,
    types: TypeRegistry,
    block_size_bytes: usize,
}

impl OocEnv {
    /// Start a fresh environment on an uninitialized store.
    pub fn create(store: Box<dyn KvStore>, params: EnvParams) -> Result<Self, EnvError> {
        if store.exists(ALLOCATION_TABLE_KEY)? {
            return Err(EnvError::AlreadyInitialized);
        }
        tracing::debug!(
            block = params.block_size_bytes,
            budget = params.cache_budget_bytes,
            "created environment"
        );
        Ok(Self {
            store,
            chains: BTreeMap::new(),
            cache: CachePolicy::new(params.cache_budget_bytes),
            types: TypeRegistry::new(),
            block_size_bytes: params.block_size_bytes.max(1),
        })
    }

    /// Reopen an environment from its allocation table.
    ///
    /// Every stored chain type must be bound in `types` with the recorded size.
    pub fn open(
        store: Box<dyn KvStore>,
        params: EnvParams,
        types: TypeRegistry,
    ) -> Result<Self, EnvError> {
        let _span = tracing::info_span!("env_open").entered();
        let raw = store
            .get(ALLOCATION_TABLE_KEY)?
            .ok_or_else(|| EnvError::NotFound(ALLOCATION_TABLE_KEY.to_owned()))?;
        let table: AllocationTable = cbor_deserialize(&raw)
            .map_err(|e| EnvError::Corruption(format!("allocation table: {e}")))?;
        if table.schema_version != ALLOCATION_SCHEMA_VERSION {
            return Err(EnvError::SchemaMismatch {
                file_version: table.schema_version,
                expected_version: ALLOCATION_SCHEMA_VERSION,
            });
        }
        for b in &table.bindings {
            if let Some(bound) = types.by_name.get(&b.name) {
                if bound.size as u64 != b.size {
                    return Err(EnvError::SizeMismatch {
                        name: b.name.clone(),
                        bound: bound.size,
                        stored: b.size as usize,
                    });
                }
            }
        }

        let mut cache = CachePolicy::new(params.cache_budget_bytes);
        let mut chains = BTreeMap::new();
        for rec in &table.chains {
            let binding = types
                .by_name
                .get(&rec.type_name)
                .ok_or_else(|| EnvError::UnknownType(rec.type_name.clone()))?;
            let chain = (binding.open)(rec);
            let expected_chunks = rec.len.div_ceil(rec.chunk_len.max(1)) as usize;
            if rec.chunk_sizes.len() != expected_chunks {
                return Err(EnvError::Corruption(format!(
                    "chain {} records {} chunks, expected {expected_chunks}",
                    rec.name,
                    rec.chunk_sizes.len()
                )));
            }
            let name: Arc<str> = Arc::from(rec.name.as_str());
            for (ci, &size) in rec.chunk_sizes.iter().enumerate() {
                if size > 0 {
                    cache.seed_disk_size(ChunkAddr::new(name.clone(), ci as u32), size);
                }
            }
            chains.insert(rec.name.clone(), chain);
        }
        if table.block_size_bytes as usize != params.block_size_bytes {
            tracing::debug!(
                stored = table.block_size_bytes,
                requested = params.block_size_bytes,
                "keeping stored block size"
            );
        }
        tracing::info!(chains = chains.len(), "opened environment");
        Ok(Self {
            store,
            chains,
            cache,
            types,
            block_size_bytes: (table.block_size_bytes as usize).max(1),
        })
    }

    /// Register an element type under a persisted name.
    pub fn bind_type<T: Element>(&mut self, name: &str) -> Result<(), EnvError> {
        self.types.bind::<T>(name)
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    pub fn block_size_bytes(&self) -> usize {
        self.block_size_bytes
    }

    fn type_name_of<T: Element>(&self) -> Result<String, EnvError> {
        self.types
            .name_of::<T>()
            .map(str::to_owned)
            .ok_or_else(|| EnvError::UnboundType(std::any::type_name::<T>().to_owned()))
    }

    /// Create an empty chain of `T`.
    pub fn create_chain<T: Element>(&mut self, name: &str) -> Result<(), EnvError> {
        let type_name = self.type_name_of::<T>()?;
        if self.chains.contains_key(name) {
            return Err(EnvError::AlreadyExists(name.to_owned()));
        }
        let chain = Chain::<T>::new(name, &type_name, self.block_size_bytes);
        tracing::trace!(name, type_name, chunk_len = chain.chunk_len(), "chain created");
        self.chains.insert(name.to_owned(), Box::new(chain));
        Ok(())
    }

    /// Create an empty chain of a bound type known only by its name.
    pub fn create_chain_dyn(&mut self, name: &str, type_name: &str) -> Result<(), EnvError> {
        if self.chains.contains_key(name) {
            return Err(EnvError::AlreadyExists(name.to_owned()));
        }
        let binding = self
            .types
            .by_name
            .get(type_name)
            .ok_or_else(|| EnvError::UnknownType(type_name.to_owned()))?;
        let rec = ChainRecord {
            name: name.to_owned(),
            type_name: type_name.to_owned(),
            len: 0,
            chunk_len: (self.block_size_bytes / binding.size.max(1)).max(1) as u64,
            chunk_sizes: Vec::new(),
        };
        self.chains.insert(name.to_owned(), (binding.open)(&rec));
        Ok(())
    }

    /// Typed handle on an existing chain.
    pub fn chain<T: Element>(&mut self, name: &str) -> Result<ChainMut<'_, T>, EnvError> {
        let expected = self.type_name_of::<T>()?;
        let entry = self
            .chains
            .get_mut(name)
            .ok_or_else(|| EnvError::NotFound(name.to_owned()))?;
        let found = entry.type_name().to_owned();
        let chain = entry
            .as_any_mut()
            .downcast_mut::<Chain<T>>()
            .ok_or_else(|| EnvError::TypeMismatch {
                chain: name.to_owned(),
                expected,
                found,
            })?;
        Ok(ChainMut {
            chain,
            io: ChunkIo {
                cache: &mut self.cache,
                store: &mut *self.store,
            },
        })
    }

    pub fn get_or_create_chain<T: Element>(
        &mut self,
        name: &str,
    ) -> Result<ChainMut<'_, T>, EnvError> {
        if !self.chains.contains_key(name) {
            self.create_chain::<T>(name)?;
        }
        self.chain::<T>(name)
    }

    /// Drop a chain with all its chunks and store keys. Returns whether it existed.
    pub fn remove_chain(&mut self, name: &str) -> Result<bool, EnvError> {
        let Some(chain) = self.chains.remove(name) else {
            return Ok(false);
        };
        let name: Arc<str> = Arc::from(name);
        for ci in 0..chain.chunk_count() {
            let addr = ChunkAddr::new(name.clone(), ci as u32);
            if self.cache.forget(&addr) {
                self.store.delete(&chunk_key(&name, ci as u32))?;
            }
        }
        tracing::trace!(name = %name, "chain removed");
        Ok(true)
    }

    pub fn contains_chain(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    pub fn chain_len(&self, name: &str) -> Option<usize> {
        self.chains.get(name).map(|c| c.len())
    }

    pub fn chain_type(&self, name: &str) -> Option<&str> {
        self.chains.get(name).map(|c| c.type_name())
    }

    /// In-memory bytes the chain would occupy fully loaded.
    pub fn chain_bytes(&self, name: &str) -> usize {
        self.chains
            .get(name)
            .map_or(0, |c| c.len() * c.elem_size().max(1))
    }

    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chains.values().map(|c| c.chunk_count()).sum()
    }

    fn dyn_chain(
        &mut self,
        name: &str,
    ) -> Result<(&mut Box<dyn AnyChain>, ChunkIo<'_>), EnvError> {
        let chain = self
            .chains
            .get_mut(name)
            .ok_or_else(|| EnvError::NotFound(name.to_owned()))?;
        Ok((
            chain,
            ChunkIo {
                cache: &mut self.cache,
                store: &mut *self.store,
            },
        ))
    }

    pub fn load_all_dyn(&mut self, name: &str) -> Result<(), EnvError> {
        let (chain, mut io) = self.dyn_chain(name)?;
        chain.load_all(&mut io)
    }

    pub fn free_all_dyn(&mut self, name: &str) -> Result<(), EnvError> {
        let (chain, mut io) = self.dyn_chain(name)?;
        chain.free_all(&mut io)
    }

    pub fn compact_dyn(&mut self, name: &str, deleted: &[u32]) -> Result<(), EnvError> {
        let (chain, mut io) = self.dyn_chain(name)?;
        chain.compact(&mut io, deleted)
    }

    pub fn resize_dyn(&mut self, name: &str, n: usize) -> Result<(), EnvError> {
        let (chain, mut io) = self.dyn_chain(name)?;
        chain.resize(&mut io, n)
    }

    /// Copy element `i` of `src` into `dst` at `j`, or append when `j` is
    /// `None`. Both chains must hold the same type. Returns the target index.
    pub fn copy_element_dyn(
        &mut self,
        src: &str,
        i: u32,
        dst: &str,
        j: Option<u32>,
    ) -> Result<u32, EnvError> {
        let src_type = self
            .chain_type(src)
            .ok_or_else(|| EnvError::NotFound(src.to_owned()))?
            .to_owned();
        let dst_type = self
            .chain_type(dst)
            .ok_or_else(|| EnvError::NotFound(dst.to_owned()))?
            .to_owned();
        if src_type != dst_type {
            return Err(EnvError::TypeMismatch {
                chain: dst.to_owned(),
                expected: dst_type,
                found: src_type,
            });
        }
        let value = {
            let (chain, mut io) = self.dyn_chain(src)?;
            chain.get_any(&mut io, i)?
        };
        let (chain, mut io) = self.dyn_chain(dst)?;
        match j {
            Some(j) => {
                chain.set_any(&mut io, j, value)?;
                Ok(j)
            }
            None => chain.push_any(&mut io, value),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn set_cache_budget(&mut self, bytes: usize) {
        self.cache.set_budget_bytes(bytes);
    }

    /// Direct access to the backing store for tables kept next to the chains.
    pub fn store(&self) -> &dyn KvStore {
        &*self.store
    }

    pub fn store_mut(&mut self) -> &mut dyn KvStore {
        &mut *self.store
    }

    fn allocation_table(&self) -> AllocationTable {
        AllocationTable {
            schema_version: ALLOCATION_SCHEMA_VERSION,
            block_size_bytes: self.block_size_bytes as u64,
            bindings: self.types.records(),
            chains: self
                .chains
                .values()
                .map(|c| c.record(&self.cache))
                .collect(),
        }
    }

    /// Write every dirty resident chunk and the allocation table.
    pub fn flush(&mut self) -> Result<(), EnvError> {
        self.cache.flush_all(&mut *self.store)?;
        let table = cbor_serialize(&self.allocation_table())?;
        self.store.put(ALLOCATION_TABLE_KEY, &table)?;
        self.store.flush()?;
        tracing::debug!(chains = self.chains.len(), "environment flushed");
        Ok(())
    }

    /// Flush and hand the store back.
    pub fn close(mut self) -> Result<Box<dyn KvStore>, EnvError> {
        let _span = tracing::info_span!("env_close").entered();
        self.flush()?;
        Ok(self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocme_persist::{DirStore, MemoryStore};

    #[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
    struct Pt {
        p: [f32; 3],
    }

    fn small_params() -> EnvParams {
        EnvParams {
            block_size_bytes: 64,
            cache_budget_bytes: 1024,
        }
    }

    fn env_with_types(store: Box<dyn KvStore>, params: EnvParams) -> OocEnv {
        let mut env = OocEnv::create(store, params).unwrap();
        env.bind_type::<u32>("u32").unwrap();
        env.bind_type::<Pt>("Pt").unwrap();
        env
    }

    fn registry() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types.bind::<u32>("u32").unwrap();
        types.bind::<Pt>("Pt").unwrap();
        types
    }

    #[test]
    fn push_get_set_across_chunks() {
        let mut env = env_with_types(Box::new(MemoryStore::new()), small_params());
        let mut c = env.get_or_create_chain::<u32>("a").unwrap();
        assert_eq!(c.chunk_len(), 16);
        for i in 0..100 {
            assert_eq!(c.push(i * 2).unwrap(), i);
        }
        assert_eq!(c.len(), 100);
        assert_eq!(c.chunk_count(), 7);
        assert_eq!(c.get(37).unwrap(), 74);
        c.set(37, 1).unwrap();
        c.update(38, |v| *v += 1).unwrap();
        assert_eq!(c.get(37).unwrap(), 1);
        assert_eq!(c.get(38).unwrap(), 77);
        assert!(matches!(
            c.get(100),
            Err(EnvError::IndexOutOfBounds { index: 100, .. })
        ));
    }

    #[test]
    fn eviction_under_tight_budget_preserves_values() {
        let params = EnvParams {
            block_size_bytes: 64,
            cache_budget_bytes: 128,
        };
        let mut env = env_with_types(Box::new(MemoryStore::new()), params);
        let mut c = env.get_or_create_chain::<u32>("a").unwrap();
        for i in 0..200 {
            c.push(i).unwrap();
        }
        for i in (0..200).rev() {
            assert_eq!(c.get(i).unwrap(), i);
        }
        let stats = env.cache_stats();
        assert!(stats.evictions > 0);
        assert!(stats.loads > 0);
        assert!(stats.used_bytes <= 128);
    }

    #[test]
    fn compact_shifts_and_drops_tail_chunks() {
        let mut env = env_with_types(Box::new(MemoryStore::new()), small_params());
        let mut c = env.get_or_create_chain::<u32>("a").unwrap();
        c.extend(0..40).unwrap();
        let deleted: Vec<u32> = (0..40).filter(|i| i % 3 == 0).collect();
        let remap = c.build_remap(&deleted);
        c.compact(&deleted).unwrap();

        let values = c.to_vec().unwrap();
        let expected: Vec<u32> = (0..40).filter(|i| i % 3 != 0).collect();
        assert_eq!(values, expected);
        for (old, new) in remap.iter().enumerate() {
            if let Some(new) = new {
                assert_eq!(values[*new as usize], old as u32);
            }
        }
        assert_eq!(c.chunk_count(), 2);
    }

    #[test]
    fn resize_grows_with_defaults_and_shrinks() {
        let mut env = env_with_types(Box::new(MemoryStore::new()), small_params());
        let mut c = env.get_or_create_chain::<u32>("a").unwrap();
        c.resize(20).unwrap();
        assert_eq!(c.get(19).unwrap(), 0);
        c.set(3, 9).unwrap();
        c.resize(4).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![0, 0, 0, 9]);
        c.push(5).unwrap();
        assert_eq!(c.len(), 5);
    }

    #[test]
    fn reopen_restores_chains() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("env");
        {
            let store = DirStore::open(&path).unwrap();
            let mut env = env_with_types(Box::new(store), small_params());
            let mut pts = env.get_or_create_chain::<Pt>("0.0.0.0.v").unwrap();
            for i in 0..50 {
                pts.push(Pt {
                    p: [i as f32, 0.5, -1.0],
                })
                .unwrap();
            }
            env.get_or_create_chain::<u32>("0.0.0.0.f")
                .unwrap()
                .extend([7, 8, 9])
                .unwrap();
            env.close().unwrap();
        }
        let store = DirStore::open(&path).unwrap();
        let mut env = OocEnv::open(Box::new(store), small_params(), registry()).unwrap();
        assert_eq!(env.chain_len("0.0.0.0.v"), Some(50));
        assert_eq!(env.chain_type("0.0.0.0.f"), Some("u32"));
        let mut pts = env.chain::<Pt>("0.0.0.0.v").unwrap();
        assert_eq!(pts.get(42).unwrap().p, [42.0, 0.5, -1.0]);
        assert_eq!(env.chain::<u32>("0.0.0.0.f").unwrap().to_vec().unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn create_on_initialized_store_fails() {
        let env = env_with_types(Box::new(MemoryStore::new()), small_params());
        let store = env.close().unwrap();
        assert!(matches!(
            OocEnv::create(store, small_params()),
            Err(EnvError::AlreadyInitialized)
        ));
    }

    fn store_with_pt_chain() -> Box<dyn KvStore> {
        let mut env = env_with_types(Box::new(MemoryStore::new()), small_params());
        env.create_chain::<Pt>("pts").unwrap();
        env.close().unwrap()
    }

    #[test]
    fn open_rejects_unknown_and_resized_types() {
        let mut only_u32 = TypeRegistry::new();
        only_u32.bind::<u32>("u32").unwrap();
        match OocEnv::open(store_with_pt_chain(), small_params(), only_u32) {
            Err(EnvError::UnknownType(name)) => assert_eq!(name, "Pt"),
            Err(e) => panic!("expected UnknownType, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }

        let mut wrong_size = TypeRegistry::new();
        wrong_size.bind::<u32>("u32").unwrap();
        wrong_size.bind::<u64>("Pt").unwrap();
        assert!(matches!(
            OocEnv::open(store_with_pt_chain(), small_params(), wrong_size),
            Err(EnvError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn type_binding_rules() {
        let mut env = env_with_types(Box::new(MemoryStore::new()), small_params());
        assert!(env.bind_type::<u32>("u32").is_ok());
        assert!(matches!(
            env.bind_type::<u64>("u32"),
            Err(EnvError::TypeRebind(_))
        ));
        assert!(matches!(
            env.create_chain::<i64>("x"),
            Err(EnvError::UnboundType(_))
        ));
        env.create_chain::<u32>("x").unwrap();
        assert!(matches!(
            env.chain::<Pt>("x"),
            Err(EnvError::TypeMismatch { .. })
        ));
        assert!(matches!(env.chain::<u32>("y"), Err(EnvError::NotFound(_))));
        assert!(matches!(
            env.create_chain::<u32>("x"),
            Err(EnvError::AlreadyExists(_))
        ));
    }

    #[test]
    fn remove_chain_deletes_store_keys() {
        let mut env = env_with_types(Box::new(MemoryStore::new()), small_params());
        env.get_or_create_chain::<u32>("a")
            .unwrap()
            .extend(0..40)
            .unwrap();
        env.flush().unwrap();
        assert!(env.store().exists("a_0").unwrap());
        assert!(env.remove_chain("a").unwrap());
        assert!(!env.remove_chain("a").unwrap());
        assert!(!env.store().exists("a_0").unwrap());
        assert!(!env.store().exists("a_2").unwrap());
        assert!(!env.contains_chain("a"));
    }

    #[test]
    fn missing_chunk_is_corruption() {
        let params = EnvParams {
            block_size_bytes: 64,
            cache_budget_bytes: 64,
        };
        let mut env = env_with_types(Box::new(MemoryStore::new()), params);
        env.get_or_create_chain::<u32>("a")
            .unwrap()
            .extend(0..48)
            .unwrap();
        // chunk 0 was evicted to the store; lose it
        env.store_mut().delete("a_0").unwrap();
        assert!(matches!(
            env.chain::<u32>("a").unwrap().get(0),
            Err(EnvError::Corruption(_))
        ));
    }

    #[test]
    fn pinned_chains_stay_resident() {
        let params = EnvParams {
            block_size_bytes: 64,
            cache_budget_bytes: 64,
        };
        let mut env = env_with_types(Box::new(MemoryStore::new()), params);
        env.get_or_create_chain::<u32>("a")
            .unwrap()
            .extend(0..32)
            .unwrap();
        env.load_all_dyn("a").unwrap();
        env.get_or_create_chain::<u32>("b")
            .unwrap()
            .extend(0..32)
            .unwrap();
        let loads_before = env.cache_stats().loads;
        assert_eq!(env.chain::<u32>("a").unwrap().get(5).unwrap(), 5);
        assert_eq!(env.cache_stats().loads, loads_before);
        env.free_all_dyn("a").unwrap();
        assert_eq!(env.chain::<u32>("a").unwrap().to_vec().unwrap(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn copy_element_between_chains() {
        let mut env = env_with_types(Box::new(MemoryStore::new()), small_params());
        env.get_or_create_chain::<u32>("a")
            .unwrap()
            .extend([1, 2, 3])
            .unwrap();
        env.create_chain::<u32>("b").unwrap();
        assert_eq!(env.copy_element_dyn("a", 2, "b", None).unwrap(), 0);
        env.copy_element_dyn("a", 0, "b", Some(0)).unwrap();
        assert_eq!(env.chain::<u32>("b").unwrap().to_vec().unwrap(), vec![1]);

        env.create_chain::<Pt>("p").unwrap();
        assert!(matches!(
            env.copy_element_dyn("a", 0, "p", None),
            Err(EnvError::TypeMismatch { .. })
        ));

        env.create_chain_dyn("q", "u32").unwrap();
        assert_eq!(env.copy_element_dyn("a", 1, "q", None).unwrap(), 0);
        assert_eq!(env.chain::<u32>("q").unwrap().get(0).unwrap(), 2);
        assert!(matches!(
            env.create_chain_dyn("r", "nope"),
            Err(EnvError::UnknownType(_))
        ));

        env.compact_dyn("a", &[1]).unwrap();
        env.resize_dyn("a", 1).unwrap();
        assert_eq!(env.chain::<u32>("a").unwrap().to_vec().unwrap(), vec![1]);
    }
}
