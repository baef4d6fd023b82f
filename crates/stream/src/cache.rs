use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ocme_persist::{KvStore, StoreError, cbor_serialize};

use crate::chain::Element;

/// Address of one chunk: owning chain name plus chunk index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkAddr {
    pub chain: Arc<str>,
    pub index: u32,
}

impl ChunkAddr {
    pub fn new(chain: Arc<str>, index: u32) -> Self {
        Self { chain, index }
    }

    /// Store key of the chunk payload: `"{chain}_{index}"`.
    pub fn store_key(&self) -> String {
        chunk_key(&self.chain, self.index)
    }
}

pub(crate) fn chunk_key(chain: &str, index: u32) -> String {
    format!("{chain}_{index}")
}

/// Owned, type-erased chunk buffer.
pub(crate) trait ChunkBuf {
    fn encode(&self) -> Result<Vec<u8>, StoreError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Element> ChunkBuf for Vec<T> {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        cbor_serialize(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Resident {
    buf: Box<dyn ChunkBuf>,
    bytes: usize,
    dirty: bool,
    pins: u32,
    loaded_at: u64,
}

/// Cache counters for instrumentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub loads: u64,
    pub evictions: u64,
    pub writes: u64,
    pub hits: u64,
    pub peak_bytes: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
    pub resident_chunks: usize,
}

/// Memory budget shared by every chain of one environment.
///
/// Owns the resident chunk buffers. Before memory is granted for a chunk,
/// the least-recently-loaded unpinned chunk of any chain is evicted until the
/// request fits. Eviction writes the chunk first if it is dirty or has never
/// been persisted.
pub struct CachePolicy {
    budget_bytes: usize,
    used_bytes: usize,
    resident: HashMap<ChunkAddr, Resident>,
    /// Load order; entries whose stamp no longer matches are stale.
    lru: VecDeque<(ChunkAddr, u64)>,
    /// On-disk size of every persisted chunk.
    disk_sizes: HashMap<ChunkAddr, u32>,
    clock: u64,
    stats: CacheStats,
}

impl CachePolicy {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            used_bytes: 0,
            resident: HashMap::new(),
            lru: VecDeque::new(),
            disk_sizes: HashMap::new(),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn set_budget_bytes(&mut self, budget_bytes: usize) {
        self.budget_bytes = budget_bytes;
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            used_bytes: self.used_bytes,
            budget_bytes: self.budget_bytes,
            resident_chunks: self.resident.len(),
            ..self.stats
        }
    }

    pub fn is_resident(&self, addr: &ChunkAddr) -> bool {
        self.resident.contains_key(addr)
    }

    pub fn is_pinned(&self, addr: &ChunkAddr) -> bool {
        self.resident.get(addr).is_some_and(|r| r.pins > 0)
    }

    pub fn is_persisted(&self, addr: &ChunkAddr) -> bool {
        self.disk_sizes.contains_key(addr)
    }

    /// On-disk byte size, 0 when never persisted.
    pub fn disk_size(&self, addr: &ChunkAddr) -> u32 {
        self.disk_sizes.get(addr).copied().unwrap_or(0)
    }

    pub(crate) fn seed_disk_size(&mut self, addr: ChunkAddr, size: u32) {
        self.disk_sizes.insert(addr, size);
    }

    pub(crate) fn record_hit(&mut self) {
        self.stats.hits += 1;
    }

    pub(crate) fn record_load(&mut self) {
        self.stats.loads += 1;
    }

    /// Evict unpinned chunks until `bytes` more fit in the budget.
    ///
    /// When only pinned chunks remain the request is granted over budget.
    pub fn make_room(&mut self, bytes: usize, store: &mut dyn KvStore) -> Result<(), StoreError> {
        let mut pinned = Vec::new();
        let mut result = Ok(());
        while self.used_bytes + bytes > self.budget_bytes {
            let Some((addr, stamp)) = self.lru.pop_front() else {
                tracing::warn!(
                    used = self.used_bytes,
                    request = bytes,
                    budget = self.budget_bytes,
                    "cache over budget, only pinned chunks resident"
                );
                break;
            };
            let Some(r) = self.resident.get(&addr) else {
                continue;
            };
            if r.loaded_at != stamp {
                continue;
            }
            if r.pins > 0 {
                pinned.push((addr, stamp));
                continue;
            }
            if let Err(e) = self.evict(&addr, store) {
                self.lru.push_front((addr, stamp));
                result = Err(e);
                break;
            }
        }
        for entry in pinned.into_iter().rev() {
            self.lru.push_front(entry);
        }
        result
    }

    /// Take ownership of a freshly loaded or created chunk buffer.
    pub(crate) fn insert(
        &mut self,
        addr: ChunkAddr,
        buf: Box<dyn ChunkBuf>,
        bytes: usize,
        dirty: bool,
    ) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(old) = self.resident.insert(
            addr.clone(),
            Resident {
                buf,
                bytes,
                dirty,
                pins: 0,
                loaded_at: stamp,
            },
        ) {
            self.used_bytes -= old.bytes;
        }
        self.used_bytes += bytes;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.used_bytes);
        self.lru.push_back((addr, stamp));
    }

    pub(crate) fn buf<T: Element>(&self, addr: &ChunkAddr) -> Option<&Vec<T>> {
        self.resident.get(addr)?.buf.as_any().downcast_ref::<Vec<T>>()
    }

    pub(crate) fn buf_mut<T: Element>(&mut self, addr: &ChunkAddr) -> Option<&mut Vec<T>> {
        self.resident
            .get_mut(addr)?
            .buf
            .as_any_mut()
            .downcast_mut::<Vec<T>>()
    }

    pub(crate) fn mark_dirty(&mut self, addr: &ChunkAddr) {
        if let Some(r) = self.resident.get_mut(addr) {
            r.dirty = true;
        }
    }

    pub(crate) fn pin(&mut self, addr: &ChunkAddr) {
        if let Some(r) = self.resident.get_mut(addr) {
            r.pins += 1;
        }
    }

    /// Drop one pin. Returns true when the chunk is no longer pinned.
    pub(crate) fn unpin(&mut self, addr: &ChunkAddr) -> bool {
        match self.resident.get_mut(addr) {
            Some(r) => {
                r.pins = r.pins.saturating_sub(1);
                r.pins == 0
            }
            None => true,
        }
    }

    /// Write a resident chunk if it is dirty or has never been persisted.
    pub fn write_back(&mut self, addr: &ChunkAddr, store: &mut dyn KvStore) -> Result<(), StoreError> {
        let Some(r) = self.resident.get_mut(addr) else {
            return Ok(());
        };
        if !r.dirty && self.disk_sizes.contains_key(addr) {
            return Ok(());
        }
        let key = addr.store_key();
        let payload = r.buf.encode()?;
        store.put(&key, &payload)?;
        r.dirty = false;
        self.disk_sizes.insert(addr.clone(), payload.len() as u32);
        self.stats.writes += 1;
        tracing::trace!(key, bytes = payload.len(), "chunk written");
        Ok(())
    }

    /// Write back then free a resident chunk, ignoring pins.
    pub(crate) fn release(&mut self, addr: &ChunkAddr, store: &mut dyn KvStore) -> Result<(), StoreError> {
        self.write_back(addr, store)?;
        if let Some(r) = self.resident.remove(addr) {
            self.used_bytes -= r.bytes;
        }
        Ok(())
    }

    fn evict(&mut self, addr: &ChunkAddr, store: &mut dyn KvStore) -> Result<(), StoreError> {
        self.release(addr, store)?;
        self.stats.evictions += 1;
        tracing::debug!(chain = %addr.chain, index = addr.index, "evicted chunk");
        Ok(())
    }

    /// Drop a chunk without writing it. Returns true if it had been persisted.
    pub(crate) fn forget(&mut self, addr: &ChunkAddr) -> bool {
        if let Some(r) = self.resident.remove(addr) {
            self.used_bytes -= r.bytes;
        }
        self.disk_sizes.remove(addr).is_some()
    }

    /// Write every resident chunk that needs it. Residency is unchanged.
    pub fn flush_all(&mut self, store: &mut dyn KvStore) -> Result<(), StoreError> {
        let mut addrs: Vec<ChunkAddr> = self
            .resident
            .iter()
            .filter(|(a, r)| r.dirty || !self.disk_sizes.contains_key(*a))
            .map(|(a, _)| a.clone())
            .collect();
        addrs.sort_by(|a, b| (&*a.chain, a.index).cmp(&(&*b.chain, b.index)));
        for addr in &addrs {
            self.write_back(addr, store)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocme_persist::MemoryStore;

    fn addr(chain: &str, index: u32) -> ChunkAddr {
        ChunkAddr::new(Arc::from(chain), index)
    }

    fn insert_chunk(cache: &mut CachePolicy, store: &mut MemoryStore, a: &ChunkAddr, values: Vec<u32>) {
        cache.make_room(16, store).unwrap();
        cache.insert(a.clone(), Box::new(values), 16, true);
    }

    #[test]
    fn store_key_format() {
        assert_eq!(addr("0.0.0.0.f", 3).store_key(), "0.0.0.0.f_3");
    }

    #[test]
    fn evicts_least_recently_loaded() {
        let mut store = MemoryStore::new();
        let mut cache = CachePolicy::new(32);
        let a = addr("a", 0);
        let b = addr("b", 0);
        let c = addr("c", 0);
        insert_chunk(&mut cache, &mut store, &a, vec![1]);
        insert_chunk(&mut cache, &mut store, &b, vec![2]);
        insert_chunk(&mut cache, &mut store, &c, vec![3]);

        assert!(!cache.is_resident(&a));
        assert!(cache.is_resident(&b));
        assert!(cache.is_resident(&c));
        assert!(cache.is_persisted(&a));
        assert!(store.exists("a_0").unwrap());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.used_bytes(), 32);
    }

    #[test]
    fn pinned_chunks_survive_and_allow_overrun() {
        let mut store = MemoryStore::new();
        let mut cache = CachePolicy::new(16);
        let a = addr("a", 0);
        let b = addr("b", 0);
        insert_chunk(&mut cache, &mut store, &a, vec![1]);
        cache.pin(&a);
        insert_chunk(&mut cache, &mut store, &b, vec![2]);

        assert!(cache.is_resident(&a));
        assert!(cache.is_resident(&b));
        assert_eq!(cache.used_bytes(), 32);
        assert_eq!(cache.stats().peak_bytes, 32);

        assert!(cache.unpin(&a));
        let c = addr("c", 0);
        insert_chunk(&mut cache, &mut store, &c, vec![3]);
        assert!(!cache.is_resident(&a));
    }

    #[test]
    fn clean_persisted_chunks_are_not_rewritten() {
        let mut store = MemoryStore::new();
        let mut cache = CachePolicy::new(1024);
        let a = addr("a", 0);
        insert_chunk(&mut cache, &mut store, &a, vec![5, 6]);
        cache.flush_all(&mut store).unwrap();
        cache.flush_all(&mut store).unwrap();
        assert_eq!(cache.stats().writes, 1);
        assert!(cache.disk_size(&a) > 0);

        cache.buf_mut::<u32>(&a).unwrap().push(7);
        cache.mark_dirty(&a);
        cache.flush_all(&mut store).unwrap();
        assert_eq!(cache.stats().writes, 2);
    }

    #[test]
    fn forget_discards_without_writing() {
        let mut store = MemoryStore::new();
        let mut cache = CachePolicy::new(1024);
        let a = addr("a", 0);
        insert_chunk(&mut cache, &mut store, &a, vec![1]);
        assert!(!cache.forget(&a));
        assert_eq!(cache.used_bytes(), 0);
        assert!(store.is_empty());
    }
}
