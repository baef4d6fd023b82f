use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use ocme_persist::{KvStore, cbor_deserialize};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::{CachePolicy, ChunkAddr};
use crate::env::{ChainRecord, EnvError};

/// Anything that can be stored in a chain.
pub trait Element: Clone + Default + Serialize + DeserializeOwned + 'static {}

impl<T: Clone + Default + Serialize + DeserializeOwned + 'static> Element for T {}

/// Number of elements per chunk for a given block size.
pub fn chunk_len_for<T>(block_size_bytes: usize) -> usize {
    (block_size_bytes / std::mem::size_of::<T>().max(1)).max(1)
}

/// Predict where each index lands after compacting `deleted` out of a chain
/// of `len` elements. `None` marks removed slots.
pub fn build_remap(len: usize, deleted: &[u32]) -> Vec<Option<u32>> {
    let mut sorted: Vec<u32> = deleted.iter().copied().filter(|&d| (d as usize) < len).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut remap = Vec::with_capacity(len);
    let mut next = sorted.iter().peekable();
    let mut w = 0u32;
    for i in 0..len as u32 {
        if next.peek() == Some(&&i) {
            next.next();
            remap.push(None);
        } else {
            remap.push(Some(w));
            w += 1;
        }
    }
    remap
}

/// Store and cache handles lent to a chain for the duration of one call.
pub(crate) struct ChunkIo<'a> {
    pub cache: &'a mut CachePolicy,
    pub store: &'a mut dyn KvStore,
}

/// Resizable array of one element type, split into fixed-size chunks that
/// are paged in and out independently.
///
/// The chain itself only holds layout; chunk buffers live in the
/// [`CachePolicy`]. Every full chunk holds exactly `chunk_len` elements, the
/// last holds the remainder.
pub struct Chain<T> {
    name: Arc<str>,
    type_name: String,
    len: usize,
    chunk_len: usize,
    _elem: PhantomData<fn() -> T>,
}

impl<T: Element> Chain<T> {
    pub(crate) fn new(name: &str, type_name: &str, block_size_bytes: usize) -> Self {
        Self {
            name: Arc::from(name),
            type_name: type_name.to_owned(),
            len: 0,
            chunk_len: chunk_len_for::<T>(block_size_bytes),
            _elem: PhantomData,
        }
    }

    pub(crate) fn from_record(rec: &ChainRecord) -> Self {
        Self {
            name: Arc::from(rec.name.as_str()),
            type_name: rec.type_name.clone(),
            len: rec.len as usize,
            chunk_len: (rec.chunk_len as usize).max(1),
            _elem: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    pub fn chunk_count(&self) -> usize {
        self.len.div_ceil(self.chunk_len)
    }

    pub(crate) fn addr(&self, ci: usize) -> ChunkAddr {
        ChunkAddr::new(self.name.clone(), ci as u32)
    }

    fn fill(&self, ci: usize) -> usize {
        self.len.saturating_sub(ci * self.chunk_len).min(self.chunk_len)
    }

    fn chunk_bytes(&self) -> usize {
        self.chunk_len * std::mem::size_of::<T>().max(1)
    }

    fn check_index(&self, i: u32) -> Result<(usize, usize), EnvError> {
        let i = i as usize;
        if i >= self.len {
            return Err(EnvError::IndexOutOfBounds {
                chain: self.name.to_string(),
                index: i,
                len: self.len,
            });
        }
        Ok((i / self.chunk_len, i % self.chunk_len))
    }

    /// Bring chunk `ci` into memory, loading it from the store if evicted.
    fn ensure_resident(&self, io: &mut ChunkIo<'_>, ci: usize) -> Result<ChunkAddr, EnvError> {
        let addr = self.addr(ci);
        if io.cache.is_resident(&addr) {
            io.cache.record_hit();
            return Ok(addr);
        }
        let fill = self.fill(ci);
        let bytes = self.chunk_bytes();
        io.cache.make_room(bytes, &mut *io.store)?;

        let data: Vec<T> = if io.cache.is_persisted(&addr) {
            let key = addr.store_key();
            let raw = io
                .store
                .get(&key)?
                .ok_or_else(|| EnvError::Corruption(format!("chunk {key} missing from store")))?;
            let mut data: Vec<T> = cbor_deserialize(&raw)
                .map_err(|e| EnvError::Corruption(format!("chunk {key}: {e}")))?;
            if data.len() < fill {
                return Err(EnvError::Corruption(format!(
                    "chunk {key} holds {} elements, expected {fill}",
                    data.len()
                )));
            }
            data.truncate(fill);
            tracing::trace!(key, fill, "chunk loaded");
            data
        } else if fill == 0 {
            Vec::new()
        } else {
            return Err(EnvError::Corruption(format!(
                "chunk {} was evicted but never written",
                addr.store_key()
            )));
        };
        io.cache.record_load();
        io.cache.insert(addr.clone(), Box::new(data), bytes, false);
        Ok(addr)
    }

    fn chunk_ref<'c>(&self, io: &'c mut ChunkIo<'_>, ci: usize) -> Result<&'c Vec<T>, EnvError> {
        let addr = self.ensure_resident(io, ci)?;
        io.cache.buf::<T>(&addr).ok_or_else(|| self.buffer_mismatch())
    }

    fn chunk_mut<'c>(&self, io: &'c mut ChunkIo<'_>, ci: usize) -> Result<&'c mut Vec<T>, EnvError> {
        let addr = self.ensure_resident(io, ci)?;
        io.cache.mark_dirty(&addr);
        io.cache.buf_mut::<T>(&addr).ok_or_else(|| self.buffer_mismatch())
    }

    fn buffer_mismatch(&self) -> EnvError {
        EnvError::Corruption(format!(
            "resident chunk of {} does not hold {}",
            self.name, self.type_name
        ))
    }

    pub(crate) fn get(&self, io: &mut ChunkIo<'_>, i: u32) -> Result<T, EnvError> {
        let (ci, off) = self.check_index(i)?;
        Ok(self.chunk_ref(io, ci)?[off].clone())
    }

    pub(crate) fn set(&self, io: &mut ChunkIo<'_>, i: u32, value: T) -> Result<(), EnvError> {
        let (ci, off) = self.check_index(i)?;
        self.chunk_mut(io, ci)?[off] = value;
        Ok(())
    }

    pub(crate) fn update<R>(
        &self,
        io: &mut ChunkIo<'_>,
        i: u32,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, EnvError> {
        let (ci, off) = self.check_index(i)?;
        Ok(f(&mut self.chunk_mut(io, ci)?[off]))
    }

    pub(crate) fn push(&mut self, io: &mut ChunkIo<'_>, value: T) -> Result<u32, EnvError> {
        let i = self.len;
        let ci = i / self.chunk_len;
        if i % self.chunk_len == 0 {
            let addr = self.addr(ci);
            // A stale copy of this chunk may survive an earlier shrink.
            if io.cache.forget(&addr) {
                io.store.delete(&addr.store_key())?;
            }
            let bytes = self.chunk_bytes();
            io.cache.make_room(bytes, &mut *io.store)?;
            io.cache
                .insert(addr, Box::new(Vec::<T>::with_capacity(self.chunk_len)), bytes, true);
        }
        self.chunk_mut(io, ci)?.push(value);
        self.len += 1;
        Ok(i as u32)
    }

    pub(crate) fn to_vec(&self, io: &mut ChunkIo<'_>) -> Result<Vec<T>, EnvError> {
        let mut out = Vec::with_capacity(self.len);
        for ci in 0..self.chunk_count() {
            out.extend_from_slice(self.chunk_ref(io, ci)?);
        }
        Ok(out)
    }

    /// Shrink to `n` elements, dropping trailing chunks and their store keys.
    fn truncate(&mut self, io: &mut ChunkIo<'_>, n: usize) -> Result<(), EnvError> {
        if n >= self.len {
            return Ok(());
        }
        let old_chunks = self.chunk_count();
        let new_chunks = n.div_ceil(self.chunk_len);
        for ci in new_chunks..old_chunks {
            let addr = self.addr(ci);
            if io.cache.forget(&addr) {
                io.store.delete(&addr.store_key())?;
            }
        }
        self.len = n;
        if new_chunks > 0 {
            let last = self.addr(new_chunks - 1);
            let fill = self.fill(new_chunks - 1);
            if let Some(buf) = io.cache.buf_mut::<T>(&last) {
                if buf.len() > fill {
                    buf.truncate(fill);
                    io.cache.mark_dirty(&last);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn resize(&mut self, io: &mut ChunkIo<'_>, n: usize) -> Result<(), EnvError> {
        if n < self.len {
            return self.truncate(io, n);
        }
        while self.len < n {
            self.push(io, T::default())?;
        }
        Ok(())
    }

    /// Remove the `deleted` indices, shifting later elements down.
    pub(crate) fn compact(&mut self, io: &mut ChunkIo<'_>, deleted: &[u32]) -> Result<(), EnvError> {
        let mut sorted: Vec<u32> = deleted
            .iter()
            .copied()
            .filter(|&d| (d as usize) < self.len)
            .collect();
        if sorted.is_empty() {
            return Ok(());
        }
        sorted.sort_unstable();
        sorted.dedup();

        let first = sorted[0];
        let mut next = sorted.iter().peekable();
        let mut w = first;
        for i in first..self.len as u32 {
            if next.peek() == Some(&&i) {
                next.next();
                continue;
            }
            let v = self.get(io, i)?;
            self.set(io, w, v)?;
            w += 1;
        }
        let removed = sorted.len();
        tracing::trace!(chain = %self.name, removed, "chain compacted");
        self.truncate(io, self.len - removed)
    }

    pub(crate) fn load_all(&self, io: &mut ChunkIo<'_>) -> Result<(), EnvError> {
        for ci in 0..self.chunk_count() {
            let addr = self.ensure_resident(io, ci)?;
            io.cache.pin(&addr);
        }
        Ok(())
    }

    pub(crate) fn free_all(&self, io: &mut ChunkIo<'_>) -> Result<(), EnvError> {
        for ci in 0..self.chunk_count() {
            let addr = self.addr(ci);
            if io.cache.is_resident(&addr) && io.cache.unpin(&addr) {
                io.cache.release(&addr, &mut *io.store)?;
            }
        }
        Ok(())
    }

    pub(crate) fn record(&self, cache: &CachePolicy) -> ChainRecord {
        ChainRecord {
            name: self.name.to_string(),
            type_name: self.type_name.clone(),
            len: self.len as u64,
            chunk_len: self.chunk_len as u64,
            chunk_sizes: (0..self.chunk_count())
                .map(|ci| cache.disk_size(&self.addr(ci)))
                .collect(),
        }
    }
}

/// Object-safe view of a chain whose element type is only known by name.
pub(crate) trait AnyChain {
    fn type_name(&self) -> &str;
    fn elem_size(&self) -> usize;
    fn len(&self) -> usize;
    fn chunk_count(&self) -> usize;
    fn record(&self, cache: &CachePolicy) -> ChainRecord;
    fn load_all(&self, io: &mut ChunkIo<'_>) -> Result<(), EnvError>;
    fn free_all(&self, io: &mut ChunkIo<'_>) -> Result<(), EnvError>;
    fn compact(&mut self, io: &mut ChunkIo<'_>, deleted: &[u32]) -> Result<(), EnvError>;
    fn resize(&mut self, io: &mut ChunkIo<'_>, n: usize) -> Result<(), EnvError>;
    fn get_any(&self, io: &mut ChunkIo<'_>, i: u32) -> Result<Box<dyn Any>, EnvError>;
    fn set_any(&mut self, io: &mut ChunkIo<'_>, i: u32, v: Box<dyn Any>) -> Result<(), EnvError>;
    fn push_any(&mut self, io: &mut ChunkIo<'_>, v: Box<dyn Any>) -> Result<u32, EnvError>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Element> Chain<T> {
    fn unbox(&self, v: Box<dyn Any>) -> Result<T, EnvError> {
        v.downcast::<T>().map(|b| *b).map_err(|_| EnvError::TypeMismatch {
            chain: self.name.to_string(),
            expected: self.type_name.clone(),
            found: "value of another type".into(),
        })
    }
}

impl<T: Element> AnyChain for Chain<T> {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn elem_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn chunk_count(&self) -> usize {
        Chain::chunk_count(self)
    }

    fn record(&self, cache: &CachePolicy) -> ChainRecord {
        Chain::record(self, cache)
    }

    fn load_all(&self, io: &mut ChunkIo<'_>) -> Result<(), EnvError> {
        Chain::load_all(self, io)
    }

    fn free_all(&self, io: &mut ChunkIo<'_>) -> Result<(), EnvError> {
        Chain::free_all(self, io)
    }

    fn compact(&mut self, io: &mut ChunkIo<'_>, deleted: &[u32]) -> Result<(), EnvError> {
        Chain::compact(self, io, deleted)
    }

    fn resize(&mut self, io: &mut ChunkIo<'_>, n: usize) -> Result<(), EnvError> {
        Chain::resize(self, io, n)
    }

    fn get_any(&self, io: &mut ChunkIo<'_>, i: u32) -> Result<Box<dyn Any>, EnvError> {
        Ok(Box::new(self.get(io, i)?))
    }

    fn set_any(&mut self, io: &mut ChunkIo<'_>, i: u32, v: Box<dyn Any>) -> Result<(), EnvError> {
        let v = self.unbox(v)?;
        self.set(io, i, v)
    }

    fn push_any(&mut self, io: &mut ChunkIo<'_>, v: Box<dyn Any>) -> Result<u32, EnvError> {
        let v = self.unbox(v)?;
        self.push(io, v)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Typed handle on one chain, borrowed from the environment.
///
/// Any call may load or evict chunks; no reference into chunk memory
/// outlives a call.
pub struct ChainMut<'a, T: Element> {
    pub(crate) chain: &'a mut Chain<T>,
    pub(crate) io: ChunkIo<'a>,
}

impl<T: Element> ChainMut<'_, T> {
    pub fn name(&self) -> &str {
        self.chain.name()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn chunk_len(&self) -> usize {
        self.chain.chunk_len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chain.chunk_count()
    }

    /// Append an element, returning its index.
    pub fn push(&mut self, value: T) -> Result<u32, EnvError> {
        self.chain.push(&mut self.io, value)
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = T>) -> Result<(), EnvError> {
        for v in values {
            self.chain.push(&mut self.io, v)?;
        }
        Ok(())
    }

    pub fn get(&mut self, i: u32) -> Result<T, EnvError> {
        self.chain.get(&mut self.io, i)
    }

    pub fn set(&mut self, i: u32, value: T) -> Result<(), EnvError> {
        self.chain.set(&mut self.io, i, value)
    }

    pub fn update<R>(&mut self, i: u32, f: impl FnOnce(&mut T) -> R) -> Result<R, EnvError> {
        self.chain.update(&mut self.io, i, f)
    }

    /// Shrink by dropping the tail, or grow with default elements.
    pub fn resize(&mut self, n: usize) -> Result<(), EnvError> {
        self.chain.resize(&mut self.io, n)
    }

    /// Remove `deleted` indices; elements above a removed slot shift down.
    pub fn compact(&mut self, deleted: &[u32]) -> Result<(), EnvError> {
        self.chain.compact(&mut self.io, deleted)
    }

    pub fn build_remap(&self, deleted: &[u32]) -> Vec<Option<u32>> {
        build_remap(self.chain.len(), deleted)
    }

    /// Pin every chunk in memory.
    pub fn load_all(&mut self) -> Result<(), EnvError> {
        self.chain.load_all(&mut self.io)
    }

    /// Unpin every chunk and release it, writing dirty chunks back.
    pub fn free_all(&mut self) -> Result<(), EnvError> {
        self.chain.free_all(&mut self.io)
    }

    pub fn to_vec(&mut self) -> Result<Vec<T>, EnvError> {
        self.chain.to_vec(&mut self.io)
    }
}
