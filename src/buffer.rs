//! Buffer cache (component B): an in-memory page pool keyed by
//! `(mapping, block-index)`, with LRU eviction and the dirty-state ring
//! that ties a buffer to the delta that last wrote it.
//!
//! The cache's free pool and LRU order are process-wide (§9 "Global
//! mutable state" — modeled as an explicit [`Cache`] value threaded via
//! `Arc`, never a singleton); each [`Mapping`] owns its own dirty lists,
//! per §3. Rather than reusing whole `Buffer` structs from a free list
//! (which would need mutable identity fields under concurrent access),
//! the free pool recycles the block-sized `Vec<u8>` backing a buffer's
//! contents and allocates a fresh `Buffer` around it; this keeps
//! `Buffer::block`/`Buffer::mapping_id` immutable for the object's
//! lifetime, which is what lets callers hold an `Arc<Buffer>` across a
//! `get`/`put` pair without extra synchronization.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::device::{BlockAddr, Device};
use crate::error::{Error, ErrorKind, Result};

/// Fixed bucket count for the block-index hash table (§4.B).
pub const BUFFER_BUCKETS: usize = 999;

fn block_hash(block: BlockAddr) -> usize {
    (block % BUFFER_BUCKETS as u64) as usize
}

/// A buffer's place in the dirty-state ring (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Freed,
    Empty,
    Clean,
    Dirty(u8),
}

impl BufferState {
    pub fn dirty_index(self) -> Option<u8> {
        match self {
            BufferState::Dirty(i) => Some(i),
            _ => None,
        }
    }
}

/// `(mapping, block-index, data, refcount, state)`, per §3.
pub struct Buffer {
    mapping_id: u64,
    block: BlockAddr,
    data: Mutex<Vec<u8>>,
    state: Mutex<BufferState>,
    refcount: AtomicUsize,
}

impl Buffer {
    pub fn block(&self) -> BlockAddr {
        self.block
    }

    pub fn state(&self) -> BufferState {
        *self.state.lock().unwrap()
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock().unwrap())
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock().unwrap())
    }

    fn is_evictable(&self) -> bool {
        matches!(*self.state.lock().unwrap(), BufferState::Clean | BufferState::Empty)
            && self.refcount.load(Ordering::SeqCst) == 0
    }
}

struct CacheInner {
    buckets: Vec<Vec<Arc<Buffer>>>,
    /// Most-recently-used at the front.
    lru: VecDeque<(u64, BlockAddr)>,
    resident: usize,
    free_data: Vec<Vec<u8>>,
}

/// The process-wide free pool and LRU order shared by every mapping.
pub struct Cache {
    pool_size: usize,
    block_size: usize,
    inner: Mutex<CacheInner>,
}

impl Cache {
    /// `init(dev, pool-size)`: allocate the free pool; `pool_size` bounds
    /// total resident buffers across all mappings.
    pub fn new(dev: &Device, pool_size: usize) -> Arc<Self> {
        Arc::new(Cache {
            pool_size,
            block_size: dev.block_size(),
            inner: Mutex::new(CacheInner {
                buckets: (0..BUFFER_BUCKETS).map(|_| Vec::new()).collect(),
                lru: VecDeque::new(),
                resident: 0,
                free_data: Vec::new(),
            }),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn touch_lru(inner: &mut CacheInner, key: (u64, BlockAddr)) {
        if let Some(pos) = inner.lru.iter().position(|&k| k == key) {
            inner.lru.remove(pos);
        }
        inner.lru.push_front(key);
    }

    fn find(inner: &CacheInner, mapping_id: u64, block: BlockAddr) -> Option<Arc<Buffer>> {
        inner.buckets[block_hash(block)]
            .iter()
            .find(|b| b.mapping_id == mapping_id && b.block == block)
            .cloned()
    }

    fn evict_one(inner: &mut CacheInner) -> Option<(u64, BlockAddr)> {
        let pos = inner
            .lru
            .iter()
            .rposition(|&(mid, blk)| Self::find(inner, mid, blk).is_some_and(|b| b.is_evictable()))?;
        let key = inner.lru.remove(pos).unwrap();
        let bucket = &mut inner.buckets[block_hash(key.1)];
        if let Some(idx) = bucket.iter().position(|b| b.mapping_id == key.0 && b.block == key.1) {
            let evicted = bucket.remove(idx);
            inner.resident -= 1;
            inner.free_data.push(evicted.data.into_inner().unwrap());
        }
        Some(key)
    }

    /// Returns the resident buffer for `(mapping_id, block)`, inserting a
    /// fresh `EMPTY` one if absent. The returned buffer carries one
    /// reference the caller must release via [`Mapping::put`] or
    /// [`Mapping::put_dirty`].
    fn get_or_insert(&self, mapping_id: u64, block: BlockAddr) -> Result<Arc<Buffer>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(buf) = Self::find(&inner, mapping_id, block) {
            buf.refcount.fetch_add(1, Ordering::SeqCst);
            Self::touch_lru(&mut inner, (mapping_id, block));
            return Ok(buf);
        }
        if inner.resident >= self.pool_size && Self::evict_one(&mut inner).is_none() {
            return Err(Error::oom(format!(
                "buffer pool exhausted (pool_size={}, resident={})",
                self.pool_size, inner.resident
            )));
        }
        let data = inner.free_data.pop().unwrap_or_else(|| vec![0u8; self.block_size]);
        let buf = Arc::new(Buffer {
            mapping_id,
            block,
            data: Mutex::new(data),
            state: Mutex::new(BufferState::Empty),
            refcount: AtomicUsize::new(1),
        });
        inner.buckets[block_hash(block)].push(buf.clone());
        inner.resident += 1;
        Self::touch_lru(&mut inner, (mapping_id, block));
        trace!("cache: inserted buffer mapping={mapping_id} block={block}");
        Ok(buf)
    }

    fn peek_inner(&self, mapping_id: u64, block: BlockAddr) -> Option<Arc<Buffer>> {
        let mut inner = self.inner.lock().unwrap();
        let found = Self::find(&inner, mapping_id, block)?;
        found.refcount.fetch_add(1, Ordering::SeqCst);
        Self::touch_lru(&mut inner, (mapping_id, block));
        Some(found)
    }
}

/// The per-mapping I/O callback, `io(buffer, write_flag) -> Result<()>`
/// (§6).
pub type MappingIo = Arc<dyn Fn(&Buffer, bool) -> Result<()> + Send + Sync>;

/// A namespace of block-addressed buffers (§3): the volume bitmap, a
/// file's extent map, or the log stream.
pub struct Mapping {
    id: u64,
    cache: Arc<Cache>,
    io: MappingIo,
    /// Dirty lists, one per ring position (`DIRTY+0..3`).
    dirty: Mutex<[Vec<Arc<Buffer>>; 4]>,
}

impl Mapping {
    pub fn new(id: u64, cache: Arc<Cache>, io: MappingIo) -> Arc<Self> {
        Arc::new(Mapping {
            id,
            cache,
            io,
            dirty: Mutex::new([Vec::new(), Vec::new(), Vec::new(), Vec::new()]),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the resident buffer or inserts an `EMPTY` one.
    pub fn get(&self, block: BlockAddr) -> Result<Arc<Buffer>> {
        self.cache.get_or_insert(self.id, block)
    }

    /// Returns a `CLEAN` buffer, invoking the mapping's reader if the
    /// buffer was `EMPTY`. `EMPTY -> CLEAN` only ever happens here (§3).
    pub fn read(&self, block: BlockAddr) -> Result<Arc<Buffer>> {
        let buf = self.get(block)?;
        let needs_read = matches!(buf.state(), BufferState::Empty);
        if needs_read {
            (self.io)(&buf, false)?;
            *buf.state.lock().unwrap() = BufferState::Clean;
        }
        Ok(buf)
    }

    /// Returns the resident buffer for `block`, or `None`; never inserts.
    pub fn peek(&self, block: BlockAddr) -> Option<Arc<Buffer>> {
        self.cache.peek_inner(self.id, block)
    }

    /// Drops a reference acquired via `get`/`read`/`peek`.
    pub fn put(&self, buf: &Arc<Buffer>) {
        buf.refcount.fetch_sub(1, Ordering::SeqCst);
    }

    /// Ensures `buf` is tagged `DIRTY + (delta & 3)` and queued on this
    /// mapping's dirty list for that ring position; idempotent if already
    /// tagged for the same delta. If the buffer was dirty for an older
    /// delta it migrates to the new delta's list (§3: "a buffer tagged
    /// for an older in-flight delta that is written again moves to the
    /// new delta's dirty list").
    pub fn mark_dirty(&self, buf: &Arc<Buffer>, delta: u64) {
        let idx = (delta & 3) as u8;
        let mut state = buf.state.lock().unwrap();
        if *state == BufferState::Dirty(idx) {
            return;
        }
        let old_idx = state.dirty_index();
        *state = BufferState::Dirty(idx);
        drop(state);

        let mut dirty = self.dirty.lock().unwrap();
        if let Some(old) = old_idx {
            let list = &mut dirty[old as usize];
            if let Some(pos) = list.iter().position(|b| Arc::ptr_eq(b, buf)) {
                list.remove(pos);
            }
        }
        let list = &mut dirty[idx as usize];
        if !list.iter().any(|b| Arc::ptr_eq(b, buf)) {
            list.push(buf.clone());
        }
    }

    /// Drops a reference and ensures the buffer is dirty for `delta`.
    pub fn put_dirty(&self, buf: Arc<Buffer>, delta: u64) {
        self.mark_dirty(&buf, delta);
        self.put(&buf);
    }

    /// Returns the buffers currently tagged `DIRTY + ring`.
    pub fn dirty_list(&self, ring: u8) -> Vec<Arc<Buffer>> {
        self.dirty.lock().unwrap()[(ring & 3) as usize].clone()
    }

    /// Writes every buffer tagged `DIRTY + ring` back through the
    /// mapping's `io` callback and transitions it to `CLEAN`, per the
    /// commit engine's `flush_state` (§4.H). A buffer whose write fails
    /// stays dirty and is reported via the returned error, but the pass
    /// continues over the rest of the ring (§9 "Bitmap staging loop").
    pub fn flush_ring(&self, ring: u8) -> Result<()> {
        let idx = (ring & 3) as usize;
        let list = std::mem::take(&mut self.dirty.lock().unwrap()[idx]);
        let mut first_err = None;
        let mut still_dirty = Vec::new();
        for buf in list {
            match (self.io)(&buf, true) {
                Ok(()) => *buf.state.lock().unwrap() = BufferState::Clean,
                Err(e) => {
                    still_dirty.push(buf);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        self.dirty.lock().unwrap()[idx] = still_dirty;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn noop_io() -> MappingIo {
        Arc::new(|_buf: &Buffer, _write: bool| Ok(()))
    }

    fn test_device() -> Device {
        use std::fs::OpenOptions;
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("tux3-core-buffer-{}-{}", std::process::id(), ts));
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path).unwrap();
        file.set_len(64 * 256).unwrap();
        Device::from_file(file, 8).unwrap()
    }

    #[test]
    fn buffer_identity_is_stable_across_get_read_peek() {
        let dev = test_device();
        let cache = Cache::new(&dev, 16);
        let mapping = Mapping::new(1, cache, noop_io());

        let a = mapping.get(5).unwrap();
        let b = mapping.read(5).unwrap();
        let c = mapping.peek(5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        mapping.put(&a);
        mapping.put(&b);
        mapping.put(&c);
    }

    #[test]
    fn mark_dirty_is_idempotent_within_a_delta() {
        let dev = test_device();
        let cache = Cache::new(&dev, 16);
        let mapping = Mapping::new(1, cache, noop_io());
        let buf = mapping.get(1).unwrap();
        mapping.mark_dirty(&buf, 7);
        mapping.mark_dirty(&buf, 7);
        assert_eq!(buf.state(), BufferState::Dirty(3));
        assert_eq!(mapping.dirty_list(3).len(), 1);
    }

    #[test]
    fn mark_dirty_migrates_between_ring_positions() {
        let dev = test_device();
        let cache = Cache::new(&dev, 16);
        let mapping = Mapping::new(1, cache, noop_io());
        let buf = mapping.get(1).unwrap();
        mapping.mark_dirty(&buf, 4); // ring 0
        assert_eq!(mapping.dirty_list(0).len(), 1);
        mapping.mark_dirty(&buf, 5); // ring 1
        assert_eq!(mapping.dirty_list(0).len(), 0);
        assert_eq!(mapping.dirty_list(1).len(), 1);
    }

    #[test]
    fn read_path_transitions_empty_to_clean() {
        let dev = test_device();
        let cache = Cache::new(&dev, 16);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let io: MappingIo = Arc::new(move |_b, _w| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mapping = Mapping::new(1, cache, io);
        let buf = mapping.read(9).unwrap();
        assert_eq!(buf.state(), BufferState::Clean);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // second read must not re-invoke the reader.
        let _ = mapping.read(9).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dirty_buffers_are_never_evicted() {
        let dev = test_device();
        let cache = Cache::new(&dev, 1);
        let mapping = Mapping::new(1, cache, noop_io());
        let buf = mapping.get(1).unwrap();
        mapping.mark_dirty(&buf, 0);
        mapping.put(&buf);
        // pool size 1 is exhausted by the dirty buffer; a second distinct
        // block must fail rather than evict it.
        let err = mapping.get(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Oom);
    }

    #[test]
    fn flush_ring_drains_to_clean() {
        let dev = test_device();
        let cache = Cache::new(&dev, 16);
        let mapping = Mapping::new(1, cache, noop_io());
        let buf = mapping.get(3).unwrap();
        mapping.put_dirty(buf.clone(), 2);
        mapping.flush_ring(2).unwrap();
        assert_eq!(buf.state(), BufferState::Clean);
        assert!(mapping.dirty_list(2).is_empty());
    }
}
