//! Superblock context (§3 "Superblock state (sb)"): the process-wide
//! volume state every other component hangs off — the device, the
//! current delta counter, the volume bitmap, the write-ahead log, the
//! inode-table B-tree, and (optional) the dedup index.
//!
//! Grounded on `original_source/user/commit.c`'s pervasive `struct sb *sb`
//! parameter (`sb->delta`, `sb->volblocks`, `sb->lognext`, the
//! `delta_lock` rwlock): this module is where those scattered fields live
//! together, wired up to the Rust types the rest of the crate defines.
//! `commit.c`'s `main()` also formats its scratch device before running
//! its delta loop; [`Superblock::format`] plays that role here, while
//! [`Superblock::open`] is what a later mount of an already-formatted
//! volume would call (§1: formatting itself is an external collaborator,
//! not part of this crate, so `format` only bootstraps the in-memory
//! structures this crate owns).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bitmap::{Bitmap, BitmapAllocator};
use crate::btree::{Btree, Root};
use crate::bucket::Digest;
use crate::buffer::{Buffer, Cache, Mapping, MappingIo};
use crate::commit::{CommitEngine, DeltaGuard};
use crate::config::EngineConfig;
use crate::dedup::{Dedup, DedupHints, Lookup};
use crate::device::{BlockAddr, Device};
use crate::error::{Error, Result};
use crate::hleaf::Hleaf;
use crate::ileaf::Ileaf;
use crate::log::{DeferredFreeList, Log};

/// Fixed mapping ids for this crate's well-known streams (§3). A
/// filesystem layer above this crate would look these up from its own
/// on-disk superblock record; this crate's scope stops at "core" (§1), so
/// `open`/`format` simply assign them.
pub const MAPPING_BITMAP: u64 = 0;
pub const MAPPING_LOG: u64 = 1;
pub const MAPPING_INODES: u64 = 2;
pub const MAPPING_DEDUP: u64 = 3;

fn direct_io(dev: Arc<Device>) -> MappingIo {
    Arc::new(move |buf: &Buffer, write: bool| {
        if write {
            buf.with_data(|d| dev.write_block(buf.block(), d))
        } else {
            buf.with_data_mut(|d| dev.read_block(buf.block(), d))
        }
    })
}

/// Where the volume's well-known structures start (§3): the bitmap and
/// log each own a fixed block range, and the inode table and (optional)
/// dedup index each start life as a single empty leaf at their own root
/// block.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Total addressable blocks the volume bitmap covers.
    pub volume_blocks: u64,
    /// First log block index `Log::lognext` hands out. The log grows by
    /// incrementing this counter directly rather than drawing from the
    /// volume bitmap (§4.C: the log owns a fixed region of the device, as
    /// in the original), so the caller must leave enough room after
    /// `log_start` that ordinary block allocation — which starts
    /// searching from the low end of the bitmap — does not catch up to
    /// it before the next commit retires old log blocks.
    pub log_start: BlockAddr,
    /// Root block of the inode-table B-tree.
    pub inode_table_root: BlockAddr,
    /// Root block of the dedup hleaf B-tree, or `None` to run without
    /// dedup (§4.I is an optional layer over the core write path).
    pub dedup_root: Option<BlockAddr>,
}

/// Process-wide volume context (§3). One instance per open volume.
pub struct Superblock {
    device: Arc<Device>,
    cache: Arc<Cache>,
    config: EngineConfig,
    delta: Arc<AtomicU64>,
    bitmap: Arc<Bitmap>,
    alloc: Arc<BitmapAllocator>,
    log: Arc<Log>,
    inodes: Btree<Arc<BitmapAllocator>>,
    dedup: Option<Dedup<Arc<BitmapAllocator>>>,
    deferred: Arc<DeferredFreeList>,
    commit: CommitEngine,
}

impl Superblock {
    fn assemble(device: Arc<Device>, config: EngineConfig, layout: Layout) -> Result<Self> {
        let cache = Cache::new(&device, config.pool_size);
        let delta = Arc::new(AtomicU64::new(0));

        let bitmap_mapping = Mapping::new(MAPPING_BITMAP, cache.clone(), direct_io(device.clone()));
        let bitmap = Arc::new(Bitmap::new(bitmap_mapping.clone(), device.block_size(), layout.volume_blocks));
        let alloc = Arc::new(BitmapAllocator::new(bitmap.clone(), delta.clone()));

        let log_mapping = Mapping::new(MAPPING_LOG, cache.clone(), direct_io(device.clone()));
        let log = Arc::new(Log::new(log_mapping, device.block_size(), layout.log_start));

        let inode_mapping = Mapping::new(MAPPING_INODES, cache.clone(), direct_io(device.clone()));
        let mut data_mappings = vec![inode_mapping.clone()];
        let inodes = Btree::new(
            Root { block: layout.inode_table_root, depth: 0 },
            inode_mapping,
            device.block_size(),
            alloc.clone(),
        );

        let dedup = match layout.dedup_root {
            Some(root) => {
                let dedup_mapping = Mapping::new(MAPPING_DEDUP, cache.clone(), direct_io(device.clone()));
                data_mappings.push(dedup_mapping.clone());
                let tree = Btree::new(Root { block: root, depth: 0 }, dedup_mapping.clone(), device.block_size(), alloc.clone());
                Some(Dedup::new(tree, dedup_mapping))
            }
            None => None,
        };

        let deferred = Arc::new(DeferredFreeList::new());
        let bfree_alloc = alloc.clone();
        let commit = CommitEngine::new(
            delta.clone(),
            config.need_delta_interval,
            log.clone(),
            bitmap_mapping,
            data_mappings,
            deferred.clone(),
            Arc::new(move |block, count| bfree_alloc.bfree(block, count)),
        );

        Ok(Superblock { device, cache, config, delta, bitmap, alloc, log, inodes, dedup, deferred, commit })
    }

    /// Bootstraps a brand-new volume: zeroes the bitmap block(s), writes
    /// an empty inode-table leaf at `layout.inode_table_root`, and (if
    /// requested) an empty hleaf at `layout.dedup_root`. Mirrors the setup
    /// `original_source/user/commit.c`'s `main()` does on its scratch
    /// device before exercising the delta loop.
    pub fn format(device: Arc<Device>, config: EngineConfig, layout: Layout) -> Result<Self> {
        let sb = Self::assemble(device, config, layout)?;

        let bpb = sb.bitmap.bits_per_block() as u64;
        for bi in 0..(layout.volume_blocks + bpb - 1) / bpb {
            let buf = sb.bitmap.mapping().get(bi)?;
            buf.with_data_mut(|d| d.fill(0));
            sb.bitmap.mapping().put_dirty(buf, 0);
        }

        let inode_buf = sb.inodes.mapping().get(layout.inode_table_root)?;
        inode_buf.with_data_mut(|d| Ileaf::init(0).store(d))?;
        sb.inodes.mapping().put_dirty(inode_buf, 0);

        if let Some(dedup) = &sb.dedup {
            let buf = dedup.mapping().get(dedup.root_block())?;
            buf.with_data_mut(|d| Hleaf::init().store(d))?;
            dedup.mapping().put_dirty(buf, 0);
        }

        // reserve the fixed metadata blocks (the bitmap's own block, the
        // log's start, the inode table root, and the dedup root) so
        // `alloc_block` never hands one of them back out as free space.
        sb.bitmap.apply(0, 1, true)?;
        sb.bitmap.apply(layout.log_start, 1, true)?;
        sb.bitmap.apply(layout.inode_table_root, 1, true)?;
        if let Some(dedup_root) = layout.dedup_root {
            sb.bitmap.apply(dedup_root, 1, true)?;
        }

        Ok(sb)
    }

    /// Wires up an already-formatted volume without touching its on-disk
    /// contents.
    pub fn open(device: Arc<Device>, config: EngineConfig, layout: Layout) -> Result<Self> {
        Self::assemble(device, config, layout)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bitmap(&self) -> &Arc<Bitmap> {
        &self.bitmap
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn delta(&self) -> u64 {
        self.delta.load(Ordering::SeqCst)
    }

    pub fn deferred_free_count(&self) -> usize {
        self.deferred.len()
    }

    /// `change_begin`: see [`CommitEngine::change_begin`].
    pub fn change_begin(&self) -> DeltaGuard<'_> {
        self.commit.change_begin()
    }

    /// `change_end`: see [`CommitEngine::change_end`].
    pub fn change_end(&self, guard: DeltaGuard<'_>) -> Result<()> {
        self.commit.change_end(guard)
    }

    /// `balloc`: allocates `count` blocks from the volume bitmap, tagged
    /// to the currently open delta.
    pub fn alloc_block(&self, count: u8) -> Result<BlockAddr> {
        self.alloc.balloc(count)
    }

    /// `bfree`: queues `(block, count)` on the deferred-free list rather
    /// than clearing the bitmap immediately — the blocks may still be
    /// visible through the prior, not-yet-committed delta's view of the
    /// volume until commit retires the list (§4.C "Deferred free list").
    pub fn free_block(&self, block: BlockAddr, count: u8) {
        self.deferred.push(block, count);
    }

    /// `read_inode(inum)`: the attribute blob for `inum`, if present
    /// (§4.E).
    pub fn read_inode(&self, inum: u64) -> Result<Option<Vec<u8>>> {
        let cursor = self.inodes.probe(inum)?;
        let leaf: Ileaf = self.inodes.load_leaf(&cursor)?;
        Ok(leaf.lookup(inum).map(<[u8]>::to_vec))
    }

    /// `write_inode(inum, data)`: resizes and writes the attribute blob
    /// for `inum`, splitting the inode-table leaf (and its ancestors) if
    /// it has no room (§4.E/§4.G).
    pub fn write_inode(&mut self, inum: u64, data: &[u8]) -> Result<()> {
        let delta = self.delta();
        let cursor = self.inodes.probe(inum)?;
        let cursor = self.inodes.tree_expand::<Ileaf>(inum, data.len() + 2, cursor, delta)?;
        let mut leaf: Ileaf = self.inodes.load_leaf(&cursor)?;
        leaf.resize(self.inodes.block_size(), inum, data.len())?;
        leaf.write(inum, data)?;
        self.inodes.store_leaf(cursor.leaf_block, &leaf, delta)
    }

    /// `purge_inode(inum)`: frees the attribute blob, leaving the inode
    /// number available for reuse.
    pub fn purge_inode(&mut self, inum: u64) -> Result<()> {
        let delta = self.delta();
        let cursor = self.inodes.probe(inum)?;
        let mut leaf: Ileaf = self.inodes.load_leaf(&cursor)?;
        leaf.purge(inum)?;
        self.inodes.store_leaf(cursor.leaf_block, &leaf, delta)
    }

    /// `find_empty_inode(goal)`: the smallest unused inode number `>=
    /// goal`, searching only the leaf that would hold it.
    pub fn find_empty_inode(&self, goal: u64) -> Result<u64> {
        let cursor = self.inodes.probe(goal)?;
        let leaf: Ileaf = self.inodes.load_leaf(&cursor)?;
        Ok(leaf.find_empty_inode(goal))
    }

    /// `dedup_lookup`: see [`Dedup::lookup`]. Errors with
    /// `ErrorKind::NotFound` if this volume was opened without a dedup
    /// index.
    pub fn dedup_lookup(&mut self, digest: &Digest, hints: &mut DedupHints) -> Result<Lookup> {
        let delta = self.delta();
        match &mut self.dedup {
            Some(dedup) => dedup.lookup(digest, hints, delta),
            None => Err(Error::not_found("volume was opened without a dedup index")),
        }
    }

    /// `dedup_record_write`: see [`Dedup::record_write`].
    pub fn dedup_record_write(&mut self, digest: &Digest, data_block: BlockAddr, hints: &mut DedupHints) -> Result<()> {
        let delta = self.delta();
        match &mut self.dedup {
            Some(dedup) => dedup.record_write(digest, data_block, hints, delta),
            None => Err(Error::not_found("volume was opened without a dedup index")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device(blocks: u64, bits: u32) -> Arc<Device> {
        use std::fs::OpenOptions;
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("tux3-core-sb-{}-{}", std::process::id(), ts));
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path).unwrap();
        file.set_len(blocks << bits).unwrap();
        Arc::new(Device::from_file(file, bits).unwrap())
    }

    fn small_layout() -> Layout {
        Layout { volume_blocks: 2048, log_start: 16, inode_table_root: 17, dedup_root: Some(18) }
    }

    fn test_config() -> EngineConfig {
        EngineConfig { pool_size: 256, block_bits: 8, need_delta_interval: 1, ..EngineConfig::default() }
    }

    #[test]
    fn write_read_and_purge_an_inode_round_trips() {
        let dev = test_device(64, 8);
        let mut sb = Superblock::format(dev, test_config(), small_layout()).unwrap();

        sb.write_inode(5, b"hello").unwrap();
        assert_eq!(sb.read_inode(5).unwrap(), Some(b"hello".to_vec()));

        sb.purge_inode(5).unwrap();
        assert_eq!(sb.read_inode(5).unwrap(), None);
    }

    #[test]
    fn find_empty_inode_skips_occupied_slots() {
        let dev = test_device(64, 8);
        let mut sb = Superblock::format(dev, test_config(), small_layout()).unwrap();
        sb.write_inode(0, b"a").unwrap();
        sb.write_inode(1, b"b").unwrap();
        assert_eq!(sb.find_empty_inode(0).unwrap(), 2);
    }

    #[test]
    fn alloc_and_deferred_free_round_trip_through_a_commit() {
        let dev = test_device(64, 8);
        let sb = Superblock::format(dev, test_config(), small_layout()).unwrap();

        let g = sb.change_begin();
        let block = sb.alloc_block(1).unwrap();
        sb.free_block(block, 1);
        assert_eq!(sb.deferred_free_count(), 1);
        sb.change_end(g).unwrap();

        assert_eq!(sb.deferred_free_count(), 0, "commit should retire the deferred free list");
        assert_eq!(sb.delta(), 1);

        // the freed block must be reusable.
        let reused = sb.alloc_block(1).unwrap();
        assert_eq!(reused, block);
    }

    #[test]
    fn dedup_hit_through_the_superblock_wrapper() {
        let dev = test_device(64, 8);
        let mut sb = Superblock::format(dev, test_config(), small_layout()).unwrap();
        let mut hints = DedupHints::default();
        let digest = crate::dedup::hash_block(b"some file content");

        match sb.dedup_lookup(&digest, &mut hints).unwrap() {
            Lookup::Fresh => {
                let block = sb.alloc_block(1).unwrap();
                sb.dedup_record_write(&digest, block, &mut hints).unwrap();
            }
            Lookup::Found(_) => panic!("first write must be fresh"),
        }

        let again = sb.dedup_lookup(&digest, &mut hints).unwrap();
        assert!(matches!(again, Lookup::Found(_)));
    }

    #[test]
    fn dedup_lookup_without_an_index_reports_not_found() {
        let dev = test_device(64, 8);
        let mut layout = small_layout();
        layout.dedup_root = None;
        let mut sb = Superblock::format(dev, test_config(), layout).unwrap();
        let mut hints = DedupHints::default();
        let digest = crate::dedup::hash_block(b"x");
        let err = sb.dedup_lookup(&digest, &mut hints).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
