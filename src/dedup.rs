//! Dedup engine (component I): Sha-1 content lookup -> bucket -> B-tree,
//! with out-of-line collision-bucket handling (§3, §4.F, §4.I).
//!
//! Sourced from the original `hash_lookup`/`htree_lookup`/`handle_collision`
//! algorithm (see `original_source/user/kernel/dedup.c`), restructured into
//! two calls the caller makes around its own write: [`Dedup::lookup`]
//! decides whether `digest` is already stored, and — only when it isn't —
//! [`Dedup::record_write`] records the block the caller just wrote to.
//! Splitting it this way avoids the original's conflation of "the write
//! bucket's own block number" with "the new content's destination block",
//! which the source never actually resolves (its fresh-insert path sets
//! the hleaf entry's `block` field to the write bucket address and never
//! records a matching bucket entry for the new content).

use std::sync::Arc;

use sha1::{Digest as _, Sha1};

use crate::btree::{BlockAllocator, Btree, Cursor};
use crate::bucket::{Bucket, BucketEntry, Digest, SHA1_LEN};
use crate::buffer::Mapping;
use crate::device::BlockAddr;
use crate::error::Result;
use crate::hleaf::{Hleaf, HleafEntry, COLLISION_OFFSET};

/// Computes the content fingerprint used as a dedup key.
pub fn hash_block(data: &[u8]) -> Digest {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut digest = [0u8; SHA1_LEN];
    digest.copy_from_slice(&out);
    digest
}

/// Per-inode dedup shortcuts (§3 "Reference bucket / write bucket"): the
/// last bucket a hit landed in, and the bucket currently accumulating new
/// entries. The filesystem layer above this crate owns the inode and
/// threads this value through; the engine only ever reads and updates it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupHints {
    pub reference_bucket: Option<BlockAddr>,
    pub write_bucket: Option<BlockAddr>,
}

/// Outcome of [`Dedup::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The content is already stored at this block; its refcount has been
    /// bumped by one.
    Found(BlockAddr),
    /// Not seen before. The caller must write the content to a block of
    /// its own choosing and then call [`Dedup::record_write`].
    Fresh,
}

/// Sha-1 lookup -> bucket -> B-tree dedup index (§4.F/§4.I), generic over
/// the allocator the hleaf tree and its buckets draw blocks from.
pub struct Dedup<A: BlockAllocator> {
    tree: Btree<A>,
    mapping: Arc<Mapping>,
}

impl<A: BlockAllocator> Dedup<A> {
    pub fn new(tree: Btree<A>, mapping: Arc<Mapping>) -> Self {
        Dedup { tree, mapping }
    }

    pub fn root_block(&self) -> BlockAddr {
        self.tree.root.block
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    fn block_size(&self) -> usize {
        self.tree.block_size()
    }

    fn load_bucket(&self, block: BlockAddr) -> Result<Bucket> {
        let buf = self.mapping.read(block)?;
        let bucket = buf.with_data(Bucket::load)?;
        self.mapping.put(&buf);
        Ok(bucket)
    }

    fn store_bucket(&self, block: BlockAddr, bucket: &Bucket, delta: u64) -> Result<()> {
        let buf = self.mapping.get(block)?;
        buf.with_data_mut(|d| bucket.store(d))?;
        self.mapping.put_dirty(buf, delta);
        Ok(())
    }

    /// The write bucket `hints` currently points at, allocating (or
    /// rotating, per §4.F "a write bucket is rotated when its count
    /// reaches entries_per_bucket") a fresh one as needed. Returns the
    /// bucket's block address and its current entry count (the offset a
    /// new entry would land at).
    fn ensure_write_bucket(&self, hints: &mut DedupHints, delta: u64) -> Result<(BlockAddr, u32)> {
        if let Some(block) = hints.write_bucket {
            let bucket = self.load_bucket(block)?;
            if !bucket.is_full(self.block_size()) {
                return Ok((block, bucket.entries.len() as u32));
            }
        }
        let block = self.tree.alloc().balloc(1)?;
        self.store_bucket(block, &Bucket::init(), delta)?;
        hints.write_bucket = Some(block);
        Ok((block, 0))
    }

    fn hleaf_key(digest: &Digest) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }

    fn insert_hleaf_entry(&mut self, cursor: Cursor, entry: HleafEntry) -> Result<()> {
        const HLEAF_ENTRY_BYTES: usize = 16;
        let cursor = self.tree.tree_expand::<Hleaf>(entry.key, HLEAF_ENTRY_BYTES, cursor, 0)?;
        let mut leaf: Hleaf = self.tree.load_leaf(&cursor)?;
        leaf.insert(self.block_size(), entry)?;
        self.tree.store_leaf(cursor.leaf_block, &leaf, 0)
    }

    /// Steps 1-6 of §4.F's dedup write path, minus the final fresh write
    /// (that's the caller's job; see [`Dedup::record_write`]).
    pub fn lookup(&mut self, digest: &Digest, hints: &mut DedupHints, delta: u64) -> Result<Lookup> {
        if let Some(rb) = hints.reference_bucket {
            let mut bucket = self.load_bucket(rb)?;
            if let Some(idx) = bucket.find(digest) {
                bucket.entries[idx].refcount += 1;
                let block = bucket.entries[idx].block;
                self.store_bucket(rb, &bucket, delta)?;
                return Ok(Lookup::Found(block));
            }
        }

        let key = Self::hleaf_key(digest);
        let cursor = self.tree.probe(key)?;
        let leaf: Hleaf = self.tree.load_leaf(&cursor)?;
        let matched = leaf.seek(key).filter(|&i| leaf.entries[i].key == key);

        let Some(idx) = matched else {
            let (wb, count) = self.ensure_write_bucket(hints, delta)?;
            let entry = HleafEntry { key, block: wb, offset: count as i16 };
            self.insert_hleaf_entry(cursor, entry)?;
            return Ok(Lookup::Fresh);
        };

        let entry = leaf.entries[idx];
        if !entry.is_collision() {
            let mut bucket = self.load_bucket(entry.block)?;
            let off = entry.offset as usize;
            if off < bucket.entries.len() && &bucket.entries[off].digest == digest {
                bucket.entries[off].refcount += 1;
                let block = bucket.entries[off].block;
                self.store_bucket(entry.block, &bucket, delta)?;
                hints.reference_bucket = Some(entry.block);
                return Ok(Lookup::Found(block));
            }

            // 8-byte prefix collision: split the slot into a collision
            // bucket holding both the pre-existing entry and a fresh slot
            // for this write (§4.F step 4). The collision entry for the
            // pre-existing digest points back at the *original* bucket
            // (`entry.block`, the hleaf entry's own bucket address) plus
            // its offset within it — not the data block itself — so the
            // later hit path re-derives the data block from
            // `original.entries[off]` (mirrors `handle_collision`'s
            // `tmp_entry->block = temp->block` in the source).
            let existing = bucket.entries[off];
            let original_bucket_block = entry.block;
            let (wb, count) = self.ensure_write_bucket(hints, delta)?;
            let mut collision = Bucket::init();
            collision.push(
                self.block_size(),
                BucketEntry { digest: existing.digest, block: original_bucket_block, refcount: off as u32 },
            )?;
            collision.push(self.block_size(), BucketEntry { digest: *digest, block: wb, refcount: count })?;
            let collision_block = self.tree.alloc().balloc(1)?;
            self.store_bucket(collision_block, &collision, delta)?;

            let mut leaf = leaf;
            leaf.set_at(idx, HleafEntry { key, block: collision_block, offset: COLLISION_OFFSET });
            self.tree.store_leaf(cursor.leaf_block, &leaf, delta)?;
            Ok(Lookup::Fresh)
        } else {
            let mut collision = self.load_bucket(entry.block)?;
            if let Some(ci) = collision.find(digest) {
                let redirect = collision.entries[ci];
                let mut original = self.load_bucket(redirect.block)?;
                let orig_off = redirect.refcount as usize;
                original.entries[orig_off].refcount += 1;
                let block = original.entries[orig_off].block;
                self.store_bucket(redirect.block, &original, delta)?;
                hints.reference_bucket = Some(redirect.block);
                return Ok(Lookup::Found(block));
            }
            let (wb, count) = self.ensure_write_bucket(hints, delta)?;
            collision.push(self.block_size(), BucketEntry { digest: *digest, block: wb, refcount: count })?;
            self.store_bucket(entry.block, &collision, delta)?;
            Ok(Lookup::Fresh)
        }
    }

    /// Records that the caller just wrote `digest`'s content to
    /// `data_block`, appending `{digest, data_block, refcount: 1}` to the
    /// current write bucket. Must be called exactly once after a
    /// [`Lookup::Fresh`] result, with the same `hints`.
    pub fn record_write(&mut self, digest: &Digest, data_block: BlockAddr, hints: &mut DedupHints, delta: u64) -> Result<()> {
        let (wb, _count) = self.ensure_write_bucket(hints, delta)?;
        let mut bucket = self.load_bucket(wb)?;
        bucket.push(self.block_size(), BucketEntry { digest: *digest, block: data_block, refcount: 1 })?;
        self.store_bucket(wb, &bucket, delta)?;
        Ok(())
    }
}
