//! Generic B-tree driver (component G): node/leaf traversal, split, and
//! cursor (`probe`), dispatching to a leaf format through the
//! [`LeafOps`] trait rather than the original's function-pointer vtable
//! (§4.G, §9 "Opaque leaf payloads").
//!
//! Internal (branch) nodes are a flat sorted array of `(key, child)`
//! pairs — the spec only calls out the two-ended packed layout for leaf
//! blocks (§9), so branch nodes use the simpler encoding.

use std::sync::Arc;

use log::debug;

use crate::buffer::Mapping;
use crate::codec::{mask48, ByteReader, ByteWriter};
use crate::device::BlockAddr;
use crate::dleaf::Dleaf;
use crate::error::{Error, Result};
use crate::hleaf::Hleaf;
use crate::ileaf::Ileaf;

/// The leaf-format vtable every B-tree leaf kind implements (§9).
pub trait LeafOps: Sized {
    fn new_empty() -> Self;
    fn sniff(buf: &[u8]) -> bool;
    fn load(buf: &[u8]) -> Result<Self>;
    fn store(&self, buf: &mut [u8]) -> Result<()>;
    /// Bytes still free for new content in this leaf.
    fn free_bytes(&self, block_size: usize) -> usize;
    /// Splits the leaf in half, returning the right half and the
    /// smallest key it now owns.
    fn split(&mut self) -> (Self, u64);
}

impl LeafOps for Dleaf {
    fn new_empty() -> Self {
        Dleaf::init()
    }
    fn sniff(buf: &[u8]) -> bool {
        Dleaf::sniff(buf)
    }
    fn load(buf: &[u8]) -> Result<Self> {
        Dleaf::load(buf)
    }
    fn store(&self, buf: &mut [u8]) -> Result<()> {
        Dleaf::store(self, buf)
    }
    fn free_bytes(&self, block_size: usize) -> usize {
        let (free, used) = self.free_used(block_size);
        used.saturating_sub(free)
    }
    fn split(&mut self) -> (Self, u64) {
        let right = Dleaf::split(self);
        let key = right
            .groups
            .first()
            .map(|g| ((g.keyhi as u64) << 24) | g.entries[0].keylo as u64)
            .unwrap_or(0);
        (right, key)
    }
}

impl LeafOps for Ileaf {
    fn new_empty() -> Self {
        Ileaf::init(0)
    }
    fn sniff(buf: &[u8]) -> bool {
        Ileaf::sniff(buf)
    }
    fn load(buf: &[u8]) -> Result<Self> {
        Ileaf::load(buf)
    }
    fn store(&self, buf: &mut [u8]) -> Result<()> {
        Ileaf::store(self, buf)
    }
    fn free_bytes(&self, block_size: usize) -> usize {
        let (free, used) = self.free_used(block_size);
        free.saturating_sub(used)
    }
    fn split(&mut self) -> (Self, u64) {
        let right = Ileaf::split(self);
        let key = right.ibase;
        (right, key)
    }
}

impl LeafOps for Hleaf {
    fn new_empty() -> Self {
        Hleaf::init()
    }
    fn sniff(buf: &[u8]) -> bool {
        Hleaf::sniff(buf)
    }
    fn load(buf: &[u8]) -> Result<Self> {
        Hleaf::load(buf)
    }
    fn store(&self, buf: &mut [u8]) -> Result<()> {
        Hleaf::store(self, buf)
    }
    fn free_bytes(&self, block_size: usize) -> usize {
        block_size.saturating_sub(2 + self.entries.len() * 16)
    }
    fn split(&mut self) -> (Self, u64) {
        let right = Hleaf::split(self);
        let key = right.entries.first().map(|e| e.key).unwrap_or(0);
        (right, key)
    }
}

/// `balloc`/`bfree`, supplied by the caller (the volume bitmap inode is
/// a collaborator, out of scope per §1 — this trait is the boundary the
/// driver consumes it through).
pub trait BlockAllocator: Send + Sync {
    fn balloc(&self, count: u8) -> Result<BlockAddr>;
    fn bfree(&self, block: BlockAddr, count: u8);
}

/// Lets one allocator back several `Btree`s at once (the superblock's
/// inode table and dedup index share the volume bitmap allocator) without
/// requiring `BlockAllocator` impls to be `Clone`.
impl<T: BlockAllocator> BlockAllocator for Arc<T> {
    fn balloc(&self, count: u8) -> Result<BlockAddr> {
        (**self).balloc(count)
    }

    fn bfree(&self, block: BlockAddr, count: u8) {
        (**self).bfree(block, count)
    }
}

const BRANCH_MAGIC: u16 = 0xb4ee;
const BRANCH_HEADER: usize = 4; // magic:u16 + count:u16
const BRANCH_ENTRY: usize = 8 + 6; // key:u64 BE + child:48-bit BE

struct BranchNode {
    entries: Vec<(u64, BlockAddr)>,
}

impl BranchNode {
    fn new() -> Self {
        BranchNode { entries: Vec::new() }
    }

    fn capacity(block_size: usize) -> usize {
        (block_size - BRANCH_HEADER) / BRANCH_ENTRY
    }

    fn load(buf: &[u8]) -> Result<Self> {
        let r = ByteReader::new(buf);
        let magic = r.u16_be(0)?;
        if magic != BRANCH_MAGIC {
            return Err(Error::corruption(format!("branch node: bad magic {magic:#x}")));
        }
        let count = r.u16_be(2)? as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = BRANCH_HEADER + i * BRANCH_ENTRY;
            entries.push((r.u64_be(off)?, r.u48_be(off + 8)?));
        }
        Ok(BranchNode { entries })
    }

    fn store(&self, buf: &mut [u8]) -> Result<()> {
        let needed = BRANCH_HEADER + self.entries.len() * BRANCH_ENTRY;
        if needed > buf.len() {
            return Err(Error::no_space("branch node does not fit in one block"));
        }
        let mut w = ByteWriter::new(buf);
        w.put_u16_be(0, BRANCH_MAGIC)?;
        w.put_u16_be(2, self.entries.len() as u16)?;
        for (i, (key, child)) in self.entries.iter().enumerate() {
            let off = BRANCH_HEADER + i * BRANCH_ENTRY;
            w.put_u64_be(off, *key)?;
            w.put_u48_be(off + 8, mask48(*child))?;
        }
        w.zero(needed, buf.len() - needed)?;
        Ok(())
    }

    /// The child slot responsible for `key`: the last entry whose key is
    /// `<= key`, or the first entry if `key` precedes everything.
    fn child_for(&self, key: u64) -> usize {
        match self.entries.iter().rposition(|&(k, _)| k <= key) {
            Some(i) => i,
            None => 0,
        }
    }

    fn insert(&mut self, block_size: usize, key: u64, child: BlockAddr) -> Result<()> {
        if self.entries.len() >= BranchNode::capacity(block_size) {
            return Err(Error::no_space("branch node is full"));
        }
        let pos = self.entries.iter().position(|&(k, _)| k > key).unwrap_or(self.entries.len());
        self.entries.insert(pos, (key, child));
        Ok(())
    }

    /// Splits at the median, returning the right half and its smallest
    /// key.
    fn split(&mut self) -> (BranchNode, u64) {
        let mid = self.entries.len() / 2;
        let right_entries = self.entries.split_off(mid);
        let key = right_entries[0].0;
        (BranchNode { entries: right_entries }, key)
    }
}

/// `(root = {block, depth}, sb, ops)` (§4.G). `depth == 0` means the
/// root block is itself a leaf.
pub struct Root {
    pub block: BlockAddr,
    pub depth: u32,
}

/// One (branch block, child slot) per level from root to leaf, per
/// `probe` (§4.G).
pub struct Cursor {
    pub path: Vec<(BlockAddr, usize)>,
    pub leaf_block: BlockAddr,
}

pub struct Btree<A: BlockAllocator> {
    pub root: Root,
    mapping: Arc<Mapping>,
    block_size: usize,
    alloc: A,
}

impl<A: BlockAllocator> Btree<A> {
    pub fn new(root: Root, mapping: Arc<Mapping>, block_size: usize, alloc: A) -> Self {
        Btree { root, mapping, block_size, alloc }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    pub fn alloc(&self) -> &A {
        &self.alloc
    }

    /// `probe`: walks from root to leaf, recording one `(buffer, slot)`
    /// per level.
    pub fn probe(&self, key: u64) -> Result<Cursor> {
        if self.root.depth == 0 {
            return Ok(Cursor { path: Vec::new(), leaf_block: self.root.block });
        }
        let mut path = Vec::with_capacity(self.root.depth as usize);
        let mut block = self.root.block;
        for _ in 0..self.root.depth {
            let buf = self.mapping.read(block)?;
            let node = buf.with_data(BranchNode::load)?;
            self.mapping.put(&buf);
            let slot = node.child_for(key);
            path.push((block, slot));
            block = node.entries[slot].1;
        }
        Ok(Cursor { path, leaf_block: block })
    }

    /// Loads the leaf at the cursor's current position.
    pub fn load_leaf<L: LeafOps>(&self, cursor: &Cursor) -> Result<L> {
        let buf = self.mapping.read(cursor.leaf_block)?;
        let leaf = buf.with_data(L::load)?;
        self.mapping.put(&buf);
        Ok(leaf)
    }

    pub fn store_leaf<L: LeafOps>(&self, block: BlockAddr, leaf: &L, delta: u64) -> Result<()> {
        let buf = self.mapping.get(block)?;
        buf.with_data_mut(|d| leaf.store(d))?;
        self.mapping.put_dirty(buf, delta);
        Ok(())
    }

    /// `tree_expand(key, bytes, cursor)`: ensures the leaf the cursor
    /// points at has room for `bytes` more content, splitting it (and
    /// ancestors, including growing a new root) as needed. All touched
    /// buffers are marked dirty for `delta`. Returns a cursor pointing
    /// at the leaf that should receive the caller's insert.
    pub fn tree_expand<L: LeafOps>(&mut self, key: u64, bytes: usize, mut cursor: Cursor, delta: u64) -> Result<Cursor> {
        loop {
            let mut left: L = self.load_leaf(&cursor)?;
            if left.free_bytes(self.block_size) >= bytes {
                return Ok(cursor);
            }
            let (right, split_key) = left.split();
            let right_block = self.alloc.balloc(1)?;
            self.store_leaf(cursor.leaf_block, &left, delta)?;
            self.store_leaf(right_block, &right, delta)?;
            debug!("btree: split leaf {} -> {} at key {split_key}", cursor.leaf_block, right_block);

            self.insert_into_ancestors(&mut cursor, split_key, right_block, delta)?;
            if key >= split_key {
                cursor.leaf_block = right_block;
            }
        }
    }

    /// Inserts `(split_key, right_block)` into the parent at the top of
    /// `cursor.path`, splitting that branch node (and recursing upward)
    /// if it has no room, or growing a new root if the path is empty.
    fn insert_into_ancestors(&mut self, cursor: &mut Cursor, mut split_key: u64, mut right_block: BlockAddr, delta: u64) -> Result<()> {
        loop {
            match cursor.path.pop() {
                Some((branch_block, _slot)) => {
                    let buf = self.mapping.read(branch_block)?;
                    let mut node = buf.with_data(BranchNode::load)?;
                    self.mapping.put(&buf);
                    if node.insert(self.block_size, split_key, right_block).is_ok() {
                        let buf = self.mapping.get(branch_block)?;
                        buf.with_data_mut(|d| node.store(d))?;
                        self.mapping.put_dirty(buf, delta);
                        return Ok(());
                    }
                    // branch node full: split it too, then keep climbing.
                    let (right_node, promoted_key) = node.split();
                    let new_branch = self.alloc.balloc(1)?;
                    let buf = self.mapping.get(branch_block)?;
                    buf.with_data_mut(|d| node.store(d))?;
                    self.mapping.put_dirty(buf, delta);
                    let target = if split_key >= promoted_key { new_branch } else { branch_block };
                    let buf = self.mapping.get(new_branch)?;
                    buf.with_data_mut(|d| right_node.store(d))?;
                    self.mapping.put_dirty(buf, delta);
                    // insert the original (split_key, right_block) into whichever half now owns it.
                    let insert_block = target;
                    let buf = self.mapping.read(insert_block)?;
                    let mut target_node = buf.with_data(BranchNode::load)?;
                    self.mapping.put(&buf);
                    target_node.insert(self.block_size, split_key, right_block).ok();
                    let buf = self.mapping.get(insert_block)?;
                    buf.with_data_mut(|d| target_node.store(d))?;
                    self.mapping.put_dirty(buf, delta);

                    split_key = promoted_key;
                    right_block = new_branch;
                    // continue climbing with the promoted key/child
                }
                None => {
                    let new_root = self.alloc.balloc(1)?;
                    let mut node = BranchNode::new();
                    node.entries.push((0, self.root.block));
                    node.insert(self.block_size, split_key, right_block).map_err(|_| {
                        Error::corruption("btree: new root overflowed immediately after creation")
                    })?;
                    let buf = self.mapping.get(new_root)?;
                    buf.with_data_mut(|d| node.store(d))?;
                    self.mapping.put_dirty(buf, delta);
                    self.root.block = new_root;
                    self.root.depth += 1;
                    return Ok(());
                }
            }
        }
    }
}
