//! Inode-table leaf (component E, "ileaf"): packed variable-size inode
//! attribute records indexed by inode number (§3, §4.E).
//!
//! Layout: header `{magic, ibase, count, free}`, a size directory of
//! `count` 16-bit sizes immediately following the header, and attribute
//! blobs packed from the top of the block downward. `free` is the low
//! boundary of the attribute region, mirroring dleaf's `used` (§9
//! "Two-ended packed layouts"). Attribute blobs are opaque bytes to this
//! leaf — the TLV decoding lives in the filesystem layer, out of scope
//! here (§4.E).

use crate::codec::{ByteReader, ByteWriter};
use crate::error::{Error, Result};

pub const ILEAF_MAGIC: u16 = 0x90de;
const HEADER_LEN: usize = 2 + 8 + 2 + 2; // magic + ibase + count + free
const SIZE_ENTRY: usize = 2;

/// A parsed ileaf: `ibase` plus one (possibly empty) attribute blob per
/// inode in `[ibase, ibase + size_dir.len())`.
#[derive(Debug, Clone)]
pub struct Ileaf {
    pub ibase: u64,
    /// One entry per inode; `None` means size 0, "absent" (§3).
    pub blobs: Vec<Option<Vec<u8>>>,
}

impl Ileaf {
    pub fn init(ibase: u64) -> Self {
        Ileaf { ibase, blobs: Vec::new() }
    }

    pub fn sniff(buf: &[u8]) -> bool {
        ByteReader::new(buf).u16_be(0).map(|m| m == ILEAF_MAGIC).unwrap_or(false)
    }

    fn attr_bytes(&self) -> usize {
        self.blobs.iter().map(|b| b.as_ref().map_or(0, Vec::len)).sum()
    }

    /// `(free, used-by-size-directory-end)` boundary offsets.
    pub fn free_used(&self, block_size: usize) -> (usize, usize) {
        let used = HEADER_LEN + self.blobs.len() * SIZE_ENTRY;
        let free = block_size - self.attr_bytes();
        (free, used)
    }

    fn index_of(&self, inum: u64) -> Option<usize> {
        if inum < self.ibase {
            return None;
        }
        let i = (inum - self.ibase) as usize;
        if i < self.blobs.len() {
            Some(i)
        } else {
            None
        }
    }

    /// `lookup(inum)`: returns the attribute blob, or `None` if absent or
    /// out of this leaf's range.
    pub fn lookup(&self, inum: u64) -> Option<&[u8]> {
        self.index_of(inum).and_then(|i| self.blobs[i].as_deref())
    }

    /// `resize(inum, new_size)`: grows or shrinks the blob for `inum`,
    /// extending the leaf's inode range if needed. Returns an error if
    /// the new total content would not fit in `block_size` bytes; the
    /// caller is expected to have reserved space via `free_used` first,
    /// matching the no-allocating contract dleaf's `add` also follows.
    pub fn resize(&mut self, block_size: usize, inum: u64, new_size: usize) -> Result<()> {
        if inum < self.ibase {
            return Err(Error::corruption(format!(
                "ileaf resize: inum {inum} below ibase {}",
                self.ibase
            )));
        }
        let i = (inum - self.ibase) as usize;
        if i >= self.blobs.len() {
            self.blobs.resize(i + 1, None);
        }
        let current = self.attr_bytes();
        let old_len = self.blobs[i].as_ref().map_or(0, Vec::len);
        let prospective_attr_bytes = current - old_len + new_size;
        let used = HEADER_LEN + self.blobs.len() * SIZE_ENTRY;
        let free = block_size - prospective_attr_bytes;
        if free < used {
            return Err(Error::no_space(format!(
                "ileaf has no room to resize inode {inum} to {new_size} bytes"
            )));
        }
        self.blobs[i] = if new_size == 0 { None } else { Some(vec![0u8; new_size]) };
        Ok(())
    }

    /// Writes `data` into the (already `resize`d) blob for `inum`.
    pub fn write(&mut self, inum: u64, data: &[u8]) -> Result<()> {
        let i = self
            .index_of(inum)
            .ok_or_else(|| Error::not_found(format!("ileaf: no slot for inode {inum}")))?;
        match &mut self.blobs[i] {
            Some(blob) if blob.len() == data.len() => {
                blob.copy_from_slice(data);
                Ok(())
            }
            _ => Err(Error::corruption(format!(
                "ileaf: inode {inum} not sized for a {}-byte write",
                data.len()
            ))),
        }
    }

    /// `purge(inum)`: sets the size to 0 (compacting happens naturally
    /// since the attribute region is rebuilt on every `store`).
    pub fn purge(&mut self, inum: u64) -> Result<()> {
        let i = self
            .index_of(inum)
            .ok_or_else(|| Error::not_found(format!("ileaf: no slot for inode {inum}")))?;
        self.blobs[i] = None;
        Ok(())
    }

    /// `find_empty_inode(goal)`: the smallest absent inum `>= goal` in
    /// this leaf, or `ibase + count` if none.
    pub fn find_empty_inode(&self, goal: u64) -> u64 {
        let start = goal.max(self.ibase);
        for inum in start..(self.ibase + self.blobs.len() as u64) {
            if self.lookup(inum).is_none() {
                return inum;
            }
        }
        self.ibase + self.blobs.len() as u64
    }

    /// Splits by attribute-byte count: moves the upper half of inodes
    /// (and their size-directory slots) to a fresh leaf, updating
    /// `ibase` on the right.
    pub fn split(&mut self) -> Ileaf {
        let mut acc = 0usize;
        let total = self.attr_bytes();
        let half = total / 2;
        let mut cut = self.blobs.len();
        for (i, b) in self.blobs.iter().enumerate() {
            acc += b.as_ref().map_or(0, Vec::len);
            if acc > half {
                cut = i;
                break;
            }
        }
        let right_blobs = self.blobs.split_off(cut);
        Ileaf { ibase: self.ibase + cut as u64, blobs: right_blobs }
    }

    /// Inverse of `split`, when capacity permits: appends `other`'s
    /// inodes (which must immediately follow this leaf's range).
    pub fn merge(&mut self, block_size: usize, other: Ileaf) -> Result<()> {
        if other.ibase != self.ibase + self.blobs.len() as u64 {
            return Err(Error::corruption(
                "ileaf merge: right leaf's ibase does not follow the left leaf",
            ));
        }
        let merged_attr = self.attr_bytes() + other.attr_bytes();
        let merged_used = HEADER_LEN + (self.blobs.len() + other.blobs.len()) * SIZE_ENTRY;
        if block_size < merged_attr + merged_used - HEADER_LEN {
            return Err(Error::no_space("ileaf merge would not fit in one block"));
        }
        self.blobs.extend(other.blobs);
        Ok(())
    }

    pub fn load(buf: &[u8]) -> Result<Self> {
        let r = ByteReader::new(buf);
        let magic = r.u16_be(0)?;
        if magic != ILEAF_MAGIC {
            return Err(Error::corruption(format!("ileaf: bad magic {magic:#x}")));
        }
        let ibase = r.u64_be(2)?;
        let count = r.u16_be(10)? as usize;
        let mut blobs = Vec::with_capacity(count);
        let mut top = buf.len();
        for i in 0..count {
            let size = r.u16_be(HEADER_LEN + i * SIZE_ENTRY)? as usize;
            if size == 0 {
                blobs.push(None);
                continue;
            }
            top -= size;
            blobs.push(Some(r.bytes(top, size)?.to_vec()));
        }
        Ok(Ileaf { ibase, blobs })
    }

    pub fn store(&self, buf: &mut [u8]) -> Result<()> {
        let block_size = buf.len();
        let (free, used) = self.free_used(block_size);
        if free < used {
            return Err(Error::no_space("ileaf contents do not fit in one block"));
        }
        let mut w = ByteWriter::new(buf);
        w.put_u16_be(0, ILEAF_MAGIC)?;
        w.put_u64_be(2, self.ibase)?;
        w.put_u16_be(10, self.blobs.len() as u16)?;
        let mut top = block_size;
        for (i, blob) in self.blobs.iter().enumerate() {
            let size = blob.as_ref().map_or(0, Vec::len);
            w.put_u16_be(HEADER_LEN + i * SIZE_ENTRY, size as u16)?;
            if size > 0 {
                top -= size;
                w.put_bytes(top, blob.as_ref().unwrap())?;
            }
        }
        w.put_u16_be(12, free as u16)?;
        if used < free {
            w.zero(used, free - used)?;
        }
        Ok(())
    }
}
