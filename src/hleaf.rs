//! Hash-index leaf (component F, "hleaf"): an ordered array of
//! `(64-bit key -> bucket, offset)` used by the dedup engine (§3, §4.F).
//!
//! Wire format (§6): magic `0xdade`, `count:32 LE`, then entries
//! `{key:64 LE, block:48, offset:16 signed}` kept in ascending key order
//! so `seek` can do a linear (or, for larger leaves, binary) search for
//! the first entry `>= key`.

use crate::codec::{ByteReader, ByteWriter};
use crate::device::BlockAddr;
use crate::error::{Error, Result};

pub const HLEAF_MAGIC: u16 = 0xdade;
const HEADER_LEN: usize = 2 + 4; // magic + count
const ENTRY_LEN: usize = 8 + 6 + 2; // key + block + offset

/// `offset == -1` marks a collision-bucket redirection rather than a
/// direct leaf-bucket slot (§3).
pub const COLLISION_OFFSET: i16 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HleafEntry {
    pub key: u64,
    pub block: BlockAddr,
    pub offset: i16,
}

impl HleafEntry {
    pub fn is_collision(&self) -> bool {
        self.offset == COLLISION_OFFSET
    }
}

#[derive(Debug, Clone, Default)]
pub struct Hleaf {
    pub entries: Vec<HleafEntry>,
}

impl Hleaf {
    pub fn init() -> Self {
        Hleaf { entries: Vec::new() }
    }

    pub fn sniff(buf: &[u8]) -> bool {
        ByteReader::new(buf).u16_be(0).map(|m| m == HLEAF_MAGIC).unwrap_or(false)
    }

    /// `hleaf_seek(key)`: the first entry with `key' >= key`, if any.
    pub fn seek(&self, key: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.key >= key)
    }

    /// Inserts a new entry, keeping ascending key order. Errors if the
    /// leaf would no longer fit in `block_size` bytes.
    pub fn insert(&mut self, block_size: usize, entry: HleafEntry) -> Result<()> {
        let used = HEADER_LEN + (self.entries.len() + 1) * ENTRY_LEN;
        if used > block_size {
            return Err(Error::no_space("hleaf is full"));
        }
        let pos = self.entries.iter().position(|e| e.key > entry.key).unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
        Ok(())
    }

    pub fn set_at(&mut self, idx: usize, entry: HleafEntry) {
        self.entries[idx] = entry;
    }

    /// Splits at the median entry, moving the upper half to a fresh
    /// leaf. Used by the generic B-tree driver (§4.G); the hleaf format
    /// itself has no upstream split operation in §4.F since the original
    /// dedup index is typically shallow, but the driver needs one leaf
    /// kind to behave like the others.
    pub fn split(&mut self) -> Hleaf {
        let mid = self.entries.len() / 2;
        Hleaf { entries: self.entries.split_off(mid) }
    }

    pub fn load(buf: &[u8]) -> Result<Self> {
        let r = ByteReader::new(buf);
        let magic = r.u16_be(0)?;
        if magic != HLEAF_MAGIC {
            return Err(Error::corruption(format!("hleaf: bad magic {magic:#x}")));
        }
        let count = r.u32_le(2)? as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = HEADER_LEN + i * ENTRY_LEN;
            entries.push(HleafEntry {
                key: {
                    let b = r.bytes(off, 8)?;
                    u64::from_le_bytes(b.try_into().unwrap())
                },
                block: r.u48_be(off + 8)?,
                offset: r.i16_le(off + 14)?,
            });
        }
        Ok(Hleaf { entries })
    }

    pub fn store(&self, buf: &mut [u8]) -> Result<()> {
        let needed = HEADER_LEN + self.entries.len() * ENTRY_LEN;
        if needed > buf.len() {
            return Err(Error::no_space("hleaf contents do not fit in one block"));
        }
        let mut w = ByteWriter::new(buf);
        w.put_u16_be(0, HLEAF_MAGIC)?;
        w.put_u32_le(2, self.entries.len() as u32)?;
        for (i, e) in self.entries.iter().enumerate() {
            let off = HEADER_LEN + i * ENTRY_LEN;
            w.put_bytes(off, &e.key.to_le_bytes())?;
            w.put_u48_be(off + 8, e.block)?;
            w.put_i16_le(off + 14, e.offset)?;
        }
        w.zero(needed, buf.len() - needed)?;
        Ok(())
    }
}
