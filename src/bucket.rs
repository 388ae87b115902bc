//! Dedup buckets (§3): off-tree blocks holding `(sha1, block, refcount)`
//! triples. A *leaf bucket* carries real reference counts; a *collision
//! bucket* reinterprets `refcount` as the byte offset of the matching
//! entry within another leaf bucket, distinguished at the hleaf layer by
//! `offset == -1` (§4.F).
//!
//! Wire format (§6): `count:16 LE` then entries `{sha1[20], block:48,
//! refcount:32}`.

use crate::codec::{ByteReader, ByteWriter};
use crate::device::BlockAddr;
use crate::error::{Error, Result};

pub const SHA1_LEN: usize = 20;
const HEADER_LEN: usize = 2; // count:16 LE
const ENTRY_LEN: usize = SHA1_LEN + 6 + 4;

pub type Digest = [u8; SHA1_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    pub digest: Digest,
    pub block: BlockAddr,
    /// A reference count in a leaf bucket, or a byte offset into another
    /// leaf bucket when this entry lives in a collision bucket.
    pub refcount: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Bucket {
    pub entries: Vec<BucketEntry>,
}

impl Bucket {
    pub fn init() -> Self {
        Bucket { entries: Vec::new() }
    }

    pub fn capacity(block_size: usize) -> usize {
        (block_size - HEADER_LEN) / ENTRY_LEN
    }

    pub fn is_full(&self, block_size: usize) -> bool {
        self.entries.len() >= Self::capacity(block_size)
    }

    pub fn find(&self, digest: &Digest) -> Option<usize> {
        self.entries.iter().position(|e| &e.digest == digest)
    }

    pub fn push(&mut self, block_size: usize, entry: BucketEntry) -> Result<usize> {
        if self.is_full(block_size) {
            return Err(Error::no_space("dedup bucket is full"));
        }
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }

    pub fn load(buf: &[u8]) -> Result<Self> {
        let r = ByteReader::new(buf);
        let count = r.u16_le(0)? as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = HEADER_LEN + i * ENTRY_LEN;
            let digest: Digest = r.bytes(off, SHA1_LEN)?.try_into().unwrap();
            let block = r.u48_be(off + SHA1_LEN)?;
            let refcount = r.u32_le(off + SHA1_LEN + 6)?;
            entries.push(BucketEntry { digest, block, refcount });
        }
        Ok(Bucket { entries })
    }

    pub fn store(&self, buf: &mut [u8]) -> Result<()> {
        let needed = HEADER_LEN + self.entries.len() * ENTRY_LEN;
        if needed > buf.len() {
            return Err(Error::no_space("bucket contents do not fit in one block"));
        }
        let mut w = ByteWriter::new(buf);
        w.put_u16_le(0, self.entries.len() as u16)?;
        for (i, e) in self.entries.iter().enumerate() {
            let off = HEADER_LEN + i * ENTRY_LEN;
            w.put_bytes(off, &e.digest)?;
            w.put_u48_be(off + SHA1_LEN, e.block)?;
            w.put_u32_le(off + SHA1_LEN + 6, e.refcount)?;
        }
        w.zero(needed, buf.len() - needed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 256;

    fn digest(b: u8) -> Digest {
        [b; SHA1_LEN]
    }

    #[test]
    fn push_find_round_trip() {
        let mut bucket = Bucket::init();
        bucket.push(BLOCK, BucketEntry { digest: digest(1), block: 10, refcount: 1 }).unwrap();
        bucket.push(BLOCK, BucketEntry { digest: digest(2), block: 20, refcount: 3 }).unwrap();
        assert_eq!(bucket.find(&digest(2)), Some(1));

        let mut buf = vec![0u8; BLOCK];
        bucket.store(&mut buf).unwrap();
        let loaded = Bucket::load(&buf).unwrap();
        assert_eq!(loaded.entries, bucket.entries);
    }

    #[test]
    fn push_fails_when_bucket_is_full() {
        let mut bucket = Bucket::init();
        let cap = Bucket::capacity(BLOCK);
        for i in 0..cap {
            bucket.push(BLOCK, BucketEntry { digest: digest(i as u8), block: i as u64, refcount: 1 }).unwrap();
        }
        let err = bucket.push(BLOCK, BucketEntry { digest: digest(255), block: 0, refcount: 1 }).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoSpace);
    }
}
