//! Volume bitmap (§3 "the volume bitmap inode"): one bit per block,
//! packed into the bitmap mapping's blocks, searched for free runs by
//! `balloc` and flipped by `bfree`/replay.
//!
//! This is the collaborator the B-tree driver's [`crate::btree::BlockAllocator`]
//! trait is defined against (§1 places the bitmap's own on-disk format
//! out of scope as an "external collaborator"; what's in scope is the
//! allocation search this crate performs over it).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;

use crate::btree::BlockAllocator;
use crate::buffer::Mapping;
use crate::device::BlockAddr;
use crate::error::{Error, Result};

fn find_free_run(data: &[u8], count: usize) -> Option<usize> {
    let total_bits = data.len() * 8;
    let mut run = 0usize;
    let mut start = 0usize;
    for i in 0..total_bits {
        let bit = (data[i / 8] >> (i % 8)) & 1;
        if bit == 0 {
            if run == 0 {
                start = i;
            }
            run += 1;
            if run == count {
                return Some(start);
            }
        } else {
            run = 0;
        }
    }
    None
}

fn set_bits(data: &mut [u8], start: usize, count: usize, used: bool) {
    for i in start..start + count {
        let byte = &mut data[i / 8];
        let mask = 1u8 << (i % 8);
        if used {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

/// A bit-per-block free map over `total_blocks` blocks, backed by the
/// bitmap mapping (§3).
pub struct Bitmap {
    mapping: Arc<Mapping>,
    block_size: usize,
    total_blocks: u64,
}

impl Bitmap {
    pub fn new(mapping: Arc<Mapping>, block_size: usize, total_blocks: u64) -> Self {
        Bitmap { mapping, block_size, total_blocks }
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    pub fn bits_per_block(&self) -> usize {
        self.block_size * 8
    }

    fn block_count(&self) -> u64 {
        let bpb = self.bits_per_block() as u64;
        (self.total_blocks + bpb - 1) / bpb
    }

    /// Searches for `count` contiguous free bits, marks them used, and
    /// tags the owning buffer dirty for `delta`. Errors with
    /// `ErrorKind::NoSpace` if no run exists (§7: "NoSpace ... caller
    /// failed to reserve").
    pub fn alloc(&self, count: u8, delta: u64) -> Result<BlockAddr> {
        let bpb = self.bits_per_block();
        for bi in 0..self.block_count() {
            let buf = self.mapping.read(bi)?;
            let found = buf.with_data(|data| find_free_run(data, count as usize));
            match found {
                Some(bit_off) => {
                    buf.with_data_mut(|data| set_bits(data, bit_off, count as usize, true));
                    self.mapping.put_dirty(buf, delta);
                    let block = bi * bpb as u64 + bit_off as u64;
                    trace!("bitmap: allocated {count} block(s) at {block}");
                    return Ok(block);
                }
                None => self.mapping.put(&buf),
            }
        }
        Err(Error::no_space(format!("bitmap: no free run of {count} block(s)")))
    }

    /// Clears `count` bits starting at `block`, tagging the owning buffer
    /// dirty for `delta`.
    pub fn free(&self, block: BlockAddr, count: u8, delta: u64) -> Result<()> {
        self.set_range(block, count, false, delta)
    }

    /// Reapplies an `ALLOC`/`FREE` log record's end state directly,
    /// without re-journalling (§4.C replay: "operations describe end
    /// states, not deltas").
    pub fn apply(&self, block: BlockAddr, count: u8, used: bool) -> Result<()> {
        self.set_range(block, count, used, 0)
    }

    fn set_range(&self, block: BlockAddr, count: u8, used: bool, delta: u64) -> Result<()> {
        let bpb = self.bits_per_block() as u64;
        let bi = block / bpb;
        let bit_off = (block % bpb) as usize;
        let buf = self.mapping.read(bi)?;
        buf.with_data_mut(|data| set_bits(data, bit_off, count as usize, used));
        self.mapping.put_dirty(buf, delta);
        Ok(())
    }
}

/// Adapts [`Bitmap`] to the B-tree driver's allocator trait, reading the
/// current delta from a counter shared with the commit engine so
/// allocations during a delta are tagged to it without threading an
/// extra parameter through every call site (§4.G/§4.H boundary).
pub struct BitmapAllocator {
    bitmap: Arc<Bitmap>,
    delta: Arc<AtomicU64>,
}

impl BitmapAllocator {
    pub fn new(bitmap: Arc<Bitmap>, delta: Arc<AtomicU64>) -> Self {
        BitmapAllocator { bitmap, delta }
    }
}

impl BlockAllocator for BitmapAllocator {
    fn balloc(&self, count: u8) -> Result<BlockAddr> {
        self.bitmap.alloc(count, self.delta.load(Ordering::SeqCst))
    }

    fn bfree(&self, block: BlockAddr, count: u8) {
        let _ = self.bitmap.free(block, count, self.delta.load(Ordering::SeqCst));
    }
}
