//! Block device abstraction (component A): positional read/write of
//! fixed-size blocks over a raw file descriptor.
//!
//! Everything above this layer — mappings, the buffer cache, the log
//! stream, the B-tree leaves — only ever asks for whole blocks by
//! address, never for raw byte ranges, so this is the single place
//! `pread`/`pwrite` appear in the crate.

use std::fs::{File, OpenOptions};
use std::path::Path;

use log::{debug, trace};
use rustix::fs::{pread, pwrite};

use crate::codec::mask48;
use crate::error::{Error, Result};

/// A 48-bit block address.
pub type BlockAddr = u64;

/// Positional block I/O over an opaque file handle, per §3 ("Block
/// address — 48-bit unsigned integer naming a fixed-size region on the
/// device; block size is `1 << dev.bits` bytes").
pub struct Device {
    file: File,
    bits: u32,
}

impl Device {
    /// Block size in bytes, `1 << bits`, constrained to the §3 range of
    /// 256 B to 64 KiB (`bits` in `8..=16`).
    pub fn open(path: impl AsRef<Path>, bits: u32) -> Result<Self> {
        if !(8..=16).contains(&bits) {
            return Err(Error::corruption(format!(
                "block size bits out of range: {bits} (want 8..=16)"
            )));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Device { file, bits })
    }

    /// Wrap an already-open file (used by tests and by callers that manage
    /// their own lifetime for the backing file).
    pub fn from_file(file: File, bits: u32) -> Result<Self> {
        if !(8..=16).contains(&bits) {
            return Err(Error::corruption(format!(
                "block size bits out of range: {bits} (want 8..=16)"
            )));
        }
        Ok(Device { file, bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn block_size(&self) -> usize {
        1usize << self.bits
    }

    fn byte_offset(&self, block: BlockAddr) -> u64 {
        mask48(block) * self.block_size() as u64
    }

    /// Reads exactly one block into `buf`, which must be `block_size()`
    /// bytes. Maps to `ErrorKind::Io` on failure (§7).
    pub fn read_block(&self, block: BlockAddr, buf: &mut [u8]) -> Result<()> {
        let bs = self.block_size();
        if buf.len() != bs {
            return Err(Error::corruption(format!(
                "read_block buffer is {} bytes, want {bs}",
                buf.len()
            )));
        }
        let off = self.byte_offset(block);
        trace!("read_block {block} at offset {off}");
        let mut pos = 0;
        while pos < buf.len() {
            let n = pread(&self.file, &mut buf[pos..], off + pos as u64)
                .map_err(Error::from)?;
            if n == 0 {
                return Err(Error::io(format!(
                    "short read at block {block}: got {pos} of {bs} bytes"
                )));
            }
            pos += n;
        }
        Ok(())
    }

    /// Writes exactly one block from `buf`, which must be `block_size()`
    /// bytes.
    pub fn write_block(&self, block: BlockAddr, buf: &[u8]) -> Result<()> {
        let bs = self.block_size();
        if buf.len() != bs {
            return Err(Error::corruption(format!(
                "write_block buffer is {} bytes, want {bs}",
                buf.len()
            )));
        }
        let off = self.byte_offset(block);
        trace!("write_block {block} at offset {off}");
        let mut pos = 0;
        while pos < buf.len() {
            let n = pwrite(&self.file, &buf[pos..], off + pos as u64)
                .map_err(Error::from)?;
            if n == 0 {
                return Err(Error::io(format!("short write at block {block}")));
            }
            pos += n;
        }
        Ok(())
    }

    /// Grows the backing file to hold `nblocks` blocks, zero-filling the
    /// new region. Used by tests and by format/bring-up tooling outside
    /// this crate.
    pub fn set_len_blocks(&self, nblocks: u64) -> Result<()> {
        let bs = self.block_size() as u64;
        debug!("resizing device to {nblocks} blocks ({} bytes)", nblocks * bs);
        self.file.set_len(nblocks * bs).map_err(Error::from)
    }
}
