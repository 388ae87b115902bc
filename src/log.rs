//! Write-ahead log stream (component C): an append-only record journal
//! backed by the log mapping, with variable-length opcodes and
//! idempotent replay.
//!
//! Wire format (§6): block header `{magic: u16 = 0xc0de, bytes: u16 BE}`
//! followed by a packed stream of opcode records, each `tag:u8` plus
//! 48-bit big-endian body fields, via [`crate::codec`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, warn};

use crate::buffer::Mapping;
use crate::codec::{ByteReader, ByteWriter};
use crate::device::BlockAddr;
use crate::error::{Error, Result};

pub const LOG_MAGIC: u16 = 0xc0de;
const HEADER_LEN: usize = 4; // magic:u16 + bytes:u16

const TAG_ALLOC: u8 = 1;
const TAG_FREE: u8 = 2;
const TAG_UPDATE: u8 = 3;
const TAG_ROOT_SWAP: u8 = 4;
const TAG_REDIRECT: u8 = 5;

const LEN_ALLOC: usize = 1 + 1 + 6; // tag + count + block
const LEN_FREE: usize = LEN_ALLOC;
const LEN_UPDATE: usize = 1 + 6 + 6 + 6; // tag + child + parent + key
const LEN_ROOT_SWAP: usize = 1 + 6 + 6; // tag + new + old
const LEN_REDIRECT: usize = 1 + 6 + 6; // tag + new + old

/// A decoded log record. `RootSwap` replaces the teacher's two divergent
/// `log_droot`/`log_iroot` entry points (§9): a single record type, one
/// producer (`Log::root_swap`), and one opcode tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    Alloc { block: BlockAddr, count: u8 },
    Free { block: BlockAddr, count: u8 },
    Update { child: BlockAddr, parent: BlockAddr, key: BlockAddr },
    RootSwap { new: BlockAddr, old: BlockAddr },
    Redirect { new: BlockAddr, old: BlockAddr },
}

impl LogOp {
    fn encoded_len(self) -> usize {
        match self {
            LogOp::Alloc { .. } => LEN_ALLOC,
            LogOp::Free { .. } => LEN_FREE,
            LogOp::Update { .. } => LEN_UPDATE,
            LogOp::RootSwap { .. } => LEN_ROOT_SWAP,
            LogOp::Redirect { .. } => LEN_REDIRECT,
        }
    }

    fn encode(self, w: &mut ByteWriter, off: usize) -> Result<()> {
        match self {
            LogOp::Alloc { block, count } => {
                w.put_u8(off, TAG_ALLOC)?;
                w.put_u8(off + 1, count)?;
                w.put_u48_be(off + 2, block)?;
            }
            LogOp::Free { block, count } => {
                w.put_u8(off, TAG_FREE)?;
                w.put_u8(off + 1, count)?;
                w.put_u48_be(off + 2, block)?;
            }
            LogOp::Update { child, parent, key } => {
                w.put_u8(off, TAG_UPDATE)?;
                w.put_u48_be(off + 1, child)?;
                w.put_u48_be(off + 7, parent)?;
                w.put_u48_be(off + 13, key)?;
            }
            LogOp::RootSwap { new, old } => {
                w.put_u8(off, TAG_ROOT_SWAP)?;
                w.put_u48_be(off + 1, new)?;
                w.put_u48_be(off + 7, old)?;
            }
            LogOp::Redirect { new, old } => {
                w.put_u8(off, TAG_REDIRECT)?;
                w.put_u48_be(off + 1, new)?;
                w.put_u48_be(off + 7, old)?;
            }
        }
        Ok(())
    }

    /// Decodes one record at `off`. Returns `Ok(None)` for an
    /// unrecognized tag byte — the caller decides, via [`ReplayPolicy`],
    /// whether that is fatal or skippable.
    fn decode(r: &ByteReader, off: usize) -> Result<Option<(LogOp, usize)>> {
        let tag = r.u8(off)?;
        let op = match tag {
            TAG_ALLOC => LogOp::Alloc { count: r.u8(off + 1)?, block: r.u48_be(off + 2)? },
            TAG_FREE => LogOp::Free { count: r.u8(off + 1)?, block: r.u48_be(off + 2)? },
            TAG_UPDATE => LogOp::Update {
                child: r.u48_be(off + 1)?,
                parent: r.u48_be(off + 7)?,
                key: r.u48_be(off + 13)?,
            },
            TAG_ROOT_SWAP => LogOp::RootSwap { new: r.u48_be(off + 1)?, old: r.u48_be(off + 7)? },
            TAG_REDIRECT => LogOp::Redirect { new: r.u48_be(off + 1)?, old: r.u48_be(off + 7)? },
            _ => return Ok(None),
        };
        let len = op.encoded_len();
        Ok(Some((op, len)))
    }

    /// Finds the next offset at or after `start` where decoding runs
    /// cleanly through to `end_off` — every tag recognized, every record
    /// landing exactly on a byte boundary, total length summing to
    /// `end_off - candidate`. A single unrecognized tag byte can't just be
    /// skipped one byte at a time: the corrupted record's own body bytes
    /// often coincide with a valid tag value a few bytes later (a `count`
    /// of 1 reads back as `TAG_ALLOC`), so re-locking onto the first
    /// byte that merely looks like a tag misdecodes everything after it.
    /// Verifying that a candidate's whole tail decodes consistently to
    /// the end of the block is what actually finds the next real record.
    fn resync(r: &ByteReader, start: usize, end_off: usize) -> Option<usize> {
        'candidates: for candidate in start..end_off {
            let mut pos = candidate;
            while pos < end_off {
                match LogOp::decode(r, pos) {
                    Ok(Some((_, len))) if pos + len <= end_off => pos += len,
                    _ => continue 'candidates,
                }
            }
            return Some(candidate);
        }
        None
    }
}

/// How replay handles an opcode tag it doesn't recognize (§9 "Unknown
/// opcode policy"): the original silently skips, which the spec flags as
/// probably wrong for data opcodes. Made an explicit, caller-chosen
/// policy instead of a hard-coded behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReplayPolicy {
    Strict,
    Lenient,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        ReplayPolicy::Lenient
    }
}

/// The currently-open log block being appended to.
struct OpenBlock {
    index: BlockAddr,
    used: usize,
}

/// Append-only record journal over the log mapping (§4.C).
pub struct Log {
    mapping: std::sync::Arc<Mapping>,
    block_size: usize,
    /// Next log block index to allocate.
    lognext: AtomicU64,
    current: Mutex<Option<OpenBlock>>,
}

impl Log {
    pub fn new(mapping: std::sync::Arc<Mapping>, block_size: usize, lognext: BlockAddr) -> Self {
        Log { mapping, block_size, lognext: AtomicU64::new(lognext), current: Mutex::new(None) }
    }

    pub fn lognext(&self) -> BlockAddr {
        self.lognext.load(Ordering::SeqCst)
    }

    /// Ensures the current log block has `bytes` free, finishing and
    /// allocating a new one if not. Serializes concurrent callers (§4.C:
    /// "log_begin takes a mutex").
    fn log_begin(&self, bytes: usize) -> Result<std::sync::MutexGuard<'_, Option<OpenBlock>>> {
        let mut cur = self.current.lock().unwrap();
        let needs_new = match &*cur {
            Some(b) => b.used + bytes > self.block_size - HEADER_LEN,
            None => true,
        };
        if needs_new {
            if let Some(old) = cur.take() {
                self.finish_block(&old)?;
            }
            let index = self.lognext.fetch_add(1, Ordering::SeqCst);
            *cur = Some(OpenBlock { index, used: 0 });
            debug!("log: opened block {index}");
        }
        Ok(cur)
    }

    fn finish_block(&self, block: &OpenBlock) -> Result<()> {
        let buf = self.mapping.get(block.index)?;
        buf.with_data_mut(|data| -> Result<()> {
            let mut w = ByteWriter::new(data);
            w.put_u16_be(0, LOG_MAGIC)?;
            w.put_u16_be(2, block.used as u16)?;
            w.zero(HEADER_LEN + block.used, data.len() - HEADER_LEN - block.used)?;
            Ok(())
        })?;
        self.mapping.put(&buf);
        debug!("log: finished block {} with {} bytes", block.index, block.used);
        Ok(())
    }

    /// Appends one record, opening/closing blocks as needed. Returns the
    /// log block index the record landed in.
    pub fn append(&self, op: LogOp) -> Result<BlockAddr> {
        let len = op.encoded_len();
        let mut cur = self.log_begin(len)?;
        let block = cur.as_mut().expect("log_begin always leaves a block open");
        let buf = self.mapping.get(block.index)?;
        let off = HEADER_LEN + block.used;
        buf.with_data_mut(|data| -> Result<()> {
            let mut w = ByteWriter::new(data);
            op.encode(&mut w, off)
        })?;
        self.mapping.put_dirty(buf, 0);
        block.used += len;
        Ok(block.index)
    }

    /// `log_finish`: writes the byte count into the current block's
    /// header, zero-fills the tail, and releases it.
    pub fn log_finish(&self) -> Result<()> {
        let mut cur = self.current.lock().unwrap();
        if let Some(block) = cur.take() {
            self.finish_block(&block)?;
        }
        Ok(())
    }

    /// Iterates every record from block `start` (inclusive) up to
    /// `lognext` (exclusive), calling `visit` for each. Per §4.C, replay
    /// reapplies end states and is idempotent by construction as long as
    /// `visit`'s handlers only ever set state, never accumulate deltas.
    pub fn replay(
        &self,
        start: BlockAddr,
        policy: ReplayPolicy,
        mut visit: impl FnMut(LogOp) -> Result<()>,
    ) -> Result<()> {
        let end = self.lognext();
        for index in start..end {
            let buf = self.mapping.read(index)?;
            let (magic, bytes) = buf.with_data(|data| {
                let r = ByteReader::new(data);
                (r.u16_be(0), r.u16_be(2))
            });
            self.mapping.put(&buf);
            let magic = magic?;
            if magic != LOG_MAGIC {
                return Err(Error::corruption(format!("log block {index}: bad magic {magic:#x}")));
            }
            let bytes = bytes? as usize;
            let buf = self.mapping.read(index)?;
            let mut off = HEADER_LEN;
            let end_off = HEADER_LEN + bytes;
            buf.with_data(|data| -> Result<()> {
                let r = ByteReader::new(data);
                while off < end_off {
                    match LogOp::decode(&r, off)? {
                        Some((op, len)) => {
                            visit(op)?;
                            off += len;
                        }
                        None => match policy {
                            ReplayPolicy::Strict => {
                                return Err(Error::corruption(format!(
                                    "log block {index}: unknown opcode {:#x} at offset {off}",
                                    r.u8(off)?
                                )));
                            }
                            ReplayPolicy::Lenient => match LogOp::resync(&r, off + 1, end_off) {
                                Some(next) => {
                                    warn!(
                                        "log block {index}: skipping unknown opcode at offset {off}, resuming at {next}"
                                    );
                                    off = next;
                                }
                                None => {
                                    warn!(
                                        "log block {index}: unknown opcode at offset {off}, no valid record boundary before end of block; skipping rest of block"
                                    );
                                    off = end_off;
                                }
                            },
                        },
                    }
                }
                Ok(())
            })?;
            self.mapping.put(&buf);
        }
        Ok(())
    }
}

/// A deferred-free extent: `(block, count)` produced during a delta,
/// retired at commit (§4.C "Deferred free list").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredExtent {
    pub block: BlockAddr,
    pub count: u8,
}

/// A singly linked list of fixed-size extent pages holding deferred-free
/// extents. Modeled directly as a `Vec` of pages since the page-chaining
/// mechanism exists in the original only to bound memory, which a `Vec`
/// already does.
#[derive(Default)]
pub struct DeferredFreeList {
    extents: Mutex<Vec<DeferredExtent>>,
}

impl DeferredFreeList {
    pub fn new() -> Self {
        DeferredFreeList { extents: Mutex::new(Vec::new()) }
    }

    pub fn push(&self, block: BlockAddr, count: u8) {
        self.extents.lock().unwrap().push(DeferredExtent { block, count });
    }

    /// Retires every queued extent by calling `bfree` for each, then
    /// clears the list, per the delta-commit retirement in §4.C.
    pub fn retire(&self, mut bfree: impl FnMut(BlockAddr, u8)) {
        let drained = std::mem::take(&mut *self.extents.lock().unwrap());
        for e in drained {
            bfree(e.block, e.count);
        }
    }

    pub fn len(&self) -> usize {
        self.extents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
