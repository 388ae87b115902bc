//! Delta commit engine (component H): the atomic-delta commit loop that
//! groups mutations into deltas, stages the bitmap, and flushes exactly
//! the prior delta's dirty buffers (§4.H).
//!
//! Grounded on `original_source/user/commit.c`'s `change_begin`/
//! `change_end`/`stage_delta`/`commit_delta`. One divergence from that
//! source, per §9's "Bitmap staging loop" note: `stage_delta` there
//! returns on the first *non-EAGAIN* result from `write_bitmap`, which
//! stops after either the first error **or** the first successful write.
//! Here, staging always targets exactly the ring the delta that just
//! closed owns (`(delta - 1) & 3`) via [`crate::buffer::Mapping::flush_ring`],
//! which already visits every buffer in that ring and only returns the
//! first real error after completing the pass — the "try again because
//! this buffer belongs to the next delta" case the source modeled with
//! `-EAGAIN` never arises because we only ever flush the ring that has
//! already closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use log::debug;

use crate::buffer::Mapping;
use crate::device::BlockAddr;
use crate::error::Result;
use crate::log::{DeferredFreeList, Log};

/// Read half of `change_begin`/`change_end`: held by every in-flight
/// mutation, upgraded to the writer half only by the caller that wins
/// the delta double-check (§5 "Ordering guarantees").
pub type DeltaGuard<'a> = RwLockReadGuard<'a, ()>;

/// The atomic-delta commit loop (§4.H). One instance per volume.
pub struct CommitEngine {
    delta: Arc<AtomicU64>,
    delta_lock: RwLock<()>,
    calls: AtomicU64,
    interval: u32,
    log: Arc<Log>,
    bitmap_mapping: Arc<Mapping>,
    data_mappings: Vec<Arc<Mapping>>,
    deferred: Arc<DeferredFreeList>,
    bfree: Arc<dyn Fn(BlockAddr, u8) + Send + Sync>,
}

impl CommitEngine {
    /// `data_mappings` are every other mapping whose dirty buffers must
    /// be flushed at commit (inode-table, dedup, file extent maps);
    /// `bfree` retires the [`DeferredFreeList`] at the end of each commit
    /// (§4.C "Deferred free list").
    pub fn new(
        delta: Arc<AtomicU64>,
        need_delta_interval: u32,
        log: Arc<Log>,
        bitmap_mapping: Arc<Mapping>,
        data_mappings: Vec<Arc<Mapping>>,
        deferred: Arc<DeferredFreeList>,
        bfree: Arc<dyn Fn(BlockAddr, u8) + Send + Sync>,
    ) -> Self {
        CommitEngine {
            delta,
            delta_lock: RwLock::new(()),
            calls: AtomicU64::new(0),
            interval: need_delta_interval,
            log,
            bitmap_mapping,
            data_mappings,
            deferred,
            bfree,
        }
    }

    pub fn delta(&self) -> u64 {
        self.delta.load(Ordering::SeqCst)
    }

    /// `change_begin`: acquires `delta_lock` in read mode. Every mutation
    /// tags its dirty buffers with `DIRTY + (delta & 3)` for the `delta`
    /// value observed while this guard is held (§5).
    pub fn change_begin(&self) -> DeltaGuard<'_> {
        self.delta_lock.read().unwrap()
    }

    /// `change_end`: releases the read guard; if this call's turn opts
    /// into `need_delta`'s one-in-`interval` policy, upgrades to the
    /// writer half and, after the classic double-check, advances and
    /// commits the delta.
    pub fn change_end(&self, guard: DeltaGuard<'_>) -> Result<()> {
        let opts_in = self.need_delta();
        drop(guard);
        if !opts_in {
            return Ok(());
        }
        let seen = self.delta();
        let _write = self.delta_lock.write().unwrap();
        if self.delta() == seen {
            let next = seen + 1;
            debug!("commit: delta {seen} -> {next}");
            self.delta.store(next, Ordering::SeqCst);
            self.stage_delta()?;
            self.commit_delta(next)?;
        }
        Ok(())
    }

    fn need_delta(&self) -> bool {
        if self.interval == 0 {
            return true;
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        n % self.interval as u64 == 0
    }

    fn committing_ring(new_delta: u64) -> u8 {
        (new_delta.wrapping_sub(1) & 3) as u8
    }

    /// Writes the bitmap mapping's dirty buffers for the ring that just
    /// closed.
    fn stage_delta(&self) -> Result<()> {
        let ring = Self::committing_ring(self.delta());
        self.bitmap_mapping.flush_ring(ring)
    }

    /// `flush_state(DIRTY + ((delta-1) & 3))`: drains every other
    /// registered mapping's dirty buffers for the same ring, finishes the
    /// log block so its records precede the data they describe on disk
    /// (§5 "Log records written in delta d are persisted before any data
    /// block of delta d is made live"), and retires the deferred-free
    /// list.
    fn commit_delta(&self, new_delta: u64) -> Result<()> {
        let ring = Self::committing_ring(new_delta);
        self.log.log_finish()?;
        for mapping in &self.data_mappings {
            mapping.flush_ring(ring)?;
        }
        self.bitmap_mapping.flush_ring(ring)?;
        let bfree = &self.bfree;
        self.deferred.retire(|block, count| bfree(block, count));
        Ok(())
    }
}
