//! Cross-module integration tests exercising the seed scenarios from
//! spec.md §8 — the properties that only show up once the buffer cache,
//! the log stream, the B-tree, and the commit engine are wired together
//! through [`Superblock`], rather than any single module in isolation.
//!
//! Placed at the crate boundary (`tests/`) rather than a `#[cfg(test)]`
//! module because these scenarios span multiple files, per SPEC_FULL.md
//! §1.1's test-tooling note.

use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tux3_core::bitmap::Bitmap;
use tux3_core::buffer::{Buffer, Cache, Mapping};
use tux3_core::config::EngineConfig;
use tux3_core::dedup::{hash_block, DedupHints, Lookup};
use tux3_core::device::Device;
use tux3_core::log::{Log, LogOp, ReplayPolicy};
use tux3_core::sb::{Layout, Superblock};

struct ScratchFile {
    path: std::path::PathBuf,
}

impl ScratchFile {
    fn new(name: &str) -> Self {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!(
            "tux3-core-engine-{}-{}-{}",
            std::process::id(),
            name,
            ts
        ));
        Self { path }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn scratch_device(name: &str, blocks: u64, bits: u32) -> (ScratchFile, Arc<Device>) {
    let scratch = ScratchFile::new(name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&scratch.path)
        .unwrap();
    let dev = Device::from_file(file, bits).unwrap();
    dev.set_len_blocks(blocks).unwrap();
    (scratch, Arc::new(dev))
}

fn small_layout() -> Layout {
    Layout { volume_blocks: 4096, log_start: 16, inode_table_root: 17, dedup_root: Some(18) }
}

fn fast_commit_config() -> EngineConfig {
    EngineConfig { pool_size: 512, block_bits: 8, need_delta_interval: 1, ..EngineConfig::default() }
}

/// Reads a single bit back out of a bitmap mapping directly, bypassing
/// `Bitmap::alloc`/`free` (which only ever write bits, never report
/// existing state) so tests can assert on what replay actually left
/// on disk.
fn bit_is_set(mapping: &Mapping, bits_per_block: usize, block: u64) -> bool {
    let bpb = bits_per_block as u64;
    let bi = block / bpb;
    let bit_off = (block % bpb) as usize;
    let buf = mapping.read(bi).unwrap();
    let set = buf.with_data(|d| (d[bit_off / 8] >> (bit_off % 8)) & 1 == 1);
    mapping.put(&buf);
    set
}

/// Seed scenario 1 (spec.md §8): 21 iterations of
/// `change_begin; balloc(1); log_alloc(block,1,1); change_end`, then
/// `log_finish` and `replay`. With `need_delta_interval = 1` every
/// `change_end` commits, so the delta counter must land at exactly 21
/// and every allocated block must still read back as allocated after
/// replaying the log against a completely fresh bitmap.
#[test]
fn twenty_one_delta_cycles_then_replay_reproduces_bitmap_state() {
    let (_scratch, dev) = scratch_device("seed1", 64, 8);
    let sb = Superblock::format(dev.clone(), fast_commit_config(), small_layout()).unwrap();

    let mut allocated = Vec::new();
    for _ in 0..21 {
        let g = sb.change_begin();
        let block = sb.alloc_block(1).unwrap();
        sb.log().append(LogOp::Alloc { block, count: 1 }).unwrap();
        allocated.push(block);
        sb.change_end(g).unwrap();
    }
    assert_eq!(sb.delta(), 21, "delta must advance exactly once per change_end at interval 1");
    sb.log().log_finish().unwrap();

    // replay against a fresh, all-zero bitmap mapping sharing the same device.
    let cache = Cache::new(&dev, 64);
    let replay_mapping = Mapping::new(tux3_core::sb::MAPPING_BITMAP, cache, Arc::new({
        let dev = dev.clone();
        move |buf: &Buffer, write: bool| {
            if write {
                buf.with_data(|d| dev.write_block(buf.block(), d))
            } else {
                buf.with_data_mut(|d| dev.read_block(buf.block(), d))
            }
        }
    }));
    // zero the on-disk bitmap region so replay has to reconstruct it from
    // scratch rather than from state `format`/`alloc_block` already wrote.
    for bi in 0..4 {
        let buf = replay_mapping.get(bi).unwrap();
        buf.with_data_mut(|d| d.fill(0));
        replay_mapping.put_dirty(buf, 0);
    }
    let fresh_bitmap = Bitmap::new(replay_mapping.clone(), dev.block_size(), 4096);

    sb.log()
        .replay(16, ReplayPolicy::Lenient, |op| {
            if let LogOp::Alloc { block, count } = op {
                fresh_bitmap.apply(block, count, true)?;
            }
            Ok(())
        })
        .unwrap();

    for block in allocated {
        assert!(
            bit_is_set(&replay_mapping, fresh_bitmap.bits_per_block(), block),
            "block {block} must read as allocated after replaying the log into a fresh bitmap"
        );
    }
}

/// Seed scenario 8 (commit monotonicity): across many commits at
/// various intervals the delta counter is non-decreasing and never
/// skips a value.
#[test]
fn delta_never_skips_a_value_across_many_commits() {
    let (_scratch, dev) = scratch_device("monotonic", 64, 8);
    let config = EngineConfig { need_delta_interval: 3, ..fast_commit_config() };
    let sb = Superblock::format(dev, config, small_layout()).unwrap();

    let mut seen = Vec::new();
    for _ in 0..30 {
        let g = sb.change_begin();
        let _ = sb.alloc_block(1);
        sb.change_end(g).unwrap();
        seen.push(sb.delta());
    }
    assert_eq!(seen.last().copied().unwrap(), 10, "30 calls at interval 3 commit 10 times");
    for w in seen.windows(2) {
        assert!(w[1] == w[0] || w[1] == w[0] + 1, "delta jumped from {} to {}", w[0], w[1]);
    }
}

/// Seed scenario 2 (spec.md §8): populate an ileaf-backed inode table,
/// force a split, write/purge entries, and confirm `find_empty_inode`
/// walks the resulting holes correctly — exercised here through the
/// full `Superblock` write path rather than the bare `Ileaf` type, so
/// the B-tree split/probe machinery is in the loop too.
#[test]
fn inode_table_round_trips_through_split_and_purge_via_superblock() {
    let (_scratch, dev) = scratch_device("ileaf-seq", 64, 8);
    let mut sb = Superblock::format(dev, fast_commit_config(), small_layout()).unwrap();

    sb.write_inode(0x13, &[b'a'; 2]).unwrap();
    sb.write_inode(0x14, &[b'b'; 4]).unwrap();
    sb.write_inode(0x16, &[b'c'; 6]).unwrap();

    sb.write_inode(0x13, &[b'x'; 5]).unwrap();
    sb.write_inode(0x18, &[b'y'; 3]).unwrap();
    sb.purge_inode(0x16).unwrap();

    assert_eq!(sb.read_inode(0x13).unwrap(), Some(vec![b'x'; 5]));
    assert_eq!(sb.read_inode(0x16).unwrap(), None);
    assert_eq!(sb.read_inode(0x18).unwrap(), Some(vec![b'y'; 3]));
    assert_eq!(sb.find_empty_inode(0x11).unwrap(), 0x11);
}

/// Seed scenario 3: writing the same block twice through the dedup
/// engine produces one bucket entry with `refcount == 2`, reusing the
/// original data block both times.
#[test]
fn dedup_reuses_the_first_block_and_bumps_refcount() {
    let (_scratch, dev) = scratch_device("dedup-reuse", 64, 8);
    let mut sb = Superblock::format(dev, fast_commit_config(), small_layout()).unwrap();
    let mut hints = DedupHints::default();
    let digest = hash_block(b"duplicate payload");

    let first_block = match sb.dedup_lookup(&digest, &mut hints).unwrap() {
        Lookup::Fresh => {
            let block = sb.alloc_block(1).unwrap();
            sb.dedup_record_write(&digest, block, &mut hints).unwrap();
            block
        }
        Lookup::Found(_) => panic!("first write of a novel digest must be Fresh"),
    };

    match sb.dedup_lookup(&digest, &mut hints).unwrap() {
        Lookup::Found(b) => assert_eq!(b, first_block, "second write must resolve to the same block"),
        Lookup::Fresh => panic!("second write of the same digest must hit"),
    }
}

/// Seed scenario 6: replaying a log whose middle record carries an
/// unrecognized opcode must, under the lenient policy, still apply the
/// two records that flank it, in order.
#[test]
fn lenient_replay_applies_flanking_records_around_an_unknown_opcode() {
    let (_scratch, dev) = scratch_device("unknown-opcode", 16, 8);
    let cache = Cache::new(&dev, 16);
    let mapping = Mapping::new(1, cache, Arc::new({
        let dev = dev.clone();
        move |buf: &Buffer, write: bool| {
            if write {
                buf.with_data(|d| dev.write_block(buf.block(), d))
            } else {
                buf.with_data_mut(|d| dev.read_block(buf.block(), d))
            }
        }
    }));
    let log = Log::new(mapping.clone(), dev.block_size(), 0);
    log.append(LogOp::Alloc { block: 5, count: 1 }).unwrap();
    log.append(LogOp::Free { block: 9, count: 1 }).unwrap();
    log.append(LogOp::RootSwap { new: 20, old: 21 }).unwrap();
    log.log_finish().unwrap();

    // corrupt the middle record's tag byte to something unrecognized.
    // ALLOC is 8 bytes (tag+count+block48), so the FREE record starts at
    // header (4) + 8 = offset 12.
    let buf = mapping.get(0).unwrap();
    buf.with_data_mut(|d| d[12] = 0xfe);
    mapping.put(&buf);

    let mut seen = Vec::new();
    log.replay(0, ReplayPolicy::Lenient, |op| {
        seen.push(op);
        Ok(())
    })
    .unwrap();

    assert_eq!(seen, vec![LogOp::Alloc { block: 5, count: 1 }, LogOp::RootSwap { new: 20, old: 21 }]);
}

/// Seed scenario: log replay idempotence. Replaying the same finished
/// log a second time must leave the bitmap in exactly the state the
/// first pass left it in — re-applying `ALLOC`/`FREE` end states is a
/// no-op on a bitmap that already reflects them.
#[test]
fn replaying_a_log_twice_is_idempotent() {
    let (_scratch, dev) = scratch_device("idempotent-replay", 16, 8);
    let cache = Cache::new(&dev, 16);
    let log_mapping = Mapping::new(1, cache.clone(), Arc::new({
        let dev = dev.clone();
        move |buf: &Buffer, write: bool| {
            if write {
                buf.with_data(|d| dev.write_block(buf.block(), d))
            } else {
                buf.with_data_mut(|d| dev.read_block(buf.block(), d))
            }
        }
    }));
    let log = Log::new(log_mapping, dev.block_size(), 0);
    log.append(LogOp::Alloc { block: 2, count: 3 }).unwrap();
    log.append(LogOp::Alloc { block: 8, count: 1 }).unwrap();
    log.append(LogOp::Free { block: 2, count: 1 }).unwrap();
    log.log_finish().unwrap();

    let bitmap_mapping = Mapping::new(2, cache, Arc::new(|_b: &Buffer, _w: bool| Ok(())));
    let bits_per_block = dev.block_size() * 8;
    let bitmap = Bitmap::new(bitmap_mapping.clone(), dev.block_size(), dev.block_size() as u64 * 8);

    let replay_once = |bitmap: &Bitmap| {
        log.replay(0, ReplayPolicy::Lenient, |op| {
            match op {
                LogOp::Alloc { block, count } => bitmap.apply(block, count, true)?,
                LogOp::Free { block, count } => bitmap.apply(block, count, false)?,
                _ => {}
            }
            Ok(())
        })
        .unwrap();
    };

    replay_once(&bitmap);
    // block 2's only extent was freed again by the third record; block 3
    // and 4 (the rest of the original 3-block ALLOC) and block 8 remain
    // allocated. A second replay pass must not change any of that.
    assert!(!bit_is_set(&bitmap_mapping, bits_per_block, 2), "block 2 should read as free after one pass");
    assert!(bit_is_set(&bitmap_mapping, bits_per_block, 8), "block 8 should read as allocated after one pass");
    replay_once(&bitmap);
    assert!(!bit_is_set(&bitmap_mapping, bits_per_block, 2), "block 2 must still be free after a second replay pass");
    assert!(bit_is_set(&bitmap_mapping, bits_per_block, 8), "block 8 must still be allocated after a second replay pass");
}

/// Seed scenario 4: an 8-byte Sha-1 prefix collision must route through
/// a collision bucket, and both original and colliding digests must
/// resolve to their own distinct stored block afterward.
#[test]
fn prefix_collision_resolves_both_digests_independently() {
    let (_scratch, dev) = scratch_device("prefix-collision", 64, 8);
    let mut sb = Superblock::format(dev, fast_commit_config(), small_layout()).unwrap();
    let mut hints = DedupHints::default();

    let mut d1 = [0u8; 20];
    d1[0..8].copy_from_slice(&[9, 8, 7, 6, 5, 4, 3, 2]);
    d1[10] = 0x11;
    let mut d2 = d1;
    d2[10] = 0x22;

    let b1 = sb.alloc_block(1).unwrap();
    assert_eq!(sb.dedup_lookup(&d1, &mut hints).unwrap(), Lookup::Fresh);
    sb.dedup_record_write(&d1, b1, &mut hints).unwrap();

    hints.reference_bucket = None;
    let b2 = sb.alloc_block(1).unwrap();
    assert_eq!(sb.dedup_lookup(&d2, &mut hints).unwrap(), Lookup::Fresh);
    sb.dedup_record_write(&d2, b2, &mut hints).unwrap();

    hints.reference_bucket = None;
    assert_eq!(sb.dedup_lookup(&d1, &mut hints).unwrap(), Lookup::Found(b1));
    hints.reference_bucket = None;
    assert_eq!(sb.dedup_lookup(&d2, &mut hints).unwrap(), Lookup::Found(b2));
}

/// A volume reopened after a clean commit must expose the same inode
/// contents a fresh `Superblock::open` over the same device and layout
/// sees — the basic "survives a restart" property the commit/flush path
/// exists for.
#[test]
fn inode_contents_survive_reopening_the_device() {
    let (_scratch, dev) = scratch_device("reopen", 64, 8);
    let layout = small_layout();
    let config = fast_commit_config();

    {
        let mut sb = Superblock::format(dev.clone(), config, layout).unwrap();
        let g = sb.change_begin();
        sb.write_inode(42, b"persisted").unwrap();
        sb.change_end(g).unwrap();
    }

    let reopened = Superblock::open(dev, config, layout).unwrap();
    assert_eq!(reopened.read_inode(42).unwrap(), Some(b"persisted".to_vec()));
    assert_eq!(reopened.delta(), 0, "a fresh Superblock::open starts its own in-memory delta counter at 0");
}

#[test]
fn config_need_delta_interval_gates_when_a_commit_actually_happens() {
    let (_scratch, dev) = scratch_device("interval", 64, 8);
    let config = EngineConfig { need_delta_interval: 5, ..fast_commit_config() };
    let sb = Superblock::format(dev, config, small_layout()).unwrap();

    for _ in 0..4 {
        let g = sb.change_begin();
        sb.change_end(g).unwrap();
    }
    assert_eq!(sb.delta(), 0);
    let g = sb.change_begin();
    sb.change_end(g).unwrap();
    assert_eq!(sb.delta(), 1);
}

#[test]
fn block_size_matches_configured_bits() {
    let cfg = EngineConfig { block_bits: 10, ..EngineConfig::default() };
    assert_eq!(cfg.block_size(), 1024);
}
