//! The object-block slice index (spec.md §4.D), grounded on
//! `object_block_index.h`'s `OBEntry`/`OBSliceEntry`/`OBSharedContext`.
//!
//! A `UniqSkiplist` per block in the original; here a `BTreeMap` keyed
//! by slice offset gives the same ordered-by-offset, O(log n) semantics
//! without pulling in a dedicated skiplist crate the rest of the stack
//! has no other use for. Reference counting is Rust's `Arc` standing in
//! for the original's manual `ref_count` increment/decrement — a slice
//! frees its trunk space when the last `Arc<OBSliceEntry>` drops rather
//! than on an explicit decref.

use crate::trunk::TrunkSpace;
use faststore_common::{BlockKey, BlockSliceKey, Error, Result, SliceKey};
use lock_api::RawMutex as _;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct OBSliceEntry {
    pub block: BlockKey,
    pub slice: SliceKey,
    pub space: TrunkSpace,
}

struct OBEntry {
    block: BlockKey,
    slices: Mutex<BTreeMap<i32, Arc<OBSliceEntry>>>,
}

struct Shard {
    entries: Mutex<HashMap<BlockKey, Arc<OBEntry>>>,
}

/// An exclusive hold on one block's slice index, acquired by the trunk
/// reclaimer to keep the index from changing under a migrating slice
/// (spec.md §4.D "Reclaim lock"). Acquired via `ObjectBlockIndex::reclaim_lock`
/// and released via `unlock`; every other accessor takes and releases
/// the same lock for the duration of a single call, so holding a token
/// across several of the reclaimer's steps blocks (but never corrupts)
/// concurrent readers/writers of that block.
pub struct ReclaimToken {
    entry: Arc<OBEntry>,
}

impl ReclaimToken {
    pub fn block(&self) -> BlockKey {
        self.entry.block
    }

    /// Runs `f` against the locked block's slice map. Only valid while
    /// this token is held (which it always is, since `unlock` consumes
    /// `self`).
    pub fn with_slices<R>(&self, f: impl FnOnce(&mut BTreeMap<i32, Arc<OBSliceEntry>>) -> R) -> R {
        // SAFETY: `reclaim_lock` already acquired this mutex's raw lock
        // and no safe path re-acquires it while a `ReclaimToken` is live.
        let mut guard = unsafe { self.entry.slices.make_guard_unchecked() };
        f(&mut guard)
    }

    pub fn unlock(self) {
        // SAFETY: this token is only constructed by `reclaim_lock`,
        // which paired this call with exactly one prior raw lock.
        unsafe { self.entry.slices.raw().unlock() };
    }
}

pub struct ObjectBlockIndex {
    shards: Vec<Shard>,
    shard_count: usize,
}

impl ObjectBlockIndex {
    pub fn new(shard_count: usize) -> Self {
        let mut shards = Vec::with_capacity(shard_count);
        shards.resize_with(shard_count, || Shard {
            entries: Mutex::new(HashMap::new()),
        });
        Self { shards, shard_count }
    }

    fn shard_index(&self, block: &BlockKey) -> usize {
        faststore_alloc::shard_for(block, self.shard_count)
    }

    fn entry_for(&self, block: BlockKey) -> Arc<OBEntry> {
        let shard = &self.shards[self.shard_index(&block)];
        let mut entries = shard.entries.lock();
        entries
            .entry(block)
            .or_insert_with(|| {
                Arc::new(OBEntry {
                    block,
                    slices: Mutex::new(BTreeMap::new()),
                })
            })
            .clone()
    }

    /// `alloc_slice`: a fresh, detached entry associated with `block`
    /// but not yet linked into its index (spec.md §4.D).
    pub fn alloc_slice(&self, block: BlockKey, slice: SliceKey, space: TrunkSpace) -> Arc<OBSliceEntry> {
        Arc::new(OBSliceEntry { block, slice, space })
    }

    /// `add_slice`: links `new` into its block's skiplist, splitting or
    /// truncating any overlapping entries (last-write-wins at offset
    /// granularity).
    pub fn add_slice(&self, new: Arc<OBSliceEntry>) {
        let entry = self.entry_for(new.block);
        let mut slices = entry.slices.lock();
        Self::splice_in(&mut slices, new);
    }

    /// Exposed to the reclaimer so it can splice a migrated slice in
    /// through an already-held [`ReclaimToken`] (`with_slices`) instead
    /// of going through `add_slice`, which would re-lock the same
    /// block's mutex the token already holds.
    pub(crate) fn splice_in(slices: &mut BTreeMap<i32, Arc<OBSliceEntry>>, new: Arc<OBSliceEntry>) {
        let mut to_remove = Vec::new();
        let mut to_insert = Vec::new();

        for (&off, existing) in slices.iter() {
            if !existing.slice.overlaps(&new.slice) {
                continue;
            }
            to_remove.push(off);

            if existing.slice.offset < new.slice.offset {
                let trimmed_len = new.slice.offset - existing.slice.offset;
                let trimmed = Arc::new(OBSliceEntry {
                    block: existing.block,
                    slice: SliceKey::new(existing.slice.offset, trimmed_len),
                    space: existing.space,
                });
                to_insert.push((trimmed.slice.offset, trimmed));
            }
            if existing.slice.end() > new.slice.end() {
                let new_offset = new.slice.end();
                let trimmed_len = existing.slice.end() - new_offset;
                let shift = (new_offset - existing.slice.offset) as u64;
                let trimmed_space = TrunkSpace {
                    trunk_id: existing.space.trunk_id,
                    offset: existing.space.offset + shift,
                    length: trimmed_len as u32,
                };
                let trimmed = Arc::new(OBSliceEntry {
                    block: existing.block,
                    slice: SliceKey::new(new_offset, trimmed_len),
                    space: trimmed_space,
                });
                to_insert.push((trimmed.slice.offset, trimmed));
            }
        }

        for off in to_remove {
            slices.remove(&off);
        }
        for (off, s) in to_insert {
            slices.insert(off, s);
        }
        slices.insert(new.slice.offset, new);
    }

    /// `get_slices`: the ordered, `Arc`-incref'd set of live entries
    /// intersecting `bs_key`'s range.
    pub fn get_slices(&self, bs_key: BlockSliceKey) -> Vec<Arc<OBSliceEntry>> {
        let shard = &self.shards[self.shard_index(&bs_key.block)];
        let entries = shard.entries.lock();
        let Some(entry) = entries.get(&bs_key.block) else {
            return Vec::new();
        };
        let slices = entry.slices.lock();
        slices
            .values()
            .filter(|s| s.slice.overlaps(&bs_key.slice))
            .cloned()
            .collect()
    }

    /// Snapshots every live slice across every block, for the
    /// reclaimer's per-trunk selection pass (spec.md §4.E step 1). The
    /// caller filters down to slices belonging to the trunk being
    /// reclaimed.
    pub fn snapshot_all(&self) -> Vec<Arc<OBSliceEntry>> {
        let mut all = Vec::new();
        for shard in &self.shards {
            let entries = shard.entries.lock();
            for entry in entries.values() {
                let slices = entry.slices.lock();
                all.extend(slices.values().cloned());
            }
        }
        all
    }

    /// `del-slice` (binlog op_type `d`, spec.md §6): removes every live
    /// entry intersecting `bs_key`'s range, splitting partially
    /// overlapping boundary entries the same way `add_slice` does.
    /// Returns the freed `TrunkSpace`s so the caller can release them
    /// from their owning trunks.
    pub fn delete_slices(&self, bs_key: BlockSliceKey) -> Vec<TrunkSpace> {
        let entry = self.entry_for(bs_key.block);
        let mut slices = entry.slices.lock();

        let mut to_remove = Vec::new();
        let mut to_insert = Vec::new();
        let mut freed = Vec::new();

        for (&off, existing) in slices.iter() {
            if !existing.slice.overlaps(&bs_key.slice) {
                continue;
            }
            to_remove.push(off);
            freed.push(existing.space);

            if existing.slice.offset < bs_key.slice.offset {
                let trimmed_len = bs_key.slice.offset - existing.slice.offset;
                let trimmed = Arc::new(OBSliceEntry {
                    block: existing.block,
                    slice: SliceKey::new(existing.slice.offset, trimmed_len),
                    space: existing.space,
                });
                to_insert.push((trimmed.slice.offset, trimmed));
            }
            if existing.slice.end() > bs_key.slice.end() {
                let new_offset = bs_key.slice.end();
                let trimmed_len = existing.slice.end() - new_offset;
                let shift = (new_offset - existing.slice.offset) as u64;
                let trimmed_space = TrunkSpace {
                    trunk_id: existing.space.trunk_id,
                    offset: existing.space.offset + shift,
                    length: trimmed_len as u32,
                };
                let trimmed = Arc::new(OBSliceEntry {
                    block: existing.block,
                    slice: SliceKey::new(new_offset, trimmed_len),
                    space: trimmed_space,
                });
                to_insert.push((trimmed.slice.offset, trimmed));
            }
        }

        for off in &to_remove {
            slices.remove(off);
        }
        for (off, s) in to_insert {
            slices.insert(off, s);
        }
        freed
    }

    /// `del-block` (binlog op_type `D`): removes every slice for
    /// `block`, returning the freed `TrunkSpace`s.
    pub fn delete_block(&self, block: BlockKey) -> Vec<TrunkSpace> {
        let shard = &self.shards[self.shard_index(&block)];
        let entry = {
            let mut entries = shard.entries.lock();
            entries.remove(&block)
        };
        let Some(entry) = entry else {
            return Vec::new();
        };
        let mut slices = entry.slices.lock();
        let freed = slices.values().map(|s| s.space).collect();
        slices.clear();
        freed
    }

    /// Acquires the exclusive per-block guard used by the reclaimer.
    /// Returns `None` if the block has no index entry at all (nothing
    /// to reclaim there).
    pub fn reclaim_lock(&self, block: BlockKey) -> Option<ReclaimToken> {
        let shard = &self.shards[self.shard_index(&block)];
        let entry = {
            let entries = shard.entries.lock();
            entries.get(&block)?.clone()
        };
        entry.slices.raw().lock();
        Some(ReclaimToken { entry })
    }
}

pub fn not_found_block(block: BlockKey) -> Error {
    Error::NotFound(format!("block {:?} missing from index during reclaim", block))
}
