//! Per-trunk reclaim pipeline (spec.md §4.E), grounded on
//! `trunk_reclaim.c`'s `convert_to_rs_array` / `combine_to_rb_array` /
//! `migrate_blocks`.

use crate::index::{not_found_block, ObjectBlockIndex, OBSliceEntry, ReclaimToken};
use crate::trunk::{Trunk, TrunkPool};
use faststore_common::{BlockKey, Result, SliceKey};
use std::collections::HashMap;
use std::sync::Arc;

/// A run of one or more originally-separate slices that are contiguous
/// within the same block and so migrate as a single new slice
/// (`trunk_reclaim.c`'s `origin.slice_count` chain).
struct CombinedRun {
    block: BlockKey,
    offset: i32,
    length: i32,
    originals: Vec<Arc<OBSliceEntry>>,
}

/// Step 2+3: sort the trunk's live-slice snapshot by `(oid,
/// block-offset, slice-offset)` and coalesce adjacent, same-block,
/// contiguous entries.
fn combine(mut slices: Vec<Arc<OBSliceEntry>>) -> Vec<CombinedRun> {
    slices.sort_by_key(|s| (s.block.oid, s.block.block_offset, s.slice.offset));

    let mut runs: Vec<CombinedRun> = Vec::new();
    for s in slices {
        if let Some(last) = runs.last_mut() {
            if last.block == s.block && last.offset + last.length == s.slice.offset {
                last.length += s.slice.length;
                last.originals.push(s);
                continue;
            }
        }
        runs.push(CombinedRun {
            block: s.block,
            offset: s.slice.offset,
            length: s.slice.length,
            originals: vec![s],
        });
    }
    runs
}

pub struct TrunkReclaimer<'a> {
    index: &'a ObjectBlockIndex,
    trunks: &'a TrunkPool,
}

impl<'a> TrunkReclaimer<'a> {
    pub fn new(index: &'a ObjectBlockIndex, trunks: &'a TrunkPool) -> Self {
        Self { index, trunks }
    }

    /// Reclaims `live_slices` (a snapshot of one trunk's live content,
    /// taken by the caller under the allocator lock, spec.md §4.E step
    /// 1) into `dest`, a freshly allocated trunk. Returns the number of
    /// combined records migrated.
    pub fn reclaim(&self, dest: &Trunk, live_slices: Vec<Arc<OBSliceEntry>>) -> Result<usize> {
        let runs = combine(live_slices);

        let mut blocks: Vec<BlockKey> = runs.iter().map(|r| r.block).collect();
        blocks.sort();
        blocks.dedup();

        let mut tokens: HashMap<BlockKey, ReclaimToken> = HashMap::with_capacity(blocks.len());
        for block in &blocks {
            match self.index.reclaim_lock(*block) {
                Some(token) => {
                    tokens.insert(*block, token);
                }
                None => {
                    for (_, token) in tokens {
                        token.unlock();
                    }
                    return Err(not_found_block(*block));
                }
            }
        }

        let result = self.migrate_runs(dest, &runs, &tokens);

        for (_, token) in tokens {
            token.unlock();
        }
        result
    }

    /// Migrates each combined run into `dest`, splicing the new slice
    /// in through the run's already-held `ReclaimToken` rather than
    /// `ObjectBlockIndex::add_slice`, which would try to re-lock the
    /// same block's mutex the token holds raw-locked and deadlock.
    fn migrate_runs(
        &self,
        dest: &Trunk,
        runs: &[CombinedRun],
        tokens: &HashMap<BlockKey, ReclaimToken>,
    ) -> Result<usize> {
        let mut buffer: Vec<u8> = Vec::new();
        for run in runs {
            self.grow_buffer(&mut buffer, run.length as usize);
            buffer.clear();
            buffer.resize(run.length as usize, 0);

            let mut cursor = 0usize;
            for original in &run.originals {
                let trunk = self
                    .trunks
                    .get(original.space.trunk_id)
                    .ok_or_else(|| not_found_block(original.block))?;
                let bytes = trunk.read_at(original.space.offset, original.space.length)?;
                buffer[cursor..cursor + bytes.len()].copy_from_slice(&bytes);
                cursor += bytes.len();
            }

            let space = dest.append(&buffer[..run.length as usize])?;
            let new_slice = self
                .index
                .alloc_slice(run.block, SliceKey::new(run.offset, run.length), space);
            let token = tokens
                .get(&run.block)
                .ok_or_else(|| not_found_block(run.block))?;
            token.with_slices(|slices| ObjectBlockIndex::splice_in(slices, new_slice));

            for original in &run.originals {
                if let Some(trunk) = self.trunks.get(original.space.trunk_id) {
                    trunk.release(original.space.length);
                }
            }
        }
        Ok(runs.len())
    }

    /// Doubles `buffer`'s capacity until it can hold `needed` bytes
    /// (spec.md §4.E "the reclaimer's buffer is grown (doubling) to fit
    /// the largest extent it has seen").
    fn grow_buffer(&self, buffer: &mut Vec<u8>, needed: usize) {
        if buffer.capacity() >= needed {
            return;
        }
        let mut target = buffer.capacity().max(4096);
        while target < needed {
            target *= 2;
        }
        buffer.reserve(target - buffer.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ObjectBlockIndex;
    use faststore_common::BlockSliceKey;

    #[test]
    fn s4_reclaim_combines_adjacent_slices() {
        let dir = tempfile::tempdir().unwrap();
        let trunks = TrunkPool::new(dir.path().to_path_buf());
        let old_trunk = trunks.create_trunk().unwrap();
        let new_trunk = trunks.create_trunk().unwrap();
        let index = ObjectBlockIndex::new(2);

        let block = BlockKey::new(1, 0);
        let space_a = old_trunk.append(&[b'A'; 1024]).unwrap();
        let space_b = old_trunk.append(&[b'B'; 1024]).unwrap();

        let slice_a = index.alloc_slice(block, SliceKey::new(0, 1024), space_a);
        let slice_b = index.alloc_slice(block, SliceKey::new(1024, 1024), space_b);
        index.add_slice(slice_a.clone());
        index.add_slice(slice_b.clone());

        let reclaimer = TrunkReclaimer::new(&index, &trunks);
        let migrated = reclaimer
            .reclaim(&new_trunk, vec![slice_a, slice_b])
            .unwrap();
        assert_eq!(migrated, 1, "adjacent same-block slices combine into one run");

        let live = index.get_slices(BlockSliceKey::new(block, SliceKey::new(0, 2048)));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].slice, SliceKey::new(0, 2048));
        assert_eq!(live[0].space.trunk_id, new_trunk.id());

        let content = new_trunk.read_at(live[0].space.offset, live[0].space.length).unwrap();
        let mut expected = vec![b'A'; 1024];
        expected.extend(vec![b'B'; 1024]);
        assert_eq!(content, expected, "migrated content must be bit-identical");
    }

    #[test]
    fn non_adjacent_slices_migrate_separately() {
        let dir = tempfile::tempdir().unwrap();
        let trunks = TrunkPool::new(dir.path().to_path_buf());
        let old_trunk = trunks.create_trunk().unwrap();
        let new_trunk = trunks.create_trunk().unwrap();
        let index = ObjectBlockIndex::new(2);

        let block = BlockKey::new(2, 0);
        let space_a = old_trunk.append(&[b'X'; 512]).unwrap();
        let space_b = old_trunk.append(&[b'Y'; 512]).unwrap();

        let slice_a = index.alloc_slice(block, SliceKey::new(0, 512), space_a);
        // Leaves a gap: not contiguous with slice_a.
        let slice_b = index.alloc_slice(block, SliceKey::new(2048, 512), space_b);
        index.add_slice(slice_a.clone());
        index.add_slice(slice_b.clone());

        let reclaimer = TrunkReclaimer::new(&index, &trunks);
        let migrated = reclaimer.reclaim(&new_trunk, vec![slice_a, slice_b]).unwrap();
        assert_eq!(migrated, 2);
    }
}
