//! The storage-engine operations shared by the live write path, the
//! reclaimer, and recovery replay (spec.md §4.E "Reads and writes run
//! through the same slice-op path used by clients" and §4.G "Replay
//! tasks call into the same storage-engine operations as live traffic
//! (`fs_slice_write`, `fs_slice_allocate`, `fs_delete_slices`)").
//!
//! `Source` distinguishes why an operation ran; only `Client` should
//! trigger replication fan-out and `data_version` issuance at the
//! caller above this crate — `Reclaim` and `Replay` write data that is
//! already durable elsewhere and must not be re-replicated.

use crate::index::{OBSliceEntry, ObjectBlockIndex};
use crate::trunk::TrunkPool;
use faststore_common::{BlockKey, BlockSliceKey, Result, SliceKey};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A client write, arriving over the normal RPC path.
    Client,
    /// The trunk reclaimer migrating a slice within the same trunk pool
    /// (spec.md §4.E: "a local rewrite, not a replicated operation").
    Reclaim,
    /// Recovery replay applying a fetched, deduplicated binlog
    /// (spec.md §4.G: `source = REPLAY` so replay does not
    /// re-replicate).
    Replay,
}

impl Source {
    /// Whether this operation's result should be fanned out to slave
    /// replicas by the caller above this crate.
    pub fn should_replicate(&self) -> bool {
        matches!(self, Source::Client)
    }
}

/// Ties one data directory's [`ObjectBlockIndex`] and [`TrunkPool`]
/// together behind the handful of operations every caller (client RPC
/// handler, reclaimer, replay worker) actually needs.
pub struct StorageEngine {
    pub index: ObjectBlockIndex,
    pub trunks: TrunkPool,
}

impl StorageEngine {
    pub fn new(index: ObjectBlockIndex, trunks: TrunkPool) -> Self {
        Self { index, trunks }
    }

    /// `fs_slice_write`: writes `payload` as a new slice, splicing it
    /// into the block's index (last-write-wins over any overlap).
    pub fn write_slice(
        &self,
        block: BlockKey,
        offset: i32,
        payload: &[u8],
        _source: Source,
    ) -> Result<Arc<OBSliceEntry>> {
        let space = self.trunks.write(payload)?;
        let slice = SliceKey::new(offset, payload.len() as i32);
        let entry = self.index.alloc_slice(block, slice, space);
        self.index.add_slice(entry.clone());
        Ok(entry)
    }

    /// `fs_slice_allocate`: reserves `length` zero-filled bytes at
    /// `offset` without a client payload (e.g. a sparse pre-allocation).
    pub fn allocate_slice(
        &self,
        block: BlockKey,
        offset: i32,
        length: i32,
        source: Source,
    ) -> Result<Arc<OBSliceEntry>> {
        let zeros = vec![0u8; length.max(0) as usize];
        self.write_slice(block, offset, &zeros, source)
    }

    /// `fs_delete_slices`: removes every live entry intersecting
    /// `bs_key`'s range and releases the trunk space it freed.
    pub fn delete_slices(&self, bs_key: BlockSliceKey, _source: Source) -> Result<usize> {
        let freed = self.index.delete_slices(bs_key);
        let count = freed.len();
        for space in freed {
            if let Some(trunk) = self.trunks.get(space.trunk_id) {
                trunk.release(space.length);
            }
        }
        Ok(count)
    }

    /// `fs_delete_block`: removes every slice belonging to `block`.
    pub fn delete_block(&self, block: BlockKey, _source: Source) -> Result<usize> {
        let freed = self.index.delete_block(block);
        let count = freed.len();
        for space in freed {
            if let Some(trunk) = self.trunks.get(space.trunk_id) {
                trunk.release(space.length);
            }
        }
        Ok(count)
    }
}
