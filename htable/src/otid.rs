//! The OTID table: per-`(Otid, BlockKey)` combine state tracking the
//! in-flight slice a client is currently appending to (spec.md §4.B,
//! grounded on `api/otid_htable.h`'s `otid_block_entry`).
//!
//! Generic over the slice-handle type `S` so this crate never has to
//! depend on `faststore_client`'s concrete `SliceEntry` — the client
//! crate instantiates `OtidTable<SliceHandle>` itself.

use crate::table::{ShardedTable, ShardedTableConfig};
use faststore_common::{BlockKey, Otid};

/// Per-key combine state: how many bytes have landed contiguously so
/// far, and a handle to the slice currently being combined into, if any.
pub struct OtidEntry<S> {
    pub successive_count: i64,
    pub last_write_offset: i64,
    pub current_slice: Option<S>,
}

impl<S> Default for OtidEntry<S> {
    fn default() -> Self {
        Self {
            successive_count: 0,
            last_write_offset: 0,
            current_slice: None,
        }
    }
}

pub struct OtidTable<S> {
    inner: ShardedTable<(Otid, BlockKey), OtidEntry<S>>,
}

impl<S: Clone> OtidTable<S> {
    pub fn new(cfg: ShardedTableConfig) -> Self {
        Self {
            inner: ShardedTable::new(cfg),
        }
    }

    /// Runs `f` against the entry for `(otid, block)`, creating a fresh
    /// one on first touch.
    pub fn with_entry_mut<R>(
        &self,
        otid: Otid,
        block: BlockKey,
        f: impl FnOnce(&mut OtidEntry<S>) -> R,
    ) -> R {
        self.inner
            .with_entry_mut((otid, block), OtidEntry::default, f)
    }

    /// Detaches and returns the slice currently being combined for
    /// `(otid, block)`, if any, resetting the entry's write-offset
    /// tracking — used when a combine window closes (flush on timeout,
    /// non-contiguous write, or buffer full; spec.md §4.C).
    pub fn take_current_slice(&self, otid: Otid, block: BlockKey) -> Option<S> {
        self.with_entry_mut(otid, block, |entry| {
            entry.successive_count = 0;
            entry.last_write_offset = 0;
            entry.current_slice.take()
        })
    }

    /// Detaches the current slice only if it still satisfies `predicate`
    /// — used by the timeout handler to avoid claiming a slice that a
    /// concurrent `combine_write` has already flushed and replaced
    /// (spec.md §4.C combine rule 4: "the slice has not been claimed by
    /// the timeout handler").
    pub fn take_current_slice_if(
        &self,
        otid: Otid,
        block: BlockKey,
        predicate: impl FnOnce(&S) -> bool,
    ) -> Option<S> {
        self.with_entry_mut(otid, block, |entry| {
            let matches = matches!(&entry.current_slice, Some(s) if predicate(s));
            if matches {
                entry.successive_count = 0;
                entry.last_write_offset = 0;
                entry.current_slice.take()
            } else {
                None
            }
        })
    }

    pub fn remove(&self, otid: Otid, block: BlockKey) {
        self.inner.remove(&(otid, block));
    }

    pub fn len(&self) -> i64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ShardedTableConfig {
        ShardedTableConfig {
            sharding_count: 4,
            element_limit: 1024,
            min_ttl_ms: 60_000,
            max_ttl_ms: 120_000,
        }
    }

    #[test]
    fn fresh_entry_has_no_current_slice() {
        let table: OtidTable<u32> = OtidTable::new(cfg());
        let block = BlockKey::new(1, 0);
        let has_slice = table.with_entry_mut(1, block, |e| e.current_slice.is_some());
        assert!(!has_slice);
    }

    #[test]
    fn take_current_slice_clears_tracking() {
        let table: OtidTable<u32> = OtidTable::new(cfg());
        let block = BlockKey::new(1, 0);
        table.with_entry_mut(1, block, |e| {
            e.current_slice = Some(99);
            e.successive_count = 3;
            e.last_write_offset = 12288;
        });
        let taken = table.take_current_slice(1, block);
        assert_eq!(taken, Some(99));
        let after = table.with_entry_mut(1, block, |e| (e.successive_count, e.last_write_offset));
        assert_eq!(after, (0, 0));
    }
}
