//! Per-shard monotonically increasing [`SliceVersion`] issuance
//! (spec.md §3, §8 property 2).

use faststore_common::SliceVersion;
use std::sync::atomic::{AtomicU64, Ordering};

/// One atomic counter per allocator shard. Each shard issues versions
/// tagged with its own index, so uniqueness across shards is free and
/// uniqueness within a shard only needs a fetch-add.
pub struct VersionIssuer {
    counters: Vec<AtomicU64>,
}

impl VersionIssuer {
    pub fn new(shard_count: usize) -> Self {
        let mut counters = Vec::with_capacity(shard_count);
        counters.resize_with(shard_count, || AtomicU64::new(0));
        Self { counters }
    }

    /// Issues the next [`SliceVersion`] for `shard_index`.
    pub fn next(&self, shard_index: usize) -> SliceVersion {
        let counter = self.counters[shard_index].fetch_add(1, Ordering::Relaxed);
        SliceVersion::new(shard_index, counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_unique_within_and_across_shards() {
        let issuer = VersionIssuer::new(17);
        let mut seen = std::collections::HashSet::new();
        for shard in 0..17 {
            for _ in 0..100 {
                let v = issuer.next(shard);
                assert_eq!(v.shard_index(), shard);
                assert!(seen.insert(v.as_u64()), "duplicate slice version issued");
            }
        }
    }
}
