//! Sharded timing wheel that guarantees no combined slice sits
//! uncommitted past `write_combine.max_wait_ms`, even if its OTID never
//! writes again (spec.md §4.C "Timeout flushing").
//!
//! Slot assignment is `slice.version mod shards` as spec'd. Within a
//! shard, entries are scheduled in call order and `max_wait_ms` is
//! constant, so the queue is effectively deadline-ordered already; we
//! still scan from the front and stop at the first unexpired entry
//! rather than assuming strict ordering, since a slice can be claimed
//! and removed out of order by a concurrent flush.

use faststore_common::{BlockKey, Otid, SliceVersion};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;

pub struct PendingFlush {
    pub otid: Otid,
    pub block: BlockKey,
    pub version: SliceVersion,
    pub deadline: Instant,
}

pub struct TimingWheel {
    shards: Vec<Mutex<VecDeque<PendingFlush>>>,
}

impl TimingWheel {
    pub fn new(shard_count: usize) -> Self {
        let mut shards = Vec::with_capacity(shard_count);
        shards.resize_with(shard_count, || Mutex::new(VecDeque::new()));
        Self { shards }
    }

    pub fn schedule(&self, otid: Otid, block: BlockKey, version: SliceVersion, deadline: Instant) {
        let slot = version.wheel_slot(self.shards.len());
        self.shards[slot].lock().push_back(PendingFlush {
            otid,
            block,
            version,
            deadline,
        });
    }

    /// Pops every entry across all shards whose deadline has passed.
    /// Entries whose slice has already been claimed or replaced by the
    /// time the caller acts on them are simply no-ops there — the wheel
    /// only records candidates, it does not own the slice itself.
    pub fn drain_expired(&self, now: Instant) -> Vec<PendingFlush> {
        let mut expired = Vec::new();
        for shard in &self.shards {
            let mut queue = shard.lock();
            while let Some(front) = queue.front() {
                if front.deadline <= now {
                    expired.push(queue.pop_front().unwrap());
                } else {
                    break;
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn only_expired_entries_drain() {
        let wheel = TimingWheel::new(4);
        let block = BlockKey::new(1, 0);
        let now = Instant::now();
        wheel.schedule(1, block, SliceVersion::new(0, 1), now - Duration::from_millis(10));
        wheel.schedule(2, block, SliceVersion::new(0, 2), now + Duration::from_secs(60));

        let expired = wheel.drain_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].otid, 1);

        let expired_again = wheel.drain_expired(now);
        assert!(expired_again.is_empty());
    }
}
