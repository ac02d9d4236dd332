//! An in-flight, not-yet-dispatched write-combine unit (spec.md §4.C).

use faststore_alloc::PooledBuffer;
use faststore_common::{BlockKey, Error, SliceKey, SliceVersion};
use std::sync::Arc;

pub type CombineResult = Result<(), Arc<Error>>;

/// A slice currently accumulating contiguous writes. Lives inside an
/// `OtidEntry::current_slice` until a combine rule fails or the timing
/// wheel claims it, at which point it is detached and dispatched.
pub struct SliceEntry {
    pub block: BlockKey,
    pub slice: SliceKey,
    pub version: SliceVersion,
    pub buffer: PooledBuffer,
    /// Senders for every caller whose write was absorbed into this
    /// slice; all are notified with the same result when the slice's
    /// RPC completes (spec.md §4.C "waiting-task protocol").
    pub waiters: Vec<flume::Sender<CombineResult>>,
}

impl SliceEntry {
    pub fn new(block: BlockKey, slice: SliceKey, version: SliceVersion, buffer: PooledBuffer) -> Self {
        Self {
            block,
            slice,
            version,
            buffer,
            waiters: Vec::new(),
        }
    }

    pub fn register_waiter(&mut self) -> flume::Receiver<CombineResult> {
        let (tx, rx) = flume::bounded(1);
        self.waiters.push(tx);
        rx
    }

    /// Extends this slice with `payload`, which the caller has already
    /// verified is strictly contiguous and within `buffer_size`.
    pub fn extend(&mut self, payload: &[u8]) {
        self.buffer.extend_from_slice(payload);
        self.slice.length += payload.len() as i32;
    }

    pub fn notify_waiters(&mut self, result: &CombineResult) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}
