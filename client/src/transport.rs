//! The pluggable sink a flushed [`crate::slice::SliceEntry`] is handed
//! to. The combine engine only owns coalescing; actual wire transport
//! (and its retry/backoff policy, spec.md §7) is the caller's concern,
//! matching the original's separation between `client_func.c`'s request
//! assembly and the RPC layer underneath it.

use crate::slice::SliceEntry;
use faststore_common::Result;

pub trait Transport: Send + Sync {
    /// Dispatches the fully combined slice. Blocking: the combine
    /// engine calls this from a background thread per flush, never on
    /// the caller's `combine_write` path.
    fn send(&self, slice: &SliceEntry) -> Result<()>;
}
