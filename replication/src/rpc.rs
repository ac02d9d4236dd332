//! The per-write replication RPC entry and the originating caller's
//! wait handle (spec.md §4.F), grounded on `replication_caller.c`'s
//! `ReplicationRPCEntry`/`reffer_count` and the service context's
//! `waiting_rpc_count`.

use faststore_common::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Tracks the originating client call across however many slaves it
/// fanned out to. Resolves its `completion` receiver exactly once, with
/// the first error recorded (if any) or `Ok(())` if every slave acked.
pub struct WaitingTask {
    waiting_rpc_count: AtomicI64,
    error: Mutex<Option<Error>>,
    done: Mutex<Option<flume::Sender<Result<()>>>>,
}

impl WaitingTask {
    pub fn new(expected: i64) -> (Arc<Self>, flume::Receiver<Result<()>>) {
        let (tx, rx) = flume::bounded(1);
        (
            Arc::new(Self {
                waiting_rpc_count: AtomicI64::new(expected),
                error: Mutex::new(None),
                done: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub fn waiting_rpc_count(&self) -> i64 {
        self.waiting_rpc_count.load(Ordering::Acquire)
    }

    fn record_error(&self, err: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Called once per slave that is never going to ack (inactive skip,
    /// ack received, or ack timeout) — `decrement waiting_rpc_count ...
    /// when it hits zero, wake the parked task` (spec.md §4.F ack path).
    pub fn complete_one(&self) {
        if self.waiting_rpc_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(tx) = self.done.lock().take() {
                let result = match self.error.lock().take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                let _ = tx.send(result);
            }
        }
    }
}

/// One mutating write's fan-out unit, shared (via `Arc`) across every
/// replication channel it was pushed onto.
pub struct RpcEntry {
    pub data_version: u64,
    reffer_count: AtomicI64,
    task: Arc<WaitingTask>,
}

impl RpcEntry {
    pub fn new(data_version: u64, initial_reffer_count: i64, task: Arc<WaitingTask>) -> Self {
        Self {
            data_version,
            reffer_count: AtomicI64::new(initial_reffer_count),
            task,
        }
    }

    /// `reffer_count(rpc) = count of slaves still to ack` (spec.md §8
    /// property 5).
    pub fn reffer_count(&self) -> i64 {
        self.reffer_count.load(Ordering::Acquire)
    }

    pub fn dec_reffer_count(&self, by: i64) {
        self.reffer_count.fetch_sub(by, Ordering::AcqRel);
    }

    /// A slave's successful ack for this entry.
    pub fn ack(&self) {
        self.dec_reffer_count(1);
        self.task.complete_one();
    }

    /// The channel's ack timeout reaped this entry before it acked.
    pub fn fail_timeout(&self) {
        self.dec_reffer_count(1);
        self.task.record_error(Error::Transport(format!(
            "ack timeout awaiting slave reply for data_version {}",
            self.data_version
        )));
        self.task.complete_one();
    }
}
