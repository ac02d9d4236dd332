//! A slave DataServer as seen by the master: its liveness status and
//! the fixed set of replication channels to it (spec.md §4.F, grounded
//! on `cluster_topology.c`'s `FS_SERVER_STATUS_*` states and
//! `replica.notify` condition variable).

use crate::rpc::RpcEntry;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Active,
    /// Transitioning; callers wait on [`Slave::wait_while_online`]
    /// until this leaves `Online`.
    Online,
    Offline,
}

struct PendingAck {
    rpc: Arc<RpcEntry>,
    deadline: Instant,
}

/// One outbound link to a slave. Channel selection is
/// `channels[H(data_group_id) mod channel_count]` (spec.md §4.F step 3).
pub struct Channel {
    ready: AtomicBool,
    outbound: Mutex<VecDeque<Arc<RpcEntry>>>,
    outbound_ready: Condvar,
    pending: Mutex<HashMap<u64, PendingAck>>,
    ack_timeout: Duration,
}

impl Channel {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            ready: AtomicBool::new(true),
            outbound: Mutex::new(VecDeque::new()),
            outbound_ready: Condvar::new(),
            pending: Mutex::new(HashMap::new()),
            ack_timeout,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Pushes `rpc` onto the outbound queue and records it as awaiting
    /// an ack; wakes the channel's event-loop thread if the queue was
    /// empty (spec.md §4.F step 3).
    pub fn push(&self, rpc: Arc<RpcEntry>) {
        self.pending.lock().insert(
            rpc.data_version,
            PendingAck {
                rpc: rpc.clone(),
                deadline: Instant::now() + self.ack_timeout,
            },
        );
        let mut queue = self.outbound.lock();
        let was_empty = queue.is_empty();
        queue.push_back(rpc);
        if was_empty {
            self.outbound_ready.notify_one();
        }
    }

    /// Blocks the calling event-loop thread until an RPC is available,
    /// or `timeout` elapses.
    pub fn pop_wait(&self, timeout: Duration) -> Option<Arc<RpcEntry>> {
        let mut queue = self.outbound.lock();
        if queue.is_empty() {
            let result = self.outbound_ready.wait_for(&mut queue, timeout);
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
        queue.pop_front()
    }

    pub fn pop(&self) -> Option<Arc<RpcEntry>> {
        self.outbound.lock().pop_front()
    }

    /// Records a slave's `ack(data_version, result)`; finds the pending
    /// RPC in the result-ring and completes it. Returns `false` if no
    /// such pending ack existed (duplicate or already-reaped ack).
    pub fn ack(&self, data_version: u64) -> bool {
        let pending = self.pending.lock().remove(&data_version);
        match pending {
            Some(entry) => {
                entry.rpc.ack();
                true
            }
            None => false,
        }
    }

    /// Reaps every ack that has timed out, failing its task with a
    /// transport error (spec.md §4.F "A missing or late ack is reaped
    /// by the channel timeout and surfaced as EIO").
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<u64> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(k, _)| *k)
                .collect()
        };
        let mut reaped = 0;
        let mut pending = self.pending.lock();
        for key in expired {
            if let Some(entry) = pending.remove(&key) {
                entry.rpc.fail_timeout();
                reaped += 1;
            }
        }
        reaped
    }
}

pub struct Slave {
    pub id: u64,
    status: Mutex<Status>,
    status_changed: Condvar,
    channels: Vec<Channel>,
    rr: AtomicUsize,
}

impl Slave {
    pub fn new(id: u64, channel_count: usize, ack_timeout: Duration) -> Self {
        let mut channels = Vec::with_capacity(channel_count.max(1));
        channels.resize_with(channel_count.max(1), || Channel::new(ack_timeout));
        Self {
            id,
            status: Mutex::new(Status::Active),
            status_changed: Condvar::new(),
            channels,
            rr: AtomicUsize::new(0),
        }
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn set_status(&self, status: Status) {
        *self.status.lock() = status;
        self.status_changed.notify_all();
    }

    /// Waits until this slave's status leaves `Online`, re-checking on
    /// every wake. `running` lets the caller break out on shutdown, as
    /// the original checks `SF_G_CONTINUE_FLAG` in its wait loop.
    pub fn wait_while_online(&self, running: &AtomicBool) -> Status {
        let mut status = self.status.lock();
        while *status == Status::Online && running.load(Ordering::Relaxed) {
            self.status_changed.wait(&mut status);
        }
        *status
    }

    pub fn channel(&self, hash_code: u32) -> &Channel {
        &self.channels[(hash_code as usize) % self.channels.len()]
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::WaitingTask;

    #[test]
    fn channel_push_and_ack_completes_task() {
        let channel = Channel::new(Duration::from_secs(5));
        let (task, rx) = WaitingTask::new(1);
        let rpc = Arc::new(RpcEntry::new(7, 1, task));
        channel.push(rpc);

        assert!(channel.ack(7));
        let result = rx.try_recv().expect("task should complete after single ack");
        assert!(result.is_ok());
    }

    #[test]
    fn unknown_ack_is_rejected() {
        let channel = Channel::new(Duration::from_secs(5));
        assert!(!channel.ack(999));
    }

    #[test]
    fn expired_ack_fails_with_transport_error() {
        let channel = Channel::new(Duration::from_millis(1));
        let (task, rx) = WaitingTask::new(1);
        let rpc = Arc::new(RpcEntry::new(3, 1, task));
        channel.push(rpc);
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(channel.reap_expired(), 1);
        let result = rx.try_recv().expect("reap should complete the task");
        assert!(result.is_err());
    }
}
