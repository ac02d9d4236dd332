//! Per-peer coalesced data-server-status fan-out (spec.md §4.H, grounded
//! on `cluster_topology.c`'s `cluster_topology_init_notify_ctx` /
//! `cluster_topology_data_server_chg_notify` / `process_notify_events`).
//!
//! Each connected peer gets its own flat `events[data_group_count ×
//! server_count]` array so one peer's already-queued event never blocks
//! another peer's notification of the same change. `in_queue` is a CAS
//! latch: a second change landing before the first has drained is a
//! no-op, so bursts coalesce into a single pending event per peer.

use crate::delay_decision::DelayDecisions;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The live fields of a DataServer, read fresh at drain time rather than
/// snapshotted at notify time — a second status change before the first
/// drains is exactly what `in_queue` is for.
pub trait DataServerHandle: Send + Sync {
    fn data_group_id(&self) -> u32;
    fn server_id(&self) -> u32;
    fn is_master(&self) -> bool;
    fn status(&self) -> u8;
    fn data_version(&self) -> u64;
}

/// The wire-level projection of a [`DataServerHandle`], matching
/// `FSProtoPushDataServerStatusBodyPart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataServerStatusRecord {
    pub data_group_id: u32,
    pub server_id: u32,
    pub is_master: bool,
    pub status: u8,
    pub data_version: u64,
}

struct Event {
    handle: Option<Arc<dyn DataServerHandle>>,
    in_queue: AtomicBool,
}

impl Event {
    fn empty() -> Self {
        Self {
            handle: None,
            in_queue: AtomicBool::new(false),
        }
    }
}

/// One connected peer's outbound notify context (`cs->notify_ctx` in the
/// original). `server_index` is this peer's index into the cluster's
/// server array.
pub struct PeerNotifyContext {
    pub server_index: usize,
    server_count: usize,
    is_leader: AtomicBool,
    active: AtomicBool,
    task_idle: AtomicBool,
    events: Vec<Event>,
    queue: Mutex<VecDeque<usize>>,
}

impl PeerNotifyContext {
    fn new(server_index: usize, data_group_count: usize, server_count: usize) -> Self {
        let mut events = Vec::with_capacity(data_group_count * server_count);
        events.resize_with(data_group_count * server_count, Event::empty);
        Self {
            server_index,
            server_count,
            is_leader: AtomicBool::new(false),
            active: AtomicBool::new(true),
            task_idle: AtomicBool::new(true),
            events,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::Release);
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Marks the peer's outbound task buffer busy/idle, mirroring the
    /// `ctx->task->offset == 0 && ctx->task->length == 0` guard in
    /// `process_notify_events` — the network layer above this crate
    /// owns the real task buffer and toggles this around sends.
    pub fn mark_task_busy(&self) {
        self.task_idle.store(false, Ordering::Release);
    }

    pub fn mark_task_idle(&self) {
        self.task_idle.store(true, Ordering::Release);
    }

    fn latch(&self, dg_index: usize, origin_server_index: usize) -> Option<bool> {
        let idx = dg_index * self.server_count + origin_server_index;
        let event = self.events.get(idx)?;
        event.handle.as_ref()?;
        if event
            .in_queue
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Some(false); // already queued; this burst coalesces
        }
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.push_back(idx);
        Some(was_empty)
    }

    /// `process_notify_events`: pops every pending event, serializes it
    /// against its handle's *current* fields, and releases `in_queue`
    /// only after serialization so a concurrent producer re-latches any
    /// change that lands mid-drain. Returns `None` if the task buffer is
    /// still busy (`EBUSY`) or nothing is queued.
    pub fn try_drain(&self) -> Option<Vec<DataServerStatusRecord>> {
        if !self.task_idle.load(Ordering::Acquire) {
            return None;
        }
        let indices: Vec<usize> = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                return None;
            }
            queue.drain(..).collect()
        };

        let mut records = Vec::with_capacity(indices.len());
        for idx in indices {
            let event = &self.events[idx];
            if let Some(handle) = &event.handle {
                records.push(DataServerStatusRecord {
                    data_group_id: handle.data_group_id(),
                    server_id: handle.server_id(),
                    is_master: handle.is_master(),
                    status: handle.status(),
                    data_version: handle.data_version(),
                });
            }
            event.in_queue.store(false, Ordering::Release);
        }
        Some(records)
    }
}

/// `cluster_topology_init_notify_ctx` generalized to own every peer's
/// context plus the cluster-wide protocol version counter.
pub struct Notifier {
    data_group_count: usize,
    server_count: usize,
    peers: Vec<PeerNotifyContext>,
    current_version: std::sync::atomic::AtomicU64,
    delay: DelayDecisions,
}

impl Notifier {
    pub fn new(data_group_count: usize, server_count: usize) -> Self {
        let peers = (0..server_count)
            .map(|i| PeerNotifyContext::new(i, data_group_count, server_count))
            .collect();
        Self {
            data_group_count,
            server_count,
            peers,
            current_version: std::sync::atomic::AtomicU64::new(0),
            delay: DelayDecisions::new(data_group_count),
        }
    }

    /// `cluster_topology_set_check_master_flags`, see
    /// [`DelayDecisions::set_check_master_flags`].
    pub fn set_check_master_flags(&self, now: i64, has_master: &[bool]) {
        self.delay.set_check_master_flags(now, has_master);
    }

    /// `cluster_topology_check_and_make_delay_decisions`, see
    /// [`DelayDecisions::check_and_make_delay_decisions`].
    pub fn check_and_make_delay_decisions(&self, now: i64) -> usize {
        self.delay.check_and_make_delay_decisions(now)
    }

    pub fn peer(&self, server_index: usize) -> Option<&PeerNotifyContext> {
        self.peers.get(server_index)
    }

    pub fn bump_version(&self) -> u64 {
        self.current_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::Acquire)
    }

    /// Binds `handle` into every peer's event table at
    /// `(dg_index, server_index)`, matching `find_data_group_server`
    /// being resolved once per peer context at startup.
    pub fn bind(&mut self, dg_index: usize, server_index: usize, handle: Arc<dyn DataServerHandle>) {
        let idx = dg_index * self.server_count + server_index;
        for peer in &mut self.peers {
            if let Some(event) = peer.events.get_mut(idx) {
                event.handle = Some(handle.clone());
            }
        }
    }

    /// `cluster_topology_data_server_chg_notify`: fans a status change
    /// on `(dg_index, origin_server_index)` out to every active peer
    /// except the leader, and the origin itself unless `notify_self`.
    /// Returns the server indices whose event-loop thread needs waking
    /// (queue transitioned empty → non-empty).
    pub fn data_server_chg_notify(
        &self,
        dg_index: usize,
        origin_server_index: usize,
        notify_self: bool,
    ) -> Vec<usize> {
        let mut woken = Vec::new();
        for peer in &self.peers {
            if peer.is_leader.load(Ordering::Acquire) {
                continue;
            }
            if !notify_self && peer.server_index == origin_server_index {
                continue;
            }
            if !peer.active.load(Ordering::Acquire) {
                continue;
            }
            if let Some(true) = peer.latch(dg_index, origin_server_index) {
                woken.push(peer.server_index);
            }
        }
        woken
    }

    /// `cluster_topology_sync_all_data_servers`: latches every data
    /// server not hosted by `peer_server_index` into that peer's queue,
    /// used to bring a freshly (re)connected peer fully up to date.
    pub fn sync_all_data_servers(&self, peer_server_index: usize) {
        let Some(peer) = self.peers.iter().find(|p| p.server_index == peer_server_index) else {
            return;
        };
        for dg_index in 0..self.data_group_count {
            for origin_server_index in 0..self.server_count {
                if origin_server_index == peer_server_index {
                    continue;
                }
                peer.latch(dg_index, origin_server_index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct FakeDs {
        dg_id: u32,
        server_id: u32,
        is_master: AtomicBool,
        status: AtomicU64,
        version: AtomicU64,
    }

    impl DataServerHandle for FakeDs {
        fn data_group_id(&self) -> u32 {
            self.dg_id
        }
        fn server_id(&self) -> u32 {
            self.server_id
        }
        fn is_master(&self) -> bool {
            self.is_master.load(Ordering::Relaxed)
        }
        fn status(&self) -> u8 {
            self.status.load(Ordering::Relaxed) as u8
        }
        fn data_version(&self) -> u64 {
            self.version.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn burst_of_changes_coalesces_into_one_pending_event() {
        let mut notifier = Notifier::new(1, 3);
        let ds = Arc::new(FakeDs {
            dg_id: 1,
            server_id: 1,
            is_master: AtomicBool::new(false),
            status: AtomicU64::new(0),
            version: AtomicU64::new(0),
        });
        notifier.bind(0, 0, ds.clone());

        let woken_first = notifier.data_server_chg_notify(0, 0, true);
        assert_eq!(woken_first, vec![0, 1, 2], "notify_self=true wakes every active peer, origin included");

        let woken_second = notifier.data_server_chg_notify(0, 0, true);
        assert!(woken_second.is_empty(), "still undrained, so the burst coalesces");

        ds.version.store(5, Ordering::Relaxed);
        let records = notifier.peer(1).unwrap().try_drain().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data_version, 5, "drain reads the live field, not a notify-time snapshot");

        let woken_third = notifier.data_server_chg_notify(0, 0, true);
        assert_eq!(woken_third, vec![1], "only the drained peer re-latches; the others are still pending");
    }

    #[test]
    fn leader_and_origin_are_skipped() {
        let mut notifier = Notifier::new(1, 2);
        notifier.peer(0).unwrap().set_leader(true);
        let ds = Arc::new(FakeDs {
            dg_id: 1,
            server_id: 1,
            is_master: AtomicBool::new(true),
            status: AtomicU64::new(1),
            version: AtomicU64::new(1),
        });
        notifier.bind(0, 1, ds);

        let woken = notifier.data_server_chg_notify(0, 1, false);
        assert!(woken.is_empty(), "peer 0 is the leader, peer 1 is the origin with notify_self=false");
    }

    #[test]
    fn sync_all_data_servers_latches_every_other_server() {
        let mut notifier = Notifier::new(1, 3);
        let ds0 = Arc::new(FakeDs {
            dg_id: 1,
            server_id: 0,
            is_master: AtomicBool::new(false),
            status: AtomicU64::new(0),
            version: AtomicU64::new(0),
        });
        let ds2 = Arc::new(FakeDs {
            dg_id: 1,
            server_id: 2,
            is_master: AtomicBool::new(false),
            status: AtomicU64::new(0),
            version: AtomicU64::new(0),
        });
        notifier.bind(0, 0, ds0);
        notifier.bind(0, 2, ds2);

        notifier.sync_all_data_servers(1);
        let records = notifier.peer(1).unwrap().try_drain().unwrap();
        assert_eq!(records.len(), 2, "server 1 gets synced for servers 0 and 2, not itself");
    }

    #[test]
    fn busy_task_buffer_defers_drain() {
        let mut notifier = Notifier::new(1, 2);
        let ds = Arc::new(FakeDs {
            dg_id: 1,
            server_id: 0,
            is_master: AtomicBool::new(false),
            status: AtomicU64::new(0),
            version: AtomicU64::new(0),
        });
        notifier.bind(0, 0, ds);
        notifier.data_server_chg_notify(0, 0, true);

        let peer = notifier.peer(1).unwrap();
        peer.mark_task_busy();
        assert!(peer.try_drain().is_none());
        peer.mark_task_idle();
        assert!(peer.try_drain().is_some());
    }
}
