//! `push_to_slave_queues` (spec.md §4.F), the master-side fan-out that
//! runs after a local slice-op succeeds.

use crate::rpc::{RpcEntry, WaitingTask};
use crate::slave::{Slave, Status};
use faststore_common::Result;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub struct DataGroup {
    pub id: u32,
    pub slaves: Vec<Arc<Slave>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// No slaves, or every fan-out slave was immediately accounted for
    /// (all inactive) — the caller replies now.
    Complete,
    /// At least one slave is still expected to ack; the caller parks
    /// on `PushResult::completion`.
    Continue,
}

pub struct PushResult {
    pub outcome: PushOutcome,
    pub completion: flume::Receiver<Result<()>>,
    pub inactive_count: usize,
}

/// Fans `data_version` out to every slave in `group`. `journal` is
/// called synchronously before the first `ONLINE`-status wait, so the
/// data-update is durable before this thread blocks (spec.md §4.F step
/// 3: "journal the data-update so no deadlock forms against the
/// journal writer").
pub fn push_to_slave_queues(
    group: &DataGroup,
    data_version: u64,
    hash_code: u32,
    running: &AtomicBool,
    mut journal: impl FnMut(),
) -> PushResult {
    let slave_count = group.slaves.len() as i64;
    let (task, completion) = WaitingTask::new(slave_count);

    if group.slaves.is_empty() {
        return PushResult {
            outcome: PushOutcome::Complete,
            completion,
            inactive_count: 0,
        };
    }

    let rpc = Arc::new(RpcEntry::new(data_version, slave_count, task.clone()));
    let mut inactive_count: i64 = 0;
    let mut journaled = false;

    for slave in &group.slaves {
        let mut status = slave.status();
        if status == Status::Online {
            if !journaled {
                journal();
                journaled = true;
            }
            status = slave.wait_while_online(running);
        }

        if status != Status::Active {
            log::info!("peer {} inactive (status {:?}); skipping replication", slave.id, status);
            inactive_count += 1;
            continue;
        }

        let channel = slave.channel(hash_code);
        if !channel.is_ready() {
            slave.set_status(Status::Offline);
            log::warn!(
                "replica channel for peer {} not established; skipping data_version {}",
                slave.id,
                data_version
            );
            inactive_count += 1;
            continue;
        }

        channel.push(rpc.clone());
    }

    if inactive_count > 0 {
        rpc.dec_reffer_count(inactive_count);
        for _ in 0..inactive_count {
            task.complete_one();
        }
    }

    let outcome = if task.waiting_rpc_count() <= 0 {
        PushOutcome::Complete
    } else {
        PushOutcome::Continue
    };

    PushResult {
        outcome,
        completion,
        inactive_count: inactive_count as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn group_with(statuses: &[Status]) -> DataGroup {
        let slaves = statuses
            .iter()
            .enumerate()
            .map(|(i, &status)| {
                let slave = Slave::new(i as u64, 1, Duration::from_secs(5));
                slave.set_status(status);
                Arc::new(slave)
            })
            .collect();
        DataGroup { id: 1, slaves }
    }

    #[test]
    fn no_slaves_completes_immediately() {
        let group = DataGroup { id: 1, slaves: Vec::new() };
        let running = AtomicBool::new(true);
        let result = push_to_slave_queues(&group, 1, 0, &running, || {});
        assert_eq!(result.outcome, PushOutcome::Complete);
    }

    #[test]
    fn s5_one_inactive_slave_still_completes_on_two_acks() {
        let group = group_with(&[Status::Active, Status::Active, Status::Offline]);
        let running = AtomicBool::new(true);
        let result = push_to_slave_queues(&group, 42, 0, &running, || {});
        assert_eq!(result.outcome, PushOutcome::Continue);
        assert_eq!(result.inactive_count, 1);

        let active_slaves: Vec<_> = group
            .slaves
            .iter()
            .filter(|s| s.status() == Status::Active)
            .collect();
        assert_eq!(active_slaves.len(), 2);

        for slave in &active_slaves {
            let channel = slave.channel(0);
            let rpc = channel.pop().expect("active slave should have a queued rpc");
            assert!(channel.ack(rpc.data_version));
        }

        let final_result = result
            .completion
            .recv_timeout(Duration::from_millis(200))
            .expect("task completes once both active slaves ack");
        assert!(final_result.is_ok());
    }

    #[test]
    fn not_ready_channel_marks_slave_offline() {
        let group = group_with(&[Status::Active]);
        group.slaves[0].channel(0).set_ready(false);
        let running = AtomicBool::new(true);
        let result = push_to_slave_queues(&group, 1, 0, &running, || {});
        assert_eq!(result.outcome, PushOutcome::Complete);
        assert_eq!(group.slaves[0].status(), Status::Offline);
    }
}
