//! Per-data-group delayed decisions (spec.md §9 Open Questions, grounded
//! on `cluster_topology.c`'s `cluster_topology_set_check_master_flags` /
//! `cluster_topology_check_master` / `check_and_make_delay_decisions`).
//!
//! The original arms a 3-second "check master" decision on every data
//! group that has a master, then later resolves it. Its resolution
//! branch is a dangling `if (expire_time >= now) {}` with an empty body
//! followed by an unconditional `return EAGAIN`, so in the original
//! binary the decision never actually resolves. We implement the
//! documented half — return "not yet decided" while the delay hasn't
//! expired — and, once it has, clear the decision to `NoOp` rather than
//! inventing a master-reselection policy the source never encoded (see
//! DESIGN.md).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

const CHECK_MASTER_DELAY_SECS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayAction {
    NoOp,
    CheckMaster,
    SelectMaster,
}

#[derive(Debug, Clone, Copy)]
struct GroupDelay {
    action: DelayAction,
    expire_time: i64,
}

impl Default for GroupDelay {
    fn default() -> Self {
        Self {
            action: DelayAction::NoOp,
            expire_time: 0,
        }
    }
}

/// Owns the per-data-group delay-decision array and its running count,
/// driven by the same background tick that drains [`super::Notifier`]'s
/// peer queues.
pub struct DelayDecisions {
    groups: Mutex<Vec<GroupDelay>>,
    count: AtomicI64,
}

impl DelayDecisions {
    pub fn new(data_group_count: usize) -> Self {
        Self {
            groups: Mutex::new(vec![GroupDelay::default(); data_group_count]),
            count: AtomicI64::new(0),
        }
    }

    /// `cluster_topology_set_check_master_flags`: resets every group's
    /// decision and arms `CheckMaster` on every group that currently has
    /// a master, expiring `CHECK_MASTER_DELAY_SECS` from `now`. Groups
    /// with no master are cleared to `NoOp`.
    pub fn set_check_master_flags(&self, now: i64, has_master: &[bool]) {
        let old_count = self.count.swap(0, Ordering::AcqRel);

        let mut groups = self.groups.lock();
        let mut new_count = 0i64;
        for (group, &has_master) in groups.iter_mut().zip(has_master) {
            if !has_master {
                group.action = DelayAction::NoOp;
                continue;
            }
            group.action = DelayAction::CheckMaster;
            group.expire_time = now + CHECK_MASTER_DELAY_SECS;
            new_count += 1;
        }
        drop(groups);

        if new_count > 0 {
            self.count.fetch_add(new_count, Ordering::AcqRel);
        }
        log::info!("check-master flags reset: old_count={old_count}, new_count={new_count}");
    }

    /// `check_and_make_delay_decisions`: resolves every armed decision it
    /// can, returning the number resolved this pass.
    pub fn check_and_make_delay_decisions(&self, now: i64) -> usize {
        if self.count.load(Ordering::Acquire) == 0 {
            return 0;
        }

        let mut groups = self.groups.lock();
        let mut done = 0usize;
        for group in groups.iter_mut() {
            let resolved = match group.action {
                DelayAction::NoOp => false,
                DelayAction::CheckMaster => check_master(group, now),
                DelayAction::SelectMaster => select_master(group),
            };
            if resolved {
                done += 1;
            }
        }
        drop(groups);

        if done > 0 {
            self.count.fetch_sub(done as i64, Ordering::AcqRel);
        }
        done
    }

    #[cfg(test)]
    fn action(&self, dg_index: usize) -> DelayAction {
        self.groups.lock()[dg_index].action
    }
}

/// `cluster_topology_check_master`: "not yet decided" while the delay
/// hasn't expired; once it has, resolves to `NoOp`.
fn check_master(group: &mut GroupDelay, now: i64) -> bool {
    if now < group.expire_time {
        return false;
    }
    group.action = DelayAction::NoOp;
    true
}

/// `cluster_topology_select_master`: the original is a stub that always
/// succeeds immediately; nothing to supplement beyond that.
fn select_master(group: &mut GroupDelay) -> bool {
    group.action = DelayAction::NoOp;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arms_check_master_only_for_groups_with_a_master() {
        let decisions = DelayDecisions::new(2);
        decisions.set_check_master_flags(100, &[true, false]);
        assert_eq!(decisions.action(0), DelayAction::CheckMaster);
        assert_eq!(decisions.action(1), DelayAction::NoOp);
        assert_eq!(decisions.count.load(Ordering::Acquire), 1);
    }

    #[test]
    fn check_master_resolves_only_after_expiry() {
        let decisions = DelayDecisions::new(1);
        decisions.set_check_master_flags(100, &[true]);

        assert_eq!(decisions.check_and_make_delay_decisions(101), 0, "not yet expired");
        assert_eq!(decisions.action(0), DelayAction::CheckMaster);

        assert_eq!(decisions.check_and_make_delay_decisions(104), 1, "expired, resolves to NoOp");
        assert_eq!(decisions.action(0), DelayAction::NoOp);
        assert_eq!(decisions.count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn no_armed_decisions_is_a_cheap_no_op() {
        let decisions = DelayDecisions::new(3);
        assert_eq!(decisions.check_and_make_delay_decisions(1_000_000), 0);
    }
}
