//! Per-peer data-server-status event notification and check-master
//! scheduling (spec.md §4.H), grounded on `cluster_topology.c`.

pub mod delay_decision;
pub mod notifier;

pub use delay_decision::{DelayAction, DelayDecisions};
pub use notifier::{DataServerHandle, DataServerStatusRecord, Notifier, PeerNotifyContext};
