//! Master-side replication fan-out: per-slave channels, RPC ack
//! accounting, and the `push_to_slave_queues` orchestration that ties
//! them together (spec.md §4.F).

pub mod caller;
pub mod rpc;
pub mod slave;

pub use caller::{push_to_slave_queues, DataGroup, PushOutcome, PushResult};
pub use rpc::{RpcEntry, WaitingTask};
pub use slave::{Channel, Slave, Status};
