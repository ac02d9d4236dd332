//! Per-data-group recovery: fetches the master's binlog tail, collapses
//! it to final state, and replays it against local storage (spec.md
//! §4.G), grounded on `data_recovery.c`/`binlog_replay.c`.

pub mod dedup;
pub mod driver;
pub mod fetch;
pub mod replay;
pub mod state;

pub use dedup::dedup_stage;
pub use driver::{recovery_base_dir, DataRecovery, LocalVersion};
pub use fetch::{init_recovery_dirs, BinlogSource};
pub use replay::{replay_stage, ReplayStats};
pub use state::{CatchUpStage, RecoveryState, Stage};
