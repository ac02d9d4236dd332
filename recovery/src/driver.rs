//! The per-data-group recovery state machine (spec.md §4.G, grounded on
//! `data_recovery.c`'s `data_recovery_start`/`do_data_recovery`):
//!
//! ```text
//! FETCH  ── fetched_bytes == 0 ──► CATCH_UP_STAGE
//! FETCH  ── fetched_bytes > 0  ──► DEDUP
//! DEDUP  ──► REPLAY
//! REPLAY ──► CATCH_UP_STAGE
//! CATCH_UP_STAGE: DOING → LAST_BATCH → DONE
//! ```

use crate::fetch::{fetch_binlog_path, fetch_stage, init_recovery_dirs, BinlogSource};
use crate::state::{CatchUpStage, RecoveryState, Stage};
use crate::{dedup, replay};
use faststore_common::binlog::{BinlogRecord, OpType, Source as RecSource};
use faststore_common::{BlockKey, Error, Result};
use faststore_storage::StorageEngine;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Scans the just-fetched binlog for the highest `data_version` record,
/// used to advance `RecoveryState::last_data_version`/`last_bkey` the
/// same way `data_recovery.c`'s fetch stage tracks `last_data_version`
/// as each record streams in.
fn last_fetched_record(fetch_dir: &Path) -> Result<Option<BinlogRecord>> {
    let path = fetch_binlog_path(fetch_dir);
    if !path.exists() {
        return Ok(None);
    }
    let file = std::fs::File::open(&path)?;
    let mut last = None;
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        last = Some(BinlogRecord::parse(&line)?);
    }
    Ok(last)
}

pub const SYS_DATA_FILENAME: &str = "data_recovery.dat";

/// Mirrors `group->myself->data_version`: the local replica's own
/// position, advanced by the replay stage and by `NO_OP` gap closing.
pub trait LocalVersion {
    fn data_version(&self) -> u64;
    fn set_data_version(&self, version: u64);
}

/// A recovery pass for one data group. Owns the storage engine its
/// replay stage writes into and the local replica's own binlog, to
/// which `NO_OP` gap-closing records are appended (spec.md §4.G "if the
/// last observed data_version exceeds our own, a NO_OP binlog record is
/// written to close the gap").
pub struct DataRecovery<'a> {
    pub data_group_id: u32,
    pub data_path: PathBuf,
    pub threads_per_data_group: usize,
    pub max_queue_depth: usize,
    pub engine: &'a StorageEngine,
    pub local_version: &'a dyn LocalVersion,
}

impl<'a> DataRecovery<'a> {
    fn sys_data_path(&self) -> PathBuf {
        self.data_path
            .join("recovery")
            .join(self.data_group_id.to_string())
            .join(SYS_DATA_FILENAME)
    }

    fn own_binlog_path(&self) -> PathBuf {
        self.data_path
            .join("binlog")
            .join(self.data_group_id.to_string())
            .join("binlog.log")
    }

    /// Appends a `NO_OP` record closing the gap up to `last_data_version`
    /// and advances the local replica's own `data_version` to match
    /// (`replica_binlog_set_data_version` + `replica_binlog_log_no_op`
    /// in the original).
    fn close_gap(&self, last_data_version: u64, last_bkey: BlockKey) -> Result<()> {
        if last_data_version <= self.local_version.data_version() {
            return Ok(());
        }

        let path = self.own_binlog_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let record = BinlogRecord {
            timestamp: 0,
            data_version: last_data_version,
            source: RecSource::Replay,
            op_type: OpType::NoOp,
            block: last_bkey,
            slice: None,
        };
        file.write_all(record.format().as_bytes())?;
        self.local_version.set_data_version(last_data_version);
        Ok(())
    }

    /// `next_catch_up_stage`: advances the catch-up sub-state and closes
    /// the data-version gap against the master's current position.
    fn next_catch_up_stage(
        &self,
        state: &mut RecoveryState,
        master: &dyn BinlogSource,
        catch_up: CatchUpStage,
    ) -> Result<CatchUpStage> {
        let next = match catch_up {
            CatchUpStage::Doing => CatchUpStage::LastBatch,
            CatchUpStage::LastBatch => CatchUpStage::Done,
            CatchUpStage::Done => CatchUpStage::Done,
        };

        let master_version = master.master_data_version(self.data_group_id)?;
        if state.last_data_version > self.local_version.data_version() {
            self.close_gap(state.last_data_version, state.last_bkey.unwrap_or(BlockKey::new(0, 0)))?;
        } else if master_version > self.local_version.data_version() {
            // Nothing fetched this round but the master has since moved
            // on; still close the gap so `data_version` tracks forward.
            self.close_gap(master_version, state.last_bkey.unwrap_or(BlockKey::new(0, 0)))?;
        }
        Ok(next)
    }

    /// Runs one `do_data_recovery` iteration: fetch (if not already
    /// past it) → dedup → replay → catch-up bookkeeping. Returns the
    /// catch-up stage reached, so the caller's loop
    /// (`data_recovery_start`) knows whether to iterate again.
    fn run_iteration(
        &self,
        state: &mut RecoveryState,
        master: &dyn BinlogSource,
        catch_up: CatchUpStage,
    ) -> Result<CatchUpStage> {
        let start = Instant::now();
        let (fetch_dir, replay_dir) = init_recovery_dirs(&self.data_path, self.data_group_id)?;

        if state.stage == Stage::Fetch {
            let fetched_bytes = fetch_stage(master, self.data_group_id, state.last_data_version, &fetch_dir)?;
            if fetched_bytes == 0 {
                return self.next_catch_up_stage(state, master, catch_up);
            }
            if let Some(last) = last_fetched_record(&fetch_dir)? {
                state.last_data_version = last.data_version;
                state.last_bkey = Some(last.block);
            }
            state.stage = Stage::Dedup;
            state.save(&self.sys_data_path())?;
        }

        let mut replayed_any = true;
        if state.stage == Stage::Dedup {
            let record_count = dedup::dedup_stage(master, &fetch_dir, &replay_dir)?;
            state.stage = Stage::Replay;
            state.save(&self.sys_data_path())?;
            replayed_any = record_count > 0;
        }

        if state.stage == Stage::Replay && replayed_any {
            let stats = replay::replay_stage(
                self.engine,
                &replay_dir,
                self.threads_per_data_group,
                self.max_queue_depth,
            )?;
            log::info!(
                "data group {}: replay done, writes={} allocs={} deletes={} fails={}",
                self.data_group_id,
                stats.write_count,
                stats.allocate_count,
                stats.delete_count,
                stats.fail_count
            );
            if stats.fail_count > 0 {
                return Err(Error::Invalid(format!(
                    "recovery replay for data group {} had {} failed records",
                    self.data_group_id, stats.fail_count
                )));
            }
        }

        if matches!(catch_up, CatchUpStage::Doing) && start.elapsed() >= std::time::Duration::from_secs(1) {
            return Ok(catch_up);
        }
        self.next_catch_up_stage(state, master, catch_up)
    }

    /// `data_recovery_start`: runs iterations until `CatchUpStage::Done`,
    /// then unlinks the persisted stage file. Resumable: a crash mid-run
    /// picks up from the persisted `Stage` on the next call via
    /// `RecoveryState::load_or_init` (spec.md §8 property 7).
    pub fn run(&self, master: &dyn BinlogSource) -> Result<()> {
        let sys_path = self.sys_data_path();
        let mut state = RecoveryState::load_or_init(&sys_path)?;
        let mut catch_up = CatchUpStage::Doing;

        loop {
            catch_up = self.run_iteration(&mut state, master, catch_up)?;
            state.stage = Stage::Fetch;
            if matches!(catch_up, CatchUpStage::Done) {
                break;
            }
        }

        RecoveryState::unlink(&sys_path)
    }
}

pub fn recovery_base_dir(data_path: &Path, data_group_id: u32) -> PathBuf {
    data_path.join("recovery").join(data_group_id.to_string())
}
