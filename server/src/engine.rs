//! The `Engine` context (spec.md §9 "reify as an explicit Engine
//! context"): owns one instance of every core subsystem and provides
//! the handful of entry points the out-of-scope network framework would
//! call into (spec.md §1). This mirrors how `forest-daemon`'s `main.rs`
//! assembles `Arc<ChainSyncer>`/`Arc<StateManager>`/… into one context
//! before serving requests.

use faststore_client::{CombineEngine, CombineOutcome, Transport, WriteContext};
use faststore_common::config::Config;
use faststore_common::{BlockKey, Result};
use faststore_htable::ShardedTableConfig as HtableShardedConfig;
use faststore_recovery::{DataRecovery, LocalVersion};
use faststore_replication::{push_to_slave_queues, DataGroup, PushOutcome, PushResult};
use faststore_storage::{ObjectBlockIndex, StorageEngine, TrunkPool};
use faststore_topology::Notifier;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Stands in for the real RPC transport (spec.md §1: "the generic
/// network framework" is out of scope for this core). Logs what would
/// have been sent so `CombineEngine` has a concrete sink to flush into
/// without this crate inventing a wire protocol client.
struct LoggingTransport;

impl Transport for LoggingTransport {
    fn send(&self, slice: &faststore_client::SliceEntry) -> Result<()> {
        log::debug!(
            "transport stub: would send slice block={:?} range={:?} bytes={}",
            slice.block,
            slice.slice,
            slice.buffer.len()
        );
        Ok(())
    }
}

/// Per-data-group `data_version` watermark recovery advances (spec.md
/// §4.G). A real deployment persists this alongside the group's own
/// binlog; kept in memory here since durable placement is a network/
/// cluster-membership concern out of this crate's scope.
struct GroupVersion(AtomicU64);

impl LocalVersion for GroupVersion {
    fn data_version(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn set_data_version(&self, version: u64) {
        self.0.store(version, Ordering::Release);
    }
}

/// Ties every core subsystem together behind the operations a caller
/// above this crate (the network framework) actually needs: a client
/// write, a replication fan-out, and a recovery run for one data group.
pub struct Engine {
    pub config: Config,
    pub data_path: PathBuf,
    combine: CombineEngine,
    storage: StorageEngine,
    topology: Notifier,
    groups: Vec<DataGroup>,
    group_versions: Vec<GroupVersion>,
    running: AtomicBool,
}

impl Engine {
    pub fn new(config: Config, data_path: PathBuf, server_count: usize) -> Self {
        let group_count = config.data_group_count.max(1) as usize;
        let alloc_shard_count = faststore_alloc::DEFAULT_SHARD_COUNT;

        let combine = CombineEngine::new(
            config.write_combine.clone(),
            HtableShardedConfig::from(config.otid.clone()),
            HtableShardedConfig::from(config.opid.clone()),
            alloc_shard_count,
            Arc::new(LoggingTransport),
        );
        let storage = StorageEngine::new(
            ObjectBlockIndex::new(alloc_shard_count),
            TrunkPool::new(data_path.join("trunks")),
        );
        let topology = Notifier::new(group_count, server_count.max(1));
        let groups = (0..group_count)
            .map(|i| DataGroup {
                id: i as u32 + 1,
                slaves: Vec::new(),
            })
            .collect();
        let group_versions = (0..group_count).map(|_| GroupVersion(AtomicU64::new(0))).collect();

        Self {
            config,
            data_path,
            combine,
            storage,
            topology,
            groups,
            group_versions,
            running: AtomicBool::new(true),
        }
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn topology(&self) -> &Notifier {
        &self.topology
    }

    /// `fs_slice_write`'s caller-facing entry point: runs the write
    /// through the combine engine (spec.md §4.C), exactly what the
    /// `SLICE_WRITE` RPC handler would call.
    pub fn combine_write(&self, ctx: WriteContext) -> Result<CombineOutcome> {
        self.combine.combine_write(ctx)
    }

    /// Routes `block` to its owning [`DataGroup`] via the same
    /// `data_group_id` hash clients and the original server use
    /// (spec.md §3).
    fn data_group_index(&self, block: &BlockKey) -> usize {
        (block.data_group_id(self.groups.len().max(1) as u32) - 1) as usize
    }

    /// Fans `data_version` out to the data group owning `block` (spec.md
    /// §4.F), called after a local slice-op succeeds on the master.
    pub fn replicate(&self, block: &BlockKey, data_version: u64, hash_code: u32) -> PushResult {
        let idx = self.data_group_index(block);
        push_to_slave_queues(&self.groups[idx], data_version, hash_code, &self.running, || {
            log::trace!("journaled data_version {data_version} before parking on replication");
        })
    }

    /// Runs a recovery pass for `data_group_id` against `master`
    /// (spec.md §4.G), threaded per `config.recovery`.
    pub fn run_recovery(&self, data_group_id: u32, master: &dyn faststore_recovery::BinlogSource) -> Result<()> {
        let idx = (data_group_id as usize).saturating_sub(1).min(self.group_versions.len().saturating_sub(1));
        let recovery = DataRecovery {
            data_group_id,
            data_path: self.data_path.clone(),
            threads_per_data_group: self.config.recovery.threads_per_data_group,
            max_queue_depth: self.config.recovery.max_queue_depth,
            engine: &self.storage,
            local_version: &self.group_versions[idx],
        };
        recovery.run(master)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_wires_every_subsystem_from_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let engine = Engine::new(config, dir.path().to_path_buf(), 1);

        assert_eq!(engine.groups.len(), 1);
        assert_eq!(engine.group_versions.len(), 1);
        assert!(engine.topology().peer(0).is_some());

        let outcome = engine
            .combine_write(WriteContext {
                otid: 1,
                opid: 1,
                block: BlockKey::new(1, 0),
                offset: 0,
                payload: b"hello".to_vec(),
            })
            .unwrap();
        assert!(!outcome.combined, "first write on a fresh OTID starts a new slice");
    }

    #[test]
    fn replicate_with_no_slaves_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(Config::default(), dir.path().to_path_buf(), 1);
        let result = engine.replicate(&BlockKey::new(1, 0), 1, 7);
        assert_eq!(result.outcome, PushOutcome::Complete);
    }
}
