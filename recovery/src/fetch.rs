//! FETCH stage (spec.md §4.G "Fetch streams the master's binlog range
//! into a local subdirectory"). The actual RPC to the master is an
//! external collaborator (spec.md §1 "the generic network framework");
//! this module only defines the boundary `BinlogSource` trait the
//! driver fetches through, plus the local subdirectory bookkeeping
//! grounded on `data_recovery.c`'s `init_recovery_sub_path`.

use faststore_common::{BlockKey, Result, SliceKey};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const FETCH_SUBDIR: &str = "fetch";
pub const REPLAY_SUBDIR: &str = "replay";
pub const FETCH_BINLOG_FILENAME: &str = "binlog.log";

/// The master-side collaborator recovery fetches from. Implementations
/// live above this crate, where the real RPC client lives; this crate
/// only consumes the interface (spec.md §1 "explicitly out of scope").
pub trait BinlogSource {
    /// The master's current `data_version` for `data_group_id`, used to
    /// decide whether a `NO_OP` gap-closing record is needed once
    /// fetch/replay catches up (spec.md §4.G "CATCH_UP").
    fn master_data_version(&self, data_group_id: u32) -> Result<u64>;

    /// Appends every binlog record for `data_group_id` strictly after
    /// `after_data_version` to `dest`, as binlog text lines (spec.md
    /// §6). Returns the number of bytes written.
    fn fetch_binlog_range(
        &self,
        data_group_id: u32,
        after_data_version: u64,
        dest: &mut dyn Write,
    ) -> Result<u64>;

    /// Reads the master's *current* bytes for `block`'s `slice` range,
    /// used by the dedup stage to materialize payload for the records
    /// that survive deduplication (spec.md §9 Open Questions item 3:
    /// "the dedup stage materialises payload bytes into a staging file
    /// indexed by data_version").
    fn fetch_slice_payload(&self, block: BlockKey, slice: SliceKey) -> Result<Vec<u8>>;
}

/// `init_recovery_sub_path`: ensures `<data_path>/recovery/<group_id>/
/// {fetch,replay}/` both exist, matching spec.md §6's persisted layout.
pub fn init_recovery_dirs(data_path: &Path, data_group_id: u32) -> Result<(PathBuf, PathBuf)> {
    let base = data_path.join("recovery").join(data_group_id.to_string());
    let fetch_dir = base.join(FETCH_SUBDIR);
    let replay_dir = base.join(REPLAY_SUBDIR);
    std::fs::create_dir_all(&fetch_dir)?;
    std::fs::create_dir_all(&replay_dir)?;
    Ok((fetch_dir, replay_dir))
}

/// Fetches every record after `last_data_version` into `fetch_dir`'s
/// binlog file, returning the number of bytes fetched (spec.md §4.G:
/// "FETCH — fetched_bytes == 0 → CATCH_UP_STAGE; fetched_bytes > 0 →
/// DEDUP").
pub fn fetch_stage(
    source: &dyn BinlogSource,
    data_group_id: u32,
    last_data_version: u64,
    fetch_dir: &Path,
) -> Result<u64> {
    let path = fetch_dir.join(FETCH_BINLOG_FILENAME);
    let mut file = std::fs::File::create(&path)?;
    let bytes = source.fetch_binlog_range(data_group_id, last_data_version, &mut file)?;
    file.flush()?;
    Ok(bytes)
}

pub fn fetch_binlog_path(fetch_dir: &Path) -> PathBuf {
    fetch_dir.join(FETCH_BINLOG_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use faststore_common::binlog::{BinlogRecord, OpType, Source as RecSource};

    struct FakeMaster {
        records: Vec<BinlogRecord>,
        current_version: u64,
    }

    impl BinlogSource for FakeMaster {
        fn master_data_version(&self, _data_group_id: u32) -> Result<u64> {
            Ok(self.current_version)
        }

        fn fetch_binlog_range(
            &self,
            _data_group_id: u32,
            after_data_version: u64,
            dest: &mut dyn Write,
        ) -> Result<u64> {
            let mut total = 0u64;
            for rec in &self.records {
                if rec.data_version <= after_data_version {
                    continue;
                }
                let line = rec.format();
                dest.write_all(line.as_bytes())?;
                total += line.len() as u64;
            }
            Ok(total)
        }

        fn fetch_slice_payload(&self, _block: BlockKey, slice: SliceKey) -> Result<Vec<u8>> {
            Ok(vec![b'x'; slice.length as usize])
        }
    }

    #[test]
    fn fetches_only_records_after_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let (fetch_dir, _replay_dir) = init_recovery_dirs(dir.path(), 1).unwrap();

        let master = FakeMaster {
            records: vec![
                BinlogRecord {
                    timestamp: 1,
                    data_version: 1,
                    source: RecSource::Rpc,
                    op_type: OpType::WriteSlice,
                    block: BlockKey::new(1, 0),
                    slice: Some(SliceKey::new(0, 10)),
                },
                BinlogRecord {
                    timestamp: 2,
                    data_version: 2,
                    source: RecSource::Rpc,
                    op_type: OpType::WriteSlice,
                    block: BlockKey::new(1, 0),
                    slice: Some(SliceKey::new(10, 10)),
                },
            ],
            current_version: 2,
        };

        let bytes = fetch_stage(&master, 1, 1, &fetch_dir).unwrap();
        assert!(bytes > 0);

        let contents = std::fs::read_to_string(fetch_binlog_path(&fetch_dir)).unwrap();
        assert_eq!(contents.lines().count(), 1, "only data_version 2 should be fetched");
    }

    #[test]
    fn nothing_new_fetches_zero_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (fetch_dir, _replay_dir) = init_recovery_dirs(dir.path(), 1).unwrap();
        let master = FakeMaster {
            records: vec![],
            current_version: 5,
        };
        let bytes = fetch_stage(&master, 1, 5, &fetch_dir).unwrap();
        assert_eq!(bytes, 0);
    }
}
