//! Persisted recovery stage (`data_recovery.dat`), grounded on
//! `data_recovery.c`'s `data_recovery_{save,load,unlink}_sys_data`.
//!
//! The original stores this as an ini file (`stage=F`, a `[fetch]`
//! section with `last_data_version` and `last_bkey`); we keep the same
//! tiny hand-rolled format rather than pulling in a general ini crate
//! for three scalar fields.

use faststore_common::{BlockKey, Error, Result};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Dedup,
    Replay,
}

impl Stage {
    fn to_char(self) -> char {
        match self {
            Stage::Fetch => 'F',
            Stage::Dedup => 'D',
            Stage::Replay => 'R',
        }
    }

    fn from_char(c: char) -> Result<Self> {
        match c {
            'F' => Ok(Stage::Fetch),
            'D' => Ok(Stage::Dedup),
            'R' => Ok(Stage::Replay),
            other => Err(Error::Invalid(format!("invalid recovery stage byte: {other:?}"))),
        }
    }
}

/// In-memory only; reset to `Doing` at the start of every recovery run
/// (the original never persists `catch_up`, see `data_recovery_start`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpStage {
    Doing,
    LastBatch,
    Done,
}

#[derive(Debug, Clone)]
pub struct RecoveryState {
    pub stage: Stage,
    pub last_data_version: u64,
    pub last_bkey: Option<BlockKey>,
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self {
            stage: Stage::Fetch,
            last_data_version: 0,
            last_bkey: None,
        }
    }
}

impl RecoveryState {
    /// Loads the persisted stage, or returns the fresh `FETCH` default
    /// (and writes it out) if no file exists yet.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let state = Self::default();
            state.save(path)?;
            return Ok(state);
        }

        let text = std::fs::read_to_string(path)?;
        let mut stage = Stage::Fetch;
        let mut last_data_version = 0u64;
        let mut last_bkey = None;
        let mut in_fetch_section = false;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "[fetch]" {
                in_fetch_section = true;
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "stage" if !in_fetch_section => {
                    stage = Stage::from_char(value.chars().next().ok_or_else(|| {
                        Error::Invalid("empty stage value in data_recovery.dat".to_string())
                    })?)?;
                }
                "last_data_version" if in_fetch_section => {
                    last_data_version = value.parse().map_err(|_| {
                        Error::Invalid(format!("invalid last_data_version: {value}"))
                    })?;
                }
                "last_bkey" if in_fetch_section => {
                    let (oid, offset) = value.split_once(',').ok_or_else(|| {
                        Error::Invalid(format!("invalid last_bkey: {value}"))
                    })?;
                    last_bkey = Some(BlockKey::new(
                        oid.parse().map_err(|_| Error::Invalid(format!("invalid oid: {oid}")))?,
                        offset
                            .parse()
                            .map_err(|_| Error::Invalid(format!("invalid block_offset: {offset}")))?,
                    ));
                }
                _ => {}
            }
        }

        Ok(Self {
            stage,
            last_data_version,
            last_bkey,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let (oid, offset) = self
            .last_bkey
            .map(|k| (k.oid, k.block_offset))
            .unwrap_or((0, 0));
        let contents = format!(
            "stage={}\n[fetch]\nlast_data_version={}\nlast_bkey={},{}\n",
            self.stage.to_char(),
            self.last_data_version,
            oid,
            offset,
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn unlink(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_initializes_fetch_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_recovery.dat");
        let state = RecoveryState::load_or_init(&path).unwrap();
        assert_eq!(state.stage, Stage::Fetch);
        assert!(path.exists());
    }

    #[test]
    fn round_trips_stage_and_fetch_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_recovery.dat");
        let state = RecoveryState {
            stage: Stage::Dedup,
            last_data_version: 42,
            last_bkey: Some(BlockKey::new(7, 1024)),
        };
        state.save(&path).unwrap();

        let loaded = RecoveryState::load_or_init(&path).unwrap();
        assert_eq!(loaded.stage, Stage::Dedup);
        assert_eq!(loaded.last_data_version, 42);
        assert_eq!(loaded.last_bkey, Some(BlockKey::new(7, 1024)));
    }

    #[test]
    fn unlink_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_recovery.dat");
        RecoveryState::unlink(&path).unwrap();
        RecoveryState::default().save(&path).unwrap();
        RecoveryState::unlink(&path).unwrap();
        assert!(!path.exists());
    }
}
