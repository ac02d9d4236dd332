//! Shared data model, error, config and wire-format types for FastStore.

pub mod binlog;
pub mod config;
pub mod error;
pub mod keys;
pub mod protocol;

pub use error::Error;
pub use keys::{BlockKey, BlockSliceKey, Opid, Otid, SliceKey, SliceVersion};

/// Result alias used throughout the core crates.
pub type Result<T> = std::result::Result<T, Error>;
