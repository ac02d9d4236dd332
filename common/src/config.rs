//! Core-relevant configuration keys (spec.md §6), loaded from a TOML file.
//!
//! The original FastStore reads an ini file through `fastcommon`'s
//! `IniContext`, falling back to a default whenever a key is absent
//! (`iniGetIntValueEx(..., default, ...)`, see `client_func.c`). We keep
//! that "always has a sane default" contract but express it with serde's
//! `#[serde(default = ...)]`, and TOML in place of ini, matching the
//! `toml` dependency the teacher workspace already carries.

use serde::Deserialize;

fn default_connect_timeout() -> u64 {
    5
}
fn default_network_timeout() -> u64 {
    30
}
fn default_read_rule() -> String {
    "any".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetRetryConfig {
    pub times: u32,
    pub interval_ms: u64,
}

impl Default for NetRetryConfig {
    fn default() -> Self {
        Self {
            times: 3,
            interval_ms: 100,
        }
    }
}

fn default_buffer_size() -> usize {
    256 * 1024
}
fn default_min_wait_ms() -> u64 {
    20
}
fn default_max_wait_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriteCombineConfig {
    pub buffer_size: usize,
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for WriteCombineConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

fn default_sharding_count() -> usize {
    4
}
fn default_htable_capacity() -> i64 {
    1 << 16
}
fn default_allocator_count() -> usize {
    17
}
fn default_element_limit() -> i64 {
    1 << 20
}
fn default_min_ttl_ms() -> i64 {
    3_600_000
}
fn default_max_ttl_ms() -> i64 {
    7_200_000
}

/// Shared by both the OTID and OPID sharded hash tables (spec.md §4.B).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardedTableConfig {
    pub sharding_count: usize,
    pub htable_capacity: i64,
    pub allocator_count: usize,
    pub element_limit: i64,
    pub min_ttl_ms: i64,
    pub max_ttl_ms: i64,
}

impl Default for ShardedTableConfig {
    fn default() -> Self {
        Self {
            sharding_count: default_sharding_count(),
            htable_capacity: default_htable_capacity(),
            allocator_count: default_allocator_count(),
            element_limit: default_element_limit(),
            min_ttl_ms: default_min_ttl_ms(),
            max_ttl_ms: default_max_ttl_ms(),
        }
    }
}

fn default_threads_limit() -> usize {
    num_cpus_like_default()
}
fn num_cpus_like_default() -> usize {
    4
}
fn default_threads_per_data_group() -> usize {
    4
}
fn default_max_queue_depth() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub threads_limit: usize,
    pub threads_per_data_group: usize,
    pub max_queue_depth: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            threads_limit: default_threads_limit(),
            threads_per_data_group: default_threads_per_data_group(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

fn default_channels_between_two_servers() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub channels_between_two_servers: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            channels_between_two_servers: default_channels_between_two_servers(),
        }
    }
}

/// Top-level configuration, read from a TOML file at startup
/// (`faststore-server`'s `--config` flag).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_network_timeout")]
    pub network_timeout: u64,
    #[serde(default = "default_read_rule")]
    pub read_rule: String,
    pub net_retry: NetRetryConfig,
    pub write_combine: WriteCombineConfig,
    pub otid: ShardedTableConfig,
    pub opid: ShardedTableConfig,
    pub recovery: RecoveryConfig,
    pub replica: ReplicaConfig,
    /// Number of data groups the cluster partitions blocks across
    /// (spec.md §3, `data_group_id = H(key) mod data_group_count + 1`).
    pub data_group_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            network_timeout: default_network_timeout(),
            read_rule: default_read_rule(),
            net_retry: NetRetryConfig::default(),
            write_combine: WriteCombineConfig::default(),
            otid: ShardedTableConfig::default(),
            opid: ShardedTableConfig::default(),
            recovery: RecoveryConfig::default(),
            replica: ReplicaConfig::default(),
            data_group_count: 1,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_all_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.connect_timeout, 5);
        assert_eq!(cfg.write_combine.buffer_size, 256 * 1024);
        assert_eq!(cfg.otid.sharding_count, 4);
    }

    #[test]
    fn partial_overrides_apply() {
        let toml = r#"
            data_group_count = 8

            [write_combine]
            buffer_size = 65536
            max_wait_ms = 500
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.data_group_count, 8);
        assert_eq!(cfg.write_combine.buffer_size, 65536);
        assert_eq!(cfg.write_combine.max_wait_ms, 500);
        // untouched field keeps its default
        assert_eq!(cfg.write_combine.min_wait_ms, 20);
    }
}
