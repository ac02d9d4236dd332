//! The generic sharded, TTL-bounded, LRU-evicting hash table used for
//! both the OTID and OPID tables (spec.md §4.B).
//!
//! `sharding_count` independent shards, each a hash table plus a mutex
//! plus an LRU eviction list (`lru::LruCache`, unbounded per-shard so we
//! can apply the *global* `element_limit` ourselves rather than let each
//! shard cap independently). Entries carry a TTL drawn from
//! `[min_ttl_ms, max_ttl_ms]`, randomised per entry so expirations don't
//! all land in the same tick and stampede.

use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Shard<K: Hash + Eq, V> {
    lru: LruCache<K, Entry<V>>,
}

/// Configuration shared by the OTID and OPID tables
/// (`otid.*`/`opid.*` config keys, spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct ShardedTableConfig {
    pub sharding_count: usize,
    pub element_limit: i64,
    pub min_ttl_ms: i64,
    pub max_ttl_ms: i64,
}

impl From<faststore_common::config::ShardedTableConfig> for ShardedTableConfig {
    fn from(c: faststore_common::config::ShardedTableConfig) -> Self {
        Self {
            sharding_count: c.sharding_count,
            element_limit: c.element_limit,
            min_ttl_ms: c.min_ttl_ms,
            max_ttl_ms: c.max_ttl_ms,
        }
    }
}

pub struct ShardedTable<K: Hash + Eq + Clone, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
    cfg: ShardedTableConfig,
    /// Total live element count across all shards, bounding memory
    /// (spec.md §4.B "A global element_limit bounds memory across all
    /// shards; overflow evicts the LRU head").
    total: AtomicI64,
}

impl<K: Hash + Eq + Clone, V> ShardedTable<K, V> {
    pub fn new(cfg: ShardedTableConfig) -> Self {
        let mut shards = Vec::with_capacity(cfg.sharding_count);
        shards.resize_with(cfg.sharding_count, || {
            Mutex::new(Shard {
                lru: LruCache::unbounded(),
            })
        });
        Self {
            shards,
            cfg,
            total: AtomicI64::new(0),
        }
    }

    pub fn shard_index(&self, key: &K) -> usize
    where
        K: std::hash::Hash,
    {
        let mut hasher = ahash::AHasher::default();
        key.hash(&mut hasher);
        use std::hash::Hasher;
        (hasher.finish() % self.cfg.sharding_count as u64) as usize
    }

    fn random_ttl(&self) -> Duration {
        let ms = if self.cfg.max_ttl_ms > self.cfg.min_ttl_ms {
            rand::thread_rng().gen_range(self.cfg.min_ttl_ms..=self.cfg.max_ttl_ms)
        } else {
            self.cfg.min_ttl_ms
        };
        Duration::from_millis(ms.max(0) as u64)
    }

    /// Inserts or replaces the entry for `key`, evicting the shard's LRU
    /// head first if the table is at `element_limit`.
    pub fn insert(&self, key: K, value: V) {
        let idx = self.shard_index(&key);
        let mut shard = self.shards[idx].lock();

        let replacing = shard.lru.contains(&key);
        if !replacing && self.total.load(Ordering::Relaxed) >= self.cfg.element_limit {
            if shard.lru.pop_lru().is_some() {
                self.total.fetch_sub(1, Ordering::Relaxed);
            }
        }

        let expires_at = Instant::now() + self.random_ttl();
        let existed = shard.lru.put(key, Entry { value, expires_at }).is_some();
        if !existed {
            self.total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Looks up `key`, evicting it first if its TTL has elapsed.
    /// Promotes the entry to most-recently-used on a hit, as the
    /// original's sharded hash table does on every lookup.
    pub fn get_cloned(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].lock();
        if let Some(entry) = shard.lru.get(key) {
            if entry.expires_at <= Instant::now() {
                shard.lru.pop(key);
                self.total.fetch_sub(1, Ordering::Relaxed);
                return None;
            }
            return Some(entry.value.clone());
        }
        None
    }

    /// Mutates the entry for `key` in place under the shard lock,
    /// inserting `default()` first if absent. This is the primitive the
    /// OTID/OPID tables build their "insert returns derived state" APIs
    /// on top of (spec.md §4.B).
    pub fn with_entry_mut<R>(
        &self,
        key: K,
        default: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let idx = self.shard_index(&key);
        let mut shard = self.shards[idx].lock();

        let expired = matches!(shard.lru.peek(&key), Some(e) if e.expires_at <= Instant::now());
        if expired {
            shard.lru.pop(&key);
            self.total.fetch_sub(1, Ordering::Relaxed);
        }

        if !shard.lru.contains(&key) {
            if self.total.load(Ordering::Relaxed) >= self.cfg.element_limit {
                if shard.lru.pop_lru().is_some() {
                    self.total.fetch_sub(1, Ordering::Relaxed);
                }
            }
            let expires_at = Instant::now() + self.random_ttl();
            shard.lru.put(
                key.clone(),
                Entry {
                    value: default(),
                    expires_at,
                },
            );
            self.total.fetch_add(1, Ordering::Relaxed);
        }

        let entry = shard.lru.get_mut(&key).expect("just inserted or present");
        f(&mut entry.value)
    }

    pub fn remove(&self, key: &K) {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].lock();
        if shard.lru.pop(key).is_some() {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// `lru::LruCache::unbounded` wants a capacity type when bounded; keep a
// helper around in case a shard ever needs a hard per-shard cap too.
#[allow(dead_code)]
fn _nonzero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ShardedTableConfig {
        ShardedTableConfig {
            sharding_count: 4,
            element_limit: 3,
            min_ttl_ms: 10_000,
            max_ttl_ms: 20_000,
        }
    }

    #[test]
    fn insert_and_get() {
        let t: ShardedTable<u64, String> = ShardedTable::new(cfg());
        t.insert(1, "a".to_string());
        assert_eq!(t.get_cloned(&1), Some("a".to_string()));
        assert_eq!(t.get_cloned(&2), None);
    }

    #[test]
    fn element_limit_evicts_lru() {
        let t: ShardedTable<u64, u64> = ShardedTable::new(ShardedTableConfig {
            sharding_count: 1,
            element_limit: 2,
            min_ttl_ms: 60_000,
            max_ttl_ms: 60_000,
        });
        t.insert(1, 1);
        t.insert(2, 2);
        assert_eq!(t.len(), 2);
        t.insert(3, 3);
        assert_eq!(t.len(), 2, "element_limit must be respected");
        // 1 was least-recently-used and should have been evicted.
        assert_eq!(t.get_cloned(&1), None);
        assert_eq!(t.get_cloned(&3), Some(3));
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let t: ShardedTable<u64, u64> = ShardedTable::new(ShardedTableConfig {
            sharding_count: 1,
            element_limit: 10,
            min_ttl_ms: 0,
            max_ttl_ms: 0,
        });
        t.insert(1, 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(t.get_cloned(&1), None);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn with_entry_mut_creates_default_then_mutates() {
        let t: ShardedTable<u64, i32> = ShardedTable::new(cfg());
        let first = t.with_entry_mut(1, || 0, |v| {
            *v += 1;
            *v
        });
        assert_eq!(first, 1);
        let second = t.with_entry_mut(1, || 0, |v| {
            *v += 1;
            *v
        });
        assert_eq!(second, 2);
    }
}
