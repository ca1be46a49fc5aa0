use crate::traits::{CacheKey, CachedResponse};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

type Shard = HashMap<CacheKey, Arc<CachedResponse>>;

/// Thread-safe sharded map backing one in-memory partition.
///
/// Keys are spread across 64 independent shards, each behind its own
/// `RwLock`, so concurrent requests for different URLs rarely contend.
/// Lookups take a read lock; writes take a write lock on a single shard,
/// which makes every write atomic per key.
///
/// There is no eviction: entries live until the partition is dropped.
pub struct ShardedMap {
    shards: Box<[RwLock<Shard>; NUM_SHARDS]>,
}

impl ShardedMap {
    pub fn new() -> Self {
        let shards: Vec<RwLock<Shard>> = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        let shards: Box<[RwLock<Shard>; NUM_SHARDS]> = shards
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| unreachable!());

        Self { shards }
    }

    #[inline]
    fn shard_index(key: &CacheKey) -> usize {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        (hash & SHARD_MASK) as usize
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedResponse>> {
        let idx = Self::shard_index(key);
        self.shards[idx].read().get(key).cloned()
    }

    /// Insert or overwrite. Last write wins.
    pub fn insert(&self, key: CacheKey, value: CachedResponse) {
        let idx = Self::shard_index(&key);
        self.shards[idx].write().insert(key, Arc::new(value));
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let idx = Self::shard_index(key);
        self.shards[idx].write().remove(key).is_some()
    }

    /// Total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

impl Default for ShardedMap {
    fn default() -> Self {
        Self::new()
    }
}
