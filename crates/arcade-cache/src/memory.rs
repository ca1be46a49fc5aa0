use crate::error::StorageError;
use crate::sharded::ShardedMap;
use crate::traits::{validate_partition_name, CacheKey, CachedResponse, StorageBackend};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Partitions held in process memory. Lost on restart.
#[derive(Default)]
pub struct MemoryBackend {
    partitions: RwLock<BTreeMap<String, Arc<ShardedMap>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, name: &str) -> Option<Arc<ShardedMap>> {
        self.partitions.read().get(name).cloned()
    }

    fn partition_or_create(&self, name: &str) -> Result<Arc<ShardedMap>, StorageError> {
        if let Some(p) = self.partition(name) {
            return Ok(p);
        }
        validate_partition_name(name)?;
        let mut partitions = self.partitions.write();
        Ok(Arc::clone(partitions.entry(name.to_string()).or_default()))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn open_partition(&self, name: &str) -> Result<(), StorageError> {
        self.partition_or_create(name).map(|_| ())
    }

    async fn match_entry(
        &self,
        partition: &str,
        key: &CacheKey,
    ) -> Result<Option<CachedResponse>, StorageError> {
        Ok(self
            .partition(partition)
            .and_then(|p| p.get(key))
            .map(|r| (*r).clone()))
    }

    async fn put_entry(
        &self,
        partition: &str,
        key: &CacheKey,
        response: &CachedResponse,
    ) -> Result<(), StorageError> {
        self.partition_or_create(partition)?
            .insert(key.clone(), response.clone());
        Ok(())
    }

    async fn delete_entry(&self, partition: &str, key: &CacheKey) -> Result<bool, StorageError> {
        Ok(self.partition(partition).is_some_and(|p| p.remove(key)))
    }

    async fn partition_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.partitions.read().keys().cloned().collect())
    }

    async fn delete_partition(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.partitions.write().remove(name).is_some())
    }

    async fn entry_count(&self, partition: &str) -> Result<usize, StorageError> {
        Ok(self.partition(partition).map_or(0, |p| p.len()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
