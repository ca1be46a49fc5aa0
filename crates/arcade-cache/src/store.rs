use crate::error::StorageError;
use crate::traits::{validate_partition_name, CacheKey, CachedResponse, StorageBackend};
use std::fmt;
use std::sync::Arc;

/// Process-wide cache storage shared by the gateway and the generation manager.
///
/// Built once at startup around a backend and cloned (cheaply) into whoever
/// needs it. The store never decides which partitions are current; it only
/// opens, reads, writes and drops them on request.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn StorageBackend>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        tracing::info!(backend = backend.name(), "cache store initialized");
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Open a partition, creating it if absent.
    pub async fn open(&self, name: &str) -> Result<Partition, StorageError> {
        self.backend.open_partition(name).await?;
        self.partition(name)
    }

    /// Handle to a partition without touching storage. The partition comes
    /// into existence on the first write.
    pub fn partition(&self, name: &str) -> Result<Partition, StorageError> {
        validate_partition_name(name)?;
        Ok(Partition {
            name: Arc::from(name),
            backend: Arc::clone(&self.backend),
        })
    }

    pub async fn partition_names(&self) -> Result<Vec<String>, StorageError> {
        self.backend.partition_names().await
    }

    pub async fn delete_partition(&self, name: &str) -> Result<bool, StorageError> {
        let existed = self.backend.delete_partition(name).await?;
        if existed {
            tracing::info!(partition = name, "partition deleted");
        }
        Ok(existed)
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// A named partition inside a [`CacheStore`].
#[derive(Clone)]
pub struct Partition {
    name: Arc<str>,
    backend: Arc<dyn StorageBackend>,
}

impl Partition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn match_entry(&self, key: &CacheKey) -> Result<Option<CachedResponse>, StorageError> {
        self.backend.match_entry(&self.name, key).await
    }

    /// Store a response. Anything other than a `GET` answered with `200` is
    /// rejected and leaves the partition untouched.
    pub async fn put(&self, key: &CacheKey, response: &CachedResponse) -> Result<(), StorageError> {
        if !key.is_get() || !response.is_storable() {
            return Err(StorageError::NotStorable {
                method: key.method.clone(),
                status: response.status,
            });
        }
        self.backend.put_entry(&self.name, key, response).await
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<bool, StorageError> {
        self.backend.delete_entry(&self.name, key).await
    }

    pub async fn len(&self) -> Result<usize, StorageError> {
        self.backend.entry_count(&self.name).await
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition").field("name", &self.name).finish()
    }
}
