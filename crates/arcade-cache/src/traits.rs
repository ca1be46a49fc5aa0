use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cached request: method plus absolute URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: impl AsRef<str>, url: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Captured HTTP response stored in a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Only a plain `200 OK` is ever persisted.
    pub fn is_storable(&self) -> bool {
        self.status == 200
    }
}

/// Durable key-value storage holding any number of named partitions.
///
/// Every operation may suspend. Implementations must make `put_entry` atomic
/// per key: a concurrent `match_entry` sees either the old or the new value,
/// never a mix. No locking is expected from callers.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create the partition if it does not exist yet. Idempotent.
    async fn open_partition(&self, name: &str) -> Result<(), StorageError>;

    /// Look up an entry. A missing partition is an empty partition.
    async fn match_entry(
        &self,
        partition: &str,
        key: &CacheKey,
    ) -> Result<Option<CachedResponse>, StorageError>;

    /// Insert or overwrite an entry, creating the partition if needed.
    async fn put_entry(
        &self,
        partition: &str,
        key: &CacheKey,
        response: &CachedResponse,
    ) -> Result<(), StorageError>;

    /// Remove a single entry. Returns whether it existed.
    async fn delete_entry(&self, partition: &str, key: &CacheKey) -> Result<bool, StorageError>;

    /// Names of every partition currently held, sorted.
    async fn partition_names(&self) -> Result<Vec<String>, StorageError>;

    /// Drop a whole partition. Returns whether it existed.
    async fn delete_partition(&self, name: &str) -> Result<bool, StorageError>;

    /// Number of entries in a partition (0 if it does not exist).
    async fn entry_count(&self, partition: &str) -> Result<usize, StorageError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Partition names double as directory names on disk.
pub fn validate_partition_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidPartitionName(name.to_string()))
    }
}
