use crate::error::StorageError;
use crate::traits::{validate_partition_name, CacheKey, CachedResponse, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;

const ENTRY_EXT: &str = "entry";

/// Header line of an entry file. The raw body follows the newline.
#[derive(Serialize, Deserialize)]
struct EntryMeta {
    key: CacheKey,
    status: u16,
    headers: Vec<(String, String)>,
}

/// Partitions persisted under a root directory.
///
/// Layout: `<root>/<partition>/<sha256(key)>.entry`. Each entry file is one
/// JSON metadata line followed by the body bytes. Writes land in a dot-prefixed
/// temp file first and are renamed into place, so readers only ever see a
/// complete entry.
pub struct DiskBackend {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    fn partition_dir(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_partition_name(name)?;
        Ok(self.root.join(name))
    }

    fn entry_file(dir: &Path, key: &CacheKey) -> PathBuf {
        let digest = Sha256::digest(key.to_string().as_bytes());
        dir.join(format!("{}.{ENTRY_EXT}", hex::encode(digest)))
    }

    fn tmp_file(&self, dir: &Path) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        dir.join(format!(".{}-{n}.tmp", std::process::id()))
    }

    fn encode(key: &CacheKey, response: &CachedResponse) -> std::io::Result<Vec<u8>> {
        let meta = EntryMeta {
            key: key.clone(),
            status: response.status,
            headers: response.headers.clone(),
        };
        // serde_json escapes newlines inside strings, so the first '\n' ends the header.
        let mut out = serde_json::to_vec(&meta)?;
        out.push(b'\n');
        out.extend_from_slice(&response.body);
        Ok(out)
    }

    fn decode(path: &Path, raw: Vec<u8>) -> Result<(CacheKey, CachedResponse), StorageError> {
        let split = raw.iter().position(|&b| b == b'\n').unwrap_or(raw.len());
        let meta: EntryMeta =
            serde_json::from_slice(&raw[..split]).map_err(|source| StorageError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        let mut raw = Bytes::from(raw);
        let body = raw.split_off((split + 1).min(raw.len()));
        Ok((meta.key, CachedResponse::new(meta.status, meta.headers, body)))
    }
}

fn not_found_as<T>(result: std::io::Result<T>, fallback: T) -> Result<T, StorageError> {
    match result {
        Ok(v) => Ok(v),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(fallback),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StorageBackend for DiskBackend {
    async fn open_partition(&self, name: &str) -> Result<(), StorageError> {
        fs::create_dir_all(self.partition_dir(name)?).await?;
        Ok(())
    }

    async fn match_entry(
        &self,
        partition: &str,
        key: &CacheKey,
    ) -> Result<Option<CachedResponse>, StorageError> {
        let path = Self::entry_file(&self.partition_dir(partition)?, key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (stored_key, response) = Self::decode(&path, raw)?;
        if &stored_key != key {
            tracing::warn!(key = %key, stored = %stored_key, "entry digest collision, treating as miss");
            return Ok(None);
        }
        Ok(Some(response))
    }

    async fn put_entry(
        &self,
        partition: &str,
        key: &CacheKey,
        response: &CachedResponse,
    ) -> Result<(), StorageError> {
        let dir = self.partition_dir(partition)?;
        fs::create_dir_all(&dir).await?;

        let bytes = Self::encode(key, response)?;
        let tmp = self.tmp_file(&dir);
        let written = match fs::write(&tmp, bytes).await {
            Ok(()) => fs::rename(&tmp, Self::entry_file(&dir, key)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // a failed write can leave a partial temp file behind
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete_entry(&self, partition: &str, key: &CacheKey) -> Result<bool, StorageError> {
        let path = Self::entry_file(&self.partition_dir(partition)?, key);
        not_found_as(fs::remove_file(path).await.map(|_| true), false)
    }

    async fn partition_names(&self) -> Result<Vec<String>, StorageError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_partition_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_partition(&self, name: &str) -> Result<bool, StorageError> {
        let dir = self.partition_dir(name)?;
        not_found_as(fs::remove_dir_all(dir).await.map(|_| true), false)
    }

    async fn entry_count(&self, partition: &str) -> Result<usize, StorageError> {
        let mut dir = match fs::read_dir(self.partition_dir(partition)?).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = dir.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == ENTRY_EXT) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}
