use std::path::PathBuf;
use thiserror::Error;

/// Failures of the underlying cache storage.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache entry at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid partition name: {0:?}")]
    InvalidPartitionName(String),

    /// Only `GET` requests answered with `200` may be stored.
    #[error("refusing to store {method} response with status {status}")]
    NotStorable { method: String, status: u16 },
}
