//! Named, versioned response cache partitions.
//!
//! A [`CacheStore`] holds any number of partitions, each a map from
//! `(method, url)` to a captured `200 OK` response. Partitions are created on
//! first use and only ever removed whole. Two backends are provided:
//! [`MemoryBackend`] for tests and ephemeral deployments, and [`DiskBackend`]
//! which survives restarts.

pub mod disk;
pub mod error;
pub mod memory;
mod sharded;
pub mod store;
pub mod traits;

pub use disk::DiskBackend;
pub use error::StorageError;
pub use memory::MemoryBackend;
pub use store::{CacheStore, Partition};
pub use traits::{CacheKey, CachedResponse, StorageBackend};
