//! Storage layer: read-only access to git object stores.
//!
//! This module provides the object store abstraction the rest of the engine
//! consumes. The upper layers (tables, executor) use this API and never
//! touch git2 directly.
//!
//! ```text
//! RepositoryPool ── open(id) ──> Repository (per-iterator handle)
//!        │                            │
//!        └──────── shared ObjectCache ┘
//! ```

mod cache;
mod errors;
mod pool;
mod repository;

#[cfg(test)]
pub mod testutil;

pub use cache::{CachedObject, ObjectCache, DEFAULT_CACHE_BYTES};
pub use errors::{StorageError, StorageResult};
pub use pool::RepositoryPool;
pub use repository::{BlobData, CommitData, RefInfo, RemoteInfo, Repository, TreeEntryData};
