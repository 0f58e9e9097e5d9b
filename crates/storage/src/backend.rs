//! Storage backend trait definition
//!
//! The async interface every artifact store implements. Checkpoint code
//! only talks to this trait, so runs can publish to a local directory or
//! an object store without changing the lifecycle logic.

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async trait for storage backends
///
/// Paths are `/`-separated keys relative to the backend root. Writes are
/// atomic: a reader never observes a partially written object under its
/// final path.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the object at `path`
    ///
    /// Fails with `StoragePathNotFound` when the object does not exist.
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write an object, creating parent directories as needed
    ///
    /// Replaces any existing object at `path` in one atomic step and
    /// returns the number of bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Write an object only if `path` does not exist yet
    ///
    /// Returns `true` when this call created the object and `false` when
    /// the path was already taken. The existence check and the write are a
    /// single atomic operation, which makes this usable as a mutual
    /// exclusion primitive.
    async fn write_if_absent(&self, path: &str, data: Bytes) -> Result<bool>;

    /// Delete the object at `path`
    ///
    /// Fails with `StoragePathNotFound` when the object does not exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check whether an object exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List object paths under a prefix, sorted lexicographically
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
