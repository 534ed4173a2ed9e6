// Content store trait and implementations
use crate::error::CoreResult;
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;

pub mod config;
pub mod local;

pub use config::StoreConfig;
pub use local::LocalContentStore;

/// Durable byte storage addressed by fingerprint.
///
/// An object is written at most once in its lifetime. Every I/O failure is
/// reported as `CoreError::StorageUnavailable`.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` under `fingerprint`.
    ///
    /// Returns `true` if this call created the object and `false` if it was
    /// already present (first writer wins).
    async fn put(&self, fingerprint: &Fingerprint, data: &[u8]) -> CoreResult<bool>;

    /// Read the full object
    async fn get(&self, fingerprint: &Fingerprint) -> CoreResult<Vec<u8>>;

    async fn exists(&self, fingerprint: &Fingerprint) -> CoreResult<bool>;

    async fn size(&self, fingerprint: &Fingerprint) -> CoreResult<u64>;

    /// Delete immediately. Returns `false` if there was nothing to delete.
    async fn delete(&self, fingerprint: &Fingerprint) -> CoreResult<bool>;

    /// Every fingerprint with a stored object
    async fn list(&self) -> CoreResult<Vec<Fingerprint>>;

    /// First half of a two-phase delete: hide the object without losing it.
    ///
    /// Returns `false` if the object did not exist.
    async fn stage_removal(&self, fingerprint: &Fingerprint) -> CoreResult<bool>;

    /// Permanently drop a staged object
    async fn finish_removal(&self, fingerprint: &Fingerprint) -> CoreResult<()>;

    /// Put a staged object back
    async fn abort_removal(&self, fingerprint: &Fingerprint) -> CoreResult<()>;

    /// Objects staged for removal and not yet finished or aborted
    async fn list_staged(&self) -> CoreResult<Vec<Fingerprint>>;
}
