// Upload and delete orchestration over the ledgers and the content store
use crate::db::MetadataDb;
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::Fingerprint;
use crate::ledger::index;
use crate::locks::KeyedLocks;
use crate::storage::ContentStore;
use std::sync::Arc;
use std::time::Duration;

pub mod dedup;
pub mod reclaim;

pub use dedup::DedupEngine;
pub use reclaim::{Removal, ReclamationEngine};

/// State shared by both engines and the maintenance tasks.
///
/// Lock order, everywhere: fingerprints ascending, then the owner.
pub struct Core {
    pub(crate) db: MetadataDb,
    pub(crate) store: Arc<dyn ContentStore>,
    pub(crate) fingerprint_locks: KeyedLocks<Fingerprint>,
    pub(crate) owner_locks: KeyedLocks<String>,
    pub(crate) default_byte_limit: u64,
}

impl Core {
    pub fn new(
        db: MetadataDb,
        store: Arc<dyn ContentStore>,
        default_byte_limit: u64,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            db,
            store,
            fingerprint_locks: KeyedLocks::new("fingerprint", lock_timeout),
            owner_locks: KeyedLocks::new("owner", lock_timeout),
            default_byte_limit,
        }
    }

    /// Delete a stored object that no ContentRecord claims.
    ///
    /// Returns the size of the deleted object, or `None` if there was nothing
    /// to delete.
    pub(crate) async fn discard_if_unreferenced(
        &self,
        fingerprint: &Fingerprint,
    ) -> CoreResult<Option<u64>> {
        let _guard = self.fingerprint_locks.acquire(fingerprint).await?;

        let mut conn = self.db.pool().acquire().await?;
        if index::get(&mut conn, fingerprint).await?.is_some() {
            return Ok(None);
        }

        let size = match self.store.size(fingerprint).await {
            Ok(size) => size,
            Err(CoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !self.store.delete(fingerprint).await? {
            return Ok(None);
        }
        tracing::info!(%fingerprint, size, "discarded unreferenced object");
        Ok(Some(size))
    }

    /// Resolve a staged removal left behind by an interrupted delete: put the
    /// object back if its record survived, otherwise drop it.
    pub(crate) async fn settle_staged(&self, fingerprint: &Fingerprint) -> CoreResult<()> {
        let _guard = self.fingerprint_locks.acquire(fingerprint).await?;

        let mut conn = self.db.pool().acquire().await?;
        if index::get(&mut conn, fingerprint).await?.is_some() {
            tracing::info!(%fingerprint, "restoring object of interrupted delete");
            self.store.abort_removal(fingerprint).await
        } else {
            self.store.finish_removal(fingerprint).await
        }
    }
}
