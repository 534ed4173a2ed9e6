// Delete path: drop an entry, release its reference and reclaim storage
use super::Core;
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::Fingerprint;
use crate::ledger::{index, ownership, quota};
use crate::models::OwnershipEntry;
use serde::Serialize;
use std::sync::Arc;

/// Outcome of a successful delete
#[derive(Debug, Clone, Serialize)]
pub struct Removal {
    pub entry: OwnershipEntry,
    /// References left on the content after this delete
    pub remaining_refs: u64,
    /// Whether the stored object and its record were removed
    pub reclaimed: bool,
    /// Bytes returned to the owner's quota
    pub uncharged_bytes: u64,
}

/// An object moved aside by a delete whose transaction has not settled.
///
/// Dropped while still armed, it asks a background task to restore or drop
/// the object depending on whether the record survived.
struct StagedObject {
    core: Arc<Core>,
    fingerprint: Option<Fingerprint>,
}

impl StagedObject {
    fn disarm(mut self) -> Option<Fingerprint> {
        self.fingerprint.take()
    }
}

impl Drop for StagedObject {
    fn drop(&mut self) {
        let Some(fingerprint) = self.fingerprint.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%fingerprint, "delete abandoned outside a runtime, object left staged");
            return;
        };

        let core = self.core.clone();
        handle.spawn(async move {
            if let Err(err) = core.settle_staged(&fingerprint).await {
                tracing::warn!(%fingerprint, error = %err, "could not settle staged object");
            }
        });
    }
}

/// Deletes entries and reclaims content nobody references.
#[derive(Clone)]
pub struct ReclamationEngine {
    core: Arc<Core>,
}

impl ReclamationEngine {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Delete entry `entry_id` on behalf of `owner_id`.
    ///
    /// Only the entry's owner may delete it. The owner's quota is released
    /// when this was their last entry for the content, and the stored object
    /// goes away with the last reference from anyone.
    pub async fn remove(&self, owner_id: &str, entry_id: &str) -> CoreResult<Removal> {
        let entry = {
            let mut conn = self.core.db.pool().acquire().await?;
            ownership::get(&mut conn, entry_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("entry {}", entry_id)))?
        };
        if entry.owner_id != owner_id {
            return Err(CoreError::Forbidden {
                caller: owner_id.to_string(),
                entry_id: entry_id.to_string(),
            });
        }

        let fingerprint = entry.fingerprint;
        let _fingerprint_guard = self.core.fingerprint_locks.acquire(&fingerprint).await?;
        let _owner_guard = self.core.owner_locks.acquire(&entry.owner_id).await?;

        let mut tx = self.core.db.begin().await?;

        // A concurrent delete of the same entry may have won the locks first.
        let entry = ownership::get(&mut tx, entry_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("entry {}", entry_id)))?;
        ownership::delete(&mut tx, entry_id).await?;

        let record = index::get(&mut tx, &fingerprint).await?.ok_or_else(|| {
            CoreError::StorageUnavailable(format!(
                "entry {} references {} which has no content record",
                entry_id, fingerprint
            ))
        })?;
        let remaining_refs = index::decrement_ref_count(&mut tx, &fingerprint).await?;

        let uncharged_bytes = if ownership::owner_holds(&mut tx, owner_id, &fingerprint).await? {
            0
        } else {
            quota::uncharge_bytes(&mut tx, owner_id, record.byte_size).await?;
            record.byte_size
        };

        let staged = if remaining_refs == 0 {
            index::delete_if_zero(&mut tx, &fingerprint).await?;
            // Armed before the move, so a stage cut short is settled too.
            let mut staged = StagedObject {
                core: self.core.clone(),
                fingerprint: Some(fingerprint),
            };
            if !self.core.store.stage_removal(&fingerprint).await? {
                tracing::warn!(%fingerprint, "object already missing at reclamation");
                staged.fingerprint = None;
            }
            Some(staged)
        } else {
            None
        };

        if let Err(err) = tx.commit().await {
            if let Some(fingerprint) = staged.and_then(StagedObject::disarm) {
                self.core.store.abort_removal(&fingerprint).await?;
            }
            return Err(err.into());
        }

        let reclaimed = staged.is_some();
        if let Some(fingerprint) = staged.and_then(StagedObject::disarm) {
            if let Err(err) = self.core.store.finish_removal(&fingerprint).await {
                tracing::warn!(%fingerprint, error = %err, "staged object left for gc");
            }
        }

        tracing::info!(
            owner_id,
            entry_id,
            %fingerprint,
            remaining_refs,
            reclaimed,
            uncharged_bytes,
            "removed"
        );

        Ok(Removal {
            entry,
            remaining_refs,
            reclaimed,
            uncharged_bytes,
        })
    }
}
