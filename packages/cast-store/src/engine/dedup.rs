// Upload path: fingerprint, decide new vs duplicate, charge quota, record
use super::Core;
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::Fingerprint;
use crate::ledger::{index, ownership, quota};
use crate::models::{EntryMetadata, OwnershipEntry, UploadFile};
use chrono::Utc;
use sqlx::{Sqlite, Transaction};
use std::sync::Arc;
use uuid::Uuid;

/// Recorded when an upload declares no content type
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One file of a batch, with its fingerprint computed up front
struct Prepared<'a> {
    fingerprint: Fingerprint,
    bytes: &'a [u8],
    content_type: &'a str,
    metadata: &'a EntryMetadata,
}

impl<'a> Prepared<'a> {
    fn new(bytes: &'a [u8], content_type: &'a str, metadata: &'a EntryMetadata) -> Self {
        Self {
            fingerprint: Fingerprint::compute(bytes),
            bytes,
            content_type: if content_type.trim().is_empty() {
                DEFAULT_CONTENT_TYPE
            } else {
                content_type
            },
            metadata,
        }
    }
}

/// Objects written, or being written, by an ingest that has not committed yet.
///
/// If the ingest future is dropped before commit, the objects are handed to
/// a background task that deletes each one still lacking a ContentRecord.
struct WrittenObjects {
    core: Arc<Core>,
    fingerprints: Vec<Fingerprint>,
}

impl WrittenObjects {
    fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            fingerprints: Vec::new(),
        }
    }

    fn keep(mut self) {
        self.fingerprints.clear();
    }

    /// Delete the objects right away. Caller holds their fingerprint locks
    /// and has rolled back the records.
    async fn discard(mut self) {
        for fingerprint in std::mem::take(&mut self.fingerprints) {
            match self.core.store.delete(&fingerprint).await {
                Ok(_) => tracing::debug!(%fingerprint, "removed object of failed ingest"),
                Err(err) => {
                    tracing::warn!(%fingerprint, error = %err, "could not remove object of failed ingest")
                }
            }
        }
    }
}

impl Drop for WrittenObjects {
    fn drop(&mut self) {
        if self.fingerprints.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                count = self.fingerprints.len(),
                "ingest abandoned outside a runtime, objects left for gc"
            );
            return;
        };

        let core = self.core.clone();
        let fingerprints = std::mem::take(&mut self.fingerprints);
        handle.spawn(async move {
            for fingerprint in fingerprints {
                if let Err(err) = core.discard_if_unreferenced(&fingerprint).await {
                    tracing::warn!(%fingerprint, error = %err, "cleanup of abandoned ingest failed");
                }
            }
        });
    }
}

/// Ingests content, storing each distinct byte sequence once.
#[derive(Clone)]
pub struct DedupEngine {
    core: Arc<Core>,
}

impl DedupEngine {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Ingest one file for `owner_id`.
    pub async fn ingest(
        &self,
        owner_id: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: EntryMetadata,
    ) -> CoreResult<OwnershipEntry> {
        let files = [Prepared::new(bytes, content_type, &metadata)];
        let mut entries = self.ingest_prepared(owner_id, &files).await?;
        entries
            .pop()
            .ok_or_else(|| CoreError::StorageUnavailable("ingest produced no entry".into()))
    }

    /// Ingest several files as one unit: either every file gets an entry or
    /// no ledger changes at all.
    ///
    /// Quota is checked cumulatively, so later files see the bytes charged
    /// by earlier ones.
    pub async fn ingest_batch(
        &self,
        owner_id: &str,
        files: &[UploadFile],
    ) -> CoreResult<Vec<OwnershipEntry>> {
        let prepared: Vec<Prepared<'_>> = files
            .iter()
            .map(|f| Prepared::new(&f.bytes, &f.content_type, &f.metadata))
            .collect();
        self.ingest_prepared(owner_id, &prepared).await
    }

    async fn ingest_prepared(
        &self,
        owner_id: &str,
        files: &[Prepared<'_>],
    ) -> CoreResult<Vec<OwnershipEntry>> {
        validate(owner_id, files)?;
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let fingerprints: Vec<Fingerprint> = files.iter().map(|f| f.fingerprint).collect();
        let _fingerprint_guards = self.core.fingerprint_locks.acquire_all(&fingerprints).await?;
        let _owner_guard = self.core.owner_locks.acquire(&owner_id.to_string()).await?;

        let mut written = WrittenObjects::new(self.core.clone());
        let tx = self.core.db.begin().await?;

        match self.apply(tx, owner_id, files, &mut written.fingerprints).await {
            Ok(entries) => {
                written.keep();
                for entry in &entries {
                    tracing::info!(
                        owner_id,
                        entry_id = %entry.id,
                        fingerprint = %entry.fingerprint,
                        duplicate = entry.is_duplicate,
                        "ingested"
                    );
                }
                Ok(entries)
            }
            Err(err) => {
                tracing::warn!(owner_id, files = files.len(), error = %err, "ingest rejected");
                written.discard().await;
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        mut tx: Transaction<'static, Sqlite>,
        owner_id: &str,
        files: &[Prepared<'_>],
        written: &mut Vec<Fingerprint>,
    ) -> CoreResult<Vec<OwnershipEntry>> {
        let mut entries = Vec::with_capacity(files.len());

        for file in files {
            let fingerprint = file.fingerprint;
            let byte_size = file.bytes.len() as u64;
            let existing = index::get(&mut tx, &fingerprint).await?;

            // Charged once per owner per fingerprint held.
            if !ownership::owner_holds(&mut tx, owner_id, &fingerprint).await? {
                quota::charge_bytes(&mut tx, owner_id, byte_size, self.core.default_byte_limit)
                    .await?;
            }

            match existing {
                Some(_) => {
                    let refs = index::increment_ref_count(&mut tx, &fingerprint).await?;
                    tracing::debug!(%fingerprint, refs, "duplicate content");
                }
                None => {
                    // Claimed before the write, so a put cut short is cleaned up too.
                    // Under the fingerprint lock an object with no record is an orphan.
                    written.push(fingerprint);
                    self.core.store.put(&fingerprint, file.bytes).await?;
                    index::create_if_absent(&mut tx, &fingerprint, file.content_type, byte_size)
                        .await?;
                }
            }

            let entry = OwnershipEntry {
                id: Uuid::new_v4().to_string(),
                fingerprint,
                owner_id: owner_id.to_string(),
                uploader_name: file
                    .metadata
                    .uploader_name
                    .clone()
                    .unwrap_or_else(|| owner_id.to_string()),
                display_name: file.metadata.display_name.clone(),
                tags: file.metadata.tags.clone(),
                visibility: file.metadata.visibility,
                is_duplicate: existing.is_some(),
                download_count: 0,
                created_at: Utc::now(),
            };
            ownership::insert(&mut tx, &entry).await?;
            entries.push(entry);
        }

        tx.commit().await?;
        Ok(entries)
    }
}

fn validate(owner_id: &str, files: &[Prepared<'_>]) -> CoreResult<()> {
    if owner_id.trim().is_empty() {
        return Err(CoreError::InvalidArgument("owner id must not be empty".into()));
    }
    for file in files {
        if file.metadata.display_name.trim().is_empty() {
            return Err(CoreError::InvalidArgument(format!(
                "display name missing for {}",
                file.fingerprint
            )));
        }
    }
    Ok(())
}
