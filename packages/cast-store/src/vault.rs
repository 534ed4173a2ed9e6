// Caller-facing store: wires the database and both engines, serves reads
// and owner-only metadata changes
use crate::db::MetadataDb;
use crate::engine::{Core, DedupEngine, ReclamationEngine, Removal};
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::Fingerprint;
use crate::gc::{self, SweepReport, VerifyReport};
use crate::ledger::{index, ownership, quota};
use crate::models::{ContentRecord, EntryMetadata, OwnershipEntry, QuotaRecord, UploadFile, Visibility};
use crate::storage::{ContentStore, LocalContentStore, StoreConfig};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;

/// An entry together with its content, as handed out for download
#[derive(Debug, Clone, Serialize)]
pub struct OpenedContent {
    pub entry: OwnershipEntry,
    pub record: ContentRecord,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

pub struct Vault {
    core: Arc<Core>,
    dedup: DedupEngine,
    reclaim: ReclamationEngine,
}

impl Vault {
    /// Open the store and database under `config.root`, creating them if needed
    pub async fn open(config: &StoreConfig) -> CoreResult<Self> {
        let store = LocalContentStore::new(config);
        store.initialize().await?;

        let db = MetadataDb::open(&config.db_path(), config.max_connections).await?;
        tracing::debug!(root = %config.root.display(), "vault opened");

        Ok(Self::with_parts(
            db,
            Arc::new(store),
            config.default_byte_limit,
            config.lock_timeout(),
        ))
    }

    pub fn with_parts(
        db: MetadataDb,
        store: Arc<dyn ContentStore>,
        default_byte_limit: u64,
        lock_timeout: Duration,
    ) -> Self {
        let core = Arc::new(Core::new(db, store, default_byte_limit, lock_timeout));
        Self {
            dedup: DedupEngine::new(core.clone()),
            reclaim: ReclamationEngine::new(core.clone()),
            core,
        }
    }

    pub async fn ingest(
        &self,
        owner_id: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: EntryMetadata,
    ) -> CoreResult<OwnershipEntry> {
        self.dedup.ingest(owner_id, bytes, content_type, metadata).await
    }

    pub async fn ingest_batch(
        &self,
        owner_id: &str,
        files: &[UploadFile],
    ) -> CoreResult<Vec<OwnershipEntry>> {
        self.dedup.ingest_batch(owner_id, files).await
    }

    pub async fn remove(&self, owner_id: &str, entry_id: &str) -> CoreResult<Removal> {
        self.reclaim.remove(owner_id, entry_id).await
    }

    pub async fn entry(&self, entry_id: &str) -> CoreResult<OwnershipEntry> {
        let mut conn = self.core.db.pool().acquire().await?;
        require_entry(&mut conn, entry_id).await
    }

    /// Entries owned by `owner_id`, oldest first
    pub async fn entries_for_owner(&self, owner_id: &str) -> CoreResult<Vec<OwnershipEntry>> {
        let mut conn = self.core.db.pool().acquire().await?;
        ownership::list_for_owner(&mut conn, owner_id).await
    }

    pub async fn content_record(&self, fingerprint: &Fingerprint) -> CoreResult<ContentRecord> {
        let mut conn = self.core.db.pool().acquire().await?;
        index::get(&mut conn, fingerprint)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("content {}", fingerprint)))
    }

    pub async fn rename_entry(
        &self,
        caller: &str,
        entry_id: &str,
        display_name: &str,
    ) -> CoreResult<OwnershipEntry> {
        if display_name.trim().is_empty() {
            return Err(CoreError::InvalidArgument("display name must not be empty".into()));
        }
        let mut tx = self.core.db.begin().await?;
        require_owned(&mut tx, caller, entry_id).await?;
        ownership::set_display_name(&mut tx, entry_id, display_name).await?;
        let entry = require_entry(&mut tx, entry_id).await?;
        tx.commit().await?;

        tracing::info!(caller, entry_id, display_name, "entry renamed");
        Ok(entry)
    }

    pub async fn set_visibility(
        &self,
        caller: &str,
        entry_id: &str,
        visibility: Visibility,
    ) -> CoreResult<OwnershipEntry> {
        let mut tx = self.core.db.begin().await?;
        require_owned(&mut tx, caller, entry_id).await?;
        ownership::set_visibility(&mut tx, entry_id, visibility).await?;
        let entry = require_entry(&mut tx, entry_id).await?;
        tx.commit().await?;

        tracing::info!(caller, entry_id, %visibility, "visibility changed");
        Ok(entry)
    }

    pub async fn set_tags(
        &self,
        caller: &str,
        entry_id: &str,
        tags: &[String],
    ) -> CoreResult<OwnershipEntry> {
        let mut tx = self.core.db.begin().await?;
        require_owned(&mut tx, caller, entry_id).await?;
        ownership::set_tags(&mut tx, entry_id, tags).await?;
        let entry = require_entry(&mut tx, entry_id).await?;
        tx.commit().await?;

        tracing::info!(caller, entry_id, tags = tags.len(), "tags replaced");
        Ok(entry)
    }

    /// Read an entry's bytes and count the download.
    ///
    /// Allowed for the owner, or for anyone when the entry is public.
    pub async fn open_content(&self, caller: &str, entry_id: &str) -> CoreResult<OpenedContent> {
        let entry = self.readable_entry(caller, entry_id).await?;

        // Held so the object cannot be reclaimed mid-read.
        let _guard = self.core.fingerprint_locks.acquire(&entry.fingerprint).await?;

        let mut conn = self.core.db.pool().acquire().await?;
        let record = index::get(&mut conn, &entry.fingerprint)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("content {}", entry.fingerprint)))?;
        let bytes = self.core.store.get(&entry.fingerprint).await?;

        let download_count = ownership::increment_downloads(&mut conn, entry_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("entry {}", entry_id)))?;

        tracing::debug!(caller, entry_id, download_count, "content opened");
        Ok(OpenedContent {
            entry: OwnershipEntry {
                download_count,
                ..entry
            },
            record,
            bytes,
        })
    }

    /// Stable handle for issuing retrieval URLs, under the same access rule
    /// as [`Vault::open_content`].
    pub async fn physical_location(&self, caller: &str, entry_id: &str) -> CoreResult<String> {
        let entry = self.readable_entry(caller, entry_id).await?;
        Ok(self.content_record(&entry.fingerprint).await?.physical_location)
    }

    pub async fn quota(&self, owner_id: &str) -> CoreResult<QuotaRecord> {
        let mut conn = self.core.db.pool().acquire().await?;
        quota::get_or_default(&mut conn, owner_id, self.core.default_byte_limit).await
    }

    pub async fn set_byte_limit(&self, owner_id: &str, byte_limit: u64) -> CoreResult<QuotaRecord> {
        let _guard = self.core.owner_locks.acquire(&owner_id.to_string()).await?;

        let mut conn = self.core.db.pool().acquire().await?;
        let record = quota::set_limit(&mut conn, owner_id, byte_limit).await?;

        tracing::info!(owner_id, byte_limit, charged = record.bytes_charged, "byte limit set");
        Ok(record)
    }

    pub async fn sweep_orphans(&self, dry_run: bool) -> CoreResult<SweepReport> {
        gc::sweep_orphans(&self.core, dry_run).await
    }

    pub async fn verify(&self) -> CoreResult<VerifyReport> {
        gc::verify(&self.core).await
    }

    async fn readable_entry(&self, caller: &str, entry_id: &str) -> CoreResult<OwnershipEntry> {
        let entry = self.entry(entry_id).await?;
        if !entry.is_readable_by(caller) {
            return Err(CoreError::Forbidden {
                caller: caller.to_string(),
                entry_id: entry_id.to_string(),
            });
        }
        Ok(entry)
    }
}

async fn require_entry(conn: &mut SqliteConnection, entry_id: &str) -> CoreResult<OwnershipEntry> {
    ownership::get(conn, entry_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("entry {}", entry_id)))
}

async fn require_owned(
    conn: &mut SqliteConnection,
    caller: &str,
    entry_id: &str,
) -> CoreResult<OwnershipEntry> {
    let entry = require_entry(conn, entry_id).await?;
    if entry.owner_id != caller {
        return Err(CoreError::Forbidden {
            caller: caller.to_string(),
            entry_id: entry_id.to_string(),
        });
    }
    Ok(entry)
}
