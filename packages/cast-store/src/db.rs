// SQLite metadata database
use crate::error::CoreResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS content_records (
        fingerprint TEXT PRIMARY KEY NOT NULL,
        content_type TEXT NOT NULL,
        byte_size INTEGER NOT NULL CHECK (byte_size >= 0),
        physical_location TEXT NOT NULL,
        ref_count INTEGER NOT NULL CHECK (ref_count >= 0),
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ownership_entries (
        id TEXT PRIMARY KEY NOT NULL,
        fingerprint TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        uploader_name TEXT NOT NULL,
        display_name TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '[]',
        visibility TEXT NOT NULL DEFAULT 'private',
        is_duplicate INTEGER NOT NULL DEFAULT 0,
        download_count INTEGER NOT NULL DEFAULT 0 CHECK (download_count >= 0),
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_entries_owner_fingerprint
        ON ownership_entries (owner_id, fingerprint)",
    "CREATE INDEX IF NOT EXISTS idx_entries_fingerprint
        ON ownership_entries (fingerprint)",
    "CREATE TABLE IF NOT EXISTS quota_records (
        owner_id TEXT PRIMARY KEY NOT NULL,
        bytes_charged INTEGER NOT NULL CHECK (bytes_charged >= 0),
        byte_limit INTEGER NOT NULL CHECK (byte_limit >= 0)
    )",
];

/// Metadata database holding the three ledgers
#[derive(Clone)]
pub struct MetadataDb {
    pool: SqlitePool,
}

impl MetadataDb {
    /// Create or open the database at `db_path` and migrate it
    pub async fn open(db_path: &Path, max_connections: u32) -> CoreResult<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new().max_connections(max_connections);
        Self::connect(pool, opts).await
    }

    /// Private in-memory database, for tests and dry runs
    pub async fn in_memory() -> CoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection would see its own empty database, and closing the
        // last one drops the data.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        Self::connect(pool, opts).await
    }

    async fn connect(pool: SqlitePoolOptions, opts: SqliteConnectOptions) -> CoreResult<Self> {
        let pool = pool.connect_with(opts).await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> CoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        tracing::debug!("metadata schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a write transaction; nothing it does is visible until commit.
    ///
    /// Takes the write lock up front, so concurrent writers queue on the busy
    /// timeout instead of failing when a read-first transaction upgrades.
    pub async fn begin(&self) -> CoreResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}
