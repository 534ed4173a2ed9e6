#![allow(dead_code)]

use async_trait::async_trait;
use cast_store::db::MetadataDb;
use cast_store::{ContentStore, CoreError, CoreResult, Fingerprint, LocalContentStore, Vault};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const TEN_MB: u64 = 10_000_000;

/// Local store that counts physical writes and can be told to misbehave
pub struct TestStore {
    inner: LocalContentStore,
    writes: AtomicUsize,
    failing: Mutex<HashSet<Fingerprint>>,
    hanging: Mutex<HashSet<Fingerprint>>,
    hang_after_write: AtomicBool,
    hang_after_stage: AtomicBool,
}

impl TestStore {
    pub async fn new(temp: &TempDir) -> Arc<Self> {
        let inner = LocalContentStore::with_store_path(temp.path().join("store"));
        inner.initialize().await.unwrap();
        Arc::new(Self {
            inner,
            writes: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            hang_after_write: AtomicBool::new(false),
            hang_after_stage: AtomicBool::new(false),
        })
    }

    /// Objects actually created by `put`
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every `put` and `size` of `data` fail
    pub fn fail_on(&self, data: &[u8]) {
        self.failing.lock().unwrap().insert(Fingerprint::compute(data));
    }

    /// Make every `put` of `data` block forever before writing
    pub fn hang_on(&self, data: &[u8]) {
        self.hanging.lock().unwrap().insert(Fingerprint::compute(data));
    }

    /// Make `put` write the object and then never return
    pub fn hang_after_write(&self, hang: bool) {
        self.hang_after_write.store(hang, Ordering::SeqCst);
    }

    /// Make `stage_removal` move the object aside and then never return
    pub fn hang_after_stage(&self, hang: bool) {
        self.hang_after_stage.store(hang, Ordering::SeqCst);
    }

    fn is_failing(&self, fingerprint: &Fingerprint) -> bool {
        self.failing.lock().unwrap().contains(fingerprint)
    }
}

#[async_trait]
impl ContentStore for TestStore {
    async fn put(&self, fingerprint: &Fingerprint, data: &[u8]) -> CoreResult<bool> {
        if self.is_failing(fingerprint) {
            return Err(CoreError::StorageUnavailable("disk on fire".into()));
        }
        let hangs = self.hanging.lock().unwrap().contains(fingerprint);
        if hangs {
            std::future::pending::<()>().await;
        }

        let created = self.inner.put(fingerprint, data).await?;
        if created {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        if self.hang_after_write.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(created)
    }

    async fn get(&self, fingerprint: &Fingerprint) -> CoreResult<Vec<u8>> {
        self.inner.get(fingerprint).await
    }

    async fn exists(&self, fingerprint: &Fingerprint) -> CoreResult<bool> {
        self.inner.exists(fingerprint).await
    }

    async fn size(&self, fingerprint: &Fingerprint) -> CoreResult<u64> {
        if self.is_failing(fingerprint) {
            return Err(CoreError::StorageUnavailable("disk on fire".into()));
        }
        self.inner.size(fingerprint).await
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> CoreResult<bool> {
        self.inner.delete(fingerprint).await
    }

    async fn list(&self) -> CoreResult<Vec<Fingerprint>> {
        self.inner.list().await
    }

    async fn stage_removal(&self, fingerprint: &Fingerprint) -> CoreResult<bool> {
        let moved = self.inner.stage_removal(fingerprint).await?;
        if self.hang_after_stage.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(moved)
    }

    async fn finish_removal(&self, fingerprint: &Fingerprint) -> CoreResult<()> {
        self.inner.finish_removal(fingerprint).await
    }

    async fn abort_removal(&self, fingerprint: &Fingerprint) -> CoreResult<()> {
        self.inner.abort_removal(fingerprint).await
    }

    async fn list_staged(&self) -> CoreResult<Vec<Fingerprint>> {
        self.inner.list_staged().await
    }
}

pub struct Harness {
    pub vault: Arc<Vault>,
    pub store: Arc<TestStore>,
    _temp: TempDir,
}

pub async fn harness() -> Harness {
    harness_with_limit(TEN_MB).await
}

pub async fn harness_with_limit(default_byte_limit: u64) -> Harness {
    let temp = TempDir::new().unwrap();
    let db = MetadataDb::in_memory().await.unwrap();
    build(temp, db, default_byte_limit).await
}

/// File-backed database with a pool of `max_connections`
pub async fn harness_on_disk(max_connections: u32) -> Harness {
    let temp = TempDir::new().unwrap();
    let db = MetadataDb::open(&temp.path().join("meta.db"), max_connections)
        .await
        .unwrap();
    build(temp, db, TEN_MB).await
}

async fn build(temp: TempDir, db: MetadataDb, default_byte_limit: u64) -> Harness {
    let store = TestStore::new(&temp).await;
    let vault = Vault::with_parts(db, store.clone(), default_byte_limit, Duration::from_secs(30));

    Harness {
        vault: Arc::new(vault),
        store,
        _temp: temp,
    }
}

/// Poll `check` until it holds, for work finished by background tasks
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Deterministic non-repeating bytes
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
