// Local filesystem content store
use super::{ContentStore, StoreConfig};
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const TMP_DIR: &str = ".tmp";
const TRASH_DIR: &str = ".trash";

/// Local filesystem content store
///
/// Stores objects in a hierarchical directory structure based on fingerprint:
/// `store/{hex[:2]}/{hex[2:4]}/{hex}`
///
/// Writes land in `store/.tmp` first and are linked into place, so a reader
/// never observes a partially written object. Staged removals wait in
/// `store/.trash` until they are finished or aborted.
pub struct LocalContentStore {
    store_path: PathBuf,
}

impl LocalContentStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_store_path(config.store_path())
    }

    pub fn with_store_path<P: AsRef<Path>>(store_path: P) -> Self {
        Self {
            store_path: store_path.as_ref().to_path_buf(),
        }
    }

    /// Create the store, tmp and trash directories if missing
    pub async fn initialize(&self) -> CoreResult<()> {
        for dir in [
            self.store_path.clone(),
            self.store_path.join(TMP_DIR),
            self.store_path.join(TRASH_DIR),
        ] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                CoreError::io(format!("failed to create directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Uses hierarchical directory structure: `store/{hex[:2]}/{hex[2:4]}/{hex}`
    fn object_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();

        self.store_path.join(&hex[..2]).join(&hex[2..4]).join(&hex)
    }

    fn trash_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.store_path.join(TRASH_DIR).join(fingerprint.to_hex())
    }

    fn temp_path(&self) -> PathBuf {
        self.store_path
            .join(TMP_DIR)
            .join(uuid::Uuid::new_v4().to_string())
    }

    async fn write_temp(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }

    /// Remove now-empty shard directories after an object leaves them
    async fn cleanup_empty_dirs(&self, path: &Path) {
        let mut dir = path.parent();
        for _ in 0..2 {
            match dir {
                Some(d) if d.starts_with(&self.store_path) && d != self.store_path => {
                    // Only succeeds if empty
                    if fs::remove_dir(d).await.is_err() {
                        return;
                    }
                    dir = d.parent();
                }
                _ => return,
            }
        }
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn put(&self, fingerprint: &Fingerprint, data: &[u8]) -> CoreResult<bool> {
        let path = self.object_path(fingerprint);

        if fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(%fingerprint, "object already stored");
            return Ok(false);
        }

        let temp_path = self.temp_path();
        if let Err(e) = self.write_temp(&temp_path, data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CoreError::io(
                format!("failed to write {}", temp_path.display()),
                e,
            ));
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(CoreError::io(
                    format!("failed to create directory {}", parent.display()),
                    e,
                ));
            }
        }

        // A hard link never replaces an existing object.
        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => {
                tracing::info!(%fingerprint, bytes = data.len(), "stored object");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(%fingerprint, "lost write race, object already stored");
                Ok(false)
            }
            Err(e) => Err(CoreError::io(
                format!("failed to store {}", path.display()),
                e,
            )),
        }
    }

    async fn get(&self, fingerprint: &Fingerprint) -> CoreResult<Vec<u8>> {
        let path = self.object_path(fingerprint);

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CoreError::NotFound(format!("content {}", fingerprint)))
            }
            Err(e) => Err(CoreError::io(format!("failed to read {}", path.display()), e)),
        }
    }

    async fn exists(&self, fingerprint: &Fingerprint) -> CoreResult<bool> {
        let path = self.object_path(fingerprint);
        fs::try_exists(&path)
            .await
            .map_err(|e| CoreError::io(format!("failed to stat {}", path.display()), e))
    }

    async fn size(&self, fingerprint: &Fingerprint) -> CoreResult<u64> {
        let path = self.object_path(fingerprint);

        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CoreError::NotFound(format!("content {}", fingerprint)))
            }
            Err(e) => Err(CoreError::io(format!("failed to stat {}", path.display()), e)),
        }
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> CoreResult<bool> {
        let path = self.object_path(fingerprint);

        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(%fingerprint, "deleted object");
                self.cleanup_empty_dirs(&path).await;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::io(
                format!("failed to delete {}", path.display()),
                e,
            )),
        }
    }

    async fn list(&self) -> CoreResult<Vec<Fingerprint>> {
        let mut found = Vec::new();
        let mut pending = vec![(self.store_path.clone(), 0usize)];

        while let Some((dir, depth)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(CoreError::io(format!("failed to list {}", dir.display()), e))
                }
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| CoreError::io(format!("failed to list {}", dir.display()), e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if depth == 0 && (name == TMP_DIR || name == TRASH_DIR) {
                    continue;
                }

                let is_dir = entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);

                if depth < 2 {
                    if is_dir {
                        pending.push((entry.path(), depth + 1));
                    }
                } else if is_dir {
                    continue;
                } else if let Ok(fingerprint) = Fingerprint::from_str(&name) {
                    found.push(fingerprint);
                } else {
                    tracing::warn!(path = %entry.path().display(), "ignoring stray file in store");
                }
            }
        }

        found.sort();
        Ok(found)
    }

    async fn stage_removal(&self, fingerprint: &Fingerprint) -> CoreResult<bool> {
        let path = self.object_path(fingerprint);
        let trash = self.trash_path(fingerprint);

        if let Some(parent) = trash.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CoreError::io(format!("failed to create directory {}", parent.display()), e)
            })?;
        }

        match fs::rename(&path, &trash).await {
            Ok(()) => {
                tracing::debug!(%fingerprint, "staged object for removal");
                self.cleanup_empty_dirs(&path).await;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::io(
                format!("failed to stage removal of {}", path.display()),
                e,
            )),
        }
    }

    async fn finish_removal(&self, fingerprint: &Fingerprint) -> CoreResult<()> {
        let trash = self.trash_path(fingerprint);

        match fs::remove_file(&trash).await {
            Ok(()) => {
                tracing::info!(%fingerprint, "deleted object");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::io(
                format!("failed to delete {}", trash.display()),
                e,
            )),
        }
    }

    async fn abort_removal(&self, fingerprint: &Fingerprint) -> CoreResult<()> {
        let path = self.object_path(fingerprint);
        let trash = self.trash_path(fingerprint);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CoreError::io(format!("failed to create directory {}", parent.display()), e)
            })?;
        }

        let err = match fs::rename(&trash, &path).await {
            Ok(()) => {
                tracing::debug!(%fingerprint, "restored staged object");
                return Ok(());
            }
            Err(e) => e,
        };

        if err.kind() != ErrorKind::NotFound {
            return Err(CoreError::io(format!("failed to restore {}", path.display()), err));
        }
        // Settled twice: nothing staged and the object is already back
        if self.exists(fingerprint).await? {
            Ok(())
        } else {
            Err(CoreError::NotFound(format!("staged content {}", fingerprint)))
        }
    }

    async fn list_staged(&self) -> CoreResult<Vec<Fingerprint>> {
        let trash = self.store_path.join(TRASH_DIR);
        let mut entries = match fs::read_dir(&trash).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::io(format!("failed to list {}", trash.display()), e)),
        };

        let mut staged = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::io(format!("failed to list {}", trash.display()), e))?
        {
            if let Ok(fingerprint) = Fingerprint::from_str(&entry.file_name().to_string_lossy()) {
                staged.push(fingerprint);
            }
        }

        staged.sort();
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_store() -> (LocalContentStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalContentStore::with_store_path(temp_dir.path().join("store"));
        store.initialize().await.unwrap();
        (store, temp_dir)
    }

    async fn put(store: &LocalContentStore, data: &[u8]) -> Fingerprint {
        let fingerprint = Fingerprint::compute(data);
        store.put(&fingerprint, data).await.unwrap();
        fingerprint
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp) = create_test_store().await;

        let data = b"test data for storage";
        let fingerprint = put(&store, data).await;

        assert_eq!(store.get(&fingerprint).await.unwrap(), data);
        assert_eq!(store.size(&fingerprint).await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let (store, _temp) = create_test_store().await;

        let data = b"duplicate data";
        let fingerprint = Fingerprint::compute(data);

        assert!(store.put(&fingerprint, data).await.unwrap());
        assert!(!store.put(&fingerprint, data).await.unwrap());

        let leftovers: Vec<_> = std::fs::read_dir(store.store_path().join(TMP_DIR))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_puts_same_content() {
        let (store, _temp) = create_test_store().await;
        let store = std::sync::Arc::new(store);
        let data = b"concurrent test data".to_vec();
        let fingerprint = Fingerprint::compute(&data);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let data = data.clone();
            handles.push(tokio::spawn(
                async move { store.put(&fingerprint, &data).await },
            ));
        }

        let mut writes = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                writes += 1;
            }
        }

        assert_eq!(writes, 1);
        assert_eq!(store.get(&fingerprint).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_empty_object() {
        let (store, _temp) = create_test_store().await;

        let fingerprint = put(&store, b"").await;
        assert!(store.exists(&fingerprint).await.unwrap());
        assert_eq!(store.size(&fingerprint).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let (store, _temp) = create_test_store().await;
        let fingerprint = Fingerprint::compute(b"nonexistent");

        assert!(!store.exists(&fingerprint).await.unwrap());
        assert!(matches!(
            store.get(&fingerprint).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_prunes_shards() {
        let (store, _temp) = create_test_store().await;

        let fingerprint = put(&store, b"delete me").await;
        let shard = store.object_path(&fingerprint).parent().unwrap().to_path_buf();

        assert!(store.delete(&fingerprint).await.unwrap());
        assert!(!store.exists(&fingerprint).await.unwrap());
        assert!(!shard.exists());
        assert!(!store.delete(&fingerprint).await.unwrap());
    }

    #[tokio::test]
    async fn test_object_path_structure() {
        let (store, _temp) = create_test_store().await;

        let fingerprint = Fingerprint::compute(b"test");
        let path = store.object_path(&fingerprint);

        let hex = fingerprint.to_hex();
        let expected = store.store_path().join(&hex[..2]).join(&hex[2..4]).join(&hex);
        assert_eq!(path, expected);
    }

    #[tokio::test]
    async fn test_list_skips_internal_dirs() {
        let (store, _temp) = create_test_store().await;

        let a = put(&store, b"one").await;
        let b = put(&store, b"two").await;
        std::fs::write(store.store_path().join(TMP_DIR).join("partial"), b"x").unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.list().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_staged_removal_abort_restores() {
        let (store, _temp) = create_test_store().await;

        let fingerprint = put(&store, b"staged").await;

        assert!(store.stage_removal(&fingerprint).await.unwrap());
        assert!(!store.exists(&fingerprint).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.list_staged().await.unwrap(), vec![fingerprint]);

        store.abort_removal(&fingerprint).await.unwrap();
        assert_eq!(store.get(&fingerprint).await.unwrap(), b"staged");

        // A second abort finds the object already restored
        store.abort_removal(&fingerprint).await.unwrap();
        let missing = Fingerprint::compute(b"never stored");
        assert!(matches!(
            store.abort_removal(&missing).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_staged_removal_finish() {
        let (store, _temp) = create_test_store().await;

        let fingerprint = put(&store, b"gone").await;

        assert!(store.stage_removal(&fingerprint).await.unwrap());
        store.finish_removal(&fingerprint).await.unwrap();

        assert!(!store.exists(&fingerprint).await.unwrap());
        assert!(!store.trash_path(&fingerprint).exists());
        assert!(store.list_staged().await.unwrap().is_empty());
        assert!(!store.stage_removal(&fingerprint).await.unwrap());
    }

    #[tokio::test]
    async fn test_large_object() {
        let (store, _temp) = create_test_store().await;

        let data = vec![0xAB; 1_000_000];
        let fingerprint = put(&store, &data).await;

        assert_eq!(store.get(&fingerprint).await.unwrap(), data);
    }
}
