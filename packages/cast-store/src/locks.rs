// Per-key mutual exclusion
//
// One async mutex per live key, created on first use and dropped again once
// no task holds or waits for it.
use crate::error::{CoreError, CoreResult};
use dashmap::DashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots<K> = DashMap<K, Arc<Mutex<()>>>;

pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone + Display,
{
    slots: Arc<Slots<K>>,
    timeout: Duration,
    kind: &'static str,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + Display,
{
    /// `kind` names the key space in conflict errors and logs
    pub fn new(kind: &'static str, timeout: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            timeout,
            kind,
        }
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Fails with `ConcurrencyConflict` if the lock is not free within the
    /// configured timeout.
    pub async fn acquire(&self, key: &K) -> CoreResult<KeyGuard<K>> {
        let slot = self.slots.entry(key.clone()).or_default().clone();

        match tokio::time::timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(KeyGuard {
                guard: Some(guard),
                key: key.clone(),
                slots: self.slots.clone(),
            }),
            Err(_) => {
                // The waiter's clone must be gone before pruning.
                release_slot(&self.slots, key);
                tracing::warn!(kind = self.kind, %key, timeout = ?self.timeout, "lock wait timed out");
                Err(CoreError::ConcurrencyConflict(format!(
                    "timed out waiting for {} lock on {}",
                    self.kind, key
                )))
            }
        }
    }

    /// Acquire several keys in ascending order, skipping repeats.
    pub async fn acquire_all(&self, keys: &[K]) -> CoreResult<Vec<KeyGuard<K>>>
    where
        K: Ord,
    {
        let mut ordered: Vec<&K> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.acquire(key).await?);
        }
        Ok(guards)
    }

    /// Number of keys with a live slot
    pub fn active(&self) -> usize {
        self.slots.len()
    }
}

fn release_slot<K: Eq + Hash>(slots: &Slots<K>, key: &K) {
    slots.remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
}

/// Exclusive access to one key, released on drop
pub struct KeyGuard<K>
where
    K: Eq + Hash + Clone + Display,
{
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    slots: Arc<Slots<K>>,
}

impl<K> KeyGuard<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyGuard<K>
where
    K: Eq + Hash + Clone + Display,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        release_slot(&self.slots, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn locks() -> KeyedLocks<String> {
        KeyedLocks::new("test", Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_slot_removed_after_release() {
        let locks = locks();

        let guard = locks.acquire(&"a".to_string()).await.unwrap();
        assert_eq!(guard.key(), "a");
        assert_eq!(locks.active(), 1);

        drop(guard);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_same_key_times_out() {
        let locks = locks();
        let key = "a".to_string();

        let _held = locks.acquire(&key).await.unwrap();
        let err = locks.acquire(&key).await.err().unwrap();
        assert!(matches!(err, CoreError::ConcurrencyConflict(_)));
        assert_eq!(locks.active(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_independent() {
        let locks = locks();

        let _a = locks.acquire(&"a".to_string()).await.unwrap();
        let _b = locks.acquire(&"b".to_string()).await.unwrap();
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_acquire_all_dedups() {
        let locks = locks();
        let keys = vec!["b".to_string(), "a".to_string(), "b".to_string()];

        let guards = locks.acquire_all(&keys).await.unwrap();
        let held: Vec<&String> = guards.iter().map(|g| g.key()).collect();
        assert_eq!(held, vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion() {
        let locks = Arc::new(KeyedLocks::new("test", Duration::from_secs(10)));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&"shared".to_string()).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }
}
