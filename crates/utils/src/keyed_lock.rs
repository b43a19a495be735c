//! Per-key async mutex whose entries disappear once nobody holds or waits on them

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

/// Guard returned by [`KeyedAsyncLock::lock`].
///
/// Dropping it releases the key and removes the map entry when no other task
/// holds a clone of the same mutex.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        // Entry clones are only handed out under the shard lock, so a count of two
        // (map + this guard) means there is no waiter.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 2);
        drop(self.guard.take());
    }
}

/// Serializes operations that share a key while letting different keys run in parallel.
///
/// ```rust,ignore
/// let locks = KeyedAsyncLock::<String>::new();
/// let _guard = locks.lock(&"default/my-pod".to_string()).await;
/// // bind or release the pod here
/// ```
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Waits until the key is free and takes it.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = mutex.lock_owned().await;

        KeyedLockGuard {
            guard: Some(guard),
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedAsyncLock::<String>::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&"default/pod-a".to_string()).await;
                let val = counter.load(Ordering::SeqCst);
                sleep(Duration::from_millis(1)).await;
                counter.store(val + 1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.expect("task should not panic");
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(locks.is_empty(), "entries should be cleaned up");
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedAsyncLock::<String>::new();

        let _a = locks.lock(&"a".to_string()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&"b".to_string())).await;

        assert!(b.is_ok(), "lock on another key should be immediate");
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_exists() {
        let locks = Arc::new(KeyedAsyncLock::<String>::new());
        let first = locks.lock(&"k".to_string()).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(&"k".to_string()).await;
            })
        };
        sleep(Duration::from_millis(10)).await;

        drop(first);
        assert_eq!(locks.len(), 1, "waiter still references the entry");

        waiter.await.expect("waiter should finish");
        assert!(locks.is_empty());
    }
}
