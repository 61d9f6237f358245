//! Async locks keyed by peer or group.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per key. Entries exist only while someone holds or waits
/// for them.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

/// Held lock for one key; releasing the last holder drops the entry
#[derive(Debug)]
pub struct KeyedGuard<'a, K: Eq + Hash> {
    owner: &'a KeyedLocks<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for the lock on `key`
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        KeyedGuard {
            owner: self,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Keys currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no key is held or waited on
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.owner.locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_last_holder() {
        let locks = KeyedLocks::new();
        let first = locks.lock("a".to_string()).await;
        let _other = locks.lock("b".to_string()).await;
        assert_eq!(locks.len(), 2);

        drop(first);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let locks = Arc::new(KeyedLocks::new());
        let held = locks.lock(1u32).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(1u32).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_entry() {
        let locks = KeyedLocks::new();
        let held = locks.lock(7u32).await;
        let waited = tokio::time::timeout(Duration::from_millis(20), locks.lock(7u32)).await;
        assert!(waited.is_err());

        drop(held);
        assert!(locks.is_empty());
    }
}
