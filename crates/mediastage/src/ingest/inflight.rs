//! Per-object locks
//!
//! Serializes ingestions of the same object ID while leaving different IDs
//! independent. Entries are dropped from the map once nobody holds or waits
//! on them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::ObjectId;

type LockMap = DashMap<ObjectId, Arc<Mutex<()>>>;

#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other holder has `key`, then hold it until the guard drops.
    pub async fn lock(&self, key: &ObjectId) -> KeyGuard {
        let mutex = Arc::clone(&self.locks.entry(key.clone()).or_default());
        // Created before the wait so a dropped waiter still prunes the entry.
        let mut held = KeyGuard {
            locks: Arc::clone(&self.locks),
            key: key.clone(),
            guard: None,
        };
        let acquire = mutex.lock_owned();
        held.guard = Some(acquire.await);
        held
    }

    /// Keys currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock for one key, or a pending wait for it
#[derive(Debug)]
pub struct KeyGuard {
    locks: Arc<LockMap>,
    key: ObjectId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let _guard = locks.lock(&id("same")).await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&id("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&id("b"))).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_leak_entry() {
        let locks = KeyedLocks::new();
        let holder = locks.lock(&id("a")).await;

        let key = id("a");
        let mut waiter = Box::pin(locks.lock(&key));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        // Released while the waiter is still registered, then the waiter gives up.
        drop(holder);
        assert_eq!(locks.len(), 1);
        drop(waiter);

        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.lock(&id("a")).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
