//! Memory cache for recently fetched payloads
//!
//! A single read/write lock guards an LRU map from object ID to bytes.
//! Lookups share the read lock and never block each other; appends take the
//! write lock, so readers never observe a half-applied chunk.
//!
//! Two limits apply:
//! - a per-entry ceiling: an append that would cross it evicts the whole
//!   entry instead of truncating it
//! - a total budget: least-recently-used entries are dropped until the
//!   cache fits again

use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use lru::LruCache;

use crate::config::CacheConfig;
use crate::types::ObjectId;

/// Result of appending a chunk to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The chunk was added; the entry now holds this many bytes
    Stored(u64),
    /// The entry would have crossed the per-entry ceiling and was removed
    Evicted,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

struct Inner {
    entries: LruCache<ObjectId, Vec<u8>>,
    total_bytes: u64,
}

/// Capacity-bounded, thread-safe payload cache.
///
/// Construct once and share through an `Arc`.
pub struct MemoryCache {
    inner: RwLock<Inner>,
    entry_limit: u64,
    total_limit: u64,
}

impl MemoryCache {
    pub fn new(entry_limit: u64, total_limit: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            entry_limit,
            total_limit: total_limit.max(entry_limit),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.entry_limit_bytes, config.total_limit_bytes)
    }

    /// Look up the payload stored for `id`.
    ///
    /// Recency is refreshed only if the write lock is free right now, so a
    /// read never waits on a writer it does not need.
    pub fn get(&self, id: &ObjectId) -> Option<Bytes> {
        let payload = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.entries.peek(id).map(|v| Bytes::copy_from_slice(v))
        }?;

        if let Ok(mut inner) = self.inner.try_write() {
            inner.entries.promote(id);
        }
        Some(payload)
    }

    /// Grow the entry for `id` by `chunk`, creating it if absent.
    ///
    /// Crossing the per-entry ceiling removes the entry; the next `get`
    /// reports a miss. This is not an error.
    pub fn append(&self, id: &ObjectId, chunk: &[u8]) -> AppendOutcome {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;

        let current = inner.entries.peek(id).map_or(0, |v| v.len() as u64);
        let new_len = current + chunk.len() as u64;
        if new_len > self.entry_limit {
            if let Some(evicted) = inner.entries.pop(id) {
                inner.total_bytes -= evicted.len() as u64;
            }
            tracing::debug!(
                "Evicted cache entry {} at {} bytes (limit {})",
                id,
                new_len,
                self.entry_limit
            );
            return AppendOutcome::Evicted;
        }

        if let Some(entry) = inner.entries.get_mut(id) {
            entry.extend_from_slice(chunk);
        } else {
            inner.entries.put(id.clone(), chunk.to_vec());
        }
        inner.total_bytes += chunk.len() as u64;

        // The entry just written is most recent, so it is never the one popped
        // while anything else remains.
        while inner.total_bytes > self.total_limit && inner.entries.len() > 1 {
            match inner.entries.pop_lru() {
                Some((victim, payload)) => {
                    inner.total_bytes -= payload.len() as u64;
                    tracing::debug!("Evicted least recently used cache entry {}", victim);
                }
                None => break,
            }
        }

        AppendOutcome::Stored(new_len)
    }

    /// Drop the entry for `id`, if any.
    pub fn clear(&self, id: &ObjectId) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(payload) = inner.entries.pop(id) {
            inner.total_bytes -= payload.len() as u64;
        }
    }

    /// Drop every entry.
    pub fn clear_all(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.contains(id)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
        }
    }

    pub fn entry_limit(&self) -> u64 {
        self.entry_limit
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    #[test]
    fn test_get_missing_entry() {
        let cache = MemoryCache::new(10, 100);
        assert!(cache.get(&id("a")).is_none());
    }

    #[test]
    fn test_append_accumulates_in_order() {
        let cache = MemoryCache::new(100, 1000);
        assert_eq!(cache.append(&id("a"), b"hello "), AppendOutcome::Stored(6));
        assert_eq!(cache.append(&id("a"), b"world"), AppendOutcome::Stored(11));
        assert_eq!(cache.get(&id("a")).unwrap(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_crossing_ceiling_evicts_whole_entry() {
        let cache = MemoryCache::new(10, 100);
        assert_eq!(cache.append(&id("a"), &[1; 6]), AppendOutcome::Stored(6));
        assert_eq!(cache.append(&id("a"), &[2; 6]), AppendOutcome::Evicted);
        assert!(cache.get(&id("a")).is_none());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_exact_ceiling_is_kept() {
        let cache = MemoryCache::new(10, 100);
        cache.append(&id("a"), &[1; 4]);
        assert_eq!(cache.append(&id("a"), &[2; 6]), AppendOutcome::Stored(10));
        assert_eq!(cache.get(&id("a")).unwrap().len(), 10);
    }

    #[test]
    fn test_single_oversized_chunk_is_not_stored() {
        let cache = MemoryCache::new(10, 100);
        assert_eq!(cache.append(&id("a"), &[0; 11]), AppendOutcome::Evicted);
        assert!(!cache.contains(&id("a")));
    }

    #[test]
    fn test_clear_removes_entry_and_bytes() {
        let cache = MemoryCache::new(10, 100);
        cache.append(&id("a"), b"abc");
        cache.append(&id("b"), b"de");
        cache.clear(&id("a"));
        assert!(cache.get(&id("a")).is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                total_bytes: 2
            }
        );
        cache.clear_all();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_total_budget_evicts_least_recently_used() {
        let cache = MemoryCache::new(10, 20);
        cache.append(&id("a"), &[0; 8]);
        cache.append(&id("b"), &[0; 8]);

        // Reading "a" makes "b" the least recently used.
        assert!(cache.get(&id("a")).is_some());

        cache.append(&id("c"), &[0; 8]);
        assert!(cache.contains(&id("a")));
        assert!(!cache.contains(&id("b")));
        assert!(cache.contains(&id("c")));
        assert_eq!(cache.stats().total_bytes, 16);
    }

    #[test]
    fn test_total_budget_never_drops_entry_being_written() {
        let cache = MemoryCache::new(10, 10);
        cache.append(&id("a"), &[0; 6]);
        cache.append(&id("b"), &[0; 6]);
        assert!(!cache.contains(&id("a")));
        assert_eq!(cache.get(&id("b")).unwrap().len(), 6);
    }

    #[test]
    fn test_concurrent_appends_to_different_ids() {
        let cache = Arc::new(MemoryCache::new(1 << 20, 1 << 24));
        let handles: Vec<_> = (0..8u8)
            .map(|n| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let key = id(&format!("obj-{n}"));
                    for i in 0..100u8 {
                        cache.append(&key, &[n, i]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for n in 0..8u8 {
            let payload = cache.get(&id(&format!("obj-{n}"))).unwrap();
            let expected: Vec<u8> = (0..100u8).flat_map(|i| [n, i]).collect();
            assert_eq!(payload.as_ref(), expected.as_slice());
        }
    }
}
