//! Read-through cache with TTL expiry and insertion-order eviction.
//!
//! Expired entries are dropped lazily on read. When the cache is full the
//! entry inserted earliest is evicted; recency of reads and overwrites is
//! not tracked.
//! Concurrent misses on the same key each invoke the fetch function.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Keys in insertion order, tagged with the sequence of the insert.
    /// Tags that no longer match the live entry are stale and skipped.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }
}

impl<V> CacheState<V> {
    fn evict_oldest(&mut self) -> Option<String> {
        while let Some((seq, key)) = self.order.pop_front() {
            if self.entries.get(&key).is_some_and(|e| e.seq == seq) {
                self.entries.remove(&key);
                return Some(key);
            }
        }
        None
    }

    fn compact_order(&mut self) {
        if self.order.len() > self.entries.len().saturating_mul(2).max(16) {
            let entries = &self.entries;
            self.order
                .retain(|(seq, key)| entries.get(key).is_some_and(|e| e.seq == *seq));
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live entries, including expired ones not yet read.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that fell through to the fetch function.
    pub misses: u64,
    /// Entries evicted to make room.
    pub evictions: u64,
}

/// Cache-aside store for one target.
pub struct CacheAside<V> {
    name: String,
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> CacheAside<V> {
    /// Creates an empty cache for the named target.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the cached value for `key`, or runs `fetch`, stores its value
    /// and returns it. Errors from `fetch` are returned and nothing is cached.
    pub async fn get<E, F, Fut>(&self, key: &str, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }

        let value = fetch().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Returns the cached value without fetching. Counts as a hit or miss.
    pub fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut s = self.state.lock();
        match s.entries.get(key).map(|e| (e.is_expired(now), e.value.clone())) {
            Some((false, value)) => {
                s.hits += 1;
                Some(value)
            }
            Some((true, _)) => {
                s.entries.remove(key);
                s.misses += 1;
                None
            }
            None => {
                s.misses += 1;
                None
            }
        }
    }

    /// Returns the cached value without touching the counters.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone())
    }

    /// Stores `value` under `key` for the configured TTL.
    ///
    /// Overwriting a present key refreshes its value and expiry but keeps
    /// its original insertion position for eviction.
    pub fn insert(&self, key: &str, value: V) {
        let expires_at = Instant::now() + self.config.ttl();
        let evicted = {
            let mut s = self.state.lock();
            let evicted = if !s.entries.contains_key(key) && s.entries.len() >= self.config.max_size {
                let evicted = s.evict_oldest();
                if evicted.is_some() {
                    s.evictions += 1;
                }
                evicted
            } else {
                None
            };

            let existing_seq = s.entries.get(key).map(|e| e.seq);
            let seq = match existing_seq {
                Some(seq) => seq,
                None => {
                    let seq = s.next_seq;
                    s.next_seq += 1;
                    s.order.push_back((seq, key.to_string()));
                    seq
                }
            };
            s.entries.insert(
                key.to_string(),
                CacheEntry {
                    value,
                    expires_at,
                    seq,
                },
            );
            s.compact_order();
            evicted
        };

        if let Some(evicted) = evicted {
            debug!(target_name = %self.name, key = %evicted, "Evicted cache entry");
        }
    }

    /// Removes `key`. Returns true if it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Removes every entry. Counters are kept.
    pub fn clear(&self) {
        let mut s = self.state.lock();
        s.entries.clear();
        s.order.clear();
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Returns the cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let s = self.state.lock();
        CacheStats {
            size: s.entries.len(),
            max_size: self.config.max_size,
            hits: s.hits,
            misses: s.misses,
            evictions: s.evictions,
        }
    }
}

impl<V> fmt::Debug for CacheAside<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheAside")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::convert::Infallible;
    use std::time::Duration;

    fn cache(ttl_ms: u64, max_size: usize) -> CacheAside<String> {
        CacheAside::new("catalog", CacheConfig::new(ttl_ms, max_size))
    }

    async fn fetch_counted(
        c: &CacheAside<String>,
        key: &str,
        value: &str,
        calls: &mut u32,
    ) -> String {
        c.get(key, || {
            *calls += 1;
            async move { Ok::<_, Infallible>(value.to_string()) }
        })
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_skips_fetch() {
        let c = cache(1_000, 10);
        let mut calls = 0;

        assert_eq!(fetch_counted(&c, "sku-1", "lamp", &mut calls).await, "lamp");
        assert_eq!(fetch_counted(&c, "sku-1", "other", &mut calls).await, "lamp");
        assert_eq!(calls, 1);

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_refetched() {
        let c = cache(1_000, 10);
        let mut calls = 0;

        fetch_counted(&c, "sku-1", "v1", &mut calls).await;
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(fetch_counted(&c, "sku-1", "v2", &mut calls).await, "v1");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(c.peek("sku-1").is_none());
        assert_eq!(fetch_counted(&c, "sku-1", "v2", &mut calls).await, "v2");
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_oldest_insert_when_full() {
        let c = cache(60_000, 2);
        c.insert("a", "1".to_string());
        c.insert("b", "2".to_string());

        // Reads do not refresh position.
        assert!(c.lookup("a").is_some());
        c.insert("c", "3".to_string());

        assert!(c.peek("a").is_none());
        assert_eq!(c.peek("b").as_deref(), Some("2"));
        assert_eq!(c.peek("c").as_deref(), Some("3"));
        assert_eq!(c.len(), 2);
        assert_eq!(c.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_keeps_insertion_position() {
        let c = cache(60_000, 2);
        c.insert("a", "1".to_string());
        c.insert("b", "2".to_string());
        c.insert("a", "1b".to_string());

        assert_eq!(c.len(), 2);
        assert_eq!(c.stats().evictions, 0);
        assert_eq!(c.peek("a").as_deref(), Some("1b"));

        // "a" was inserted first, so it still goes first.
        c.insert("c", "3".to_string());
        assert!(c.peek("a").is_none());
        assert_eq!(c.peek("b").as_deref(), Some("2"));
        assert_eq!(c.peek("c").as_deref(), Some("3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_not_cached() {
        let c = cache(60_000, 2);
        let result: Result<String, &str> = c.get("k", || async { Err("upstream down") }).await;
        assert_eq!(result, Err("upstream down"));
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_clear() {
        let c = cache(60_000, 10);
        c.insert("a", "1".to_string());
        c.insert("b", "2".to_string());

        assert!(c.invalidate("a"));
        assert!(!c.invalidate("a"));
        assert_eq!(c.len(), 1);

        c.clear();
        assert!(c.is_empty());
    }
}
