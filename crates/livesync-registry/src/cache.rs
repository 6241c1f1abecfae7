//! TTL + insertion-order LRU response cache.
//!
//! Entries are never returned past their TTL. When the entry count exceeds
//! `max_size` the oldest insertion is evicted; re-inserting a key moves it
//! to the back. Ages are measured on the monotonic clock.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Cached upstream payload.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub data: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Fresh while `now - inserted_at < ttl`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Keys in insertion order, oldest first.
    order: VecDeque<String>,
}

impl<V> CacheInner<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let removed = self.entries.remove(key)?;
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        Some(removed)
    }
}

/// Response cache keyed by request key.
pub struct ResponseCache<V> {
    inner: Mutex<CacheInner<V>>,
    max_size: usize,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_size: max_size.max(1),
        }
    }

    /// Get a fresh entry's data. Expired entries are removed on read.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = inner.entries.get(key)?;
        if entry.is_fresh(now) {
            return Some(entry.data.clone());
        }
        inner.remove(key);
        debug!(key, "Cache entry expired");
        None
    }

    /// Store a payload, evicting the oldest insertions past `max_size`.
    pub fn insert(&self, key: impl Into<String>, data: V, ttl: Duration) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            data,
            inserted_at: Instant::now(),
            ttl,
        };

        let mut inner = self.inner.lock();
        inner.remove(&key);
        inner.order.push_back(key.clone());
        inner.entries.insert(key, entry);

        while inner.entries.len() > self.max_size {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            debug!(key = %oldest, "Cache entry evicted");
        }
    }

    /// Remove a single key.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.is_fresh(now));
        let CacheInner { entries, order } = &mut *inner;
        order.retain(|k| entries.contains_key(k));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
