//! Expiring in-memory cache

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Cache entry
#[derive(Debug, Clone)]
struct TtlCacheEntry<V> {
    value: V,
    cached_at: Instant,
}

/// Key/value cache whose entries expire after a fixed TTL
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, TtlCacheEntry<V>>>,
    ttl: Duration,
    capacity: usize,
}

impl<V: Clone> TtlCache<V> {
    /// Create a new cache
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Get a live entry
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|e| e.cached_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    /// Insert an entry, evicting expired ones first and then the oldest
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let key = key.into();

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, e| e.cached_at.elapsed() < ttl);

            if entries.len() >= self.capacity {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.cached_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            TtlCacheEntry {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key).map(|e| e.value)
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
