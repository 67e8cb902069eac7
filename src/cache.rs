//! Small time-bounded maps used for peer bookkeeping.

use lru::LruCache;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// A map whose entries expire `ttl` after insertion and which never grows past
/// `capacity`. Lookups do not touch recency, so the LRU end is always the
/// oldest insertion and both eviction and expiry pop from there.
pub struct TtlMap<K: Hash + Eq, V> {
    entries: LruCache<K, (V, Instant)>,
    ttl: Duration,
}

impl<K: Hash + Eq, V> TtlMap<K, V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: LruCache::new(capacity), ttl }
    }

    /// Insert or refresh `key`. A full map drops its oldest entry.
    pub fn insert(&mut self, key: K, value: V) {
        self.expire_oldest();
        self.entries.put(key, (value, Instant::now()));
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        match self.entries.peek(key) {
            Some((v, t)) if t.elapsed() <= self.ttl => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key).map(|(v, _)| v)
    }

    /// Drop every expired entry.
    pub fn purge(&mut self) {
        while self.expire_oldest() {}
    }

    fn expire_oldest(&mut self) -> bool {
        let ttl = self.ttl;
        let expired = self.entries.peek_lru().map_or(false, |(_, (_, t))| t.elapsed() > ttl);
        if expired {
            self.entries.pop_lru();
        }
        expired
    }

    /// Count including entries that expired but were not purged yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Hash + Eq, V> fmt::Debug for TtlMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlMap")
            .field("len", &self.entries.len())
            .field("cap", &self.entries.cap())
            .field("ttl", &self.ttl)
            .finish()
    }
}
