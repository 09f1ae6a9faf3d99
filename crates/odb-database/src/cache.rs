//! Bounded cache of recently read objects.
//!
//! Entries are evicted least recently used first once the cached bytes
//! exceed `max_bytes`. Objects larger than `max_object_size` are never
//! cached, and neither are blobs unless `cache_blobs` is set.

use lru::LruCache;
use odb_types::{ObjectHeader, ObjectKind, Oid, RawObject};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total object bytes held before eviction starts. Zero disables caching.
    pub max_bytes: u64,
    /// Largest single object that is cached.
    pub max_object_size: u64,
    pub cache_blobs: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 << 20,
            max_object_size: 4096,
            cache_blobs: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

struct Inner {
    entries: LruCache<Oid, RawObject>,
    bytes: u64,
    hits: u64,
    misses: u64,
}

pub struct ObjectCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl ObjectCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn admits(&self, obj: &RawObject) -> bool {
        self.config.max_bytes > 0
            && obj.size <= self.config.max_object_size
            && obj.size <= self.config.max_bytes
            && (self.config.cache_blobs || obj.kind != ObjectKind::Blob)
    }

    /// A copy of the cached object, marking it most recently used.
    pub fn get(&self, oid: &Oid) -> Option<RawObject> {
        let mut inner = self.inner.lock();
        let found = inner.entries.get(oid).cloned();
        match found {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        found
    }

    pub fn header(&self, oid: &Oid) -> Option<ObjectHeader> {
        let mut inner = self.inner.lock();
        let found = inner.entries.get(oid).map(RawObject::header);
        match found {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        found
    }

    /// Membership test that does not count as a use.
    pub fn contains(&self, oid: &Oid) -> bool {
        self.inner.lock().entries.contains(oid)
    }

    /// Cache `obj` if its kind and size qualify, evicting older entries to
    /// stay within the byte budget.
    pub fn insert(&self, oid: Oid, obj: &RawObject) {
        if !self.admits(obj) {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.put(oid, obj.clone()) {
            inner.bytes -= old.size;
        }
        inner.bytes += obj.size;
        while inner.bytes > self.config.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.bytes -= evicted.size,
                None => break,
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
