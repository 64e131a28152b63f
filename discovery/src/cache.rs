//! Response caches for the discovery endpoint families.
//!
//! Each family owns an independent key-to-bytes cache. Clearing a cache
//! drops the cached bytes but keeps the keys, so hit/miss statistics keep
//! accumulating across registry churn; re-population is lazy, driven by the
//! next read.
//
// TODO(cache): all-or-nothing invalidation is coarse. Finer keys and a TTL
// would avoid recomputing every response after every change; the cache is
// kept behind this small surface so that swap stays local.

use ahash::AHashMap as HashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Hit/miss counters for one cached response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hit: u64,
    pub miss: u64,
}

#[derive(Debug, Default)]
struct Entry {
    /// `None` means the key is known but its response was evicted.
    data: RwLock<Option<Bytes>>,
    hit: AtomicU64,
    miss: AtomicU64,
}

/// A key-to-response cache with per-entry statistics.
#[derive(Debug)]
pub struct DiscoveryCache {
    disabled: bool,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
}

// === impl DiscoveryCache ===

impl DiscoveryCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            disabled: !enabled,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The cached response for `key`, if present. Counts a hit.
    pub fn cached_response(&self, key: &str) -> Option<Bytes> {
        if self.disabled {
            return None;
        }

        let entries = self.entries.read();
        let entry = entries.get(key)?;
        let data = entry.data.read().clone()?;
        entry.hit.fetch_add(1, Ordering::Relaxed);
        Some(data)
    }

    /// Stores a freshly computed response. Counts a miss.
    pub fn update_cached_response(&self, key: &str, data: Bytes) {
        if self.disabled {
            return;
        }

        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_default();
        {
            let mut slot = entry.data.write();
            if slot.is_some() {
                tracing::warn!(key, "overriding cached data");
            }
            *slot = Some(data);
        }
        entry.miss.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops every cached response while retaining keys and statistics.
    pub fn clear(&self) {
        let entries = self.entries.write();
        for entry in entries.values() {
            *entry.data.write() = None;
        }
    }

    /// Zeroes every entry's counters.
    pub fn reset_stats(&self) {
        let entries = self.entries.read();
        for entry in entries.values() {
            entry.hit.store(0, Ordering::Relaxed);
            entry.miss.store(0, Ordering::Relaxed);
        }
    }

    /// A stable snapshot of the per-key statistics.
    pub fn stats(&self) -> BTreeMap<String, CacheStats> {
        self.entries
            .read()
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    CacheStats {
                        hit: entry.hit.load(Ordering::Relaxed),
                        miss: entry.miss.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}
