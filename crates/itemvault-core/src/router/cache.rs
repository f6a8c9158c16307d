//! Process-local object cache
//!
//! One sub-cache per item, created on first use. Sub-caches live in a
//! sharded map so work on different items does not contend, while every
//! mutation of one item's entries is serialized by its shard lock.
//!
//! Two eviction policies:
//!
//! - [`CachePolicy::EvictUnderPressure`]: entries are held strongly; once more
//!   than `max_items` items are cached, the least recently used item's whole
//!   sub-cache is dropped.
//! - [`CachePolicy::EvictWhenUnreferenced`]: entries are weak; an object stays
//!   cached only while some caller still holds it.
//!
//! Writes stamp the item with a fresh generation. A value read from the
//! backends is only filled in if no write to that item (and no drop of its
//! sub-cache) happened since the read began, so a slow read can never
//! overwrite what a concurrent write just cached.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::cluster::{ClusterPath, ItemId, StoredObject};

/// How cached objects are released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    EvictUnderPressure,
    EvictWhenUnreferenced,
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub policy: CachePolicy,

    /// Item sub-caches kept before the least recently used is dropped
    pub max_items: usize,

    /// Cache confirmed-absent lookups (pressure policy only)
    pub remember_absent: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            policy: CachePolicy::EvictUnderPressure,
            max_items: 1024,
            remember_absent: false,
        }
    }
}

/// Outcome of a cache lookup
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(Arc<StoredObject>),
    /// Known to be absent from every backend
    Absent,
    Miss,
}

/// Counters reported by [`MemoryCache::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub items: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
enum Slot {
    Held(Arc<StoredObject>),
    Weak(Weak<StoredObject>),
    Absent,
}

#[derive(Debug, Default)]
struct ItemCache {
    entries: HashMap<ClusterPath, Slot>,
    last_used: u64,
    /// Generation of the last write to this item
    written: u64,
}

/// Per-item object cache
#[derive(Debug)]
pub struct MemoryCache {
    settings: CacheSettings,
    items: DashMap<ItemId, ItemCache>,
    clock: AtomicU64,
    generation: AtomicU64,
    /// Generation of the last write or drop that left no sub-cache behind
    dropped: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            items: DashMap::new(),
            clock: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up one path
    pub fn lookup(&self, item: &ItemId, path: &ClusterPath) -> CacheLookup {
        let result = match self.items.get_mut(item) {
            Some(mut cache) => {
                cache.last_used = self.tick();
                let found = match cache.entries.get(path) {
                    Some(Slot::Held(obj)) => CacheLookup::Hit(Arc::clone(obj)),
                    Some(Slot::Absent) => CacheLookup::Absent,
                    Some(Slot::Weak(weak)) => weak.upgrade().map_or(CacheLookup::Miss, CacheLookup::Hit),
                    None => CacheLookup::Miss,
                };
                if matches!(found, CacheLookup::Miss) {
                    // drop dead weak slots
                    cache.entries.remove(path);
                }
                found
            }
            None => CacheLookup::Miss,
        };
        match result {
            CacheLookup::Miss => self.misses.fetch_add(1, Ordering::Relaxed),
            _ => self.hits.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Current write generation; take it before reading the backends
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_drop(&self) {
        self.dropped.fetch_max(self.bump(), Ordering::SeqCst);
    }

    fn slot_for(&self, object: Arc<StoredObject>) -> Slot {
        match self.settings.policy {
            CachePolicy::EvictUnderPressure => Slot::Held(object),
            CachePolicy::EvictWhenUnreferenced => Slot::Weak(Arc::downgrade(&object)),
        }
    }

    /// Record a value just written to the backends
    pub fn insert(&self, item: &ItemId, path: ClusterPath, object: Arc<StoredObject>) {
        let slot = self.slot_for(object);
        self.store(item, path, slot, None);
    }

    /// Record a value read from the backends, unless the item was written
    /// after generation `seen`. Returns whether the value was cached.
    pub fn fill(&self, item: &ItemId, path: ClusterPath, object: Arc<StoredObject>, seen: u64) -> bool {
        let slot = self.slot_for(object);
        self.store(item, path, slot, Some(seen))
    }

    /// Record that no backend held this path as of generation `seen`
    pub fn mark_absent(&self, item: &ItemId, path: ClusterPath, seen: u64) -> bool {
        if self.settings.remember_absent && self.settings.policy == CachePolicy::EvictUnderPressure {
            self.store(item, path, Slot::Absent, Some(seen))
        } else {
            false
        }
    }

    /// `seen` is `None` for writes, which always win and bump the generation
    fn store(&self, item: &ItemId, path: ClusterPath, slot: Slot, seen: Option<u64>) -> bool {
        let created = {
            let now = self.tick();
            let mut created = false;
            let mut cache = match self.items.entry(*item) {
                Entry::Occupied(entry) => {
                    if seen.is_some_and(|seen| entry.get().written > seen) {
                        return false;
                    }
                    entry.into_ref()
                }
                Entry::Vacant(entry) => {
                    if seen.is_some_and(|seen| self.dropped.load(Ordering::SeqCst) > seen) {
                        return false;
                    }
                    created = true;
                    entry.insert(ItemCache::default())
                }
            };
            if seen.is_none() {
                cache.written = self.bump();
            }
            cache.last_used = now;
            if matches!(slot, Slot::Weak(_)) {
                cache
                    .entries
                    .retain(|_, s| !matches!(s, Slot::Weak(w) if w.strong_count() == 0));
            }
            cache.entries.insert(path, slot);
            created
        };
        if created && self.settings.policy == CachePolicy::EvictUnderPressure {
            self.evict_over_capacity(item);
        }
        true
    }

    fn evict_over_capacity(&self, keep: &ItemId) {
        while self.items.len() > self.settings.max_items.max(1) {
            let victim = self
                .items
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.value().last_used)
                .map(|entry| *entry.key());
            match victim {
                Some(victim) => {
                    debug!(item = %victim, "Evicting item cache under pressure");
                    self.record_drop();
                    self.items.remove(&victim);
                }
                None => break,
            }
        }
    }

    /// Forget one path after a write to it
    pub fn remove(&self, item: &ItemId, path: &ClusterPath) {
        match self.items.entry(*item) {
            Entry::Occupied(mut entry) => {
                let cache = entry.get_mut();
                cache.entries.remove(path);
                cache.written = self.bump();
            }
            // still holding the shard lock, so no fill can slip in between
            Entry::Vacant(_vacant) => self.record_drop(),
        }
    }

    /// Forget every path at or beneath `prefix`
    pub fn clear_prefix(&self, item: &ItemId, prefix: &ClusterPath) {
        if let Some(mut cache) = self.items.get_mut(item) {
            cache.entries.retain(|path, _| !path.starts_with(prefix));
        }
    }

    /// Drop an item's whole sub-cache
    pub fn clear_item(&self, item: &ItemId) {
        self.record_drop();
        self.items.remove(item);
    }

    /// Drop everything
    pub fn clear_all(&self) {
        self.record_drop();
        self.items.clear();
    }

    /// Paths currently cached for an item, sorted
    pub fn cached_paths(&self, item: &ItemId) -> Vec<String> {
        let mut paths: Vec<String> = self
            .items
            .get(item)
            .map(|cache| cache.entries.keys().map(ToString::to_string).collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            items: self.items.len(),
            entries: self.items.iter().map(|c| c.entries.len()).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Property;

    fn object(name: &str) -> (ClusterPath, Arc<StoredObject>) {
        let obj: StoredObject = Property::new(name, "v").into();
        (obj.cluster_path().unwrap(), Arc::new(obj))
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = MemoryCache::new(CacheSettings::default());
        let item = ItemId::new();
        let (path, obj) = object("Name");
        assert!(matches!(cache.lookup(&item, &path), CacheLookup::Miss));
        cache.insert(&item, path.clone(), obj.clone());
        match cache.lookup(&item, &path) {
            CacheLookup::Hit(hit) => assert_eq!(hit, obj),
            other => panic!("expected hit, got {:?}", other),
        }
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_clear_prefix_and_item() {
        let cache = MemoryCache::new(CacheSettings::default());
        let item = ItemId::new();
        let (a, oa) = object("A");
        let (b, ob) = object("B");
        cache.insert(&item, a.clone(), oa);
        cache.insert(&item, b.clone(), ob);

        cache.clear_prefix(&item, &a);
        assert_eq!(cache.cached_paths(&item), vec!["Property/B"]);

        cache.clear_item(&item);
        assert!(cache.cached_paths(&item).is_empty());
        // idempotent on unknown items
        cache.clear_item(&ItemId::new());
        cache.clear_prefix(&ItemId::new(), &b);
    }

    #[test]
    fn test_pressure_evicts_least_recent_item() {
        let cache = MemoryCache::new(CacheSettings {
            max_items: 2,
            ..CacheSettings::default()
        });
        let (first, second, third) = (ItemId::new(), ItemId::new(), ItemId::new());
        let (path, obj) = object("Name");
        cache.insert(&first, path.clone(), obj.clone());
        cache.insert(&second, path.clone(), obj.clone());
        // touch first so second becomes the oldest
        let _ = cache.lookup(&first, &path);
        cache.insert(&third, path.clone(), obj);

        assert_eq!(cache.stats().items, 2);
        assert!(matches!(cache.lookup(&second, &path), CacheLookup::Miss));
        assert!(matches!(cache.lookup(&first, &path), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_unreferenced_entries_disappear() {
        let cache = MemoryCache::new(CacheSettings {
            policy: CachePolicy::EvictWhenUnreferenced,
            ..CacheSettings::default()
        });
        let item = ItemId::new();
        let (path, obj) = object("Name");
        cache.insert(&item, path.clone(), obj.clone());
        assert!(matches!(cache.lookup(&item, &path), CacheLookup::Hit(_)));
        drop(obj);
        assert!(matches!(cache.lookup(&item, &path), CacheLookup::Miss));
    }

    #[test]
    fn test_absent_marker_only_when_enabled() {
        let item = ItemId::new();
        let (path, obj) = object("Name");

        let plain = MemoryCache::new(CacheSettings::default());
        plain.mark_absent(&item, path.clone(), plain.generation());
        assert!(matches!(plain.lookup(&item, &path), CacheLookup::Miss));

        let negative = MemoryCache::new(CacheSettings {
            remember_absent: true,
            ..CacheSettings::default()
        });
        negative.mark_absent(&item, path.clone(), negative.generation());
        assert!(matches!(negative.lookup(&item, &path), CacheLookup::Absent));
        negative.insert(&item, path.clone(), obj);
        assert!(matches!(negative.lookup(&item, &path), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_fill_loses_to_later_write() {
        let cache = MemoryCache::new(CacheSettings::default());
        let item = ItemId::new();
        let (path, stale) = object("Name");
        let fresh: Arc<StoredObject> = Arc::new(Property::new("Name", "fresh").into());

        let seen = cache.generation();
        cache.insert(&item, path.clone(), fresh.clone());
        assert!(!cache.fill(&item, path.clone(), stale.clone(), seen));
        match cache.lookup(&item, &path) {
            CacheLookup::Hit(hit) => assert_eq!(hit, fresh),
            other => panic!("expected fresh hit, got {:?}", other),
        }

        // a fill that started after the write is accepted
        assert!(cache.fill(&item, path.clone(), stale, cache.generation()));
    }

    #[test]
    fn test_fill_loses_to_delete_and_drop() {
        let cache = MemoryCache::new(CacheSettings {
            remember_absent: true,
            ..CacheSettings::default()
        });
        let item = ItemId::new();
        let (path, obj) = object("Name");

        // delete of an item with no sub-cache
        let seen = cache.generation();
        cache.remove(&item, &path);
        assert!(!cache.fill(&item, path.clone(), obj.clone(), seen));
        assert!(matches!(cache.lookup(&item, &path), CacheLookup::Miss));

        // a write followed by a clear must not let the older read back in
        let seen = cache.generation();
        cache.insert(&item, path.clone(), obj.clone());
        cache.clear_item(&item);
        assert!(!cache.fill(&item, path.clone(), obj, seen));
        assert!(!cache.mark_absent(&item, path.clone(), seen));
        assert!(matches!(cache.lookup(&item, &path), CacheLookup::Miss));
    }
}
