//! Lazy ordered maps over a cluster's children
//!
//! A [`RemoteMap`] is bound to one `(item, cluster path)` and mirrors that
//! path's children. Keys are listed on first use and seeded as unloaded
//! placeholders; values are fetched one at a time when asked for.
//!
//! Keys order with [`MapKey`]: integers numerically, so `"9" < "10"`, ahead
//! of every non-numeric key.
//!
//! A map is either in direct mode, where `put`/`remove` write through its
//! [`ClusterSource`], or in subscribed mode, where it follows a live feed of
//! [`ChangeEvent`]s and refuses local writes.

mod history;
mod jobs;

pub use history::History;
pub use jobs::JobList;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::cluster::{ClusterPath, Event, ItemId, Job, StoredObject};
use crate::error::{Result, StorageError};
use crate::router::{ChangeEvent, ChangeKind};
use crate::transaction::Locker;

/// Where a map reads and writes its entries
///
/// Implemented by the router (committed state) and the transaction manager
/// (a locker's view, including its uncommitted writes).
pub trait ClusterSource: Send + Sync {
    /// Child names directly below `path`
    fn list(&self, item: &ItemId, path: &ClusterPath, locker: Option<&Locker>) -> Result<Vec<String>>;

    fn fetch(&self, item: &ItemId, path: &ClusterPath, locker: Option<&Locker>) -> Result<Arc<StoredObject>>;

    fn store(&self, item: &ItemId, object: StoredObject, locker: Option<&Locker>) -> Result<()>;

    fn erase(&self, item: &ItemId, path: &ClusterPath, locker: Option<&Locker>) -> Result<()>;

    /// Claim an id at or above `candidate` that has never been handed out for this path
    fn reserve_id(&self, item: &ItemId, path: &ClusterPath, candidate: i64) -> i64;
}

/// Map key with numeric-first ordering
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapKey(String);

impl MapKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key as an integer, when it is one
    pub fn as_id(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl Ord for MapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.as_id(), other.as_id()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MapKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Values a [`RemoteMap`] can hold
pub trait MapValue: Clone + Send + Sync {
    /// Kind name used in error messages
    const KIND: &'static str;

    fn from_stored(object: &StoredObject) -> Option<Self>;

    fn into_stored(self) -> StoredObject;
}

impl MapValue for StoredObject {
    const KIND: &'static str = "object";

    fn from_stored(object: &StoredObject) -> Option<Self> {
        Some(object.clone())
    }

    fn into_stored(self) -> StoredObject {
        self
    }
}

impl MapValue for Event {
    const KIND: &'static str = "event";

    fn from_stored(object: &StoredObject) -> Option<Self> {
        match object {
            StoredObject::Event(event) => Some(event.clone()),
            _ => None,
        }
    }

    fn into_stored(self) -> StoredObject {
        StoredObject::Event(self)
    }
}

impl MapValue for Job {
    const KIND: &'static str = "job";

    fn from_stored(object: &StoredObject) -> Option<Self> {
        match object {
            StoredObject::Job(job) => Some(job.clone()),
            _ => None,
        }
    }

    fn into_stored(self) -> StoredObject {
        StoredObject::Job(self)
    }
}

enum Mode {
    Direct,
    Subscribed(broadcast::Receiver<ChangeEvent>),
}

/// Lazily loaded, sorted view of one cluster path's children
pub struct RemoteMap<V: MapValue> {
    source: Arc<dyn ClusterSource>,
    item: ItemId,
    root: ClusterPath,
    locker: Option<Locker>,
    entries: BTreeMap<MapKey, Option<V>>,
    loaded: bool,
    mode: Mode,
}

impl<V: MapValue> fmt::Debug for RemoteMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMap")
            .field("item", &self.item)
            .field("root", &self.root)
            .field("locker", &self.locker)
            .field("keys", &self.entries.len())
            .field("loaded", &self.loaded)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl<V: MapValue> RemoteMap<V> {
    pub fn new(source: Arc<dyn ClusterSource>, item: ItemId, root: ClusterPath, locker: Option<Locker>) -> Self {
        Self {
            source,
            item,
            root,
            locker,
            entries: BTreeMap::new(),
            loaded: false,
            mode: Mode::Direct,
        }
    }

    pub fn item(&self) -> &ItemId {
        &self.item
    }

    /// Cluster path whose children this map mirrors
    pub fn path(&self) -> &ClusterPath {
        &self.root
    }

    pub fn locker(&self) -> Option<&Locker> {
        self.locker.as_ref()
    }

    /// List the bound path once and seed unloaded placeholders
    pub fn load_keys(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let keys = self.source.list(&self.item, &self.root, self.locker.as_ref())?;
        debug!(item = %self.item, path = %self.root, keys = keys.len(), "Loaded remote map keys");
        for key in keys {
            self.entries.entry(MapKey::new(key)).or_insert(None);
        }
        self.loaded = true;
        Ok(())
    }

    /// Value for `key`, fetched from storage on first access
    pub fn get(&mut self, key: &str) -> Result<Option<V>> {
        self.load_keys()?;
        let key = MapKey::new(key);
        match self.entries.get(&key) {
            None => return Ok(None),
            Some(Some(value)) => return Ok(Some(value.clone())),
            Some(None) => {}
        }

        let path = self.root.child(key.as_str())?;
        let object = match self.source.fetch(&self.item, &path, self.locker.as_ref()) {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                // listed but gone since
                self.entries.remove(&key);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let value = V::from_stored(&object).ok_or_else(|| {
            StorageError::invalid_path(format!("{} does not hold a {}", path, V::KIND))
        })?;
        self.entries.insert(key, Some(value.clone()));
        Ok(Some(value))
    }

    pub fn contains_key(&mut self, key: &str) -> Result<bool> {
        self.load_keys()?;
        Ok(self.entries.contains_key(&MapKey::new(key)))
    }

    /// Keys in map order
    pub fn keys(&mut self) -> Result<Vec<String>> {
        self.load_keys()?;
        Ok(self.entries.keys().map(|k| k.0.clone()).collect())
    }

    /// Every entry in map order, loading each value
    pub fn values(&mut self) -> Result<Vec<V>> {
        let mut values = Vec::new();
        for key in self.keys()? {
            if let Some(value) = self.get(&key)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    pub fn len(&mut self) -> Result<usize> {
        self.load_keys()?;
        Ok(self.entries.len())
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Greatest key in map order
    pub fn last_key(&mut self) -> Result<Option<String>> {
        self.load_keys()?;
        Ok(self.entries.keys().next_back().map(|k| k.0.clone()))
    }

    /// Last key as an integer; -1 when empty or not numeric
    pub fn last_id(&mut self) -> Result<i64> {
        self.load_keys()?;
        Ok(self
            .entries
            .keys()
            .next_back()
            .and_then(MapKey::as_id)
            .unwrap_or(-1))
    }

    /// Allocate the next id; never repeats within the process, even after deletes
    pub fn next_id(&mut self) -> Result<i64> {
        let candidate = self.last_id()? + 1;
        Ok(self.source.reserve_id(&self.item, &self.root, candidate))
    }

    fn ensure_direct(&self) -> Result<()> {
        match self.mode {
            Mode::Direct => Ok(()),
            Mode::Subscribed(_) => Err(StorageError::unsupported(format!(
                "{} of {} follows live updates; local writes are disabled",
                self.root, self.item
            ))),
        }
    }

    /// Write a value through to storage; returns its key
    ///
    /// The value must live directly below the bound path.
    pub fn put(&mut self, value: V) -> Result<String> {
        self.ensure_direct()?;
        let object = value.clone().into_stored();
        let path = object.cluster_path()?;
        let key = match (path.parent(), path.last()) {
            (Some(parent), Some(key)) if parent == self.root => key.to_string(),
            _ => {
                return Err(StorageError::invalid_path(format!(
                    "{} is not a child of {}",
                    path, self.root
                )))
            }
        };
        self.load_keys()?;
        self.source.store(&self.item, object, self.locker.as_ref())?;
        self.entries.insert(MapKey::new(key.clone()), Some(value));
        Ok(key)
    }

    /// Delete an entry from storage; returns the value if it was loaded
    pub fn remove(&mut self, key: &str) -> Result<Option<V>> {
        self.ensure_direct()?;
        self.load_keys()?;
        let path = self.root.child(key)?;
        self.source.erase(&self.item, &path, self.locker.as_ref())?;
        Ok(self.entries.remove(&MapKey::new(key)).flatten())
    }

    /// Forget everything; the next access lists the keys again
    pub fn clear(&mut self) {
        self.entries.clear();
        self.loaded = false;
    }

    /// Follow a live change feed instead of writing locally
    pub fn activate(&mut self, receiver: broadcast::Receiver<ChangeEvent>) {
        self.mode = Mode::Subscribed(receiver);
    }

    /// Return to direct mode, handing back the feed
    pub fn deactivate(&mut self) -> Option<broadcast::Receiver<ChangeEvent>> {
        match std::mem::replace(&mut self.mode, Mode::Direct) {
            Mode::Subscribed(receiver) => Some(receiver),
            Mode::Direct => None,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(self.mode, Mode::Subscribed(_))
    }

    /// Apply queued change events for the bound path; returns how many applied
    ///
    /// A lagging feed drops the local state so it is listed again; a closed
    /// feed returns the map to direct mode.
    pub fn sync(&mut self) -> Result<usize> {
        let mut applied = 0;
        loop {
            let next = match &mut self.mode {
                Mode::Subscribed(receiver) => receiver.try_recv(),
                Mode::Direct => return Ok(applied),
            };
            match next {
                Ok(event) => {
                    if self.apply(&event) {
                        applied += 1;
                    }
                }
                Err(TryRecvError::Empty) => return Ok(applied),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(item = %self.item, path = %self.root, missed, "Change feed lagged; reloading keys");
                    self.clear();
                }
                Err(TryRecvError::Closed) => {
                    warn!(item = %self.item, path = %self.root, "Change feed closed; back to direct mode");
                    self.mode = Mode::Direct;
                    return Ok(applied);
                }
            }
        }
    }

    fn apply(&mut self, event: &ChangeEvent) -> bool {
        if event.item != self.item || event.path.parent().as_ref() != Some(&self.root) {
            return false;
        }
        let Some(key) = event.path.last() else {
            return false;
        };
        if !self.loaded {
            // the eventual listing will see it
            return true;
        }
        match event.kind {
            ChangeKind::Added => {
                self.entries.insert(MapKey::new(key), None);
            }
            ChangeKind::Deleted => {
                self.entries.remove(&MapKey::new(key));
            }
        }
        true
    }
}
