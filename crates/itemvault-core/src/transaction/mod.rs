//! Per-item transactions
//!
//! [`TransactionManager`] sits in front of the [`StorageRouter`] and buffers
//! writes per [`Locker`]. Each item is either unlocked or locked by exactly
//! one locker:
//!
//! ```text
//!   Unlocked ──put/remove(L)──▶ Locked(L) ──commit(L) / abort(L)──▶ Unlocked
//! ```
//!
//! Contention never waits: a write from any other locker fails at once with
//! [`StorageError::AccessDenied`]. A `None` locker writes straight through,
//! holding the item's lock only for the duration of the write.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cluster::{ClusterPath, ClusterType, ItemId, StoredObject};
use crate::error::{Result, StorageError};
use crate::remote_map::{ClusterSource, History, JobList};
use crate::router::{ClusterEntry, StorageRouter};

/// Opaque identity of one transactional caller
///
/// Only compared, never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locker(Uuid);

impl Locker {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One buffered write; `object == None` marks a delete
#[derive(Debug, Clone)]
pub struct TransactionEntry {
    pub item: ItemId,
    pub path: ClusterPath,
    pub object: Option<Arc<StoredObject>>,
}

impl TransactionEntry {
    pub fn is_delete(&self) -> bool {
        self.object.is_none()
    }

    fn targets(&self, item: &ItemId, path: &ClusterPath) -> bool {
        self.item == *item && self.path == *path
    }
}

impl fmt::Display for TransactionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.is_delete() { "delete" } else { "put" };
        write!(f, "{} {}/{}", op, self.item, self.path)
    }
}

#[derive(Debug, Default)]
struct TxState {
    locks: HashMap<ItemId, Locker>,
    pending: HashMap<Locker, Vec<TransactionEntry>>,
}

impl TxState {
    fn release_all(&mut self, locker: &Locker) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, holder| holder != locker);
        before - self.locks.len()
    }

    fn pending_entry(&self, item: &ItemId, path: &ClusterPath, locker: &Locker) -> Option<&TransactionEntry> {
        if self.locks.get(item) != Some(locker) {
            return None;
        }
        self.pending
            .get(locker)
            .and_then(|entries| entries.iter().find(|e| e.targets(item, path)))
    }
}

struct TxInner {
    router: StorageRouter,
    state: Mutex<TxState>,
}

/// Buffers writes per locker and enforces one locker per item
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TxInner>,
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransactionManager")
            .field("locked_items", &state.locks.len())
            .field("open_transactions", &state.pending.len())
            .finish()
    }
}

impl TransactionManager {
    pub fn new(router: StorageRouter) -> Self {
        Self {
            inner: Arc::new(TxInner {
                router,
                state: Mutex::new(TxState::default()),
            }),
        }
    }

    /// The router committed writes go to
    pub fn router(&self) -> &StorageRouter {
        &self.inner.router
    }

    /// Resolve a path, seeing `locker`'s own uncommitted writes
    pub fn get(&self, item: &ItemId, path: &str, locker: Option<&Locker>) -> Result<ClusterEntry> {
        let path = ClusterPath::parse(path)?;

        if let Some(locker) = locker {
            if path.is_root() {
                match path.cluster_type() {
                    ClusterType::History => {
                        return Ok(ClusterEntry::History(History::new(self.source(), *item, Some(*locker))))
                    }
                    ClusterType::Job => {
                        return Ok(ClusterEntry::Jobs(JobList::new(self.source(), *item, Some(*locker))))
                    }
                    _ => {}
                }
            }
            if let Some(object) = self.buffered(item, &path, locker)? {
                return Ok(ClusterEntry::Object(object));
            }
        }

        self.inner.router.resolve(item, &path)
    }

    fn source(&self) -> Arc<dyn ClusterSource> {
        Arc::new(self.clone())
    }

    /// The locker's buffered value, `DeletedUncommitted` for a buffered delete
    fn buffered(&self, item: &ItemId, path: &ClusterPath, locker: &Locker) -> Result<Option<Arc<StoredObject>>> {
        let state = self.inner.state.lock();
        match state.pending_entry(item, path, locker) {
            Some(TransactionEntry { object: Some(object), .. }) => Ok(Some(Arc::clone(object))),
            Some(_) => Err(StorageError::DeletedUncommitted {
                item: item.to_string(),
                path: path.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Write an object at its own path
    pub fn put(&self, item: &ItemId, object: StoredObject, locker: Option<&Locker>) -> Result<()> {
        let path = object.cluster_path()?;
        self.write(item, path, Some(Arc::new(object)), locker)
    }

    /// Delete one path
    pub fn remove(&self, item: &ItemId, path: &str, locker: Option<&Locker>) -> Result<()> {
        let path = ClusterPath::parse(path)?;
        self.write(item, path, None, locker)
    }

    fn write(
        &self,
        item: &ItemId,
        path: ClusterPath,
        object: Option<Arc<StoredObject>>,
        locker: Option<&Locker>,
    ) -> Result<()> {
        let token = locker.copied().unwrap_or_default();
        {
            let mut state = self.inner.state.lock();
            match state.locks.get(item) {
                Some(holder) if *holder != token => {
                    return Err(StorageError::AccessDenied {
                        item: item.to_string(),
                        holder: holder.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    state.locks.insert(*item, token);
                    debug!(item = %item, locker = %token, "Item locked");
                }
            }

            if locker.is_some() {
                let entries = state.pending.entry(token).or_default();
                entries.retain(|e| !e.targets(item, &path));
                entries.push(TransactionEntry {
                    item: *item,
                    path,
                    object,
                });
                return Ok(());
            }
        }

        let result = match object {
            Some(object) => self.inner.router.put_shared(item, object).map(|_| ()),
            None => self.inner.router.delete_path(item, &path),
        };
        self.release(item, &token);
        result
    }

    fn release(&self, item: &ItemId, locker: &Locker) {
        let mut state = self.inner.state.lock();
        if state.locks.get(item) == Some(locker) {
            state.locks.remove(item);
            debug!(item = %item, locker = %locker, "Item unlocked");
        }
    }

    /// Apply every pending entry of `locker` in buffered order
    ///
    /// A failure part-way leaves earlier entries applied; the rest are
    /// discarded, all of the locker's locks are released and the error comes
    /// back as [`StorageError::CommitAborted`].
    pub fn commit(&self, locker: &Locker) -> Result<()> {
        let entries = {
            let mut state = self.inner.state.lock();
            match state.pending.remove(locker) {
                Some(entries) if !entries.is_empty() => entries,
                _ => {
                    state.release_all(locker);
                    return Ok(());
                }
            }
        };

        let total = entries.len();
        for (idx, entry) in entries.iter().enumerate() {
            let result = match &entry.object {
                Some(object) => self
                    .inner
                    .router
                    .put_shared(&entry.item, Arc::clone(object))
                    .map(|_| ()),
                None => self.inner.router.delete_path(&entry.item, &entry.path),
            };

            if let Err(e) = result {
                let discarded = total - idx - 1;
                error!(
                    locker = %locker,
                    entry = %entry,
                    applied = idx,
                    discarded,
                    error = %e,
                    "Commit failed after storage was mutated; remaining entries discarded"
                );
                self.inner.state.lock().release_all(locker);
                return Err(StorageError::CommitAborted {
                    applied: idx,
                    discarded,
                    source: Box::new(e),
                });
            }

            if !entries[idx + 1..].iter().any(|later| later.item == entry.item) {
                self.release(&entry.item, locker);
            }
        }

        debug!(locker = %locker, entries = total, "Transaction committed");
        Ok(())
    }

    /// Drop every pending entry of `locker` and release its locks
    pub fn abort(&self, locker: &Locker) {
        let mut state = self.inner.state.lock();
        let discarded = state.pending.remove(locker).map_or(0, |e| e.len());
        let released = state.release_all(locker);
        debug!(locker = %locker, discarded, released, "Transaction aborted");
    }

    /// Children of a path, including `locker`'s own uncommitted additions
    pub fn get_cluster_contents(&self, item: &ItemId, path: &str, locker: Option<&Locker>) -> Result<Vec<String>> {
        if path.trim_matches('/').is_empty() {
            return self.inner.router.get_cluster_contents(item, path);
        }
        let path = ClusterPath::parse(path)?;
        self.list_children(item, &path, locker)
    }

    fn list_children(&self, item: &ItemId, path: &ClusterPath, locker: Option<&Locker>) -> Result<Vec<String>> {
        let mut names = self.inner.router.contents(item, path);
        let Some(locker) = locker else {
            return Ok(names);
        };

        let state = self.inner.state.lock();
        if state.locks.get(item) != Some(locker) {
            return Ok(names);
        }
        let depth = path.segments().len();
        for entry in state.pending.get(locker).into_iter().flatten() {
            if entry.item != *item || entry.path == *path || !entry.path.starts_with(path) {
                continue;
            }
            let name = &entry.path.segments()[depth];
            match entry.object {
                Some(_) if !names.contains(name) => names.push(name.clone()),
                None if entry.path.segments().len() == depth + 1 => names.retain(|n| n != name),
                _ => {}
            }
        }
        Ok(names)
    }

    /// Delete every leaf beneath `path`; an empty path walks every cluster type
    ///
    /// Cluster type roots themselves are never deleted.
    pub fn remove_cluster(&self, item: &ItemId, path: &str, locker: Option<&Locker>) -> Result<()> {
        if path.trim_matches('/').is_empty() {
            for cluster in self.inner.router.get_cluster_contents(item, "")? {
                self.remove_cluster(item, &cluster, locker)?;
            }
            return Ok(());
        }
        let path = ClusterPath::parse(path)?;
        self.remove_tree(item, &path, locker)
    }

    fn remove_tree(&self, item: &ItemId, path: &ClusterPath, locker: Option<&Locker>) -> Result<()> {
        let children = self.list_children(item, path, locker)?;
        for child in &children {
            self.remove_tree(item, &path.child(child.as_str())?, locker)?;
        }
        if children.is_empty() && !path.is_root() {
            self.write(item, path.clone(), None, locker)?;
        }
        Ok(())
    }

    pub fn has_pending(&self, locker: &Locker) -> bool {
        self.pending_len(locker) > 0
    }

    /// Number of entries buffered for `locker`
    pub fn pending_len(&self, locker: &Locker) -> usize {
        self.inner
            .state
            .lock()
            .pending
            .get(locker)
            .map_or(0, Vec::len)
    }

    /// Items currently locked by `locker`
    pub fn locked_items(&self, locker: &Locker) -> Vec<ItemId> {
        let mut items: Vec<ItemId> = self
            .inner
            .state
            .lock()
            .locks
            .iter()
            .filter(|(_, holder)| *holder == locker)
            .map(|(item, _)| *item)
            .collect();
        items.sort();
        items
    }

    /// The locker holding an item, if any
    pub fn holder_of(&self, item: &ItemId) -> Option<Locker> {
        self.inner.state.lock().locks.get(item).copied()
    }

    /// Log every open transaction and return the same lines
    pub fn dump_pending(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut lines = Vec::new();
        for (locker, entries) in &state.pending {
            lines.push(format!("transaction {} ({} entries)", locker, entries.len()));
            lines.extend(entries.iter().map(|e| format!("  {}", e)));
        }
        if lines.is_empty() {
            info!("No open transactions");
        }
        for line in &lines {
            info!("{}", line);
        }
        lines
    }

    /// Discard open transactions (logged as lost), then close the router
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            for (locker, entries) in &state.pending {
                error!(
                    locker = %locker,
                    entries = entries.len(),
                    "Pending transaction discarded on shutdown"
                );
            }
            state.pending.clear();
            state.locks.clear();
        }
        self.inner.router.close()
    }
}

impl ClusterSource for TransactionManager {
    fn list(&self, item: &ItemId, path: &ClusterPath, locker: Option<&Locker>) -> Result<Vec<String>> {
        self.list_children(item, path, locker)
    }

    fn fetch(&self, item: &ItemId, path: &ClusterPath, locker: Option<&Locker>) -> Result<Arc<StoredObject>> {
        if let Some(locker) = locker {
            if let Some(object) = self.buffered(item, path, locker)? {
                return Ok(object);
            }
        }
        self.inner.router.fetch(item, path)
    }

    fn store(&self, item: &ItemId, object: StoredObject, locker: Option<&Locker>) -> Result<()> {
        self.put(item, object, locker)
    }

    fn erase(&self, item: &ItemId, path: &ClusterPath, locker: Option<&Locker>) -> Result<()> {
        self.write(item, path.clone(), None, locker)
    }

    fn reserve_id(&self, item: &ItemId, path: &ClusterPath, candidate: i64) -> i64 {
        self.inner.router.reserve_id(item, path, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{FailureMode, MemoryBackend};
    use crate::cluster::{Outcome, Property};

    fn manager() -> (TransactionManager, Arc<MemoryBackend>) {
        let mem = Arc::new(MemoryBackend::new("mem"));
        let router = StorageRouter::builder().backend(mem.clone()).build().unwrap();
        (TransactionManager::new(router), mem)
    }

    fn prop(name: &str, value: &str) -> StoredObject {
        Property::new(name, value).into()
    }

    #[test]
    fn test_direct_write_releases_lock() {
        let (tm, mem) = manager();
        let item = ItemId::new();
        tm.put(&item, prop("Name", "x"), None).unwrap();
        assert_eq!(mem.object_count(&item), 1);
        assert!(tm.holder_of(&item).is_none());
    }

    #[test]
    fn test_buffered_write_is_invisible_until_commit() {
        let (tm, mem) = manager();
        let item = ItemId::new();
        let locker = Locker::new();
        tm.put(&item, prop("Name", "x"), Some(&locker)).unwrap();

        assert_eq!(mem.object_count(&item), 0);
        assert_eq!(tm.holder_of(&item), Some(locker));
        assert!(tm.get(&item, "Property/Name", None).unwrap_err().is_not_found());
        assert!(tm.get(&item, "Property/Name", Some(&locker)).is_ok());

        tm.commit(&locker).unwrap();
        assert_eq!(mem.object_count(&item), 1);
        assert!(tm.holder_of(&item).is_none());
        assert!(!tm.has_pending(&locker));
    }

    #[test]
    fn test_contention_fails_fast() {
        let (tm, _) = manager();
        let item = ItemId::new();
        let (owner, other) = (Locker::new(), Locker::new());
        tm.put(&item, prop("Name", "x"), Some(&owner)).unwrap();

        let err = tm.put(&item, prop("Name", "y"), Some(&other)).unwrap_err();
        assert!(err.is_access_denied());
        assert!(err.to_string().contains(&owner.to_string()));
        assert!(tm.remove(&item, "Property/Name", None).unwrap_err().is_access_denied());

        tm.abort(&owner);
        tm.put(&item, prop("Name", "y"), Some(&other)).unwrap();
    }

    #[test]
    fn test_later_entry_supersedes() {
        let (tm, _) = manager();
        let item = ItemId::new();
        let locker = Locker::new();
        tm.put(&item, prop("Name", "first"), Some(&locker)).unwrap();
        tm.put(&item, prop("Name", "second"), Some(&locker)).unwrap();
        assert_eq!(tm.pending_len(&locker), 1);

        tm.remove(&item, "Property/Name", Some(&locker)).unwrap();
        assert_eq!(tm.pending_len(&locker), 1);
        let err = tm.get(&item, "Property/Name", Some(&locker)).unwrap_err();
        assert!(matches!(err, StorageError::DeletedUncommitted { .. }));
    }

    #[test]
    fn test_commit_without_entries_is_noop() {
        let (tm, _) = manager();
        tm.commit(&Locker::new()).unwrap();
    }

    #[test]
    fn test_commit_failure_is_fatal_and_unlocks() {
        let (tm, mem) = manager();
        let (a, b) = (ItemId::new(), ItemId::new());
        let locker = Locker::new();
        tm.put(&a, prop("Name", "x"), Some(&locker)).unwrap();
        tm.put(&b, prop("Name", "y"), Some(&locker)).unwrap();
        tm.put(&b, Outcome::new("S", 0, 1, "d").into(), Some(&locker)).unwrap();

        mem.inject_failure(Some(FailureMode::Writes));
        let err = tm.commit(&locker).unwrap_err();
        assert!(err.is_fatal());
        match err {
            StorageError::CommitAborted { applied, discarded, .. } => {
                assert_eq!((applied, discarded), (0, 2));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(tm.locked_items(&locker).is_empty());
        assert!(!tm.has_pending(&locker));
    }

    #[test]
    fn test_listing_includes_own_pending_additions() {
        let (tm, _) = manager();
        let item = ItemId::new();
        tm.put(&item, prop("Committed", "1"), None).unwrap();
        let locker = Locker::new();
        tm.put(&item, prop("Pending", "2"), Some(&locker)).unwrap();
        tm.remove(&item, "Property/Committed", Some(&locker)).unwrap();

        assert_eq!(
            tm.get_cluster_contents(&item, "Property", Some(&locker)).unwrap(),
            vec!["Pending"]
        );
        assert_eq!(
            tm.get_cluster_contents(&item, "Property", None).unwrap(),
            vec!["Committed"]
        );
    }

    #[test]
    fn test_remove_cluster_deletes_leaves() {
        let (tm, mem) = manager();
        let item = ItemId::new();
        tm.put(&item, Outcome::new("S", 0, 1, "a").into(), None).unwrap();
        tm.put(&item, Outcome::new("S", 1, 2, "b").into(), None).unwrap();
        tm.put(&item, prop("Name", "x"), None).unwrap();

        tm.remove_cluster(&item, "Outcome", None).unwrap();
        assert_eq!(mem.object_count(&item), 1);
        assert!(tm.get_cluster_contents(&item, "Outcome", None).unwrap().is_empty());
    }

    #[test]
    fn test_dump_and_close_discard_pending() {
        let (tm, _) = manager();
        let item = ItemId::new();
        let locker = Locker::new();
        tm.put(&item, prop("Name", "x"), Some(&locker)).unwrap();
        let lines = tm.dump_pending();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("put"));

        tm.close().unwrap();
        assert!(!tm.has_pending(&locker));
        assert!(tm.holder_of(&item).is_none());
    }
}
