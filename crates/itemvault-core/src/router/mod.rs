//! Storage router and cache
//!
//! Aggregates backends in a fixed priority order and routes every read and
//! write by cluster type:
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   get/put/del → │        StorageRouter         │ → ChangeSink
//!                 │  MemoryCache   RouteTable    │
//!                 └──────┬──────────┬────────────┘
//!                        │          │
//!                 ┌──────▼───┐ ┌────▼─────┐
//!                 │ backend 0│ │ backend 1│ ...
//!                 └──────────┘ └──────────┘
//! ```
//!
//! - Reads try each reader in priority order and return the first hit; a
//!   reader that errors is skipped.
//! - Writes fan out to **every** writer. A failure after some writers
//!   succeeded is reported as [`StorageError::PartiallyApplied`]; nothing is
//!   rolled back.
//! - Listings union every reader's children, skipping failing readers.
//!
//! The router is a cheap cloneable handle; clones share backends, cache and
//! route table.

pub mod cache;
pub mod notify;

pub use cache::{CacheLookup, CachePolicy, CacheSettings, CacheStats, MemoryCache};
pub use notify::{BroadcastSink, ChangeEvent, ChangeKind, ChangeSink};

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::{ClusterStorage, Credentials, Query};
use crate::cluster::object::VIEWPOINT_DATA;
use crate::cluster::{ClusterPath, ClusterType, ItemId, StoredObject};
use crate::config::StorageConfig;
use crate::error::{Result, ResultExt, StorageError};
use crate::remote_map::{ClusterSource, History, JobList};
use crate::transaction::Locker;

/// A registered backend and the id it is known by
#[derive(Clone)]
pub struct BackendDescriptor {
    pub id: String,
    pub backend: Arc<dyn ClusterStorage>,
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor").field("id", &self.id).finish()
    }
}

/// Readers and writers for one cluster type, as indices in priority order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Routes {
    readers: Vec<usize>,
    writers: Vec<usize>,
}

/// What a path resolves to
#[derive(Debug)]
pub enum ClusterEntry {
    /// A stored object
    Object(Arc<StoredObject>),
    /// The audit trail of an item, materialized lazily
    History(History),
    /// The job list of an item, materialized lazily
    Jobs(JobList),
}

impl ClusterEntry {
    /// The stored object, or `Unsupported` for a virtual collection
    pub fn into_object(self) -> Result<Arc<StoredObject>> {
        match self {
            ClusterEntry::Object(obj) => Ok(obj),
            ClusterEntry::History(_) => Err(StorageError::unsupported(
                "AuditTrail is a virtual collection, not an object",
            )),
            ClusterEntry::Jobs(_) => Err(StorageError::unsupported(
                "Job is a virtual collection, not an object",
            )),
        }
    }
}

struct RouterInner {
    backends: Vec<BackendDescriptor>,
    routes: RwLock<HashMap<ClusterType, Arc<Routes>>>,
    cache: MemoryCache,
    sink: Option<Arc<dyn ChangeSink>>,
    /// Highest id handed out per numbered cluster; never shrinks
    watermarks: Mutex<HashMap<(ItemId, ClusterPath), i64>>,
}

/// Multi-backend router with a per-item object cache
#[derive(Clone)]
pub struct StorageRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for StorageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRouter")
            .field("backends", &self.backend_ids())
            .finish()
    }
}

/// Builder for [`StorageRouter`]
pub struct StorageRouterBuilder {
    config: StorageConfig,
    backends: Vec<Arc<dyn ClusterStorage>>,
    sink: Option<Arc<dyn ChangeSink>>,
}

impl StorageRouterBuilder {
    pub fn new() -> Self {
        Self {
            config: StorageConfig::default(),
            backends: Vec::new(),
            sink: None,
        }
    }

    pub fn config(mut self, config: StorageConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a backend; without an explicit order, registration order is priority order
    pub fn backend(mut self, backend: Arc<dyn ClusterStorage>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Publish change events to this sink instead of the default broadcast channel
    pub fn sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Order, open and assemble the backends
    pub fn build(self) -> Result<StorageRouter> {
        let backends = order_backends(self.backends, &self.config.backend_order)?;
        if backends.is_empty() {
            return Err(StorageError::Config("no storage backends configured".into()));
        }

        let sink = match self.sink {
            Some(sink) => Some(sink),
            None if self.config.notify_capacity > 0 => {
                Some(Arc::new(BroadcastSink::new(self.config.notify_capacity)) as Arc<dyn ChangeSink>)
            }
            None => None,
        };

        let router = StorageRouter {
            inner: Arc::new(RouterInner {
                backends,
                routes: RwLock::new(HashMap::new()),
                cache: MemoryCache::new(self.config.cache.clone()),
                sink,
                watermarks: Mutex::new(HashMap::new()),
            }),
        };
        router.open_all(&self.config.credentials)?;
        Ok(router)
    }
}

impl Default for StorageRouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn order_backends(
    registered: Vec<Arc<dyn ClusterStorage>>,
    order: &[String],
) -> Result<Vec<BackendDescriptor>> {
    let mut descriptors: Vec<BackendDescriptor> = Vec::with_capacity(registered.len());
    for backend in registered {
        let id = backend.id().to_string();
        if descriptors.iter().any(|d| d.id == id) {
            return Err(StorageError::Config(format!("duplicate backend id '{}'", id)));
        }
        descriptors.push(BackendDescriptor { id, backend });
    }

    if order.is_empty() {
        return Ok(descriptors);
    }

    let mut ordered = Vec::with_capacity(order.len());
    for id in order {
        let pos = descriptors
            .iter()
            .position(|d| &d.id == id)
            .ok_or_else(|| StorageError::Config(format!("backend '{}' is not registered", id)))?;
        ordered.push(descriptors.remove(pos));
    }
    for unused in &descriptors {
        warn!(backend = %unused.id, "Registered backend missing from backend_order; ignoring it");
    }
    Ok(ordered)
}

impl StorageRouter {
    pub fn builder() -> StorageRouterBuilder {
        StorageRouterBuilder::new()
    }

    fn open_all(&self, credentials: &Credentials) -> Result<()> {
        for desc in &self.inner.backends {
            desc.backend
                .open(credentials)
                .with_context(|| format!("opening backend '{}'", desc.id))?;
            info!(backend = %desc.id, name = desc.backend.name(), "Storage backend opened");
        }
        Ok(())
    }

    /// Close every backend; failures are logged and the first is returned
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;
        for desc in &self.inner.backends {
            if let Err(e) = desc.backend.close() {
                warn!(backend = %desc.id, error = %e, "Error closing storage backend");
                first_error.get_or_insert(e);
            }
        }
        self.inner.cache.clear_all();
        first_error.map_or(Ok(()), Err)
    }

    /// Backend ids in priority order
    pub fn backend_ids(&self) -> Vec<String> {
        self.inner.backends.iter().map(|d| d.id.clone()).collect()
    }

    fn routes(&self, cluster: ClusterType) -> Arc<Routes> {
        if let Some(routes) = self.inner.routes.read().get(&cluster) {
            return Arc::clone(routes);
        }
        let mut routes = Routes::default();
        for (idx, desc) in self.inner.backends.iter().enumerate() {
            let capability = desc.backend.capability(cluster);
            if capability.can_read() {
                routes.readers.push(idx);
            }
            if capability.can_write() {
                routes.writers.push(idx);
            }
        }
        debug!(
            cluster = %cluster,
            readers = routes.readers.len(),
            writers = routes.writers.len(),
            "Resolved backend routes"
        );
        let routes = Arc::new(routes);
        self.inner
            .routes
            .write()
            .entry(cluster)
            .or_insert(routes)
            .clone()
    }

    fn descriptor(&self, idx: usize) -> &BackendDescriptor {
        &self.inner.backends[idx]
    }

    /// Ids of backends able to read a cluster type, in priority order
    pub fn readers(&self, cluster: ClusterType) -> Vec<String> {
        self.routes(cluster)
            .readers
            .iter()
            .map(|&i| self.descriptor(i).id.clone())
            .collect()
    }

    /// Ids of backends able to write a cluster type, in priority order
    pub fn writers(&self, cluster: ClusterType) -> Vec<String> {
        self.routes(cluster)
            .writers
            .iter()
            .map(|&i| self.descriptor(i).id.clone())
            .collect()
    }

    /// Union of every reader's children of `path`
    ///
    /// An empty path (or `/`) lists the cluster types the item has data in.
    /// A reader that fails contributes nothing.
    pub fn get_cluster_contents(&self, item: &ItemId, path: &str) -> Result<Vec<String>> {
        if path.trim_matches('/').is_empty() {
            return Ok(self.cluster_types_of(item));
        }
        let path = ClusterPath::parse(path)?;
        Ok(self.contents(item, &path))
    }

    pub(crate) fn contents(&self, item: &ItemId, path: &ClusterPath) -> Vec<String> {
        let routes = self.routes(path.cluster_type());
        routes
            .readers
            .iter()
            .flat_map(|&idx| {
                let desc = self.descriptor(idx);
                match desc.backend.children(item, path) {
                    Ok(children) => children,
                    Err(e) => {
                        warn!(
                            backend = %desc.id,
                            item = %item,
                            path = %path,
                            error = %e,
                            "Skipping backend while listing cluster contents"
                        );
                        Vec::new()
                    }
                }
            })
            .unique()
            .collect()
    }

    fn cluster_types_of(&self, item: &ItemId) -> Vec<String> {
        ClusterType::ALL
            .into_iter()
            .filter(|t| !self.contents(item, &ClusterPath::root(*t)).is_empty())
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Resolve a path: a cached or stored object, or a virtual collection view
    pub fn get(&self, item: &ItemId, path: &str) -> Result<ClusterEntry> {
        let path = ClusterPath::parse(path)?;
        self.resolve(item, &path)
    }

    /// Resolve a path that must name a stored object
    pub fn get_object(&self, item: &ItemId, path: &str) -> Result<Arc<StoredObject>> {
        let path = ClusterPath::parse(path)?;
        self.fetch(item, &path)
    }

    pub(crate) fn resolve(&self, item: &ItemId, path: &ClusterPath) -> Result<ClusterEntry> {
        if path.is_root() {
            match path.cluster_type() {
                ClusterType::History => {
                    return Ok(ClusterEntry::History(History::new(self.source(), *item, None)))
                }
                ClusterType::Job => {
                    return Ok(ClusterEntry::Jobs(JobList::new(self.source(), *item, None)))
                }
                _ => {}
            }
        }
        self.fetch(item, path).map(ClusterEntry::Object)
    }

    fn source(&self) -> Arc<dyn ClusterSource> {
        Arc::new(self.clone())
    }

    /// Cache, then viewpoint projection, then readers in priority order
    pub(crate) fn fetch(&self, item: &ItemId, path: &ClusterPath) -> Result<Arc<StoredObject>> {
        match self.inner.cache.lookup(item, path) {
            CacheLookup::Hit(obj) => return Ok(obj),
            CacheLookup::Absent => return Err(StorageError::not_found(item, path)),
            CacheLookup::Miss => {}
        }

        if let Some(viewpoint_path) = viewpoint_projection(path) {
            return self.project_viewpoint(item, &viewpoint_path);
        }

        // writes racing this read win over whatever it fetches
        let seen = self.inner.cache.generation();
        let routes = self.routes(path.cluster_type());
        let mut failed = false;
        for &idx in &routes.readers {
            let desc = self.descriptor(idx);
            match desc.backend.get(item, path) {
                Ok(Some(object)) => {
                    let object = Arc::new(object);
                    self.inner
                        .cache
                        .fill(item, path.clone(), Arc::clone(&object), seen);
                    return Ok(object);
                }
                Ok(None) => {}
                Err(e) => {
                    failed = true;
                    warn!(
                        backend = %desc.id,
                        item = %item,
                        path = %path,
                        error = %e,
                        "Backend read failed, trying next"
                    );
                }
            }
        }

        // absent only if every reader answered
        if !failed {
            self.inner.cache.mark_absent(item, path.clone(), seen);
        }
        Err(StorageError::not_found(item, path))
    }

    fn project_viewpoint(&self, item: &ItemId, viewpoint_path: &ClusterPath) -> Result<Arc<StoredObject>> {
        let viewpoint = self.fetch(item, viewpoint_path)?;
        match viewpoint.as_ref() {
            StoredObject::Viewpoint(vp) => self.fetch(item, &vp.outcome_path()?),
            _ => Err(StorageError::invalid_path(format!(
                "{} does not hold a viewpoint",
                viewpoint_path
            ))),
        }
    }

    /// Write an object to every writer of its cluster type
    pub fn put(&self, item: &ItemId, object: StoredObject) -> Result<Arc<StoredObject>> {
        self.put_shared(item, Arc::new(object))
    }

    pub(crate) fn put_shared(&self, item: &ItemId, object: Arc<StoredObject>) -> Result<Arc<StoredObject>> {
        let path = object.cluster_path()?;
        self.fan_out(item, &path, |backend| backend.put(item, &object))?;
        self.inner.cache.insert(item, path.clone(), Arc::clone(&object));
        self.notify(ChangeEvent::new(*item, path, ChangeKind::Added));
        Ok(object)
    }

    /// Delete a path from every writer of its cluster type
    pub fn delete(&self, item: &ItemId, path: &str) -> Result<()> {
        let path = ClusterPath::parse(path)?;
        self.delete_path(item, &path)
    }

    pub(crate) fn delete_path(&self, item: &ItemId, path: &ClusterPath) -> Result<()> {
        self.fan_out(item, path, |backend| backend.delete(item, path))?;
        self.inner.cache.remove(item, path);
        self.notify(ChangeEvent::new(*item, path.clone(), ChangeKind::Deleted));
        Ok(())
    }

    fn fan_out<F>(&self, item: &ItemId, path: &ClusterPath, op: F) -> Result<()>
    where
        F: Fn(&dyn ClusterStorage) -> Result<()>,
    {
        let routes = self.routes(path.cluster_type());
        if routes.writers.is_empty() {
            return Err(StorageError::unsupported(format!(
                "no backend can write {} clusters",
                path.cluster_type()
            )));
        }

        let mut applied: Vec<String> = Vec::with_capacity(routes.writers.len());
        for &idx in &routes.writers {
            let desc = self.descriptor(idx);
            if let Err(e) = op(desc.backend.as_ref()) {
                // the backends no longer agree; force the next read back to storage
                self.inner.cache.remove(item, path);
                return Err(if applied.is_empty() {
                    StorageError::WriteFailed {
                        backend: desc.id.clone(),
                        message: e.to_string(),
                    }
                } else {
                    warn!(
                        item = %item,
                        path = %path,
                        applied = ?applied,
                        failed = %desc.id,
                        "Write partially applied across backends"
                    );
                    StorageError::PartiallyApplied {
                        applied,
                        failed: desc.id.clone(),
                        message: e.to_string(),
                    }
                });
            }
            applied.push(desc.id.clone());
        }
        Ok(())
    }

    fn notify(&self, event: ChangeEvent) {
        match &self.inner.sink {
            Some(sink) => {
                if let Err(e) = sink.publish(&event) {
                    warn!(item = %event.item, path = %event.path, error = %e, "Change notification dropped");
                }
            }
            None => warn!(
                item = %event.item,
                path = %event.path,
                "No change sink configured; dropping notification"
            ),
        }
    }

    /// Live feed of change events, when the sink supports subscriptions
    pub fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        self.inner.sink.as_ref().and_then(|sink| sink.subscribe())
    }

    /// Forget cached entries at or below a path prefix
    pub fn clear_cache_path(&self, item: &ItemId, prefix: &str) -> Result<()> {
        let prefix = ClusterPath::parse(prefix)?;
        self.inner.cache.clear_prefix(item, &prefix);
        Ok(())
    }

    /// Forget everything cached for one item
    pub fn clear_item_cache(&self, item: &ItemId) {
        self.inner.cache.clear_item(item);
    }

    /// Forget everything cached
    pub fn clear_cache(&self) {
        self.inner.cache.clear_all();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Paths currently cached for an item
    pub fn cached_paths(&self, item: &ItemId) -> Vec<String> {
        self.inner.cache.cached_paths(item)
    }

    /// Run a query on the first backend that understands its language
    pub fn execute_query(&self, query: &Query) -> Result<String> {
        let desc = self
            .inner
            .backends
            .iter()
            .find(|d| d.backend.supports_query(&query.language))
            .ok_or_else(|| {
                StorageError::unsupported(format!(
                    "no backend supports query language '{}'",
                    query.language
                ))
            })?;
        desc.backend
            .execute_query(query)
            .with_context(|| format!("query on backend '{}'", desc.id))
    }

    /// Never hand out the same id twice for one numbered cluster, even after deletes
    ///
    /// The watermark table keeps one entry per numbered cluster ever used and
    /// grows for the lifetime of the process.
    pub(crate) fn reserve_id(&self, item: &ItemId, path: &ClusterPath, candidate: i64) -> i64 {
        let mut marks = self.inner.watermarks.lock();
        let mark = marks.entry((*item, path.clone())).or_insert(-1);
        let id = candidate.max(*mark + 1);
        *mark = id;
        id
    }
}

/// `ViewPoint/<schema>/<name>/data` → `ViewPoint/<schema>/<name>`
fn viewpoint_projection(path: &ClusterPath) -> Option<ClusterPath> {
    if path.cluster_type() == ClusterType::ViewPoint
        && path.segments().len() == 3
        && path.last() == Some(VIEWPOINT_DATA)
    {
        path.parent()
    } else {
        None
    }
}

impl ClusterSource for StorageRouter {
    fn list(&self, item: &ItemId, path: &ClusterPath, _locker: Option<&Locker>) -> Result<Vec<String>> {
        Ok(self.contents(item, path))
    }

    fn fetch(&self, item: &ItemId, path: &ClusterPath, _locker: Option<&Locker>) -> Result<Arc<StoredObject>> {
        StorageRouter::fetch(self, item, path)
    }

    fn store(&self, item: &ItemId, object: StoredObject, _locker: Option<&Locker>) -> Result<()> {
        self.put(item, object).map(|_| ())
    }

    fn erase(&self, item: &ItemId, path: &ClusterPath, _locker: Option<&Locker>) -> Result<()> {
        self.delete_path(item, path)
    }

    fn reserve_id(&self, item: &ItemId, path: &ClusterPath, candidate: i64) -> i64 {
        StorageRouter::reserve_id(self, item, path, candidate)
    }
}
