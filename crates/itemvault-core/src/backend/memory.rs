//! In-process backend
//!
//! Holds every object in a map keyed by item and path. Capabilities are
//! configurable per cluster type, failures can be injected, and the whole
//! store can be written to and read from a JSON snapshot file.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{Capability, ClusterStorage, Credentials, Query};
use crate::cluster::{ClusterPath, ClusterType, ItemId, StoredObject};
use crate::error::{Result, StorageError};

/// Query language understood by [`MemoryBackend::execute_query`]: the query
/// text is a cluster path prefix, the result a JSON array of `item/path`.
pub const PATH_PREFIX_QUERY: &str = "path-prefix";

/// Which operations an injected failure affects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Reads,
    Writes,
    All,
}

type ItemTable = BTreeMap<ItemId, BTreeMap<ClusterPath, StoredObject>>;

/// On-disk form of a memory backend
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    items: BTreeMap<ItemId, Vec<StoredObject>>,
}

/// Backend keeping all data in memory
pub struct MemoryBackend {
    id: String,
    capabilities: HashMap<ClusterType, Capability>,
    default_capability: Capability,
    data: RwLock<ItemTable>,
    failure: RwLock<Option<FailureMode>>,
    open: AtomicBool,
}

impl MemoryBackend {
    /// Backend that can read and write every cluster type
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: HashMap::new(),
            default_capability: Capability::ReadWrite,
            data: RwLock::new(BTreeMap::new()),
            failure: RwLock::new(None),
            open: AtomicBool::new(false),
        }
    }

    /// Backend with no capability except those granted by [`Self::with_capability`]
    pub fn restricted(id: impl Into<String>) -> Self {
        Self {
            default_capability: Capability::None,
            ..Self::new(id)
        }
    }

    /// Override the capability for one cluster type
    pub fn with_capability(mut self, cluster: ClusterType, capability: Capability) -> Self {
        self.capabilities.insert(cluster, capability);
        self
    }

    /// Make subsequent operations of the given kind fail; `None` heals
    pub fn inject_failure(&self, mode: Option<FailureMode>) {
        *self.failure.write() = mode;
    }

    /// Number of objects held for an item
    pub fn object_count(&self, item: &ItemId) -> usize {
        self.data.read().get(item).map_or(0, BTreeMap::len)
    }

    /// Items with at least one stored object
    pub fn items(&self) -> Vec<ItemId> {
        self.data.read().keys().copied().collect()
    }

    /// Read the stored value directly, bypassing capability checks
    pub fn peek(&self, item: &ItemId, path: &ClusterPath) -> Option<StoredObject> {
        self.data.read().get(item).and_then(|m| m.get(path)).cloned()
    }

    /// Write the whole store as pretty JSON
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = Snapshot {
            items: self
                .data
                .read()
                .iter()
                .map(|(item, objects)| (*item, objects.values().cloned().collect()))
                .collect(),
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build a read-write backend from a snapshot file
    pub fn load_snapshot(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        let backend = Self::new(id);
        {
            let mut data = backend.data.write();
            for (item, objects) in snapshot.items {
                let table = data.entry(item).or_default();
                for object in objects {
                    table.insert(object.cluster_path()?, object);
                }
            }
        }
        Ok(backend)
    }

    fn check(&self, write: bool) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(StorageError::backend(&self.id, "backend is not open"));
        }
        let failing = match *self.failure.read() {
            Some(FailureMode::All) => true,
            Some(FailureMode::Writes) => write,
            Some(FailureMode::Reads) => !write,
            None => false,
        };
        if failing {
            return Err(StorageError::backend(&self.id, "injected failure"));
        }
        Ok(())
    }
}

impl ClusterStorage for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&self, credentials: &Credentials) -> Result<()> {
        debug!(
            backend = %self.id,
            principal = credentials.principal.as_deref().unwrap_or("anonymous"),
            "Opening memory backend"
        );
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn capability(&self, cluster: ClusterType) -> Capability {
        self.capabilities
            .get(&cluster)
            .copied()
            .unwrap_or(self.default_capability)
    }

    fn get(&self, item: &ItemId, path: &ClusterPath) -> Result<Option<StoredObject>> {
        self.check(false)?;
        Ok(self.peek(item, path))
    }

    fn put(&self, item: &ItemId, object: &StoredObject) -> Result<()> {
        self.check(true)?;
        let path = object.cluster_path()?;
        self.data
            .write()
            .entry(*item)
            .or_default()
            .insert(path, object.clone());
        Ok(())
    }

    fn delete(&self, item: &ItemId, path: &ClusterPath) -> Result<()> {
        self.check(true)?;
        let mut data = self.data.write();
        if let Some(table) = data.get_mut(item) {
            table.remove(path);
            if table.is_empty() {
                data.remove(item);
            }
        }
        Ok(())
    }

    fn children(&self, item: &ItemId, path: &ClusterPath) -> Result<Vec<String>> {
        self.check(false)?;
        let depth = path.segments().len();
        let data = self.data.read();
        let names: BTreeSet<String> = data
            .get(item)
            .into_iter()
            .flat_map(|table| table.keys())
            .filter(|stored| stored.starts_with(path) && stored.segments().len() > depth)
            .map(|stored| stored.segments()[depth].clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn supports_query(&self, language: &str) -> bool {
        language == PATH_PREFIX_QUERY
    }

    fn execute_query(&self, query: &Query) -> Result<String> {
        if !self.supports_query(&query.language) {
            return Err(StorageError::unsupported(format!(
                "backend '{}' cannot execute {} queries",
                self.id, query.language
            )));
        }
        self.check(false)?;
        let prefix = ClusterPath::parse(&query.text)?;
        let data = self.data.read();
        let hits: Vec<String> = data
            .iter()
            .flat_map(|(item, table)| {
                table
                    .keys()
                    .filter(|p| p.starts_with(&prefix))
                    .map(move |p| format!("{}/{}", item, p))
            })
            .collect();
        Ok(serde_json::to_string(&hits)?)
    }
}
