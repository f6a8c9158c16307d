//! Backend capability interface
//!
//! A backend is any store that can hold some cluster types of some items.
//! Each one declares, per cluster type, whether it can be read, written or
//! both; the router asks once per type and remembers the answer.
//!
//! Contract:
//!
//! - `open` / `close` bracket every other call.
//! - `get` returns `Ok(None)` for a structurally absent object and fails only
//!   on genuine I/O trouble.
//! - `delete` of an absent node is a no-op.
//! - `children` lists the next path segments below a path.

pub mod memory;

pub use memory::MemoryBackend;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cluster::{ClusterPath, ClusterType, ItemId, StoredObject};
use crate::error::{Result, StorageError};

/// What a backend can do with one cluster type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
}

impl Capability {
    pub fn can_read(self) -> bool {
        matches!(self, Capability::Read | Capability::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Capability::Write | Capability::ReadWrite)
    }
}

/// Credentials handed to every backend on open
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Backend-specific settings, keyed by name
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }
}

/// Query passed through to a backend that can execute it server-side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub language: String,
    pub text: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl Query {
    pub fn new(language: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            text: text.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// Contract every storage backend implements
pub trait ClusterStorage: Send + Sync {
    /// Stable identifier used in configuration and error messages
    fn id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str {
        self.id()
    }

    fn open(&self, credentials: &Credentials) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Declarative capability for one cluster type; assumed static
    fn capability(&self, cluster: ClusterType) -> Capability;

    /// Point lookup; `Ok(None)` when absent
    fn get(&self, item: &ItemId, path: &ClusterPath) -> Result<Option<StoredObject>>;

    /// Upsert at the object's own path
    fn put(&self, item: &ItemId, object: &StoredObject) -> Result<()>;

    /// Remove one node; absent nodes are ignored
    fn delete(&self, item: &ItemId, path: &ClusterPath) -> Result<()>;

    /// Next path segments below `path`
    fn children(&self, item: &ItemId, path: &ClusterPath) -> Result<Vec<String>>;

    /// Whether `execute_query` understands this language
    fn supports_query(&self, _language: &str) -> bool {
        false
    }

    fn execute_query(&self, query: &Query) -> Result<String> {
        Err(StorageError::unsupported(format!(
            "backend '{}' cannot execute {} queries",
            self.id(),
            query.language
        )))
    }
}
