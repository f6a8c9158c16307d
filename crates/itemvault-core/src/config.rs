//! Storage configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::backend::Credentials;
use crate::error::{Result, StorageError};
use crate::router::cache::{CachePolicy, CacheSettings};

/// Default capacity of the change-notification channel
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

/// Main storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend ids in priority order; empty keeps registration order
    pub backend_order: Vec<String>,

    /// Cache configuration
    pub cache: CacheSettings,

    /// Credentials handed to every backend on open
    pub credentials: Credentials,

    /// Capacity of the change-notification channel; 0 disables notifications
    pub notify_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend_order: Vec::new(),
            cache: CacheSettings::default(),
            credentials: Credentials::anonymous(),
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

impl StorageConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend priority order
    pub fn with_backend_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backend_order = order.into_iter().map(Into::into).collect();
        self
    }

    /// Set the cache eviction policy
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache.policy = policy;
        self
    }

    /// Set the number of item caches kept under pressure
    pub fn with_max_cached_items(mut self, max: usize) -> Self {
        self.cache.max_items = max;
        self
    }

    /// Cache confirmed-absent lookups
    pub fn with_remember_absent(mut self, remember: bool) -> Self {
        self.cache.remember_absent = remember;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity;
        self
    }

    /// Load configuration from a `.toml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = if is_toml(path) {
            toml::from_str(&content).map_err(|e| StorageError::Config(e.to_string()))?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    /// Save configuration to a `.toml` or `.json` file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}
