//! Itemvault Core - storage and transaction kernel for addressable items
//!
//! Every item owns a tree of clusters (properties, outcomes, audit trail,
//! viewpoints, jobs, ...) addressed by slash-delimited paths. The core
//! decides which backend holds which cluster type, caches what it reads,
//! and buffers writes per caller until they commit.
//!
//! # Architecture
//!
//! 1. **Cluster paths** (`cluster`): item ids, cluster types, parsed paths and the stored objects
//! 2. **Backends** (`backend`): the capability interface every store implements, plus an in-memory one
//! 3. **Router** (`router`): priority-ordered read fallback, write fan-out, per-item cache, change events
//! 4. **Transactions** (`transaction`): per-locker write buffers and one-locker-per-item exclusion
//! 5. **Remote maps** (`remote_map`): lazily loaded, numerically ordered views such as the audit trail
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use itemvault_core::backend::MemoryBackend;
//! use itemvault_core::cluster::{ItemId, Property};
//! use itemvault_core::router::StorageRouter;
//! use itemvault_core::transaction::{Locker, TransactionManager};
//!
//! let router = StorageRouter::builder()
//!     .backend(Arc::new(MemoryBackend::new("mem")))
//!     .build()
//!     .unwrap();
//! let tm = TransactionManager::new(router);
//!
//! let item = ItemId::new();
//! let locker = Locker::new();
//! tm.put(&item, Property::new("Name", "widget").into(), Some(&locker)).unwrap();
//!
//! // only the locker sees its own write until it commits
//! assert!(tm.get(&item, "Property/Name", Some(&locker)).is_ok());
//! assert!(tm.get(&item, "Property/Name", None).is_err());
//!
//! tm.commit(&locker).unwrap();
//! assert!(tm.get(&item, "/Property/Name", None).is_ok());
//! ```

#![deny(unsafe_code)]

pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod remote_map;
pub mod router;
pub mod transaction;

pub use backend::{Capability, ClusterStorage, Credentials, MemoryBackend, Query};
pub use cluster::{ClusterPath, ClusterType, ItemId, StoredObject};
pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use remote_map::{ClusterSource, History, JobList, MapKey, RemoteMap};
pub use router::{ClusterEntry, StorageRouter, StorageRouterBuilder};
pub use transaction::{Locker, TransactionManager};

/// Version of Itemvault Core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
