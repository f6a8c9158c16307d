//! Cluster path model
//!
//! Every piece of item data lives at a slash-delimited path whose first
//! segment names its [`ClusterType`]:
//!
//! ```text
//! Property/Name
//! Outcome/Schema/0/12
//! AuditTrail/12
//! ViewPoint/Schema/last
//! Job/3
//! ```
//!
//! Paths are plain strings at the API boundary and are parsed into a
//! [`ClusterPath`] for routing. Segment names never contain `/`; there is no
//! escaping.

pub mod object;

pub use object::{Event, Job, Outcome, Property, Record, StoredObject, Viewpoint};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Path separator
pub const SEPARATOR: char = '/';

/// Identifier of an addressable item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl ItemId {
    /// Generate a fresh item identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| StorageError::invalid_path(format!("bad item id '{}': {}", s, e)))
    }
}

/// Top-level category of stored item data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterType {
    Property,
    Collection,
    LifeCycle,
    Outcome,
    /// Audit trail of events; named `AuditTrail` on the wire
    #[serde(rename = "AuditTrail")]
    History,
    ViewPoint,
    Job,
    Path,
    Attachment,
}

impl ClusterType {
    /// Every cluster type, in declaration order
    pub const ALL: [ClusterType; 9] = [
        ClusterType::Property,
        ClusterType::Collection,
        ClusterType::LifeCycle,
        ClusterType::Outcome,
        ClusterType::History,
        ClusterType::ViewPoint,
        ClusterType::Job,
        ClusterType::Path,
        ClusterType::Attachment,
    ];

    /// Name used as the first path segment
    pub fn name(self) -> &'static str {
        match self {
            ClusterType::Property => "Property",
            ClusterType::Collection => "Collection",
            ClusterType::LifeCycle => "LifeCycle",
            ClusterType::Outcome => "Outcome",
            ClusterType::History => "AuditTrail",
            ClusterType::ViewPoint => "ViewPoint",
            ClusterType::Job => "Job",
            ClusterType::Path => "Path",
            ClusterType::Attachment => "Attachment",
        }
    }

    /// Types with no single serialized form, materialized as lazy maps
    pub fn is_virtual_collection(self) -> bool {
        matches!(self, ClusterType::History | ClusterType::Job)
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ClusterType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        ClusterType::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| StorageError::invalid_path(format!("unknown cluster type '{}'", s)))
    }
}

/// Parsed cluster path: a cluster type plus the remaining segments
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterPath {
    cluster: ClusterType,
    segments: Vec<String>,
}

impl ClusterPath {
    /// Path naming just the cluster type
    pub fn root(cluster: ClusterType) -> Self {
        Self {
            cluster,
            segments: Vec::new(),
        }
    }

    /// Build a path from a cluster type and segments
    pub fn new<I, S>(cluster: ClusterType, segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = Self::root(cluster);
        for segment in segments {
            path = path.child(segment)?;
        }
        Ok(path)
    }

    /// Parse a `/`-delimited path; a leading `/` and empty segments are ignored
    pub fn parse(path: &str) -> Result<Self> {
        let mut parts = path.split(SEPARATOR).filter(|s| !s.is_empty());
        let head = parts
            .next()
            .ok_or_else(|| StorageError::invalid_path(format!("empty path '{}'", path)))?;
        let cluster = ClusterType::from_str(head)?;
        Ok(Self {
            cluster,
            segments: parts.map(str::to_string).collect(),
        })
    }

    /// The cluster type this path addresses
    pub fn cluster_type(&self) -> ClusterType {
        self.cluster
    }

    /// Segments after the cluster type
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True when the path names only the cluster type
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Final segment, if any beyond the cluster type
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Path extended by one segment
    pub fn child(&self, segment: impl Into<String>) -> Result<Self> {
        let segment = segment.into();
        if segment.is_empty() || segment.contains(SEPARATOR) {
            return Err(StorageError::invalid_path(format!(
                "invalid segment '{}' under {}",
                segment, self
            )));
        }
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Self {
            cluster: self.cluster,
            segments,
        })
    }

    /// Path with the final segment removed; `None` at the cluster root
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self {
            cluster: self.cluster,
            segments,
        })
    }

    /// True when `self` equals `prefix` or lies beneath it
    pub fn starts_with(&self, prefix: &ClusterPath) -> bool {
        self.cluster == prefix.cluster
            && self.segments.len() >= prefix.segments.len()
            && self.segments.iter().zip(&prefix.segments).all(|(a, b)| a == b)
    }
}

impl fmt::Display for ClusterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cluster.name())?;
        for segment in &self.segments {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}

impl FromStr for ClusterPath {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ClusterPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClusterPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ClusterPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}
