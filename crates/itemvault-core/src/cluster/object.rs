//! Stored objects
//!
//! A [`StoredObject`] knows its own cluster path, so writers never pass one
//! alongside it. The core interprets a handful of record kinds (viewpoints for
//! the `data` projection, events and jobs for the numbered virtual
//! collections); every other cluster type is carried as an opaque [`Record`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ClusterPath, ClusterType, ItemId};
use crate::error::Result;

/// Reserved last segment of a viewpoint path that projects its outcome
pub const VIEWPOINT_DATA: &str = "data";

/// Any value stored at exactly one cluster path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredObject {
    Property(Property),
    Viewpoint(Viewpoint),
    Outcome(Outcome),
    Event(Event),
    Job(Job),
    Record(Record),
}

impl StoredObject {
    /// Cluster type derived from the object itself
    pub fn cluster_type(&self) -> ClusterType {
        match self {
            StoredObject::Property(_) => ClusterType::Property,
            StoredObject::Viewpoint(_) => ClusterType::ViewPoint,
            StoredObject::Outcome(_) => ClusterType::Outcome,
            StoredObject::Event(_) => ClusterType::History,
            StoredObject::Job(_) => ClusterType::Job,
            StoredObject::Record(r) => r.path.cluster_type(),
        }
    }

    /// Full path derived from the object itself
    pub fn cluster_path(&self) -> Result<ClusterPath> {
        match self {
            StoredObject::Property(p) => ClusterPath::new(ClusterType::Property, [p.name.as_str()]),
            StoredObject::Viewpoint(v) => ClusterPath::new(
                ClusterType::ViewPoint,
                [v.schema.as_str(), v.name.as_str()],
            ),
            StoredObject::Outcome(o) => ClusterPath::new(
                ClusterType::Outcome,
                [
                    o.schema.clone(),
                    o.schema_version.to_string(),
                    o.event_id.to_string(),
                ],
            ),
            StoredObject::Event(e) => ClusterPath::new(ClusterType::History, [e.id.to_string()]),
            StoredObject::Job(j) => ClusterPath::new(ClusterType::Job, [j.id.to_string()]),
            StoredObject::Record(r) => Ok(r.path.clone()),
        }
    }

    /// Last path segment, the object's name within its parent
    pub fn name(&self) -> Result<String> {
        let path = self.cluster_path()?;
        Ok(path
            .last()
            .map(str::to_string)
            .unwrap_or_else(|| path.cluster_type().name().to_string()))
    }
}

/// Named item property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
    pub mutable: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            mutable: true,
        }
    }
}

/// Named pointer to the outcome recorded by one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewpoint {
    pub schema: String,
    pub name: String,
    pub schema_version: u32,
    pub event_id: i64,
}

impl Viewpoint {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, schema_version: u32, event_id: i64) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            schema_version,
            event_id,
        }
    }

    /// Path of the outcome this viewpoint refers to
    pub fn outcome_path(&self) -> Result<ClusterPath> {
        ClusterPath::new(
            ClusterType::Outcome,
            [
                self.schema.clone(),
                self.schema_version.to_string(),
                self.event_id.to_string(),
            ],
        )
    }
}

/// Outcome document submitted with an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub schema: String,
    pub schema_version: u32,
    pub event_id: i64,
    pub data: String,
}

impl Outcome {
    pub fn new(schema: impl Into<String>, schema_version: u32, event_id: i64, data: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            schema_version,
            event_id,
            data: data.into(),
        }
    }
}

/// One audit trail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Numeric id; allocated by the history view when negative
    pub id: i64,
    pub agent: String,
    pub agent_role: String,
    pub step_name: String,
    pub transition: String,
    pub origin_state: String,
    pub target_state: String,
    /// Schema of the outcome recorded with this event, if any
    pub schema: Option<String>,
    pub schema_version: Option<u32>,
    pub view_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Unnumbered event; [`crate::remote_map::History::add_event`] assigns the id
    pub fn new(
        agent: impl Into<String>,
        agent_role: impl Into<String>,
        step_name: impl Into<String>,
        transition: impl Into<String>,
    ) -> Self {
        Self {
            id: -1,
            agent: agent.into(),
            agent_role: agent_role.into(),
            step_name: step_name.into(),
            transition: transition.into(),
            origin_state: String::new(),
            target_state: String::new(),
            schema: None,
            schema_version: None,
            view_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_states(mut self, origin: impl Into<String>, target: impl Into<String>) -> Self {
        self.origin_state = origin.into();
        self.target_state = target.into();
        self
    }

    pub fn with_outcome(mut self, schema: impl Into<String>, version: u32, view_name: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self.schema_version = Some(version);
        self.view_name = Some(view_name.into());
        self
    }
}

/// Work offered to an agent role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub item: ItemId,
    pub step_name: String,
    pub transition: String,
    pub agent_role: String,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        item: ItemId,
        step_name: impl Into<String>,
        transition: impl Into<String>,
        agent_role: impl Into<String>,
    ) -> Self {
        Self {
            id: -1,
            item,
            step_name: step_name.into(),
            transition: transition.into(),
            agent_role: agent_role.into(),
            created_at: Utc::now(),
        }
    }
}

/// Opaque payload for cluster types the storage core does not interpret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub path: ClusterPath,
    pub body: serde_json::Value,
}

impl Record {
    pub fn new(path: ClusterPath, body: serde_json::Value) -> Self {
        Self { path, body }
    }
}

impl From<Property> for StoredObject {
    fn from(p: Property) -> Self {
        StoredObject::Property(p)
    }
}

impl From<Viewpoint> for StoredObject {
    fn from(v: Viewpoint) -> Self {
        StoredObject::Viewpoint(v)
    }
}

impl From<Outcome> for StoredObject {
    fn from(o: Outcome) -> Self {
        StoredObject::Outcome(o)
    }
}

impl From<Event> for StoredObject {
    fn from(e: Event) -> Self {
        StoredObject::Event(e)
    }
}

impl From<Job> for StoredObject {
    fn from(j: Job) -> Self {
        StoredObject::Job(j)
    }
}

impl From<Record> for StoredObject {
    fn from(r: Record) -> Self {
        StoredObject::Record(r)
    }
}
