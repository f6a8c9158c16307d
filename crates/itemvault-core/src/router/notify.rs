//! Change notifications
//!
//! After every successful put or delete the router publishes a
//! [`ChangeEvent`] to its configured [`ChangeSink`]. Publishing never blocks
//! and never fails the write; sink errors are logged and dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::cluster::{ClusterPath, ItemId};
use crate::error::{Result, StorageError};

/// Kind of change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Deleted,
}

/// One committed change to an item's cluster tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub item: ItemId,
    pub path: ClusterPath,
    pub kind: ChangeKind,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(item: ItemId, path: ClusterPath, kind: ChangeKind) -> Self {
        Self {
            item,
            path,
            kind,
            at: Utc::now(),
        }
    }
}

/// Receiver of change events
pub trait ChangeSink: Send + Sync {
    /// Publish without blocking
    fn publish(&self, event: &ChangeEvent) -> Result<()>;

    /// Live feed of future events, when the sink supports it
    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}

/// Fan-out sink backed by a bounded broadcast channel
///
/// Slow subscribers lag rather than block the publisher.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl ChangeSink for BroadcastSink {
    fn publish(&self, event: &ChangeEvent) -> Result<()> {
        if self.sender.receiver_count() == 0 {
            debug!(item = %event.item, path = %event.path, "No subscribers for change event");
            return Ok(());
        }
        self.sender
            .send(event.clone())
            .map(|_| ())
            .map_err(|e| StorageError::backend("notify", e.to_string()))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.sender.subscribe())
    }
}
