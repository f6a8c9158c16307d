use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::{ClusterSource, RemoteMap};
use crate::cluster::{ClusterPath, ClusterType, Event, ItemId};
use crate::error::Result;
use crate::transaction::Locker;

/// An item's audit trail, keyed by event id
#[derive(Debug)]
pub struct History {
    map: RemoteMap<Event>,
}

impl History {
    pub fn new(source: Arc<dyn ClusterSource>, item: ItemId, locker: Option<Locker>) -> Self {
        Self {
            map: RemoteMap::new(source, item, ClusterPath::root(ClusterType::History), locker),
        }
    }

    /// Append an event, allocating its id when it has none
    pub fn add_event(&mut self, mut event: Event) -> Result<Event> {
        if event.id < 0 {
            event.id = self.map.next_id()?;
        }
        self.map.put(event.clone())?;
        Ok(event)
    }

    pub fn event(&mut self, id: i64) -> Result<Option<Event>> {
        self.map.get(&id.to_string())
    }
}

impl Deref for History {
    type Target = RemoteMap<Event>;

    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

impl DerefMut for History {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::router::StorageRouter;

    #[test]
    fn test_add_event_allocates_sequential_ids() {
        let router = StorageRouter::builder()
            .backend(Arc::new(MemoryBackend::new("mem")))
            .build()
            .unwrap();
        let item = ItemId::new();
        let mut history = History::new(Arc::new(router.clone()), item, None);

        let first = history.add_event(Event::new("alice", "Admin", "Create", "Done")).unwrap();
        let second = history.add_event(Event::new("bob", "User", "Edit", "Save")).unwrap();
        assert_eq!((first.id, second.id), (0, 1));

        let stored = router.get_object(&item, "AuditTrail/1").unwrap();
        assert_eq!(stored.name().unwrap(), "1");
        assert_eq!(history.event(0).unwrap().map(|e| e.agent), Some("alice".to_string()));
    }
}
