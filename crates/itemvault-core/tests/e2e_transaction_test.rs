//! End-to-end tests for per-item transactions.
//!
//! The transaction manager runs in front of a real router and memory
//! backend; assertions look at both the manager's view and the backend.

use itemvault_core::backend::memory::FailureMode;
use itemvault_core::backend::MemoryBackend;
use itemvault_core::cluster::{Event, ItemId, Outcome, Property, StoredObject};
use itemvault_core::router::{ClusterEntry, StorageRouter};
use itemvault_core::transaction::{Locker, TransactionManager};
use itemvault_core::StorageError;
use proptest::prelude::*;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn manager() -> (TransactionManager, Arc<MemoryBackend>) {
    let mem = Arc::new(MemoryBackend::new("mem"));
    let router = StorageRouter::builder()
        .backend(mem.clone())
        .build()
        .expect("router should build");
    (TransactionManager::new(router), mem)
}

fn prop(value: &str) -> StoredObject {
    Property::new("Name", value).into()
}

fn value_of(entry: ClusterEntry) -> String {
    match entry.into_object().unwrap().as_ref() {
        StoredObject::Property(p) => p.value.clone(),
        other => panic!("expected property, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Test 1: Another locker is refused until the holder commits or aborts
// ---------------------------------------------------------------------------
#[test]
fn test_exclusion_until_commit_or_abort() {
    let (tm, _) = manager();
    let item = ItemId::new();
    let (l1, l2) = (Locker::new(), Locker::new());

    tm.put(&item, prop("one"), Some(&l1)).unwrap();
    assert!(tm.put(&item, prop("two"), Some(&l2)).unwrap_err().is_access_denied());
    assert!(tm.remove(&item, "Property/Name", Some(&l2)).unwrap_err().is_access_denied());

    tm.commit(&l1).unwrap();
    tm.put(&item, prop("two"), Some(&l2)).unwrap();
    assert!(tm.put(&item, prop("three"), Some(&l1)).unwrap_err().is_access_denied());

    tm.abort(&l2);
    tm.put(&item, prop("three"), Some(&l1)).unwrap();
}

// ---------------------------------------------------------------------------
// Test 2: Read-your-writes, invisible to everyone else
// ---------------------------------------------------------------------------
#[test]
fn test_read_your_writes() {
    let (tm, _) = manager();
    let item = ItemId::new();
    let (owner, other) = (Locker::new(), Locker::new());

    tm.put(&item, prop("draft"), Some(&owner)).unwrap();
    assert_eq!(value_of(tm.get(&item, "/Property/Name", Some(&owner)).unwrap()), "draft");
    assert!(tm.get(&item, "Property/Name", None).unwrap_err().is_not_found());
    assert!(tm.get(&item, "Property/Name", Some(&other)).unwrap_err().is_not_found());

    tm.commit(&owner).unwrap();
    assert_eq!(value_of(tm.get(&item, "Property/Name", Some(&other)).unwrap()), "draft");
}

// ---------------------------------------------------------------------------
// Test 3: Abort leaves no trace
// ---------------------------------------------------------------------------
#[test]
fn test_abort_leaves_no_trace() {
    let (tm, mem) = manager();
    let item = ItemId::new();
    tm.put(&item, prop("kept"), None).unwrap();

    let locker = Locker::new();
    tm.put(&item, prop("changed"), Some(&locker)).unwrap();
    tm.put(&item, Outcome::new("S", 0, 1, "x").into(), Some(&locker)).unwrap();
    tm.abort(&locker);

    assert_eq!(value_of(tm.get(&item, "Property/Name", None).unwrap()), "kept");
    assert!(tm.get(&item, "Outcome/S/0/1", None).unwrap_err().is_not_found());
    assert_eq!(mem.object_count(&item), 1);
    assert!(tm.holder_of(&item).is_none());
}

// ---------------------------------------------------------------------------
// Test 4: Two puts to one path collapse into one write, second value wins
// ---------------------------------------------------------------------------
#[test]
fn test_same_path_collapses() {
    let (tm, mem) = manager();
    let item = ItemId::new();
    let locker = Locker::new();
    let mut rx = tm.router().subscribe().unwrap();

    tm.put(&item, prop("first"), Some(&locker)).unwrap();
    tm.put(&item, prop("second"), Some(&locker)).unwrap();
    assert_eq!(tm.pending_len(&locker), 1);
    tm.commit(&locker).unwrap();

    assert_eq!(std::iter::from_fn(|| rx.try_recv().ok()).count(), 1);
    assert_eq!(mem.object_count(&item), 1);
    assert_eq!(value_of(tm.get(&item, "Property/Name", None).unwrap()), "second");
}

// ---------------------------------------------------------------------------
// Test 5: Empty commit is a no-op
// ---------------------------------------------------------------------------
#[test]
fn test_empty_commit_is_noop() {
    let (tm, _) = manager();
    let locker = Locker::new();
    tm.commit(&locker).unwrap();
    tm.commit(&locker).unwrap();
    tm.abort(&locker);
}

// ---------------------------------------------------------------------------
// Test 6: One commit spans many items and applies them in buffered order
// ---------------------------------------------------------------------------
#[test]
fn test_commit_across_items_in_order() {
    let (tm, _) = manager();
    let (a, b) = (ItemId::new(), ItemId::new());
    let locker = Locker::new();
    let mut rx = tm.router().subscribe().unwrap();

    tm.put(&a, prop("a"), Some(&locker)).unwrap();
    tm.put(&b, prop("b"), Some(&locker)).unwrap();
    tm.put(&a, Outcome::new("S", 0, 0, "x").into(), Some(&locker)).unwrap();
    assert_eq!(tm.locked_items(&locker).len(), 2);

    tm.commit(&locker).unwrap();
    let order: Vec<(ItemId, String)> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|e| (e.item, e.path.to_string()))
        .collect();
    assert_eq!(
        order,
        vec![
            (a, "Property/Name".to_string()),
            (b, "Property/Name".to_string()),
            (a, "Outcome/S/0/0".to_string()),
        ]
    );
    assert!(tm.locked_items(&locker).is_empty());
}

// ---------------------------------------------------------------------------
// Test 7: A commit failing part-way is fatal, never success
// ---------------------------------------------------------------------------
#[test]
fn test_partial_commit_is_fatal() {
    let good = Arc::new(MemoryBackend::new("good"));
    let flaky = Arc::new(MemoryBackend::new("flaky"));
    let router = StorageRouter::builder()
        .backend(good.clone())
        .backend(flaky.clone())
        .build()
        .unwrap();
    let tm = TransactionManager::new(router);
    let item = ItemId::new();
    let locker = Locker::new();

    tm.put(&item, prop("x"), Some(&locker)).unwrap();
    tm.put(&item, Outcome::new("S", 0, 1, "y").into(), Some(&locker)).unwrap();
    flaky.inject_failure(Some(FailureMode::Writes));

    let err = tm.commit(&locker).unwrap_err();
    assert!(err.is_fatal());
    let StorageError::CommitAborted { source, discarded, .. } = err else {
        panic!("expected CommitAborted");
    };
    assert!(source.is_partial());
    assert_eq!(discarded, 1);
    assert_eq!(good.object_count(&item), 1);
    assert!(tm.holder_of(&item).is_none());
}

// ---------------------------------------------------------------------------
// Test 8: Transaction-bound history sees its own new events only
// ---------------------------------------------------------------------------
#[test]
fn test_transactional_history_view() {
    let (tm, _) = manager();
    let item = ItemId::new();
    let locker = Locker::new();

    let ClusterEntry::History(mut history) = tm.get(&item, "AuditTrail", Some(&locker)).unwrap() else {
        panic!("expected history view");
    };
    let event = history
        .add_event(Event::new("alice", "Admin", "Create", "Done").with_states("New", "Open"))
        .unwrap();
    assert_eq!(event.id, 0);

    assert!(tm.get(&item, "AuditTrail/0", Some(&locker)).is_ok());
    assert!(tm.get(&item, "AuditTrail/0", None).unwrap_err().is_not_found());
    assert_eq!(
        tm.get_cluster_contents(&item, "AuditTrail", Some(&locker)).unwrap(),
        vec!["0"]
    );

    tm.commit(&locker).unwrap();
    let ClusterEntry::History(mut committed) = tm.get(&item, "AuditTrail", None).unwrap() else {
        panic!("expected history view");
    };
    assert_eq!(committed.event(0).unwrap().map(|e| e.target_state), Some("Open".to_string()));
}

// ---------------------------------------------------------------------------
// Test 9: Recursive removal under a locker commits as one unit
// ---------------------------------------------------------------------------
#[test]
fn test_remove_cluster_buffered() {
    let (tm, mem) = manager();
    let item = ItemId::new();
    for (ver, event) in [(0, 1), (0, 2), (1, 3)] {
        tm.put(&item, Outcome::new("Report", ver, event, "d").into(), None).unwrap();
    }
    tm.put(&item, prop("x"), None).unwrap();

    let locker = Locker::new();
    tm.remove_cluster(&item, "Outcome/Report", Some(&locker)).unwrap();
    assert_eq!(tm.pending_len(&locker), 3);
    assert_eq!(mem.object_count(&item), 4);

    tm.commit(&locker).unwrap();
    assert_eq!(mem.object_count(&item), 1);

    tm.remove_cluster(&item, "", None).unwrap();
    assert_eq!(mem.object_count(&item), 0);
}

proptest! {
    /// Whatever sequence of values one locker writes to a path, the last one is committed
    #[test]
    fn prop_last_write_wins(values in proptest::collection::vec("[a-z]{1,6}", 1..12)) {
        let (tm, mem) = manager();
        let item = ItemId::new();
        let locker = Locker::new();
        for value in &values {
            tm.put(&item, prop(value), Some(&locker)).unwrap();
        }
        prop_assert_eq!(tm.pending_len(&locker), 1);
        tm.commit(&locker).unwrap();
        prop_assert_eq!(mem.object_count(&item), 1);
        let last = values.last().cloned().unwrap_or_default();
        prop_assert_eq!(value_of(tm.get(&item, "Property/Name", None).unwrap()), last);
    }
}
