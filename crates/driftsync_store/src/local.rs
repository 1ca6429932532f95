//! The per-device persistent store contract.

use crate::error::{StoreError, StoreResult};
use crate::subscription::{CallbackSubscription, SubscriptionHandle};
use async_trait::async_trait;
use driftsync_model::{OwnerId, RecordId, RecordKind, SyncRecord};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Listener invoked with records changed in the local store.
pub type LocalListener = Arc<dyn Fn(Vec<SyncRecord>) + Send + Sync>;

/// Owner scoping for local reads.
#[derive(Debug, Clone, Copy)]
pub enum OwnerFilter<'a> {
    /// Records owned by the given user.
    Owned(&'a OwnerId),
    /// Records not yet claimed by any user.
    Unowned,
    /// All records regardless of owner.
    Any,
}

impl OwnerFilter<'_> {
    /// Returns true if the record passes this filter.
    pub fn matches(&self, record: &SyncRecord) -> bool {
        match self {
            OwnerFilter::Owned(owner) => record.owner_id.as_ref() == Some(*owner),
            OwnerFilter::Unowned => record.owner_id.is_none(),
            OwnerFilter::Any => true,
        }
    }
}

/// Outcome of a local insert.
///
/// A conflicting insert is expected control flow, not an error: the engine
/// resolves it with a timestamp comparison and an explicit [`replace`].
///
/// [`replace`]: LocalStore::replace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// No row with this id existed; the record was written.
    Inserted,
    /// A row with this id already exists; nothing was written.
    Conflict,
}

/// The per-device persistent store.
///
/// Implemented by the host's storage adapter (SQLite, an ORM layer, ...)
/// and injected into the engine. Write methods are suspension points; the
/// engine re-checks its own state after each call.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Reads all records of a kind passing the owner filter.
    async fn select_all(
        &self,
        kind: &RecordKind,
        filter: OwnerFilter<'_>,
    ) -> StoreResult<Vec<SyncRecord>>;

    /// Reads one record by id.
    async fn get(&self, kind: &RecordKind, id: &RecordId) -> StoreResult<Option<SyncRecord>>;

    /// Inserts a record, reporting a conflict if the id already exists.
    async fn insert(&self, kind: &RecordKind, record: &SyncRecord) -> StoreResult<InsertOutcome>;

    /// Writes a record unconditionally. Used after a conflict once the
    /// incoming record won the timestamp comparison.
    async fn replace(&self, kind: &RecordKind, record: &SyncRecord) -> StoreResult<()>;

    /// Assigns `owner` to every record of this kind with no owner, as one
    /// all-or-nothing transaction. Returns the number of rows updated.
    async fn assign_missing_owner(
        &self,
        kind: &RecordKind,
        owner: &OwnerId,
    ) -> StoreResult<u64>;

    /// Subscribes to changes of records of `kind` owned by `owner`.
    fn subscribe(
        &self,
        kind: &RecordKind,
        owner: OwnerId,
        listener: LocalListener,
    ) -> SubscriptionHandle;
}

struct LocalSubscriber {
    kind: RecordKind,
    owner: OwnerId,
    listener: LocalListener,
}

#[derive(Default)]
struct LocalInner {
    tables: HashMap<RecordKind, BTreeMap<RecordId, SyncRecord>>,
    subscribers: HashMap<u64, LocalSubscriber>,
    next_subscriber: u64,
    fail_writes: bool,
    fail_assign: bool,
}

/// In-memory [`LocalStore`] for tests and demos.
///
/// Notifies subscribers synchronously on every committed write and supports
/// scriptable failure injection for write and owner-assignment paths.
/// Cloning shares the underlying storage.
#[derive(Clone, Default)]
pub struct MemoryLocalStore {
    inner: Arc<Mutex<LocalInner>>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent insert/replace calls fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Makes subsequent owner-assignment calls fail without mutating.
    pub fn set_fail_assign(&self, fail: bool) {
        self.inner.lock().fail_assign = fail;
    }

    /// Writes a record without notifying subscribers. Test setup helper.
    pub fn seed(&self, kind: &RecordKind, record: SyncRecord) {
        self.inner
            .lock()
            .tables
            .entry(kind.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Returns a snapshot of all records of a kind.
    pub fn records(&self, kind: &RecordKind) -> Vec<SyncRecord> {
        self.inner
            .lock()
            .tables
            .get(kind)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    fn notify(&self, kind: &RecordKind, changed: Vec<SyncRecord>) {
        if changed.is_empty() {
            return;
        }
        // Snapshot listeners, then invoke outside the lock: a listener may
        // re-enter the store.
        let listeners: Vec<(LocalListener, Vec<SyncRecord>)> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .values()
                .filter(|sub| sub.kind == *kind)
                .filter_map(|sub| {
                    let matching: Vec<SyncRecord> = changed
                        .iter()
                        .filter(|record| record.owner_id.as_ref() == Some(&sub.owner))
                        .cloned()
                        .collect();
                    if matching.is_empty() {
                        None
                    } else {
                        Some((Arc::clone(&sub.listener), matching))
                    }
                })
                .collect()
        };
        for (listener, records) in listeners {
            listener(records);
        }
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn select_all(
        &self,
        kind: &RecordKind,
        filter: OwnerFilter<'_>,
    ) -> StoreResult<Vec<SyncRecord>> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(kind)
            .map(|table| {
                table
                    .values()
                    .filter(|record| filter.matches(record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, kind: &RecordKind, id: &RecordId) -> StoreResult<Option<SyncRecord>> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(kind)
            .and_then(|table| table.get(id).cloned()))
    }

    async fn insert(&self, kind: &RecordKind, record: &SyncRecord) -> StoreResult<InsertOutcome> {
        {
            let mut inner = self.inner.lock();
            if inner.fail_writes {
                return Err(StoreError::local("write failure injected"));
            }
            let table = inner.tables.entry(kind.clone()).or_default();
            if table.contains_key(&record.id) {
                return Ok(InsertOutcome::Conflict);
            }
            table.insert(record.id.clone(), record.clone());
        }
        self.notify(kind, vec![record.clone()]);
        Ok(InsertOutcome::Inserted)
    }

    async fn replace(&self, kind: &RecordKind, record: &SyncRecord) -> StoreResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.fail_writes {
                return Err(StoreError::local("write failure injected"));
            }
            inner
                .tables
                .entry(kind.clone())
                .or_default()
                .insert(record.id.clone(), record.clone());
        }
        self.notify(kind, vec![record.clone()]);
        Ok(())
    }

    async fn assign_missing_owner(
        &self,
        kind: &RecordKind,
        owner: &OwnerId,
    ) -> StoreResult<u64> {
        let assigned = {
            let mut inner = self.inner.lock();
            if inner.fail_assign {
                return Err(StoreError::local("assignment failure injected"));
            }
            let table = inner.tables.entry(kind.clone()).or_default();
            let mut assigned = Vec::new();
            for record in table.values_mut() {
                if record.owner_id.is_none() {
                    record.owner_id = Some(owner.clone());
                    assigned.push(record.clone());
                }
            }
            assigned
        };
        let count = assigned.len() as u64;
        self.notify(kind, assigned);
        Ok(count)
    }

    fn subscribe(
        &self,
        kind: &RecordKind,
        owner: OwnerId,
        listener: LocalListener,
    ) -> SubscriptionHandle {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(
                id,
                LocalSubscriber {
                    kind: kind.clone(),
                    owner,
                    listener,
                },
            );
            id
        };
        let inner = Arc::clone(&self.inner);
        Box::new(CallbackSubscription::new(move || {
            inner.lock().subscribers.remove(&id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn kind() -> RecordKind {
        RecordKind::new("notes")
    }

    fn record(id: &str, secs: i64) -> SyncRecord {
        SyncRecord::new(id, Utc.timestamp_opt(secs, 0).unwrap()).with_owner("u1")
    }

    #[tokio::test]
    async fn insert_reports_conflict() {
        let store = MemoryLocalStore::new();
        let outcome = store.insert(&kind(), &record("a", 1)).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        let outcome = store.insert(&kind(), &record("a", 2)).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Conflict);

        // The conflicting insert must not have overwritten the row.
        let stored = store.get(&kind(), &RecordId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, Utc.timestamp_opt(1, 0).unwrap());
    }

    #[tokio::test]
    async fn select_all_respects_owner_filter() {
        let store = MemoryLocalStore::new();
        store.seed(&kind(), record("a", 1));
        store.seed(&kind(), SyncRecord::new("b", Utc.timestamp_opt(2, 0).unwrap()));

        let owner = OwnerId::new("u1");
        let owned = store.select_all(&kind(), OwnerFilter::Owned(&owner)).await.unwrap();
        assert_eq!(owned.len(), 1);

        let unowned = store.select_all(&kind(), OwnerFilter::Unowned).await.unwrap();
        assert_eq!(unowned.len(), 1);
        assert_eq!(unowned[0].id, RecordId::new("b"));

        let all = store.select_all(&kind(), OwnerFilter::Any).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_owned_writes_until_cancelled() {
        let store = MemoryLocalStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = store.subscribe(
            &kind(),
            OwnerId::new("u1"),
            Arc::new(move |records| {
                counter.fetch_add(records.len(), Ordering::SeqCst);
            }),
        );

        store.insert(&kind(), &record("a", 1)).await.unwrap();
        // A write for another owner is not delivered.
        store
            .insert(&kind(), &record("b", 1).with_owner("u2"))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        sub.cancel();
        store.insert(&kind(), &record("c", 1)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn assign_missing_owner_is_all_or_nothing() {
        let store = MemoryLocalStore::new();
        for id in ["a", "b", "c"] {
            store.seed(&kind(), SyncRecord::new(id, Utc.timestamp_opt(1, 0).unwrap()));
        }

        store.set_fail_assign(true);
        let owner = OwnerId::new("u1");
        assert!(store.assign_missing_owner(&kind(), &owner).await.is_err());
        let unowned = store.select_all(&kind(), OwnerFilter::Unowned).await.unwrap();
        assert_eq!(unowned.len(), 3, "failed assignment must not mutate");

        store.set_fail_assign(false);
        let assigned = store.assign_missing_owner(&kind(), &owner).await.unwrap();
        assert_eq!(assigned, 3);
        let owned = store.select_all(&kind(), OwnerFilter::Owned(&owner)).await.unwrap();
        assert_eq!(owned.len(), 3);
    }

    #[tokio::test]
    async fn injected_write_failure() {
        let store = MemoryLocalStore::new();
        store.set_fail_writes(true);
        assert!(store.insert(&kind(), &record("a", 1)).await.is_err());
        assert!(store.replace(&kind(), &record("a", 1)).await.is_err());

        store.set_fail_writes(false);
        assert!(store.insert(&kind(), &record("a", 1)).await.is_ok());
    }
}
