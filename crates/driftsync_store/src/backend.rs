//! The shared backend store contract.

use crate::error::{StoreError, StoreResult};
use crate::subscription::{CallbackSubscription, SubscriptionHandle};
use async_trait::async_trait;
use driftsync_model::{EnvelopeCodec, IndexEntry, OwnerId, RecordCodec, RecordId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Listener invoked with `(collection, row)` for every backend change.
pub type ChangeListener = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Maximum ids accepted by one [`BackendStore::select_by_ids`] call.
pub const MAX_IDS_PER_QUERY: usize = 100;

/// The shared backend store.
///
/// Rows are raw wire values; the engine converts them through each kind's
/// [`RecordCodec`]. Upserts are keyed by `(id, owner)`. The backend may run
/// its own last-write-wins trigger and silently discard stale upserts; the
/// engine behaves correctly with or without it.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Fetches the lightweight `(id, updated_at)` index of every record in
    /// `collection` owned by `owner`.
    async fn select_index(&self, collection: &str, owner: &OwnerId)
        -> StoreResult<Vec<IndexEntry>>;

    /// Fetches full rows for the given ids. Callers page their requests;
    /// at most [`MAX_IDS_PER_QUERY`] ids are accepted per call.
    async fn select_by_ids(
        &self,
        collection: &str,
        owner: &OwnerId,
        ids: &[RecordId],
    ) -> StoreResult<Vec<Value>>;

    /// Inserts or updates rows, keyed by `(id, owner)`.
    async fn upsert(&self, collection: &str, rows: Vec<Value>) -> StoreResult<()>;

    /// Subscribes one multiplexed channel to changes in all of the given
    /// collections, filtered to rows owned by `owner`.
    fn subscribe_changes(
        &self,
        collections: Vec<String>,
        owner: OwnerId,
        listener: ChangeListener,
    ) -> SubscriptionHandle;
}

struct BackendSubscriber {
    collections: HashSet<String>,
    owner: OwnerId,
    listener: ChangeListener,
}

#[derive(Default)]
struct BackendInner {
    collections: HashMap<String, BTreeMap<(Option<OwnerId>, RecordId), Value>>,
    subscribers: HashMap<u64, BackendSubscriber>,
    next_subscriber: u64,
    index_calls: u64,
    page_calls: u64,
    upsert_calls: u64,
    rejected_upserts: u64,
    fail_upserts: bool,
    fail_index: bool,
}

/// In-memory [`BackendStore`] for tests and demos.
///
/// Emulates the backend's server-side last-write-wins trigger (stale
/// upserts are silently discarded) and echoes every accepted row to all
/// subscribed channels, including the writer's own — exactly the reflection
/// the engine's echo suppression exists for. Counts index, page, and upsert
/// calls so tests can assert on fetch behavior. Cloning shares storage.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<BackendInner>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent upserts fail with a retryable error.
    pub fn set_fail_upserts(&self, fail: bool) {
        self.inner.lock().fail_upserts = fail;
    }

    /// Makes subsequent index fetches fail with a retryable error.
    pub fn set_fail_index(&self, fail: bool) {
        self.inner.lock().fail_index = fail;
    }

    /// Returns a snapshot of all rows in a collection.
    pub fn rows(&self, collection: &str) -> Vec<Value> {
        self.inner
            .lock()
            .collections
            .get(collection)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of index fetches served.
    pub fn index_call_count(&self) -> u64 {
        self.inner.lock().index_calls
    }

    /// Number of page fetches served.
    pub fn page_call_count(&self) -> u64 {
        self.inner.lock().page_calls
    }

    /// Number of upsert calls served.
    pub fn upsert_call_count(&self) -> u64 {
        self.inner.lock().upsert_calls
    }

    /// Number of rows discarded by the last-write-wins trigger.
    pub fn rejected_upsert_count(&self) -> u64 {
        self.inner.lock().rejected_upserts
    }
}

#[async_trait]
impl BackendStore for MemoryBackend {
    async fn select_index(
        &self,
        collection: &str,
        owner: &OwnerId,
    ) -> StoreResult<Vec<IndexEntry>> {
        let mut inner = self.inner.lock();
        inner.index_calls += 1;
        if inner.fail_index {
            return Err(StoreError::backend_retryable("index fetch failure injected"));
        }
        let mut index = Vec::new();
        if let Some(rows) = inner.collections.get(collection) {
            for ((row_owner, id), row) in rows {
                if row_owner.as_ref() == Some(owner) {
                    let record = EnvelopeCodec.decode(row)?;
                    index.push(IndexEntry::new(id.clone(), record.updated_at));
                }
            }
        }
        Ok(index)
    }

    async fn select_by_ids(
        &self,
        collection: &str,
        owner: &OwnerId,
        ids: &[RecordId],
    ) -> StoreResult<Vec<Value>> {
        let mut inner = self.inner.lock();
        inner.page_calls += 1;
        if ids.len() > MAX_IDS_PER_QUERY {
            return Err(StoreError::backend_fatal(format!(
                "requested {} ids, limit is {MAX_IDS_PER_QUERY}",
                ids.len()
            )));
        }
        let wanted: HashSet<&RecordId> = ids.iter().collect();
        Ok(inner
            .collections
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .filter(|((row_owner, id), _)| {
                        row_owner.as_ref() == Some(owner) && wanted.contains(id)
                    })
                    .map(|(_, row)| row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert(&self, collection: &str, rows: Vec<Value>) -> StoreResult<()> {
        let accepted = {
            let mut inner = self.inner.lock();
            inner.upsert_calls += 1;
            if inner.fail_upserts {
                return Err(StoreError::backend_retryable("upsert failure injected"));
            }
            let mut accepted = Vec::new();
            for row in rows {
                let record = EnvelopeCodec.decode(&row)?;
                let key = (record.owner_id.clone(), record.id.clone());
                let stale = inner
                    .collections
                    .get(collection)
                    .and_then(|table| table.get(&key))
                    .map(|existing| EnvelopeCodec.decode(existing))
                    .transpose()?
                    .is_some_and(|existing| !record.is_newer_than(&existing));
                if stale {
                    // The server-side trigger: stale writes vanish.
                    inner.rejected_upserts += 1;
                    continue;
                }
                inner
                    .collections
                    .entry(collection.to_string())
                    .or_default()
                    .insert(key, row.clone());
                accepted.push((record.owner_id, row));
            }
            accepted
        };

        // Echo accepted rows to every matching channel, the writer's own
        // included.
        for (row_owner, row) in accepted {
            let listeners: Vec<ChangeListener> = {
                let inner = self.inner.lock();
                inner
                    .subscribers
                    .values()
                    .filter(|sub| {
                        sub.collections.contains(collection)
                            && row_owner.as_ref() == Some(&sub.owner)
                    })
                    .map(|sub| Arc::clone(&sub.listener))
                    .collect()
            };
            for listener in listeners {
                listener(collection, row.clone());
            }
        }
        Ok(())
    }

    fn subscribe_changes(
        &self,
        collections: Vec<String>,
        owner: OwnerId,
        listener: ChangeListener,
    ) -> SubscriptionHandle {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(
                id,
                BackendSubscriber {
                    collections: collections.into_iter().collect(),
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
    use driftsync_model::SyncRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn row(id: &str, owner: &str, secs: i64) -> Value {
        EnvelopeCodec.encode(
            &SyncRecord::new(id, Utc.timestamp_opt(secs, 0).unwrap()).with_owner(owner),
        )
    }

    #[tokio::test]
    async fn upsert_applies_last_write_wins_trigger() {
        let backend = MemoryBackend::new();
        backend.upsert("notes", vec![row("a", "u1", 10)]).await.unwrap();
        // Stale and equal-timestamp writes are silently discarded.
        backend.upsert("notes", vec![row("a", "u1", 9)]).await.unwrap();
        backend.upsert("notes", vec![row("a", "u1", 10)]).await.unwrap();
        backend.upsert("notes", vec![row("a", "u1", 11)]).await.unwrap();

        assert_eq!(backend.rejected_upsert_count(), 2);
        let rows = backend.rows("notes");
        assert_eq!(rows.len(), 1);
        let stored = EnvelopeCodec.decode(&rows[0]).unwrap();
        assert_eq!(stored.updated_at, Utc.timestamp_opt(11, 0).unwrap());
    }

    #[tokio::test]
    async fn changes_echo_to_all_matching_channels() {
        let backend = MemoryBackend::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _sub = backend.subscribe_changes(
            vec!["notes".into()],
            OwnerId::new("u1"),
            Arc::new(move |collection, _row| {
                assert_eq!(collection, "notes");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        backend.upsert("notes", vec![row("a", "u1", 1)]).await.unwrap();
        // Another owner's rows and other collections stay silent.
        backend.upsert("notes", vec![row("b", "u2", 1)]).await.unwrap();
        backend.upsert("tags", vec![row("c", "u1", 1)]).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_channel_is_silent() {
        let backend = MemoryBackend::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = backend.subscribe_changes(
            vec!["notes".into()],
            OwnerId::new("u1"),
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        sub.cancel();
        backend.upsert("notes", vec![row("a", "u1", 1)]).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn select_by_ids_enforces_page_limit() {
        let backend = MemoryBackend::new();
        let owner = OwnerId::new("u1");
        let ids: Vec<RecordId> = (0..=MAX_IDS_PER_QUERY)
            .map(|n| RecordId::new(format!("r{n}")))
            .collect();
        assert!(backend.select_by_ids("notes", &owner, &ids).await.is_err());
        assert!(backend
            .select_by_ids("notes", &owner, &ids[..MAX_IDS_PER_QUERY])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn index_lists_only_the_owner() {
        let backend = MemoryBackend::new();
        backend.upsert("notes", vec![row("a", "u1", 5)]).await.unwrap();
        backend.upsert("notes", vec![row("b", "u2", 6)]).await.unwrap();

        let index = backend.select_index("notes", &OwnerId::new("u1")).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].id, RecordId::new("a"));
        assert_eq!(backend.index_call_count(), 1);
    }
}
