//! Persisted sync watermarks.

use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Optional persisted last-pushed / last-pulled watermarks.
///
/// Keys have the shape `{kind}_{direction}` with direction `lastPushed` or
/// `lastPulled`. The engine owns these values: it loads them once at enable
/// time and writes them through on advance; nothing else reads them.
#[async_trait]
pub trait TimestampStore: Send + Sync {
    /// Reads a persisted watermark.
    async fn get(&self, key: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Persists a watermark.
    async fn set(&self, key: &str, at: DateTime<Utc>) -> StoreResult<()>;
}

/// In-memory [`TimestampStore`] for tests and demos. Cloning shares state.
#[derive(Clone, Default)]
pub struct MemoryTimestampStore {
    inner: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryTimestampStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all stored watermarks.
    pub fn entries(&self) -> HashMap<String, DateTime<Utc>> {
        self.inner.lock().clone()
    }
}

#[async_trait]
impl TimestampStore for MemoryTimestampStore {
    async fn get(&self, key: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().get(key).copied())
    }

    async fn set(&self, key: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.lock().insert(key.to_string(), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn get_and_set() {
        let store = MemoryTimestampStore::new();
        assert_eq!(store.get("notes_lastPushed").await.unwrap(), None);

        let at = Utc.timestamp_opt(100, 0).unwrap();
        store.set("notes_lastPushed", at).await.unwrap();
        assert_eq!(store.get("notes_lastPushed").await.unwrap(), Some(at));
        assert_eq!(store.get("notes_lastPulled").await.unwrap(), None);
    }
}
