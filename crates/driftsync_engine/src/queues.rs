//! Queue and echo-set mechanics.
//!
//! Each registered kind owns one outgoing queue, one incoming queue, and a
//! pair of echo sets. Producers (listeners, the reconciler) and the drain
//! consumer run concurrently; callers guard each structure with a lock and
//! drain via atomic swap-and-clear so concurrently enqueued entries are
//! never lost.

use crate::event::SyncSource;
use driftsync_model::{RecordDigest, RecordId, SyncRecord};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Pending local mutations, coalesced per record id.
#[derive(Default)]
pub(crate) struct OutgoingQueue {
    entries: HashMap<RecordId, SyncRecord>,
}

impl OutgoingQueue {
    /// Admits a record unless an entry with the same id is at least as new.
    /// Returns true if the record was queued.
    pub fn admit(&mut self, record: SyncRecord) -> bool {
        match self.entries.get(&record.id) {
            Some(queued) if !record.is_newer_than(queued) => false,
            _ => {
                self.entries.insert(record.id.clone(), record);
                true
            }
        }
    }

    /// Removes and returns the whole queue contents.
    pub fn swap(&mut self) -> Vec<SyncRecord> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Re-merges a batch after a failed push. Entries queued concurrently
    /// win if they are newer; the batch is never silently discarded.
    pub fn restore(&mut self, batch: Vec<SyncRecord>) {
        for record in batch {
            self.admit(record);
        }
    }
}

/// Records pulled or pushed from the backend awaiting local application.
///
/// Keyed by content digest, so identical deliveries collapse to one entry.
#[derive(Default)]
pub(crate) struct IncomingQueue {
    entries: HashMap<RecordDigest, (SyncRecord, SyncSource)>,
}

impl IncomingQueue {
    /// Queues a delivery. Returns false if an identical record is already
    /// queued.
    pub fn insert(&mut self, record: SyncRecord, source: SyncSource) -> bool {
        let digest = record.digest();
        if self.entries.contains_key(&digest) {
            return false;
        }
        self.entries.insert(digest, (record, source));
        true
    }

    /// Removes one queued delivery, in no particular order.
    pub fn pop(&mut self) -> Option<(SyncRecord, SyncSource)> {
        let digest = *self.entries.keys().next()?;
        self.entries.remove(&digest)
    }

    /// Number of queued deliveries from the given source.
    pub fn pending(&self, source: SyncSource) -> usize {
        self.entries
            .values()
            .filter(|(_, entry_source)| *entry_source == source)
            .count()
    }
}

/// Digests of records this engine already sent to or received from the
/// backend, used to break reflection loops.
///
/// Entries older than the retention window are evicted lazily; `None`
/// retains everything for the lifetime of the engine (the reference
/// behavior, unbounded).
pub(crate) struct EchoSet {
    entries: HashMap<RecordDigest, Instant>,
    retention: Option<Duration>,
}

impl EchoSet {
    /// Creates a set with the given retention.
    pub fn new(retention: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
        }
    }

    /// Inserts a digest, evicting expired entries first.
    pub fn insert(&mut self, digest: RecordDigest) {
        if let Some(retention) = self.retention {
            self.entries.retain(|_, at| at.elapsed() < retention);
        }
        self.entries.insert(digest, Instant::now());
    }

    /// Returns true if the digest is present and not expired.
    pub fn contains(&self, digest: &RecordDigest) -> bool {
        match self.entries.get(digest) {
            None => false,
            Some(at) => match self.retention {
                None => true,
                Some(retention) => at.elapsed() < retention,
            },
        }
    }

    /// Removes a digest.
    pub fn remove(&mut self, digest: &RecordDigest) {
        self.entries.remove(digest);
    }

    #[cfg(test)]
    fn retained(&self) -> usize {
        self.entries.len()
    }
}
