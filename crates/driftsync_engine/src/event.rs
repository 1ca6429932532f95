//! Sync activity notifications.

use driftsync_model::RecordKind;

/// Where a pulled record entered the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    /// Delivered over the realtime backend channel.
    Realtime,
    /// Discovered by a full reconciliation pass.
    FullSync,
}

/// A notification about sync progress, delivered over a broadcast channel.
///
/// Push passes emit the `Push*` pair around each upserted batch. Full-sync
/// reconcile passes emit the `Pull*` pair with [`SyncSource::FullSync`] and
/// the discovered/enqueued counts; incoming drains emit the pair with
/// [`SyncSource::Realtime`] for realtime-delivered records, so each pass
/// reports its items exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncActivity {
    /// A push batch is about to be upserted.
    PushStarted {
        /// Record kind being pushed.
        kind: RecordKind,
        /// Records in the batch.
        items: usize,
    },
    /// A push batch was upserted.
    PushCompleted {
        /// Record kind pushed.
        kind: RecordKind,
        /// Records upserted.
        items: usize,
    },
    /// A pull pass began.
    PullStarted {
        /// Record kind being pulled.
        kind: RecordKind,
        /// Where the records came from.
        source: SyncSource,
        /// Records pending.
        items: usize,
    },
    /// A pull pass finished.
    PullCompleted {
        /// Record kind pulled.
        kind: RecordKind,
        /// Where the records came from.
        source: SyncSource,
        /// Records applied or enqueued.
        items: usize,
    },
}

impl SyncActivity {
    /// The record kind this notification is about.
    pub fn kind(&self) -> &RecordKind {
        match self {
            SyncActivity::PushStarted { kind, .. }
            | SyncActivity::PushCompleted { kind, .. }
            | SyncActivity::PullStarted { kind, .. }
            | SyncActivity::PullCompleted { kind, .. } => kind,
        }
    }

    /// The item count carried by this notification.
    pub fn items(&self) -> usize {
        match self {
            SyncActivity::PushStarted { items, .. }
            | SyncActivity::PushCompleted { items, .. }
            | SyncActivity::PullStarted { items, .. }
            | SyncActivity::PullCompleted { items, .. } => *items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let activity = SyncActivity::PullCompleted {
            kind: RecordKind::new("notes"),
            source: SyncSource::Realtime,
            items: 3,
        };
        assert_eq!(activity.kind().as_str(), "notes");
        assert_eq!(activity.items(), 3);
    }
}
