//! Per-kind runtime state and engine status types.

use crate::queues::{EchoSet, IncomingQueue, OutgoingQueue};
use chrono::{DateTime, Utc};
use driftsync_model::{RecordCodec, RecordKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

/// Everything the engine tracks for one registered record kind.
///
/// Queues and echo sets are individually locked: their producers (listeners,
/// the reconciler) run concurrently with the drain consumer.
pub(crate) struct KindState {
    /// The kind discriminator.
    pub kind: RecordKind,
    /// Backend collection name.
    pub collection: String,
    /// Wire row codec.
    pub codec: Arc<dyn RecordCodec>,
    /// Pending local mutations, coalesced per id.
    pub outgoing: Mutex<OutgoingQueue>,
    /// Backend deliveries awaiting local application.
    pub incoming: Mutex<IncomingQueue>,
    /// Digests of records pushed by this engine instance.
    pub sent: Mutex<EchoSet>,
    /// Digests of records applied from the backend.
    pub received: Mutex<EchoSet>,
    /// Records pushed to the backend.
    pub pushed: AtomicU64,
    /// Records applied from the backend.
    pub pulled: AtomicU64,
    /// Greatest `updated_at` acknowledged by a push.
    pub last_pushed: Mutex<Option<DateTime<Utc>>>,
    /// When the last pull for this kind completed.
    pub last_pulled: Mutex<Option<DateTime<Utc>>>,
    /// Whether persisted watermarks were already loaded.
    pub watermarks_loaded: AtomicBool,
}

impl KindState {
    /// Creates fresh runtime state for a registration.
    pub fn new(
        kind: RecordKind,
        collection: String,
        codec: Arc<dyn RecordCodec>,
        echo_retention: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            collection,
            codec,
            outgoing: Mutex::new(OutgoingQueue::default()),
            incoming: Mutex::new(IncomingQueue::default()),
            sent: Mutex::new(EchoSet::new(echo_retention)),
            received: Mutex::new(EchoSet::new(echo_retention)),
            pushed: AtomicU64::new(0),
            pulled: AtomicU64::new(0),
            last_pushed: Mutex::new(None),
            last_pulled: Mutex::new(None),
            watermarks_loaded: AtomicBool::new(false),
        })
    }
}

/// The engine-level state machine.
///
/// `Disabled ⇄ Enabled` is re-enterable; `Disposed` is terminal.
/// Orthogonally, the backend subscription cycles subscribed/unsubscribed
/// under the presence gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not syncing. Queues accept nothing; the drain loop idles.
    Disabled,
    /// Syncing: listeners attached, drain loop active.
    Enabled,
    /// Terminal. Subscriptions cancelled, drain loop stopped.
    Disposed,
}

impl EngineState {
    /// Returns true if the engine can still be enabled.
    pub fn can_enable(&self) -> bool {
        !matches!(self, EngineState::Disposed)
    }
}

/// Counters for one record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindCounters {
    /// The record kind.
    pub kind: RecordKind,
    /// Records pushed to the backend.
    pub pushed: u64,
    /// Records applied from the backend.
    pub pulled: u64,
}

/// Snapshot of engine observability state.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Per-kind push/pull counters, in registration order.
    pub kinds: Vec<KindCounters>,
    /// Full reconciliation passes performed.
    pub full_syncs: u64,
    /// Most recent drain or reconcile failure, if any.
    pub last_error: Option<String>,
}
