//! The synchronization engine.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::{SyncActivity, SyncSource};
use crate::presence::PresenceGate;
use crate::registry::{Registry, SyncHandle};
use crate::state::{EngineState, KindCounters, KindState, SyncStats};
use chrono::{DateTime, Utc};
use driftsync_model::{OwnerId, RecordCodec, RecordId, RecordKind, SyncRecord};
use driftsync_store::{
    BackendStore, ChangeListener, InsertOutcome, LocalListener, LocalStore, OwnerFilter,
    SubscriptionHandle, TimestampStore,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Outcome of applying one incoming record to the local store.
///
/// The last-write-wins decision is ordinary control flow: a conflicting
/// insert resolves to `Replaced` or `Rejected` by timestamp comparison,
/// never through an error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No local row existed; the record was inserted.
    Inserted,
    /// A local row existed and the incoming record was strictly newer; the
    /// row was overwritten.
    Replaced,
    /// A local row existed and was at least as new; the incoming record
    /// was discarded.
    Rejected,
}

#[derive(Clone, Copy)]
enum Watermark {
    Pushed,
    Pulled,
}

impl Watermark {
    fn key(self, kind: &RecordKind) -> String {
        match self {
            Watermark::Pushed => format!("{kind}_lastPushed"),
            Watermark::Pulled => format!("{kind}_lastPulled"),
        }
    }
}

/// Raises an atomic flag for the duration of a scope.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The offline-first synchronization engine.
///
/// Tracks pending local and remote changes per registered record kind,
/// reconciles local and backend state with a last-write-wins rule, keeps a
/// presence-gated realtime subscription, and drains queued work on a
/// recurring cycle that tolerates per-kind failures.
///
/// The engine is injected with its collaborators: the per-device
/// [`LocalStore`], the shared [`BackendStore`], and optionally a
/// [`TimestampStore`] for incremental sync across restarts. Cloning the
/// engine shares the underlying instance.
///
/// # Example
///
/// ```ignore
/// let engine = SyncEngine::new(EngineConfig::default(), local, backend);
/// let notes = engine.register("notes", "notes_v1", Arc::new(EnvelopeCodec))?;
/// engine.set_user_id(Some(OwnerId::new("u1"))).await?;
/// engine.enable_sync().await?;
/// ```
pub struct SyncEngine<L, B> {
    inner: Arc<EngineInner<L, B>>,
}

impl<L, B> Clone for SyncEngine<L, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<L, B> {
    config: EngineConfig,
    local: L,
    backend: B,
    timestamps: Option<Arc<dyn TimestampStore>>,
    presence: PresenceGate,
    registry: RwLock<Registry>,
    user: RwLock<Option<OwnerId>>,
    other_device_last_active: RwLock<Option<DateTime<Utc>>>,
    enabled: AtomicBool,
    disposed: AtomicBool,
    loop_started: AtomicBool,
    full_syncs: AtomicU64,
    pushing: AtomicBool,
    pulling: AtomicBool,
    last_error: Mutex<Option<String>>,
    local_subs: Mutex<Vec<SubscriptionHandle>>,
    backend_sub: Mutex<Option<SubscriptionHandle>>,
    events: broadcast::Sender<SyncActivity>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<L, B> SyncEngine<L, B>
where
    L: LocalStore + 'static,
    B: BackendStore + 'static,
{
    /// Creates an engine with no timestamp store; every reconciliation is
    /// a full one.
    pub fn new(config: EngineConfig, local: L, backend: B) -> Self {
        Self::build(config, local, backend, None)
    }

    /// Creates an engine that persists last-pushed/last-pulled watermarks
    /// through `timestamps`, enabling incremental sync across restarts.
    pub fn with_timestamp_store(
        config: EngineConfig,
        local: L,
        backend: B,
        timestamps: Arc<dyn TimestampStore>,
    ) -> Self {
        Self::build(config, local, backend, Some(timestamps))
    }

    fn build(
        config: EngineConfig,
        local: L,
        backend: B,
        timestamps: Option<Arc<dyn TimestampStore>>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let presence = PresenceGate::new(config.inactivity_window);
        Self {
            inner: Arc::new(EngineInner {
                config,
                local,
                backend,
                timestamps,
                presence,
                registry: RwLock::new(Registry::default()),
                user: RwLock::new(None),
                other_device_last_active: RwLock::new(None),
                enabled: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                loop_started: AtomicBool::new(false),
                full_syncs: AtomicU64::new(0),
                pushing: AtomicBool::new(false),
                pulling: AtomicBool::new(false),
                last_error: Mutex::new(None),
                local_subs: Mutex::new(Vec::new()),
                backend_sub: Mutex::new(None),
                events,
                shutdown_tx,
                shutdown_rx,
            }),
        }
    }

    /// Registers a record kind.
    ///
    /// Idempotent per kind: re-registering an already-known kind is a
    /// no-op returning an equivalent handle. Fails once the drain loop has
    /// started, or when `kind` is blank.
    pub fn register(
        &self,
        kind: impl Into<RecordKind>,
        collection: impl Into<String>,
        codec: Arc<dyn RecordCodec>,
    ) -> EngineResult<SyncHandle> {
        let kind = kind.into();
        if self.inner.is_disposed() {
            return Err(EngineError::Disposed);
        }
        if kind.is_blank() {
            return Err(EngineError::BlankKind);
        }
        if self.inner.loop_started.load(Ordering::SeqCst) {
            return Err(EngineError::RegisteredAfterStart { kind });
        }

        let mut registry = self.inner.registry.write();
        if registry.contains(&kind) {
            return Ok(SyncHandle::new(kind));
        }
        registry.insert(KindState::new(
            kind.clone(),
            collection.into(),
            codec,
            self.inner.config.echo_retention,
        ));
        debug!(kind = %kind, "registered record kind");
        Ok(SyncHandle::new(kind))
    }

    /// Enables syncing.
    ///
    /// Starts the drain loop on first call, attaches local and backend
    /// subscriptions, and runs an initial reconciliation. Requires at
    /// least one registered kind.
    pub async fn enable_sync(&self) -> EngineResult<()> {
        if self.inner.is_disposed() {
            return Err(EngineError::Disposed);
        }
        if self.inner.registry.read().is_empty() {
            return Err(EngineError::NothingRegistered);
        }

        self.inner.enabled.store(true, Ordering::SeqCst);
        self.inner.load_watermarks().await;

        if !self.inner.loop_started.swap(true, Ordering::SeqCst) {
            let inner = Arc::downgrade(&self.inner);
            let shutdown = self.inner.shutdown_rx.clone();
            let interval = self.inner.config.drain_interval;
            tokio::spawn(run_drain_loop(inner, shutdown, interval));
        }

        self.inner.rebuild_subscriptions();
        self.inner.sync_tables().await
    }

    /// Disables syncing.
    ///
    /// Detaches subscriptions and suppresses further enqueuing and network
    /// I/O. The drain loop keeps ticking idly so a later
    /// [`enable_sync`](Self::enable_sync) resumes instantly. In-flight
    /// operations are not cancelled.
    pub fn disable_sync(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.rebuild_subscriptions();
        debug!("sync disabled");
    }

    /// Sets or clears the active user, rebuilding subscriptions and — when
    /// enabled with a user present — triggering a reconciliation.
    pub async fn set_user_id(&self, user: Option<OwnerId>) -> EngineResult<()> {
        if self.inner.is_disposed() {
            return Err(EngineError::Disposed);
        }
        *self.inner.user.write() = user.clone();
        self.inner.rebuild_subscriptions();
        if self.inner.is_enabled() && user.is_some() {
            self.inner.sync_tables().await?;
        }
        Ok(())
    }

    /// Supplies the last time another of this user's devices was active.
    ///
    /// `None` clears the signal, returning the presence gate to its
    /// optimistic default. Rebuilds subscriptions (the realtime channel is
    /// presence-gated) and triggers a reconciliation.
    pub async fn set_last_time_other_device_was_active(
        &self,
        at: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        if self.inner.is_disposed() {
            return Err(EngineError::Disposed);
        }
        *self.inner.other_device_last_active.write() = at;
        self.inner.rebuild_subscriptions();
        if self.inner.is_enabled() && self.inner.active_user().is_some() {
            self.inner.sync_tables().await?;
        }
        Ok(())
    }

    /// Runs a reconciliation pass over every registered kind.
    ///
    /// Queues newer local records for push, diffs the backend index
    /// against local state, and pages needed records into the incoming
    /// queue — unless the presence gate proves nothing could have changed
    /// remotely. Per-kind failures are logged and do not stop other kinds.
    pub async fn sync_tables(&self) -> EngineResult<()> {
        self.inner.sync_tables().await
    }

    /// Drains the outgoing then incoming queue of every kind immediately,
    /// without waiting for the next tick.
    pub async fn flush(&self) {
        if self.inner.is_disposed() {
            return;
        }
        self.inner.drain_all().await;
    }

    /// Assigns the active user to every local record that has no owner,
    /// one all-or-nothing transaction per kind. Returns the number of
    /// records claimed.
    pub async fn fill_missing_owner(&self) -> EngineResult<u64> {
        if self.inner.is_disposed() {
            return Err(EngineError::Disposed);
        }
        let user = self.inner.active_user().ok_or(EngineError::NoActiveUser)?;
        let states = self.inner.registry.read().states();
        let mut claimed = 0u64;
        for state in states {
            claimed += self.inner.local.assign_missing_owner(&state.kind, &user).await?;
        }
        Ok(claimed)
    }

    /// Disposes the engine: cancels subscriptions and stops the drain
    /// loop. Idempotent and terminal.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.enabled.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);
        for sub in self.inner.local_subs.lock().drain(..) {
            sub.cancel();
        }
        if let Some(sub) = self.inner.backend_sub.lock().take() {
            sub.cancel();
        }
        debug!("engine disposed");
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        if self.inner.is_disposed() {
            EngineState::Disposed
        } else if self.inner.is_enabled() {
            EngineState::Enabled
        } else {
            EngineState::Disabled
        }
    }

    /// Records pushed for the handle's kind.
    pub fn pushed_count(&self, handle: &SyncHandle) -> u64 {
        self.inner
            .registry
            .read()
            .get(handle.kind())
            .map_or(0, |state| state.pushed.load(Ordering::SeqCst))
    }

    /// Records applied from the backend for the handle's kind.
    pub fn pulled_count(&self, handle: &SyncHandle) -> u64 {
        self.inner
            .registry
            .read()
            .get(handle.kind())
            .map_or(0, |state| state.pulled.load(Ordering::SeqCst))
    }

    /// Full reconciliation passes performed.
    pub fn full_sync_count(&self) -> u64 {
        self.inner.full_syncs.load(Ordering::SeqCst)
    }

    /// Returns true while the realtime backend channel is attached.
    pub fn is_subscribed_to_backend(&self) -> bool {
        self.inner.backend_sub.lock().is_some()
    }

    /// Returns true while a push batch is in flight.
    pub fn is_syncing_to_backend(&self) -> bool {
        self.inner.pushing.load(Ordering::SeqCst)
    }

    /// Returns true while incoming records are being applied.
    pub fn is_syncing_from_backend(&self) -> bool {
        self.inner.pulling.load(Ordering::SeqCst)
    }

    /// Returns the presence gate's current verdict.
    pub fn other_devices_active(&self) -> bool {
        self.inner.presence_allows()
    }

    /// Snapshot of counters and the most recent failure.
    pub fn stats(&self) -> SyncStats {
        let kinds = self
            .inner
            .registry
            .read()
            .states()
            .iter()
            .map(|state| KindCounters {
                kind: state.kind.clone(),
                pushed: state.pushed.load(Ordering::SeqCst),
                pulled: state.pulled.load(Ordering::SeqCst),
            })
            .collect();
        SyncStats {
            kinds,
            full_syncs: self.full_sync_count(),
            last_error: self.inner.last_error.lock().clone(),
        }
    }

    /// Subscribes to sync activity notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncActivity> {
        self.inner.events.subscribe()
    }
}

impl<L, B> EngineInner<L, B>
where
    L: LocalStore + 'static,
    B: BackendStore + 'static,
{
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn active_user(&self) -> Option<OwnerId> {
        self.user.read().clone()
    }

    fn presence_allows(&self) -> bool {
        self.presence
            .other_devices_active(*self.other_device_last_active.read(), Utc::now())
    }

    fn emit(&self, activity: SyncActivity) {
        let _ = self.events.send(activity);
    }

    fn note_failure(&self, stage: &str, kind: &RecordKind, error: &EngineError) {
        warn!(stage, kind = %kind, %error, "sync step failed; queued work retries next tick");
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Loads persisted watermarks once per kind. Failures degrade to a
    /// full reconciliation and are not fatal.
    async fn load_watermarks(&self) {
        let Some(store) = &self.timestamps else { return };
        let states = self.registry.read().states();
        for state in states {
            if state.watermarks_loaded.swap(true, Ordering::SeqCst) {
                continue;
            }
            match store.get(&Watermark::Pushed.key(&state.kind)).await {
                Ok(Some(at)) => *state.last_pushed.lock() = Some(at),
                Ok(None) => {}
                Err(error) => warn!(kind = %state.kind, %error, "failed to load push watermark"),
            }
            match store.get(&Watermark::Pulled.key(&state.kind)).await {
                Ok(Some(at)) => *state.last_pulled.lock() = Some(at),
                Ok(None) => {}
                Err(error) => warn!(kind = %state.kind, %error, "failed to load pull watermark"),
            }
        }
    }

    /// Persists a watermark. Failures are logged; the in-memory value is
    /// already advanced and stays authoritative for this session.
    async fn persist_watermark(&self, kind: &RecordKind, watermark: Watermark, at: DateTime<Utc>) {
        if let Some(store) = &self.timestamps {
            if let Err(error) = store.set(&watermark.key(kind), at).await {
                warn!(kind = %kind, %error, "failed to persist watermark");
            }
        }
    }

    /// Tears down and re-creates all subscriptions from current state.
    ///
    /// Called on every enablement, user, or presence change; the previous
    /// listeners are always cancelled, never patched.
    fn rebuild_subscriptions(self: &Arc<Self>) {
        for sub in self.local_subs.lock().drain(..) {
            sub.cancel();
        }
        if let Some(sub) = self.backend_sub.lock().take() {
            sub.cancel();
        }

        if self.is_disposed() || !self.is_enabled() {
            return;
        }
        let Some(user) = self.active_user() else {
            return;
        };

        let states = self.registry.read().states();
        let mut handles = Vec::with_capacity(states.len());
        for state in &states {
            let weak = Arc::downgrade(self);
            let kind_state = Arc::clone(state);
            let listener: LocalListener = Arc::new(move |records| {
                if let Some(inner) = weak.upgrade() {
                    // Re-check: the subscription may outlive an enablement
                    // change by one emission.
                    if inner.is_enabled() {
                        inner.consider_for_outgoing(&kind_state, records);
                    }
                }
            });
            handles.push(self.local.subscribe(&state.kind, user.clone(), listener));
        }
        *self.local_subs.lock() = handles;

        if self.presence_allows() {
            let collections = self.registry.read().collections();
            let weak = Arc::downgrade(self);
            let listener: ChangeListener = Arc::new(move |collection, row| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_backend_change(collection, row);
                }
            });
            *self.backend_sub.lock() =
                Some(self.backend.subscribe_changes(collections, user, listener));
            debug!("backend channel attached");
        } else {
            debug!("backend channel withheld, no other device active");
        }
    }

    /// Handles one realtime change message.
    fn on_backend_change(&self, collection: &str, row: serde_json::Value) {
        if !self.is_enabled() {
            return;
        }
        let Some(state) = self.registry.read().state_for_collection(collection) else {
            return;
        };
        match state.codec.decode(&row) {
            Ok(record) => {
                if state.incoming.lock().insert(record, SyncSource::Realtime) {
                    debug!(kind = %state.kind, "queued realtime change");
                }
            }
            Err(error) => {
                warn!(kind = %state.kind, %error, "dropping undecodable realtime row");
            }
        }
    }

    /// Admits candidate records to the outgoing queue.
    ///
    /// A candidate is dropped when it came from a prior incoming delivery,
    /// when its timestamp does not beat the queued entry for the same id,
    /// or when it does not beat the acknowledged push watermark.
    fn consider_for_outgoing(&self, state: &KindState, records: Vec<SyncRecord>) {
        if !self.is_enabled() {
            return;
        }
        let last_pushed = *state.last_pushed.lock();
        let mut admitted = 0usize;
        {
            let received = state.received.lock();
            let mut outgoing = state.outgoing.lock();
            for record in records {
                if received.contains(&record.digest()) {
                    continue;
                }
                if let Some(at) = last_pushed {
                    if record.updated_at <= at {
                        continue;
                    }
                }
                if outgoing.admit(record) {
                    admitted += 1;
                }
            }
        }
        if admitted > 0 {
            debug!(kind = %state.kind, admitted, "queued local changes");
        }
    }

    /// One full drain pass: outgoing for every kind, then incoming for
    /// every kind, isolating per-kind failures.
    async fn drain_all(&self) {
        let states = self.registry.read().states();
        for state in &states {
            if let Err(error) = self.drain_outgoing(state).await {
                self.note_failure("push", &state.kind, &error);
            }
        }
        for state in &states {
            if let Err(error) = self.drain_incoming(state).await {
                self.note_failure("pull", &state.kind, &error);
            }
        }
    }

    /// Pushes queued local mutations for one kind.
    async fn drain_outgoing(&self, state: &KindState) -> EngineResult<()> {
        loop {
            if !self.is_enabled() {
                return Ok(());
            }
            let batch = state.outgoing.lock().swap();
            if batch.is_empty() {
                return Ok(());
            }

            let Some(user) = self.active_user() else {
                // Queued under a user that signed out. The local store
                // still owns the data; the next reconcile for the right
                // user re-queues it.
                debug!(kind = %state.kind, dropped = batch.len(), "dropping batch, no active user");
                return Ok(());
            };
            let to_push: Vec<SyncRecord> = batch
                .into_iter()
                .filter(|record| record.owner_id.as_ref() == Some(&user))
                .collect();
            if to_push.is_empty() {
                continue;
            }

            let _guard = FlagGuard::raise(&self.pushing);
            self.emit(SyncActivity::PushStarted {
                kind: state.kind.clone(),
                items: to_push.len(),
            });

            let rows: Vec<serde_json::Value> =
                to_push.iter().map(|record| state.codec.encode(record)).collect();
            if let Err(error) = self.backend.upsert(&state.collection, rows).await {
                // The swap cleared these ids from the live queue; put the
                // batch back so nothing is silently lost.
                state.outgoing.lock().restore(to_push);
                return Err(error.into());
            }

            {
                let mut sent = state.sent.lock();
                for record in &to_push {
                    sent.insert(record.digest());
                }
            }
            state.pushed.fetch_add(to_push.len() as u64, Ordering::SeqCst);

            if let Some(batch_max) = to_push.iter().map(|record| record.updated_at).max() {
                let advanced = {
                    let mut last_pushed = state.last_pushed.lock();
                    if last_pushed.is_none_or(|at| batch_max > at) {
                        *last_pushed = Some(batch_max);
                        true
                    } else {
                        false
                    }
                };
                // Finish the in-flight push, but leave persisted
                // watermarks alone once the engine is disabled.
                if advanced && self.is_enabled() {
                    self.persist_watermark(&state.kind, Watermark::Pushed, batch_max).await;
                }
            }
            self.emit(SyncActivity::PushCompleted {
                kind: state.kind.clone(),
                items: to_push.len(),
            });
        }
    }

    /// Applies queued backend deliveries for one kind.
    async fn drain_incoming(&self, state: &KindState) -> EngineResult<()> {
        let pending_realtime = state.incoming.lock().pending(SyncSource::Realtime);
        if pending_realtime > 0 {
            self.emit(SyncActivity::PullStarted {
                kind: state.kind.clone(),
                source: SyncSource::Realtime,
                items: pending_realtime,
            });
        }
        let mut applied_realtime = 0usize;

        let result = loop {
            if !self.is_enabled() {
                break Ok(());
            }
            let Some((record, source)) = state.incoming.lock().pop() else {
                break Ok(());
            };
            let digest = record.digest();
            let echoed = {
                let sent = state.sent.lock();
                let received = state.received.lock();
                sent.contains(&digest) || received.contains(&digest)
            };
            if echoed {
                debug!(kind = %state.kind, id = %record.id, "suppressed echo");
                continue;
            }

            // Register the delivery before writing: the local store may
            // notify its subscribers synchronously, and that emission must
            // not re-admit this record to the outgoing queue.
            state.received.lock().insert(digest);

            let _guard = FlagGuard::raise(&self.pulling);
            match self.write_incoming(state, &record).await {
                Ok(WriteOutcome::Inserted | WriteOutcome::Replaced) => {
                    state.pulled.fetch_add(1, Ordering::SeqCst);
                    if source == SyncSource::Realtime {
                        applied_realtime += 1;
                    }
                }
                Ok(WriteOutcome::Rejected) => {
                    debug!(kind = %state.kind, id = %record.id, "discarded stale record");
                }
                Err(error) => {
                    // The write never happened: forget the pre-registered
                    // digest and re-queue the delivery for the next tick.
                    state.received.lock().remove(&digest);
                    state.incoming.lock().insert(record, source);
                    break Err(error);
                }
            }
        };

        if pending_realtime > 0 {
            self.emit(SyncActivity::PullCompleted {
                kind: state.kind.clone(),
                source: SyncSource::Realtime,
                items: applied_realtime,
            });
        }
        result
    }

    /// Writes one incoming record into the local store under the
    /// last-write-wins rule.
    async fn write_incoming(
        &self,
        state: &KindState,
        record: &SyncRecord,
    ) -> EngineResult<WriteOutcome> {
        match self.local.insert(&state.kind, record).await? {
            InsertOutcome::Inserted => Ok(WriteOutcome::Inserted),
            InsertOutcome::Conflict => {
                let existing = self.local.get(&state.kind, &record.id).await?;
                match existing {
                    Some(existing) if !record.is_newer_than(&existing) => {
                        Ok(WriteOutcome::Rejected)
                    }
                    _ => {
                        self.local.replace(&state.kind, record).await?;
                        Ok(WriteOutcome::Replaced)
                    }
                }
            }
        }
    }

    /// Reconciles every kind for the active user.
    async fn sync_tables(&self) -> EngineResult<()> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        if !self.is_enabled() {
            debug!("reconciliation requested while disabled");
            return Ok(());
        }
        let Some(user) = self.active_user() else {
            debug!("reconciliation requested with no active user");
            return Ok(());
        };

        self.full_syncs.fetch_add(1, Ordering::SeqCst);
        let states = self.registry.read().states();
        for state in states {
            if !self.is_enabled() {
                break;
            }
            if let Err(error) = self.reconcile_kind(&state, &user).await {
                self.note_failure("reconcile", &state.kind, &error);
            }
        }
        Ok(())
    }

    /// Reconciles one kind: queue newer local records for push, then diff
    /// the backend index and page needed records into the incoming queue,
    /// unless the presence gate proves a pull is unnecessary.
    async fn reconcile_kind(&self, state: &KindState, user: &OwnerId) -> EngineResult<()> {
        let local = self
            .local
            .select_all(&state.kind, OwnerFilter::Owned(user))
            .await?;
        if !self.is_enabled() {
            return Ok(());
        }
        let local_index: HashMap<RecordId, DateTime<Utc>> = local
            .iter()
            .map(|record| (record.id.clone(), record.updated_at))
            .collect();
        self.consider_for_outgoing(state, local);

        let last_pulled = *state.last_pulled.lock();
        let other_active = *self.other_device_last_active.read();
        if self.presence.skip_pull(last_pulled, other_active) {
            debug!(kind = %state.kind, "skipping pull, no other device active since last pull");
            return Ok(());
        }

        let index = self.backend.select_index(&state.collection, user).await?;
        if !self.is_enabled() {
            return Ok(());
        }
        let needed: Vec<RecordId> = index
            .into_iter()
            .filter(|entry| {
                local_index
                    .get(&entry.id)
                    .is_none_or(|local_at| entry.updated_at > *local_at)
            })
            .map(|entry| entry.id)
            .collect();

        if !needed.is_empty() {
            self.emit(SyncActivity::PullStarted {
                kind: state.kind.clone(),
                source: SyncSource::FullSync,
                items: needed.len(),
            });
            let mut queued = 0usize;
            for page in needed.chunks(self.config.pull_page_size.max(1)) {
                let rows = self
                    .backend
                    .select_by_ids(&state.collection, user, page)
                    .await?;
                if !self.is_enabled() {
                    return Ok(());
                }
                let mut incoming = state.incoming.lock();
                for row in rows {
                    match state.codec.decode(&row) {
                        Ok(record) => {
                            if incoming.insert(record, SyncSource::FullSync) {
                                queued += 1;
                            }
                        }
                        Err(error) => {
                            warn!(kind = %state.kind, %error, "dropping undecodable row");
                        }
                    }
                }
            }
            self.emit(SyncActivity::PullCompleted {
                kind: state.kind.clone(),
                source: SyncSource::FullSync,
                items: queued,
            });
        }

        let now = Utc::now();
        *state.last_pulled.lock() = Some(now);
        if self.is_enabled() {
            self.persist_watermark(&state.kind, Watermark::Pulled, now).await;
        }
        Ok(())
    }
}

/// The recurring drain task. Started on first enablement; runs until the
/// engine is disposed or dropped. Disablement only makes ticks idle.
async fn run_drain_loop<L, B>(
    inner: std::sync::Weak<EngineInner<L, B>>,
    mut shutdown: watch::Receiver<bool>,
    interval: std::time::Duration,
) where
    L: LocalStore + 'static,
    B: BackendStore + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.is_disposed() {
                    break;
                }
                inner.drain_all().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("drain loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use driftsync_model::EnvelopeCodec;
    use driftsync_store::{MemoryBackend, MemoryLocalStore};

    fn engine() -> SyncEngine<MemoryLocalStore, MemoryBackend> {
        SyncEngine::new(
            EngineConfig::default(),
            MemoryLocalStore::new(),
            MemoryBackend::new(),
        )
    }

    #[tokio::test]
    async fn register_rejects_blank_kind() {
        let engine = engine();
        let result = engine.register("", "notes_v1", Arc::new(EnvelopeCodec));
        assert!(matches!(result, Err(EngineError::BlankKind)));
        let result = engine.register("  ", "notes_v1", Arc::new(EnvelopeCodec));
        assert!(matches!(result, Err(EngineError::BlankKind)));
    }

    #[tokio::test]
    async fn register_is_idempotent_per_kind() {
        let engine = engine();
        let first = engine
            .register("notes", "notes_v1", Arc::new(EnvelopeCodec))
            .unwrap();
        let second = engine
            .register("notes", "notes_v1", Arc::new(EnvelopeCodec))
            .unwrap();
        assert_eq!(first.kind(), second.kind());
        assert_eq!(engine.stats().kinds.len(), 1);
    }

    #[tokio::test]
    async fn register_after_start_is_rejected() {
        let engine = engine();
        engine
            .register("notes", "notes_v1", Arc::new(EnvelopeCodec))
            .unwrap();
        engine.enable_sync().await.unwrap();

        let result = engine.register("tags", "tags_v1", Arc::new(EnvelopeCodec));
        assert!(matches!(
            result,
            Err(EngineError::RegisteredAfterStart { .. })
        ));
        engine.dispose();
    }

    #[tokio::test]
    async fn enable_requires_a_registration() {
        let engine = engine();
        let result = engine.enable_sync().await;
        assert!(matches!(result, Err(EngineError::NothingRegistered)));
        assert_eq!(engine.state(), EngineState::Disabled);
    }

    #[tokio::test]
    async fn state_machine_transitions() {
        let engine = engine();
        engine
            .register("notes", "notes_v1", Arc::new(EnvelopeCodec))
            .unwrap();
        assert_eq!(engine.state(), EngineState::Disabled);

        engine.enable_sync().await.unwrap();
        assert_eq!(engine.state(), EngineState::Enabled);

        engine.disable_sync();
        assert_eq!(engine.state(), EngineState::Disabled);

        engine.enable_sync().await.unwrap();
        assert_eq!(engine.state(), EngineState::Enabled);

        engine.dispose();
        assert_eq!(engine.state(), EngineState::Disposed);
        assert!(matches!(
            engine.enable_sync().await,
            Err(EngineError::Disposed)
        ));
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let engine = engine();
        engine
            .register("notes", "notes_v1", Arc::new(EnvelopeCodec))
            .unwrap();
        engine.enable_sync().await.unwrap();
        engine.dispose();
        engine.dispose();
        assert_eq!(engine.state(), EngineState::Disposed);
    }

    #[tokio::test]
    async fn fill_missing_owner_requires_user() {
        let engine = engine();
        engine
            .register("notes", "notes_v1", Arc::new(EnvelopeCodec))
            .unwrap();
        let result = engine.fill_missing_owner().await;
        assert!(matches!(result, Err(EngineError::NoActiveUser)));
    }

    #[tokio::test]
    async fn counters_default_to_zero() {
        let engine = engine();
        let handle = engine
            .register("notes", "notes_v1", Arc::new(EnvelopeCodec))
            .unwrap();
        assert_eq!(engine.pushed_count(&handle), 0);
        assert_eq!(engine.pulled_count(&handle), 0);
        assert_eq!(engine.full_sync_count(), 0);
        assert!(!engine.is_subscribed_to_backend());
        assert!(!engine.is_syncing_to_backend());
        assert!(!engine.is_syncing_from_backend());
    }
}
