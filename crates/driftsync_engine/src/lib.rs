//! # Driftsync Engine
//!
//! Offline-first synchronization of records between a per-device local
//! store and a shared backend store, for multiple devices belonging to the
//! same user.
//!
//! This crate provides:
//! - Per-kind registration with a typed [`SyncHandle`] accessor
//! - Coalescing outgoing and digest-deduplicated incoming queues
//! - Echo suppression for the engine's own writes reflecting back
//! - A reconciler that diffs `(id, updated_at)` indexes and pages pulls
//! - A presence gate deciding when the realtime channel and pulls are
//!   worth their cost
//! - A recurring drain loop that isolates per-kind failures
//!
//! ## Architecture
//!
//! The engine resolves every conflict with **last-write-wins** on the
//! record's mutation timestamp: whole-record replacement, no field-level
//! merge. Records are safe to re-deliver; nothing guarantees exactly-once
//! across restarts, and unrelated records drain in no particular order.
//!
//! Collaborators are injected as traits (see `driftsync_store`); the
//! engine owns no storage itself.
//!
//! ## Key Invariants
//!
//! - For any record id, the greatest `updated_at` is authoritative
//! - Lesser-or-equal-timestamp writes are discarded wherever observed
//! - A drained batch that fails to push is re-merged, never lost
//! - Registration is rejected once the drain loop has started
//! - Disposal is terminal and idempotent
//!
//! Call [`SyncEngine::dispose`] when finished; it cancels subscriptions
//! and stops the drain loop deterministically.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod event;
mod presence;
mod queues;
mod registry;
mod state;

pub use config::EngineConfig;
pub use engine::{SyncEngine, WriteOutcome};
pub use error::{EngineError, EngineResult};
pub use event::{SyncActivity, SyncSource};
pub use presence::PresenceGate;
pub use registry::SyncHandle;
pub use state::{EngineState, KindCounters, SyncStats};
