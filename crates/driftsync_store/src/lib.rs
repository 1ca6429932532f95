//! # Driftsync Store
//!
//! Collaborator contracts consumed by the driftsync engine, plus complete
//! in-memory implementations for tests and demos.
//!
//! This crate provides:
//! - [`LocalStore`]: the per-device persistent store
//! - [`BackendStore`]: the shared backend store
//! - [`TimestampStore`]: optional persisted sync watermarks
//! - [`Subscription`]: cancellable change-feed handles
//! - [`MemoryLocalStore`], [`MemoryBackend`], [`MemoryTimestampStore`]:
//!   in-memory implementations with scriptable failure injection
//!
//! The engine is injected with these contracts rather than inheriting
//! storage capability, so any ORM / SQL / HTTP adapter can implement them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod local;
mod subscription;
mod timestamps;

pub use backend::{BackendStore, ChangeListener, MemoryBackend};
pub use error::{StoreError, StoreResult};
pub use local::{InsertOutcome, LocalListener, LocalStore, MemoryLocalStore, OwnerFilter};
pub use subscription::{CallbackSubscription, Subscription, SubscriptionHandle};
pub use timestamps::{MemoryTimestampStore, TimestampStore};
