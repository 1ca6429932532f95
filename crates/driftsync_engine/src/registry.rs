//! Registered record kinds.

use crate::state::KindState;
use driftsync_model::RecordKind;
use std::collections::HashMap;
use std::sync::Arc;

/// Typed handle returned by registration.
///
/// Registration is keyed by an explicit discriminator chosen by the caller;
/// the handle is the accessor for all subsequent per-kind queries (counters,
/// and so on), so callers never pass loose strings around after setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncHandle {
    kind: RecordKind,
}

impl SyncHandle {
    pub(crate) fn new(kind: RecordKind) -> Self {
        Self { kind }
    }

    /// The registered kind this handle refers to.
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }
}

/// All registered kinds, in registration order.
#[derive(Default)]
pub(crate) struct Registry {
    states: HashMap<RecordKind, Arc<KindState>>,
    by_collection: HashMap<String, RecordKind>,
    order: Vec<RecordKind>,
}

impl Registry {
    /// Returns true if the kind is registered.
    pub fn contains(&self, kind: &RecordKind) -> bool {
        self.states.contains_key(kind)
    }

    /// Adds a registration. The caller guarantees the kind is new.
    pub fn insert(&mut self, state: Arc<KindState>) {
        self.by_collection
            .insert(state.collection.clone(), state.kind.clone());
        self.order.push(state.kind.clone());
        self.states.insert(state.kind.clone(), state);
    }

    /// Looks up one kind's state.
    pub fn get(&self, kind: &RecordKind) -> Option<Arc<KindState>> {
        self.states.get(kind).cloned()
    }

    /// Resolves the kind subscribed to a backend collection.
    pub fn state_for_collection(&self, collection: &str) -> Option<Arc<KindState>> {
        self.by_collection
            .get(collection)
            .and_then(|kind| self.states.get(kind))
            .cloned()
    }

    /// All states in registration order.
    pub fn states(&self) -> Vec<Arc<KindState>> {
        self.order
            .iter()
            .filter_map(|kind| self.states.get(kind).cloned())
            .collect()
    }

    /// All backend collections in registration order.
    pub fn collections(&self) -> Vec<String> {
        self.states().iter().map(|s| s.collection.clone()).collect()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_model::EnvelopeCodec;

    fn state(kind: &str, collection: &str) -> Arc<KindState> {
        KindState::new(
            RecordKind::new(kind),
            collection.to_string(),
            Arc::new(EnvelopeCodec),
            None,
        )
    }

    #[test]
    fn iteration_preserves_registration_order() {
        let mut registry = Registry::default();
        registry.insert(state("notes", "notes_v1"));
        registry.insert(state("tags", "tags_v1"));
        registry.insert(state("folders", "folders_v1"));

        let kinds: Vec<String> = registry
            .states()
            .iter()
            .map(|s| s.kind.as_str().to_string())
            .collect();
        assert_eq!(kinds, ["notes", "tags", "folders"]);
        assert_eq!(registry.collections(), ["notes_v1", "tags_v1", "folders_v1"]);
    }

    #[test]
    fn collection_lookup() {
        let mut registry = Registry::default();
        registry.insert(state("notes", "notes_v1"));

        let found = registry.state_for_collection("notes_v1").unwrap();
        assert_eq!(found.kind, RecordKind::new("notes"));
        assert!(registry.state_for_collection("unknown").is_none());
    }
}
