//! Error types for the sync engine.

use driftsync_model::RecordKind;
use driftsync_store::StoreError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the sync engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Registration used a blank kind discriminator.
    #[error("record kind must be a non-empty discriminator")]
    BlankKind,

    /// Registration arrived after the drain loop had started.
    #[error("cannot register `{kind}` after the drain loop has started")]
    RegisteredAfterStart {
        /// The rejected kind.
        kind: RecordKind,
    },

    /// Sync was enabled with nothing registered.
    #[error("cannot enable sync with no registered record kinds")]
    NothingRegistered,

    /// The engine has been disposed.
    #[error("engine has been disposed")]
    Disposed,

    /// An operation required an active user.
    #[error("no active user")]
    NoActiveUser,

    /// A store collaborator failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Returns true for configuration errors, which are surfaced to the
    /// caller immediately and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::BlankKind
                | EngineError::RegisteredAfterStart { .. }
                | EngineError::NothingRegistered
                | EngineError::Disposed
                | EngineError::NoActiveUser
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_classification() {
        assert!(EngineError::BlankKind.is_configuration());
        assert!(EngineError::NothingRegistered.is_configuration());
        assert!(EngineError::Disposed.is_configuration());
        assert!(!EngineError::Store(StoreError::backend_retryable("offline")).is_configuration());
    }

    #[test]
    fn error_display() {
        let err = EngineError::RegisteredAfterStart {
            kind: RecordKind::new("notes"),
        };
        assert!(err.to_string().contains("notes"));
    }
}
