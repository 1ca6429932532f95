//! Cancellable change-feed subscriptions.

use parking_lot::Mutex;

/// A cancellable subscription to a change feed.
///
/// Returned by [`LocalStore::subscribe`](crate::LocalStore::subscribe) and
/// [`BackendStore::subscribe_changes`](crate::BackendStore::subscribe_changes).
/// Cancellation must be idempotent. Dropping a handle cancels it.
pub trait Subscription: Send + Sync {
    /// Detaches the listener. Further change events are not delivered.
    fn cancel(&self);
}

/// Boxed subscription handle.
pub type SubscriptionHandle = Box<dyn Subscription>;

/// A subscription backed by a one-shot cancel closure.
pub struct CallbackSubscription {
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CallbackSubscription {
    /// Creates a subscription that runs `on_cancel` when cancelled.
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_cancel: Mutex::new(Some(Box::new(on_cancel))),
        }
    }
}

impl Subscription for CallbackSubscription {
    fn cancel(&self) {
        if let Some(on_cancel) = self.on_cancel.lock().take() {
            on_cancel();
        }
    }
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn cancel_is_idempotent() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let sub = CallbackSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.cancel();
        sub.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_cancels() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        drop(CallbackSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
