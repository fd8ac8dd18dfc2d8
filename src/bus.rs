//! Synchronous in-process publish/subscribe dispatcher.
//!
//! The bus is an explicitly constructed value: clone a handle and pass it to
//! whichever components need to publish or subscribe. Delivery is synchronous
//! and in registration order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, Callback)>>,
}

/// Synchronous publish/subscribe bus.
///
/// Callbacks registered under an event name are invoked on the broadcasting
/// thread, in registration order, before [`EventBus::broadcast`] returns.
/// Cloned handles share the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

/// Handle returned by [`EventBus::on`].
///
/// Calling [`Subscription::unsubscribe`] removes the callback. Dropping the
/// handle without calling it leaves the callback registered for the lifetime
/// of the bus.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    event: String,
    id: u64,
}

impl Subscription {
    /// Removes the subscribed callback from the bus.
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut guard = lock(&registry);
        if let Some(callbacks) = guard.topics.get_mut(&self.event) {
            callbacks.retain(|(id, _)| *id != self.id);
        }
    }
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` under `event` and returns a revocation handle.
    ///
    /// Callbacks are kept in insertion order and are never de-duplicated:
    /// registering the same closure twice delivers each broadcast twice.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event = event.into();
        let mut guard = lock(&self.registry);
        let id = guard.next_id;
        guard.next_id += 1;
        guard
            .topics
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            event,
            id,
        }
    }

    /// Delivers `payload` to every callback currently registered under
    /// `event`, in registration order, before returning.
    pub fn broadcast(&self, event: &str, payload: &Value) {
        // Snapshot the callback list so subscribers can re-enter the bus.
        let callbacks: Vec<Callback> = {
            let guard = lock(&self.registry);
            guard
                .topics
                .get(event)
                .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };

        for callback in callbacks {
            callback(payload);
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
