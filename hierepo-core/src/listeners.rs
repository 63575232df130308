//! Event fan-out to internal listeners

use crate::changelog::ChangeLog;
use crate::event::{Event, EventBundle, InternalEventListener};
use std::sync::{Arc, Mutex, PoisonError};

/// Listeners interested in committed local and external changes
///
/// Delivery works on a snapshot of the registered set, so listeners may be
/// added or removed while a delivery is running.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<dyn InternalEventListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Registering the same listener twice is a no-op.
    pub fn add(&self, listener: Arc<dyn InternalEventListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Unregister a listener; returns whether it was registered
    pub fn remove(&self, listener: &Arc<dyn InternalEventListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn InternalEventListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver `events` to every registered listener.
    ///
    /// Nothing is delivered for an empty sequence.
    pub fn deliver(&self, events: &[Event], is_local: bool, change_log: Option<&ChangeLog>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.snapshot();
        tracing::debug!(
            events = events.len(),
            listeners = listeners.len(),
            is_local,
            "delivering events"
        );
        let bundle = EventBundle::new(events, is_local, change_log);
        for listener in listeners {
            listener.on_event(&bundle);
        }
    }
}
