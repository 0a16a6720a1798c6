//! Event-scoped listener tables
//!
//! Inbound protocol events fan out through explicit dispatch tables, one
//! per scope (connection-wide, per-session). Each table maps an event key
//! (full method name, method namespace, or the unscoped bucket) to a list
//! of callbacks invoked synchronously in registration order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// One inbound protocol event, as decoded off the wire.
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
    /// Full method name, e.g. `Page.frameNavigated`
    pub method: String,
    /// Event parameters
    pub params: Value,
    /// Session the event is scoped to, if any
    pub session_id: Option<String>,
}

impl ProtocolEvent {
    /// The method's namespace prefix (`Page.frameNavigated` → `Page`)
    pub fn namespace(&self) -> &str {
        namespace_of(&self.method)
    }
}

/// Split off the namespace prefix of a method name
pub fn namespace_of(method: &str) -> &str {
    method.split('.').next().unwrap_or(method)
}

/// Callback invoked synchronously during event dispatch
pub type EventCallback = Arc<dyn Fn(&ProtocolEvent) + Send + Sync>;

/// Handle for removing a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EventKey {
    /// Full method name, e.g. `Page.frameNavigated`
    Method(String),
    /// Method namespace prefix, e.g. `Page`
    Namespace(String),
    /// Events whose session id matched no live session
    Unscoped,
}

/// Dispatch table for one event scope.
///
/// Callbacks are snapshotted out of the lock before invocation, so a
/// callback may register or remove listeners without deadlocking; such
/// changes take effect from the next event onward.
#[derive(Default)]
pub struct EventListeners {
    next_id: AtomicU64,
    table: Mutex<HashMap<EventKey, Vec<(u64, EventCallback)>>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: EventKey, callback: EventCallback) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.lock().expect("listener table poisoned");
        table.entry(key).or_default().push((id, callback));
        ListenerId(id)
    }

    /// Register a callback for one full method name
    pub fn on_method(&self, method: impl Into<String>, callback: EventCallback) -> ListenerId {
        self.insert(EventKey::Method(method.into()), callback)
    }

    /// Register a callback for every method under a namespace prefix
    pub fn on_namespace(&self, namespace: impl Into<String>, callback: EventCallback) -> ListenerId {
        self.insert(EventKey::Namespace(namespace.into()), callback)
    }

    /// Register a callback for events that matched no live session
    pub fn on_unscoped(&self, callback: EventCallback) -> ListenerId {
        self.insert(EventKey::Unscoped, callback)
    }

    /// Remove a listener; unknown ids are a no-op
    pub fn remove(&self, id: ListenerId) {
        let mut table = self.table.lock().expect("listener table poisoned");
        for listeners in table.values_mut() {
            listeners.retain(|(lid, _)| *lid != id.0);
        }
        table.retain(|_, listeners| !listeners.is_empty());
    }

    fn snapshot(&self, key: &EventKey) -> Vec<EventCallback> {
        let table = self.table.lock().expect("listener table poisoned");
        table
            .get(key)
            .map(|listeners| listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    /// Dispatch an event to its method-name listeners, then its
    /// namespace listeners, each in registration order.
    pub fn emit(&self, event: &ProtocolEvent) {
        for cb in self.snapshot(&EventKey::Method(event.method.clone())) {
            cb(event);
        }
        for cb in self.snapshot(&EventKey::Namespace(event.namespace().to_string())) {
            cb(event);
        }
    }

    /// Dispatch an event to the unscoped bucket
    pub fn emit_unscoped(&self, event: &ProtocolEvent) {
        for cb in self.snapshot(&EventKey::Unscoped) {
            cb(event);
        }
    }
}

/// A plain notification list (no payload routing), used for
/// connection-level connected/disconnected and target crash signals.
#[derive(Default)]
pub struct NotifyList {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
}

impl NotifyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: Arc<dyn Fn() + Send + Sync>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .expect("notify list poisoned")
            .push((id, callback));
        ListenerId(id)
    }

    pub fn remove(&self, id: ListenerId) {
        self.callbacks
            .lock()
            .expect("notify list poisoned")
            .retain(|(lid, _)| *lid != id.0);
    }

    pub fn notify(&self) {
        let snapshot: Vec<_> = self
            .callbacks
            .lock()
            .expect("notify list poisoned")
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in snapshot {
            cb();
        }
    }
}
