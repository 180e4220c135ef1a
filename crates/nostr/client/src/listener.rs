//! Callbacks raised by relay sessions and the pool.

use crate::error::RelayError;
use crate::message::Command;
use crate::relay::RelaySession;
use nostr::Event;
use std::sync::{Arc, RwLock};

/// Observer of everything a relay session does.
///
/// Every method has an empty default so implementors only pick what they
/// need. Callbacks run on the transport task; they must not block.
pub trait RelayListener: Send + Sync {
    fn on_connecting(&self, _relay: &RelaySession) {}

    fn on_connected(&self, _relay: &RelaySession, _ping_ms: u64, _compressed: bool) {}

    fn on_disconnecting(&self, _relay: &RelaySession) {}

    fn on_disconnected(&self, _relay: &RelaySession) {}

    fn on_cannot_connect(&self, _relay: &RelaySession, _message: &str) {}

    /// Runs before an event is routed to EVENT or AUTH.
    fn on_before_send(&self, _relay: &RelaySession, _event: &Event) {}

    fn on_sent(&self, _relay: &RelaySession, _frame: &str, _command: &Command, _success: bool) {}

    fn on_event(
        &self,
        _relay: &RelaySession,
        _subscription_id: &str,
        _event: &Event,
        _arrival_secs: u64,
        _after_eose: bool,
    ) {
    }

    fn on_eose(&self, _relay: &RelaySession, _subscription_id: &str, _arrival_secs: u64) {}

    fn on_ok(&self, _relay: &RelaySession, _event_id: &str, _success: bool, _message: &str) {}

    /// First successful OK for an AUTH reply on this connection.
    fn on_authenticated(&self, _relay: &RelaySession, _event_id: &str) {}

    fn on_auth(&self, _relay: &RelaySession, _challenge: &str) {}

    fn on_notify(&self, _relay: &RelaySession, _message: &str) {}

    fn on_closed(&self, _relay: &RelaySession, _subscription_id: &str, _message: &str) {}

    fn on_count(&self, _relay: &RelaySession, _subscription_id: &str, _count: u64) {}

    fn on_error(&self, _relay: &RelaySession, _error: &RelayError) {}
}

/// Registry of external listeners, compared by reference.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn RelayListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn RelayListener>) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove(&self, listener: &Arc<dyn RelayListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    pub fn contains(&self, listener: &Arc<dyn RelayListener>) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|known| Arc::ptr_eq(known, listener))
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` on every listener without holding the registry lock.
    pub fn for_each(&self, mut f: impl FnMut(&dyn RelayListener)) {
        let snapshot = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in &snapshot {
            f(listener.as_ref());
        }
    }
}
