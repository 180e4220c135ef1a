//! In-process relay stand-in for driving sessions without a network.
//!
//! A `MemoryRelayHub` plays every relay at once. Sockets built from its
//! `MemorySocketBuilder` register with the hub on `connect`; the hub then
//! opens, feeds, fails or closes the current socket of a relay on request
//! and records every frame written to it.

use super::{WebSocket, WebSocketBuilder, WebSocketListener};
use crate::error::{ClientError, Result};
use nostr::RelayUrl;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    next_socket: u64,
    auto_open: bool,
    refused: HashSet<RelayUrl>,
    relays: HashMap<RelayUrl, RelayEndpoint>,
}

#[derive(Default)]
struct RelayEndpoint {
    current: Option<LiveSocket>,
    connects: usize,
    sent: Vec<String>,
}

struct LiveSocket {
    id: u64,
    listener: Arc<dyn WebSocketListener>,
    finished: Arc<AtomicBool>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder(&self) -> MemorySocketBuilder {
        MemorySocketBuilder { hub: self.clone() }
    }

    /// Open sockets as soon as they dial.
    pub fn set_auto_open(&self, auto_open: bool) {
        self.state().auto_open = auto_open;
    }

    /// Make `build` fail for this relay.
    pub fn refuse(&self, url: &RelayUrl) {
        self.state().refused.insert(url.clone());
    }

    pub fn accept(&self, url: &RelayUrl) {
        self.state().refused.remove(url);
    }

    /// Complete the handshake of the relay's dialing socket.
    pub fn open(&self, url: &RelayUrl) -> bool {
        match self.current_listener(url) {
            Some(listener) => {
                listener.on_open(0, false);
                true
            }
            None => false,
        }
    }

    /// Push a text frame from the relay to the client.
    pub fn deliver(&self, url: &RelayUrl, text: &str) -> bool {
        match self.current_listener(url) {
            Some(listener) => {
                listener.on_message(text);
                true
            }
            None => false,
        }
    }

    /// Fail the relay's socket, as a refused dial or a broken pipe would.
    pub fn fail(&self, url: &RelayUrl, error: &str, code: Option<u16>) -> bool {
        match self.detach(url) {
            Some(listener) => {
                listener.on_failure(error, code, None);
                true
            }
            None => false,
        }
    }

    /// Close the relay's socket from the server side.
    pub fn close(&self, url: &RelayUrl, code: u16, reason: &str) -> bool {
        match self.detach(url) {
            Some(listener) => {
                listener.on_closing(code, reason);
                listener.on_closed(code, reason);
                true
            }
            None => false,
        }
    }

    /// Drop the relay's socket without any callback, like a silently dead TCP link.
    pub fn sever(&self, url: &RelayUrl) -> bool {
        self.detach(url).is_some()
    }

    /// Every frame the client wrote to this relay, oldest first.
    pub fn sent(&self, url: &RelayUrl) -> Vec<String> {
        self.state()
            .relays
            .get(url)
            .map(|relay| relay.sent.clone())
            .unwrap_or_default()
    }

    /// Frames of one kind (`"REQ"`, `"EVENT"`, ...) written to this relay.
    pub fn sent_of_kind(&self, url: &RelayUrl, kind: &str) -> Vec<String> {
        let prefix = format!("[\"{}\"", kind);
        self.sent(url)
            .into_iter()
            .filter(|frame| frame.starts_with(&prefix))
            .collect()
    }

    pub fn clear_sent(&self, url: &RelayUrl) {
        if let Some(relay) = self.state().relays.get_mut(url) {
            relay.sent.clear();
        }
    }

    /// Number of dials made to this relay.
    pub fn connect_count(&self, url: &RelayUrl) -> usize {
        self.state()
            .relays
            .get(url)
            .map_or(0, |relay| relay.connects)
    }

    /// Whether the relay currently has a dialing or open socket.
    pub fn has_socket(&self, url: &RelayUrl) -> bool {
        self.state()
            .relays
            .get(url)
            .is_some_and(|relay| relay.current.is_some())
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_listener(&self, url: &RelayUrl) -> Option<Arc<dyn WebSocketListener>> {
        self.state()
            .relays
            .get(url)
            .and_then(|relay| relay.current.as_ref())
            .map(|socket| Arc::clone(&socket.listener))
    }

    fn detach(&self, url: &RelayUrl) -> Option<Arc<dyn WebSocketListener>> {
        let socket = self.state().relays.get_mut(url)?.current.take()?;
        socket.finished.store(true, Ordering::SeqCst);
        Some(socket.listener)
    }

    /// Returns whether the socket should be opened right away.
    fn register(&self, socket: &MemorySocket) -> bool {
        let mut state = self.state();
        let auto_open = state.auto_open;
        let relay = state.relays.entry(socket.url.clone()).or_default();
        relay.connects += 1;
        if let Some(previous) = relay.current.take() {
            previous.finished.store(true, Ordering::SeqCst);
        }
        relay.current = Some(LiveSocket {
            id: socket.id,
            listener: Arc::clone(&socket.listener),
            finished: Arc::clone(&socket.finished),
        });
        auto_open
    }

    fn record_send(&self, socket: &MemorySocket, text: &str) -> bool {
        let mut state = self.state();
        let Some(relay) = state.relays.get_mut(&socket.url) else {
            return false;
        };
        if relay.current.as_ref().is_some_and(|live| live.id == socket.id) {
            relay.sent.push(text.to_string());
            true
        } else {
            false
        }
    }

    fn unregister(&self, socket: &MemorySocket) {
        let mut state = self.state();
        if let Some(relay) = state.relays.get_mut(&socket.url)
            && relay.current.as_ref().is_some_and(|live| live.id == socket.id)
        {
            relay.current = None;
        }
    }
}

pub struct MemorySocketBuilder {
    hub: MemoryRelayHub,
}

impl WebSocketBuilder for MemorySocketBuilder {
    fn build(
        &self,
        url: &RelayUrl,
        listener: Arc<dyn WebSocketListener>,
    ) -> Result<Arc<dyn WebSocket>> {
        let id = {
            let mut state = self.hub.state();
            if state.refused.contains(url) {
                return Err(ClientError::WebSocket(format!(
                    "connection to {} refused",
                    url
                )));
            }
            state.next_socket += 1;
            state.next_socket
        };

        Ok(Arc::new(MemorySocket {
            id,
            url: url.clone(),
            hub: self.hub.clone(),
            listener,
            finished: Arc::new(AtomicBool::new(false)),
            dialed: AtomicBool::new(false),
        }))
    }
}

struct MemorySocket {
    id: u64,
    url: RelayUrl,
    hub: MemoryRelayHub,
    listener: Arc<dyn WebSocketListener>,
    finished: Arc<AtomicBool>,
    dialed: AtomicBool,
}

impl WebSocket for MemorySocket {
    fn connect(&self) {
        if self.dialed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.hub.register(self) {
            self.listener.on_open(0, false);
        }
    }

    fn send(&self, text: &str) -> bool {
        !self.finished.load(Ordering::SeqCst) && self.hub.record_send(self, text)
    }

    fn cancel(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.hub.unregister(self);
    }

    fn needs_reconnect(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}
