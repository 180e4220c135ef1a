//! WebSocket seam between relay sessions and the network.
//!
//! A session never touches a socket library directly. It asks a
//! `WebSocketBuilder` for a socket bound to its own `WebSocketListener`, and
//! the socket reports everything that happens through that listener.

mod memory;
mod tungstenite;

pub use memory::{MemoryRelayHub, MemorySocketBuilder};
pub use tungstenite::{DEFAULT_CONNECT_TIMEOUT, TungsteniteSocketBuilder};

use crate::error::Result;
use nostr::RelayUrl;
use std::sync::Arc;

/// One dialable connection. Methods never block.
pub trait WebSocket: Send + Sync {
    /// Start dialing. Completion is reported through `on_open` or `on_failure`.
    fn connect(&self);

    /// Queue a text frame. Returns false when the socket can no longer write.
    fn send(&self, text: &str) -> bool;

    /// Tear the connection down without reporting further callbacks.
    fn cancel(&self);

    /// Whether the underlying connection is gone and a fresh socket is needed.
    fn needs_reconnect(&self) -> bool;
}

/// Socket events, delivered in order for one socket.
pub trait WebSocketListener: Send + Sync {
    fn on_open(&self, ping_ms: u64, compression: bool);

    fn on_message(&self, text: &str);

    fn on_closing(&self, code: u16, reason: &str);

    fn on_closed(&self, code: u16, reason: &str);

    /// `code` and `response` are set when the server answered the handshake with HTTP.
    fn on_failure(&self, error: &str, code: Option<u16>, response: Option<&str>);
}

pub trait WebSocketBuilder: Send + Sync {
    fn build(
        &self,
        url: &RelayUrl,
        listener: Arc<dyn WebSocketListener>,
    ) -> Result<Arc<dyn WebSocket>>;
}
