//! Nostr relay client engine.
//!
//! Two layers:
//! - `RelaySession`: one relay connection with EOSE tracking, NIP-42 AUTH
//!   replies and reconnect backoff
//! - `NostrClient`: a pool orchestrator that turns REQ subscriptions, COUNT
//!   queries and outgoing events into the set of relay sessions it needs,
//!   writing only what changed and replaying state after reconnects
//!
//! Sockets sit behind the `transport` traits; `TungsteniteSocketBuilder`
//! talks to real relays and `MemoryRelayHub` stands in for them in tests.

mod backoff;
pub mod client;
pub mod config;
pub mod count;
pub mod error;
pub mod listener;
pub mod message;
pub mod outbox;
pub mod pool;
pub mod reconcile;
pub mod relay;
pub mod stats;
pub mod subscription;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use client::{AuthSigner, NostrClient};
pub use config::{ClientConfig, SessionConfig};
pub use count::{CountListener, PoolCounts};
pub use error::{ClientError, RelayError, Result};
pub use listener::{ListenerSet, RelayListener};
pub use message::{Command, RelayMessage, parse_relay_message};
pub use outbox::{OutboxStatus, PoolEventOutbox};
pub use pool::{RelayPool, RelayPoolStatus};
pub use reconcile::{FilterChange, diff};
pub use relay::{ConnectionState, RelaySession};
pub use stats::{RelayDebugKind, RelayDebugMessage, RelayStat};
pub use subscription::{PoolRequests, ReqStatus, RequestListener};
pub use transport::{
    DEFAULT_CONNECT_TIMEOUT, MemoryRelayHub, MemorySocketBuilder, TungsteniteSocketBuilder,
    WebSocket, WebSocketBuilder, WebSocketListener,
};
