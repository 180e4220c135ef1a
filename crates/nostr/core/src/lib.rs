//! Nostr wire value types shared by the relay client engine.
//!
//! The engine treats events and filters as opaque values: it serializes them,
//! compares them for equality, and reads the few tags the relay protocol itself
//! depends on (the NIP-42 challenge). Content semantics live elsewhere.

pub mod nip01;
pub mod nip42;
mod relay_url;

pub use nip01::{Event, Filter, KIND_CLIENT_AUTH, KIND_TEXT_NOTE};
pub use nip42::{AUTH_REQUIRED_PREFIX, auth_challenge, is_auth_required};
pub use relay_url::{RelayUrl, RelayUrlError};
