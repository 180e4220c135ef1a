//! NIP-42: authentication of clients to relays.
//!
//! Signing the reply is the caller's job. These helpers only read what the
//! relay protocol needs from an already signed kind-22242 event and classify
//! relay rejections that ask for authentication.

use crate::nip01::Event;

/// Machine-readable prefix relays put on `OK`/`CLOSED` messages that need AUTH first.
pub const AUTH_REQUIRED_PREFIX: &str = "auth-required";

/// Challenge string carried by a signed auth event, if it is one.
pub fn auth_challenge(event: &Event) -> Option<&str> {
    if !event.is_auth() {
        return None;
    }
    event.tag_value("challenge")
}

/// Whether a relay rejection message asks the client to authenticate and retry.
pub fn is_auth_required(message: &str) -> bool {
    message.starts_with(AUTH_REQUIRED_PREFIX)
}
