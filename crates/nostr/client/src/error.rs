//! Client error types.
//!
//! `ClientError` is returned from constructors and parsers. Everything that
//! goes wrong while a relay session is running is a `RelayError`: it is
//! recorded in the relay's stats and handed to listeners, never returned.

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] nostr::RelayUrlError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no tokio runtime: {0}")]
    Runtime(String),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failure observed on one relay, reported through `RelayListener::on_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Connect or write failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unsupported relay message. The pump keeps going.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// NOTICE sent by the relay.
    #[error("relay notice: {0}")]
    Notice(String),

    /// `OK false` for an event. The connection stays open.
    #[error("event {event_id} rejected: {message}")]
    Rejected { event_id: String, message: String },

    /// `OK false` with an `auth-required` message. The outbox keeps the event.
    #[error("event {event_id} needs auth: {message}")]
    AuthRequired { event_id: String, message: String },

    /// Rejection class that pins the long reconnect cooldown.
    #[error("relay unavailable: {0}")]
    Fatal(String),
}

impl RelayError {
    /// Classify an `OK false` acknowledgment.
    pub fn from_rejection(event_id: &str, message: &str) -> Self {
        if nostr::is_auth_required(message) {
            Self::AuthRequired {
                event_id: event_id.to_string(),
                message: message.to_string(),
            }
        } else {
            Self::Rejected {
                event_id: event_id.to_string(),
                message: message.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_classification() {
        assert!(matches!(
            RelayError::from_rejection("e1", "auth-required: sign in"),
            RelayError::AuthRequired { .. }
        ));
        assert!(matches!(
            RelayError::from_rejection("e1", "blocked: spam"),
            RelayError::Rejected { .. }
        ));
    }
}
