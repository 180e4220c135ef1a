//! Relay protocol frames: inbound `RelayMessage` parsing and outbound `Command` encoding.

use crate::error::{ClientError, Result};
use nostr::{Event, Filter};
use serde_json::{Value, json};

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    Ok(String, bool, String),
    Eose(String),
    Notice(String),
    Auth(String),
    Notify(String),
    Closed(String, String),
    Count(String, u64),
    /// Anything with a kind this client does not speak, carried raw.
    Unknown(String),
}

/// Command sent to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
    Event(Event),
    Auth(Event),
}

impl Command {
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn count(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self::Count {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self::Close {
            subscription_id: subscription_id.into(),
        }
    }

    /// REQ and COUNT without filters are never written.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Req { filters, .. } | Self::Count { filters, .. } => !filters.is_empty(),
            Self::Close { .. } | Self::Event(_) | Self::Auth(_) => true,
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Req {
                subscription_id, ..
            }
            | Self::Count {
                subscription_id, ..
            }
            | Self::Close { subscription_id } => Some(subscription_id),
            Self::Event(_) | Self::Auth(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            Self::Req {
                subscription_id,
                filters,
            } => with_filters("REQ", subscription_id, filters)?,
            Self::Count {
                subscription_id,
                filters,
            } => with_filters("COUNT", subscription_id, filters)?,
            Self::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            Self::Event(event) => json!(["EVENT", event]),
            Self::Auth(event) => json!(["AUTH", event]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

fn with_filters(kind: &str, subscription_id: &str, filters: &[Filter]) -> Result<Value> {
    let mut frame = Vec::with_capacity(filters.len() + 2);
    frame.push(Value::from(kind));
    frame.push(Value::from(subscription_id));
    for filter in filters {
        frame.push(serde_json::to_value(filter)?);
    }
    Ok(Value::Array(frame))
}

/// Parse relay protocol JSON text message into typed relay message.
pub fn parse_relay_message(text: &str) -> Result<RelayMessage> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    let Some(first) = array.first() else {
        return Ok(RelayMessage::Unknown(text.to_string()));
    };

    let kind = first
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    match kind {
        "EVENT" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid EVENT message".to_string()));
            }
            let subscription_id = str_at(array, 1, "invalid EVENT subscription id")?;
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            Ok(RelayMessage::Event(subscription_id, event))
        }
        "OK" => {
            if array.len() < 4 {
                return Err(ClientError::Protocol("invalid OK message".to_string()));
            }
            let event_id = str_at(array, 1, "invalid OK event id")?;
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let message = str_at(array, 3, "invalid OK message text")?;
            Ok(RelayMessage::Ok(event_id, accepted, message))
        }
        "EOSE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid EOSE message".to_string()));
            }
            Ok(RelayMessage::Eose(str_at(
                array,
                1,
                "invalid EOSE subscription id",
            )?))
        }
        "NOTICE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
            }
            Ok(RelayMessage::Notice(str_at(
                array,
                1,
                "invalid NOTICE message text",
            )?))
        }
        "AUTH" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid AUTH message".to_string()));
            }
            Ok(RelayMessage::Auth(str_at(array, 1, "invalid AUTH challenge")?))
        }
        "NOTIFY" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid NOTIFY message".to_string()));
            }
            Ok(RelayMessage::Notify(str_at(
                array,
                1,
                "invalid NOTIFY message text",
            )?))
        }
        "CLOSED" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid CLOSED message".to_string()));
            }
            let subscription_id = str_at(array, 1, "invalid CLOSED subscription id")?;
            // Some relays omit the reason.
            let message = match array.get(2) {
                Some(value) => value
                    .as_str()
                    .ok_or_else(|| {
                        ClientError::Protocol("invalid CLOSED message text".to_string())
                    })?
                    .to_string(),
                None => String::new(),
            };
            Ok(RelayMessage::Closed(subscription_id, message))
        }
        "COUNT" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid COUNT message".to_string()));
            }
            let subscription_id = str_at(array, 1, "invalid COUNT subscription id")?;
            let count = array[2]
                .get("count")
                .and_then(Value::as_u64)
                .ok_or_else(|| ClientError::Protocol("invalid COUNT payload".to_string()))?;
            Ok(RelayMessage::Count(subscription_id, count))
        }
        _ => Ok(RelayMessage::Unknown(text.to_string())),
    }
}

fn str_at(array: &[Value], index: usize, error: &str) -> Result<String> {
    array
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::Protocol(error.to_string()))
}
