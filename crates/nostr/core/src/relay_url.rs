use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayUrlError {
    #[error("invalid relay URL: {0}")]
    Parse(String),

    #[error("relay URL must use ws:// or wss:// scheme, got: {0}")]
    Scheme(String),

    #[error("relay URL has no host: {0}")]
    MissingHost(String),
}

/// Canonical relay identity.
///
/// Two spellings of the same relay (`wss://Relay.Example.com/`,
/// `relay.example.com`, `https://relay.example.com:443`) normalize to one
/// value, so every per-relay map dedups on this type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn parse(input: &str) -> Result<Self, RelayUrlError> {
        let trimmed = input.trim();
        let with_scheme = if let Some(rest) = trimmed.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("wss://{trimmed}")
        };

        let mut url =
            Url::parse(&with_scheme).map_err(|error| RelayUrlError::Parse(error.to_string()))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(RelayUrlError::Scheme(url.scheme().to_string()));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(RelayUrlError::MissingHost(input.to_string()));
        }
        url.set_fragment(None);

        let mut normalized = url.to_string();
        if url.query().is_none() {
            while normalized.ends_with('/') {
                normalized.pop();
            }
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RelayUrl {
    type Err = RelayUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
