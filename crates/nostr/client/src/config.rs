//! Client and session tuning.

use std::time::Duration;

pub const ENV_RELAY_SET_SAMPLE_MS: &str = "NOSTR_CLIENT_RELAY_SET_SAMPLE_MS";
pub const ENV_RECONNECT_DEBOUNCE_MS: &str = "NOSTR_CLIENT_RECONNECT_DEBOUNCE_MS";
pub const ENV_MIN_RECONNECT_DELAY_SECS: &str = "NOSTR_CLIENT_MIN_RECONNECT_DELAY_SECS";
pub const ENV_MAX_RECONNECT_DELAY_SECS: &str = "NOSTR_CLIENT_MAX_RECONNECT_DELAY_SECS";
pub const ENV_FATAL_COOLDOWN_SECS: &str = "NOSTR_CLIENT_FATAL_COOLDOWN_SECS";
pub const ENV_STATS_HISTORY: &str = "NOSTR_CLIENT_STATS_HISTORY";

pub const DEFAULT_RELAY_SET_SAMPLE: Duration = Duration::from_millis(300);
pub const DEFAULT_RECONNECT_DEBOUNCE: Duration = Duration::from_millis(200);
pub const DEFAULT_MIN_RECONNECT_DELAY_SECS: u64 = 1;
pub const DEFAULT_MAX_RECONNECT_DELAY_SECS: u64 = 300;
pub const DEFAULT_FATAL_COOLDOWN_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_STATS_HISTORY: usize = 100;

/// Per-relay session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Backoff floor, restored whenever a connection becomes ready.
    pub min_reconnect_delay_secs: u64,
    /// Ceiling for ordinary failures.
    pub max_reconnect_delay_secs: u64,
    /// Delay pinned after a relay answered the handshake with an HTTP error.
    pub fatal_cooldown_secs: u64,
    /// Number of diagnostic messages kept per relay.
    pub stats_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_reconnect_delay_secs: DEFAULT_MIN_RECONNECT_DELAY_SECS,
            max_reconnect_delay_secs: DEFAULT_MAX_RECONNECT_DELAY_SECS,
            fatal_cooldown_secs: DEFAULT_FATAL_COOLDOWN_SECS,
            stats_history: DEFAULT_STATS_HISTORY,
        }
    }
}

/// Pool orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How often the wanted relay set is recomputed after demand changes.
    pub relay_set_sample: Duration,
    /// Quiet period before a requested reconnect sweep runs.
    pub reconnect_debounce: Duration,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_set_sample: DEFAULT_RELAY_SET_SAMPLE,
            reconnect_debounce: DEFAULT_RECONNECT_DEBOUNCE,
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by any valid `NOSTR_CLIENT_*` variable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let session = SessionConfig {
            min_reconnect_delay_secs: env_parse(ENV_MIN_RECONNECT_DELAY_SECS)
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.session.min_reconnect_delay_secs),
            max_reconnect_delay_secs: env_parse(ENV_MAX_RECONNECT_DELAY_SECS)
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.session.max_reconnect_delay_secs),
            fatal_cooldown_secs: env_parse(ENV_FATAL_COOLDOWN_SECS)
                .unwrap_or(defaults.session.fatal_cooldown_secs),
            stats_history: env_parse(ENV_STATS_HISTORY)
                .unwrap_or(defaults.session.stats_history),
        };

        Self {
            relay_set_sample: env_parse(ENV_RELAY_SET_SAMPLE_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.relay_set_sample),
            reconnect_debounce: env_parse(ENV_RECONNECT_DEBOUNCE_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_debounce),
            session,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_non_empty(key).and_then(|value| value.parse().ok())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn with_env<T>(overrides: &[(&str, Option<&str>)], test: impl FnOnce() -> T) -> T {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = overrides
            .iter()
            .map(|(key, _)| (*key, std::env::var(key).ok()))
            .collect::<Vec<_>>();

        for (key, value) in overrides {
            if let Some(value) = value {
                unsafe { std::env::set_var(key, value) };
            } else {
                unsafe { std::env::remove_var(key) };
            }
        }

        let result = test();

        for (key, value) in previous {
            if let Some(value) = value {
                unsafe { std::env::set_var(key, value) };
            } else {
                unsafe { std::env::remove_var(key) };
            }
        }

        result
    }

    const ALL_KEYS: [&str; 6] = [
        ENV_RELAY_SET_SAMPLE_MS,
        ENV_RECONNECT_DEBOUNCE_MS,
        ENV_MIN_RECONNECT_DELAY_SECS,
        ENV_MAX_RECONNECT_DELAY_SECS,
        ENV_FATAL_COOLDOWN_SECS,
        ENV_STATS_HISTORY,
    ];

    #[test]
    fn defaults_when_env_is_empty() {
        let cleared = ALL_KEYS.map(|key| (key, None));
        with_env(&cleared, || {
            let config = ClientConfig::from_env();
            assert_eq!(config, ClientConfig::default());
            assert_eq!(config.relay_set_sample, Duration::from_millis(300));
            assert_eq!(config.reconnect_debounce, Duration::from_millis(200));
            assert_eq!(config.session.fatal_cooldown_secs, 86_400);
        });
    }

    #[test]
    fn env_overrides_are_applied() {
        with_env(
            &[
                (ENV_RELAY_SET_SAMPLE_MS, Some("50")),
                (ENV_RECONNECT_DEBOUNCE_MS, Some(" 20 ")),
                (ENV_MIN_RECONNECT_DELAY_SECS, Some("2")),
                (ENV_MAX_RECONNECT_DELAY_SECS, Some("60")),
                (ENV_FATAL_COOLDOWN_SECS, Some("3600")),
                (ENV_STATS_HISTORY, Some("10")),
            ],
            || {
                let config = ClientConfig::from_env();
                assert_eq!(config.relay_set_sample, Duration::from_millis(50));
                assert_eq!(config.reconnect_debounce, Duration::from_millis(20));
                assert_eq!(config.session.min_reconnect_delay_secs, 2);
                assert_eq!(config.session.max_reconnect_delay_secs, 60);
                assert_eq!(config.session.fatal_cooldown_secs, 3600);
                assert_eq!(config.session.stats_history, 10);
            },
        );
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let mut overrides = ALL_KEYS.map(|key| (key, None));
        overrides[0] = (ENV_RELAY_SET_SAMPLE_MS, Some("soon"));
        overrides[2] = (ENV_MIN_RECONNECT_DELAY_SECS, Some("0"));
        overrides[5] = (ENV_STATS_HISTORY, Some("-1"));
        with_env(&overrides, || {
            assert_eq!(ClientConfig::from_env(), ClientConfig::default());
        });
    }
}
