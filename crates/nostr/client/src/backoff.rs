//! Reconnect delay bookkeeping for one relay.

use crate::config::SessionConfig;

/// Failure messages produced by our own teardown rather than by the relay.
const LOCAL_CLOSE_MESSAGES: [&str; 3] = ["Socket closed", "Socket is closed", "Cancelled"];

/// Exponential reconnect delay with a floor, a ceiling and a long cooldown.
///
/// Ordinary failures double the delay until it reaches the ceiling. A fatal
/// failure pins the cooldown, which sits above the ceiling, so later ordinary
/// failures leave it alone. Only `reset` brings the delay back down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    delay_secs: u64,
    min_secs: u64,
    max_secs: u64,
    fatal_secs: u64,
}

impl ReconnectBackoff {
    pub fn new(config: &SessionConfig) -> Self {
        let min_secs = config.min_reconnect_delay_secs.max(1);
        Self {
            delay_secs: min_secs,
            min_secs,
            max_secs: config.max_reconnect_delay_secs.max(min_secs),
            fatal_secs: config.fatal_cooldown_secs,
        }
    }

    pub fn delay_secs(&self) -> u64 {
        self.delay_secs
    }

    pub fn reset(&mut self) {
        self.delay_secs = self.min_secs;
    }

    pub fn record_failure(&mut self) {
        if self.delay_secs < self.max_secs {
            self.delay_secs = self.delay_secs.saturating_mul(2).min(self.max_secs);
        }
    }

    pub fn pin_fatal(&mut self) {
        self.delay_secs = self.delay_secs.max(self.fatal_secs);
    }

    /// Whether a new dial is allowed `now_secs` after an attempt at `last_attempt_secs`.
    pub fn may_retry(&self, last_attempt_secs: u64, now_secs: u64) -> bool {
        now_secs > last_attempt_secs.saturating_add(self.delay_secs)
    }
}

/// Handshakes answered with an HTTP status, or routes that do not exist, are
/// not worth retrying soon.
pub fn is_fatal_failure(code: Option<u16>, message: &str) -> bool {
    code.is_some() || message.ends_with("Host unreachable")
}

/// Failures caused by closing the socket locally are not reported as cannot-connect.
pub fn is_local_close(message: &str) -> bool {
    LOCAL_CLOSE_MESSAGES.contains(&message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ReconnectBackoff {
        ReconnectBackoff::new(&SessionConfig::default())
    }

    #[test]
    fn doubles_up_to_ceiling() {
        let mut backoff = backoff();
        let mut seen = vec![backoff.delay_secs()];
        for _ in 0..10 {
            backoff.record_failure();
            seen.push(backoff.delay_secs());
        }
        assert_eq!(
            seen,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300]
        );
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut backoff = backoff();
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        assert_eq!(backoff.delay_secs(), 1);
    }

    #[test]
    fn fatal_cooldown_is_not_shortened_by_ordinary_failures() {
        let mut backoff = backoff();
        backoff.pin_fatal();
        assert_eq!(backoff.delay_secs(), 86_400);
        backoff.record_failure();
        assert_eq!(backoff.delay_secs(), 86_400);
        backoff.reset();
        assert_eq!(backoff.delay_secs(), 1);
    }

    #[test]
    fn retry_window() {
        let mut backoff = backoff();
        backoff.record_failure();
        assert!(!backoff.may_retry(100, 101));
        assert!(!backoff.may_retry(100, 102));
        assert!(backoff.may_retry(100, 103));
        assert!(backoff.may_retry(0, 1_700_000_000));
    }

    #[test]
    fn failure_classification() {
        struct Case {
            name: &'static str,
            code: Option<u16>,
            message: &'static str,
            fatal: bool,
            local: bool,
        }

        let cases = vec![
            Case {
                name: "http status",
                code: Some(403),
                message: "HTTP error: 403 Forbidden",
                fatal: true,
                local: false,
            },
            Case {
                name: "unreachable host",
                code: None,
                message: "SOCKS: Host unreachable",
                fatal: true,
                local: false,
            },
            Case {
                name: "connection refused",
                code: None,
                message: "Connection refused (os error 111)",
                fatal: false,
                local: false,
            },
            Case {
                name: "local close",
                code: None,
                message: "Socket closed",
                fatal: false,
                local: true,
            },
            Case {
                name: "cancelled",
                code: None,
                message: "Cancelled",
                fatal: false,
                local: true,
            },
        ];

        for case in cases {
            assert_eq!(
                is_fatal_failure(case.code, case.message),
                case.fatal,
                "{}",
                case.name
            );
            assert_eq!(is_local_close(case.message), case.local, "{}", case.name);
        }
    }
}
