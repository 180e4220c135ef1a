//! Per-relay counters and a short diagnostic history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayDebugKind {
    Error,
    Notice,
    Spam,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayDebugMessage {
    pub kind: RelayDebugKind,
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Snapshot-friendly counters for one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStat {
    pub received_bytes: u64,
    pub sent_bytes: u64,
    pub error_count: u64,
    pub notice_count: u64,
    pub spam_count: u64,
    /// Round trip of the last successful handshake.
    pub ping_ms: Option<u64>,
    pub messages: VecDeque<RelayDebugMessage>,
    #[serde(skip)]
    history: usize,
}

impl RelayStat {
    pub fn new(history: usize) -> Self {
        Self {
            received_bytes: 0,
            sent_bytes: 0,
            error_count: 0,
            notice_count: 0,
            spam_count: 0,
            ping_ms: None,
            messages: VecDeque::with_capacity(history),
            history,
        }
    }

    pub fn add_bytes_received(&mut self, bytes: usize) {
        self.received_bytes += bytes as u64;
    }

    pub fn add_bytes_sent(&mut self, bytes: usize) {
        self.sent_bytes += bytes as u64;
    }

    pub fn new_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.push(RelayDebugKind::Error, message.into());
    }

    pub fn new_notice(&mut self, message: impl Into<String>) {
        self.notice_count += 1;
        self.push(RelayDebugKind::Notice, message.into());
    }

    pub fn new_spam(&mut self, message: impl Into<String>) {
        self.spam_count += 1;
        self.push(RelayDebugKind::Spam, message.into());
    }

    fn push(&mut self, kind: RelayDebugKind, message: String) {
        if self.history == 0 {
            return;
        }
        while self.messages.len() >= self.history {
            self.messages.pop_front();
        }
        self.messages.push_back(RelayDebugMessage {
            kind,
            time: Utc::now(),
            message,
        });
    }
}
