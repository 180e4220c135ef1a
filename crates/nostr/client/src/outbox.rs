//! Outgoing events awaiting relay acknowledgement.
//!
//! An event stays queued for a relay until that relay answers OK true.
//! Disconnects put sent events back to `Sending` so the next resync replays
//! them. A plain rejection is final for that relay; an `auth-required` one
//! waits for authentication and is replayed after it.

use crate::message::Command;
use nostr::{Event, RelayUrl, is_auth_required};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Queued for the next write or resync.
    Sending,
    /// Written, no OK yet.
    Sent,
    /// Refused until the connection authenticates.
    NeedsAuth,
    /// Refused for good.
    Rejected,
}

impl OutboxStatus {
    fn is_pending(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

struct OutboxEntry {
    event: Event,
    relays: HashMap<RelayUrl, OutboxStatus>,
}

#[derive(Default)]
pub struct PoolEventOutbox {
    entries: HashMap<String, OutboxEntry>,
}

impl PoolEventOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `event` for `relays`. Relays that already acknowledged it are
    /// not tracked anymore, so asking again sends it again.
    pub fn mark_as_sending(&mut self, event: &Event, relays: &HashSet<RelayUrl>) {
        let entry = self
            .entries
            .entry(event.id.clone())
            .or_insert_with(|| OutboxEntry {
                event: event.clone(),
                relays: HashMap::new(),
            });
        for relay in relays {
            entry.relays.insert(relay.clone(), OutboxStatus::Sending);
        }
    }

    /// EVENT writes for relays still waiting on `event_id`.
    pub fn commands_for(&self, event_id: &str) -> Vec<(RelayUrl, Command)> {
        let Some(entry) = self.entries.get(event_id) else {
            return Vec::new();
        };
        entry
            .relays
            .iter()
            .filter(|(_, status)| **status == OutboxStatus::Sending)
            .map(|(relay, _)| (relay.clone(), Command::Event(entry.event.clone())))
            .collect()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.entries.contains_key(event_id)
    }

    pub fn status(&self, event_id: &str, relay: &RelayUrl) -> Option<OutboxStatus> {
        self.entries
            .get(event_id)
            .and_then(|entry| entry.relays.get(relay))
            .copied()
    }

    /// Relays that still owe an acknowledgement.
    pub fn wanted_relays(&self) -> HashSet<RelayUrl> {
        self.entries
            .values()
            .flat_map(|entry| {
                entry
                    .relays
                    .iter()
                    .filter(|(_, status)| status.is_pending())
                    .map(|(relay, _)| relay.clone())
            })
            .collect()
    }

    /// Events queued for one relay with their status.
    pub fn active_outbox_for(&self, relay: &RelayUrl) -> HashMap<String, OutboxStatus> {
        self.entries
            .iter()
            .filter_map(|(event_id, entry)| {
                entry
                    .relays
                    .get(relay)
                    .map(|status| (event_id.clone(), *status))
            })
            .collect()
    }

    /// Replay every unacknowledged event to a relay that just became ready
    /// or authenticated.
    pub fn sync_state(&self, relay: &RelayUrl) -> Vec<Command> {
        self.entries
            .values()
            .filter(|entry| {
                entry
                    .relays
                    .get(relay)
                    .is_some_and(|status| status.is_pending())
            })
            .map(|entry| Command::Event(entry.event.clone()))
            .collect()
    }

    pub(crate) fn on_sent(&mut self, relay: &RelayUrl, command: &Command, success: bool) {
        let Command::Event(event) = command else {
            return;
        };
        if !success {
            return;
        }
        if let Some(status) = self
            .entries
            .get_mut(&event.id)
            .and_then(|entry| entry.relays.get_mut(relay))
        {
            *status = OutboxStatus::Sent;
        }
    }

    /// Returns whether `relay` stopped owing an acknowledgement for this event.
    pub(crate) fn on_ok(
        &mut self,
        relay: &RelayUrl,
        event_id: &str,
        success: bool,
        message: &str,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(event_id) else {
            return false;
        };
        if !entry.relays.contains_key(relay) {
            return false;
        }
        if success {
            entry.relays.remove(relay);
            if entry.relays.is_empty() {
                self.entries.remove(event_id);
            }
            return true;
        }
        let status = if is_auth_required(message) {
            OutboxStatus::NeedsAuth
        } else {
            OutboxStatus::Rejected
        };
        entry.relays.insert(relay.clone(), status);
        !status.is_pending()
    }

    /// Forget relays that refused an event for good. Returns how many legs
    /// were dropped.
    pub fn prune_rejected(&mut self) -> usize {
        let mut pruned = 0;
        self.entries.retain(|_, entry| {
            let before = entry.relays.len();
            entry.relays.retain(|_, status| status.is_pending());
            pruned += before - entry.relays.len();
            !entry.relays.is_empty()
        });
        pruned
    }

    /// Unacknowledged writes on a dead connection go back in the queue.
    pub(crate) fn on_disconnected(&mut self, relay: &RelayUrl) {
        for entry in self.entries.values_mut() {
            if let Some(status) = entry.relays.get_mut(relay)
                && *status == OutboxStatus::Sent
            {
                *status = OutboxStatus::Sending;
            }
        }
    }
}
