//! Pool-wide COUNT queries.
//!
//! Same bookkeeping as REQ subscriptions, except that a relay leg ends with
//! its COUNT answer: once every relay has answered, the query is dropped.

use crate::message::Command;
use crate::reconcile::{FilterChange, diff};
use nostr::{Filter, RelayUrl};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub trait CountListener: Send + Sync {
    fn on_count(&self, _relay: &RelayUrl, _count: u64, _filters: Option<&[Filter]>) {}

    fn on_closed(&self, _relay: &RelayUrl, _message: &str) {}

    fn on_cannot_connect(&self, _relay: &RelayUrl, _message: &str) {}
}

struct CountQuery {
    filters: HashMap<RelayUrl, Vec<Filter>>,
    listener: Option<Arc<dyn CountListener>>,
}

pub(crate) enum CountCallback {
    Count {
        listener: Arc<dyn CountListener>,
        relay: RelayUrl,
        count: u64,
        filters: Option<Vec<Filter>>,
    },
    Closed {
        listener: Arc<dyn CountListener>,
        relay: RelayUrl,
        message: String,
    },
    CannotConnect {
        listener: Arc<dyn CountListener>,
        relay: RelayUrl,
        message: String,
    },
}

impl CountCallback {
    pub(crate) fn fire(self) {
        match self {
            Self::Count {
                listener,
                relay,
                count,
                filters,
            } => listener.on_count(&relay, count, filters.as_deref()),
            Self::Closed {
                listener,
                relay,
                message,
            } => listener.on_closed(&relay, &message),
            Self::CannotConnect {
                listener,
                relay,
                message,
            } => listener.on_cannot_connect(&relay, &message),
        }
    }
}

#[derive(Default)]
pub struct PoolCounts {
    queries: HashMap<String, CountQuery>,
    sent: HashMap<String, HashMap<RelayUrl, Vec<Filter>>>,
}

impl PoolCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every relay that may need a write.
    pub fn add_or_update(
        &mut self,
        query_id: &str,
        filters: HashMap<RelayUrl, Vec<Filter>>,
        listener: Option<Arc<dyn CountListener>>,
    ) -> HashSet<RelayUrl> {
        let mut affected: HashSet<RelayUrl> = filters.keys().cloned().collect();
        match self.queries.get_mut(query_id) {
            Some(query) => {
                affected.extend(query.filters.keys().cloned());
                query.filters = filters;
                if listener.is_some() {
                    query.listener = listener;
                }
            }
            None => {
                self.queries
                    .insert(query_id.to_string(), CountQuery { filters, listener });
            }
        }
        if let Some(sent) = self.sent.get(query_id) {
            affected.extend(sent.keys().cloned());
        }
        affected
    }

    pub fn remove(&mut self, query_id: &str) -> HashSet<RelayUrl> {
        let mut affected = HashSet::new();
        if let Some(query) = self.queries.remove(query_id) {
            affected.extend(query.filters.into_keys());
        }
        if let Some(sent) = self.sent.get(query_id) {
            affected.extend(sent.keys().cloned());
        }
        affected
    }

    pub fn contains(&self, query_id: &str) -> bool {
        self.queries.contains_key(query_id)
    }

    pub fn query_ids(&self) -> Vec<String> {
        self.queries.keys().cloned().collect()
    }

    pub fn wanted_relays(&self) -> HashSet<RelayUrl> {
        self.queries
            .values()
            .flat_map(|query| {
                query
                    .filters
                    .iter()
                    .filter(|(_, filters)| !filters.is_empty())
                    .map(|(relay, _)| relay.clone())
            })
            .collect()
    }

    /// Unanswered COUNT filters on one relay, by query.
    pub fn active_counts_for(&self, relay: &RelayUrl) -> HashMap<String, Vec<Filter>> {
        self.queries
            .iter()
            .filter_map(|(query_id, query)| {
                query
                    .filters
                    .get(relay)
                    .filter(|filters| !filters.is_empty())
                    .map(|filters| (query_id.clone(), filters.clone()))
            })
            .collect()
    }

    pub fn commands_for(
        &self,
        query_id: &str,
        relays: &HashSet<RelayUrl>,
    ) -> Vec<(RelayUrl, Command)> {
        relays
            .iter()
            .filter_map(|relay| {
                self.change_for(query_id, relay)
                    .map(|command| (relay.clone(), command))
            })
            .collect()
    }

    pub fn sync_state(&self, relay: &RelayUrl) -> Vec<Command> {
        self.active_counts_for(relay)
            .into_iter()
            .map(|(query_id, filters)| Command::count(query_id, filters))
            .collect()
    }

    pub(crate) fn on_sent(&mut self, relay: &RelayUrl, command: &Command) {
        match command {
            Command::Count {
                subscription_id,
                filters,
            } => {
                self.sent
                    .entry(subscription_id.clone())
                    .or_default()
                    .insert(relay.clone(), filters.clone());
            }
            Command::Close { subscription_id } => self.forget_sent(subscription_id, relay),
            Command::Req { .. } | Command::Event(_) | Command::Auth(_) => {}
        }
    }

    /// Record the answer and retire this relay's leg of the query.
    pub(crate) fn on_count(
        &mut self,
        relay: &RelayUrl,
        query_id: &str,
        count: u64,
    ) -> Option<CountCallback> {
        let filters = self.sent.get(query_id).and_then(|sent| sent.get(relay)).cloned();
        let listener = self.retire(query_id, relay)?;
        Some(CountCallback::Count {
            listener,
            relay: relay.clone(),
            count,
            filters,
        })
    }

    /// A refused COUNT is not retried on this relay.
    pub(crate) fn on_closed(
        &mut self,
        relay: &RelayUrl,
        query_id: &str,
        message: &str,
    ) -> Option<CountCallback> {
        let listener = self.retire(query_id, relay)?;
        Some(CountCallback::Closed {
            listener,
            relay: relay.clone(),
            message: message.to_string(),
        })
    }

    pub(crate) fn on_disconnected(&mut self, relay: &RelayUrl) {
        self.sent.retain(|_, relays| {
            relays.remove(relay);
            !relays.is_empty()
        });
    }

    pub(crate) fn on_cannot_connect(
        &mut self,
        relay: &RelayUrl,
        message: &str,
    ) -> Vec<CountCallback> {
        self.on_disconnected(relay);
        self.queries
            .values()
            .filter(|query| query.filters.contains_key(relay))
            .filter_map(|query| query.listener.clone())
            .map(|listener| CountCallback::CannotConnect {
                listener,
                relay: relay.clone(),
                message: message.to_string(),
            })
            .collect()
    }

    fn retire(&mut self, query_id: &str, relay: &RelayUrl) -> Option<Arc<dyn CountListener>> {
        self.forget_sent(query_id, relay);
        let query = self.queries.get_mut(query_id)?;
        query.filters.remove(relay);
        let listener = query.listener.clone();
        if query.filters.is_empty() {
            self.queries.remove(query_id);
        }
        listener
    }

    fn forget_sent(&mut self, query_id: &str, relay: &RelayUrl) {
        if let Some(relays) = self.sent.get_mut(query_id) {
            relays.remove(relay);
            if relays.is_empty() {
                self.sent.remove(query_id);
            }
        }
    }

    fn change_for(&self, query_id: &str, relay: &RelayUrl) -> Option<Command> {
        let sent = self
            .sent
            .get(query_id)
            .and_then(|relays| relays.get(relay))
            .map(Vec::as_slice);
        let wanted = self
            .queries
            .get(query_id)
            .and_then(|query| query.filters.get(relay))
            .map(Vec::as_slice);

        match diff(sent, wanted) {
            FilterChange::Open(filters) => Some(Command::count(query_id, filters)),
            FilterChange::Close => Some(Command::close(query_id)),
            FilterChange::Unchanged => None,
        }
    }
}
