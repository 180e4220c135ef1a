//! Pool-wide REQ subscriptions.
//!
//! `PoolRequests` keeps two views of every subscription: the filters the
//! application wants per relay, and what each relay was last sent. Writes
//! are derived from the difference, so asking for the same thing twice
//! costs nothing. A relay that is still replaying stored events for one REQ
//! is not sent a newer version until its EOSE or CLOSED arrives, otherwise
//! the EOSEs of the two versions could not be told apart.
//!
//! The tracker never calls out. Methods return commands to write and
//! callbacks to fire, and the caller runs them after releasing its lock.

use crate::message::Command;
use crate::reconcile::{FilterChange, diff};
use nostr::{Event, Filter, RelayUrl};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Per-subscription observer.
pub trait RequestListener: Send + Sync {
    /// A REQ with these filters was written to the relay.
    fn on_start(&self, _relay: &RelayUrl, _filters: &[Filter]) {}

    /// `is_live` is true once the relay has finished sending stored events.
    fn on_event(
        &self,
        _relay: &RelayUrl,
        _event: &Event,
        _is_live: bool,
        _filters: Option<&[Filter]>,
    ) {
    }

    fn on_eose(&self, _relay: &RelayUrl, _filters: Option<&[Filter]>) {}

    /// The relay ended the subscription.
    fn on_closed(&self, _relay: &RelayUrl, _message: &str, _filters: Option<&[Filter]>) {}

    /// We ended the subscription on this relay.
    fn on_close(&self, _relay: &RelayUrl) {}

    fn on_cannot_connect(&self, _relay: &RelayUrl, _message: &str, _filters: Option<&[Filter]>) {}
}

/// What a relay is doing with the last REQ it was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    /// Written, nothing back yet.
    Sent,
    /// Stored events are arriving.
    QueryingPast,
    /// EOSE seen; new events are live.
    Live,
    /// CLOSE sent or CLOSED received.
    Closed,
}

#[derive(Debug, Clone)]
struct RelayReqState {
    status: ReqStatus,
    filters: Option<Vec<Filter>>,
}

struct WantedSubscription {
    filters: HashMap<RelayUrl, Vec<Filter>>,
    listener: Option<Arc<dyn RequestListener>>,
}

/// Deferred `RequestListener` call.
pub(crate) enum RequestCallback {
    Start {
        listener: Arc<dyn RequestListener>,
        relay: RelayUrl,
        filters: Vec<Filter>,
    },
    Event {
        listener: Arc<dyn RequestListener>,
        relay: RelayUrl,
        event: Event,
        is_live: bool,
        filters: Option<Vec<Filter>>,
    },
    Eose {
        listener: Arc<dyn RequestListener>,
        relay: RelayUrl,
        filters: Option<Vec<Filter>>,
    },
    Closed {
        listener: Arc<dyn RequestListener>,
        relay: RelayUrl,
        message: String,
        filters: Option<Vec<Filter>>,
    },
    Close {
        listener: Arc<dyn RequestListener>,
        relay: RelayUrl,
    },
    CannotConnect {
        listener: Arc<dyn RequestListener>,
        relay: RelayUrl,
        message: String,
        filters: Option<Vec<Filter>>,
    },
}

impl RequestCallback {
    pub(crate) fn fire(self) {
        match self {
            Self::Start {
                listener,
                relay,
                filters,
            } => listener.on_start(&relay, &filters),
            Self::Event {
                listener,
                relay,
                event,
                is_live,
                filters,
            } => listener.on_event(&relay, &event, is_live, filters.as_deref()),
            Self::Eose {
                listener,
                relay,
                filters,
            } => listener.on_eose(&relay, filters.as_deref()),
            Self::Closed {
                listener,
                relay,
                message,
                filters,
            } => listener.on_closed(&relay, &message, filters.as_deref()),
            Self::Close { listener, relay } => listener.on_close(&relay),
            Self::CannotConnect {
                listener,
                relay,
                message,
                filters,
            } => listener.on_cannot_connect(&relay, &message, filters.as_deref()),
        }
    }
}

/// Follow-up after EOSE or CLOSED, plus the callback for the message itself.
pub(crate) struct RequestUpdate {
    pub callback: Option<RequestCallback>,
    pub follow_up: Option<Command>,
}

#[derive(Default)]
pub struct PoolRequests {
    wanted: HashMap<String, WantedSubscription>,
    relay_state: HashMap<String, HashMap<RelayUrl, RelayReqState>>,
    /// Listeners of removed subscriptions, kept until every relay got its CLOSE.
    closing: HashMap<String, Arc<dyn RequestListener>>,
}

impl PoolRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the wanted filters of a subscription. Returns every relay
    /// that may need a write: the ones it used and the ones it uses now.
    pub fn add_or_update(
        &mut self,
        subscription_id: &str,
        filters: HashMap<RelayUrl, Vec<Filter>>,
        listener: Option<Arc<dyn RequestListener>>,
    ) -> HashSet<RelayUrl> {
        let mut affected: HashSet<RelayUrl> = filters.keys().cloned().collect();
        match self.wanted.get_mut(subscription_id) {
            Some(wanted) => {
                affected.extend(wanted.filters.keys().cloned());
                wanted.filters = filters;
                if listener.is_some() {
                    wanted.listener = listener;
                }
            }
            None => {
                let listener = listener.or_else(|| self.closing.remove(subscription_id));
                self.wanted.insert(
                    subscription_id.to_string(),
                    WantedSubscription { filters, listener },
                );
            }
        }
        if let Some(sent) = self.relay_state.get(subscription_id) {
            affected.extend(sent.keys().cloned());
        }
        affected
    }

    /// Forget a subscription. Returns the relays it was sent to, which now need a CLOSE.
    pub fn remove(&mut self, subscription_id: &str) -> HashSet<RelayUrl> {
        let mut affected = HashSet::new();
        let listener = self.wanted.remove(subscription_id).and_then(|wanted| {
            affected.extend(wanted.filters.into_keys());
            wanted.listener
        });
        if let Some(sent) = self.relay_state.get(subscription_id) {
            affected.extend(sent.keys().cloned());
            if let Some(listener) = listener {
                self.closing.insert(subscription_id.to_string(), listener);
            }
        }
        affected
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.wanted.contains_key(subscription_id)
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        self.wanted.keys().cloned().collect()
    }

    pub fn filters(&self, subscription_id: &str) -> Option<HashMap<RelayUrl, Vec<Filter>>> {
        self.wanted
            .get(subscription_id)
            .map(|wanted| wanted.filters.clone())
    }

    /// Relays some subscription wants filters on.
    pub fn wanted_relays(&self) -> HashSet<RelayUrl> {
        self.wanted
            .values()
            .flat_map(|wanted| {
                wanted
                    .filters
                    .iter()
                    .filter(|(_, filters)| !filters.is_empty())
                    .map(|(relay, _)| relay.clone())
            })
            .collect()
    }

    /// Wanted filters on one relay, by subscription.
    pub fn active_filters_for(&self, relay: &RelayUrl) -> HashMap<String, Vec<Filter>> {
        self.wanted
            .iter()
            .filter_map(|(subscription_id, wanted)| {
                wanted
                    .filters
                    .get(relay)
                    .filter(|filters| !filters.is_empty())
                    .map(|filters| (subscription_id.clone(), filters.clone()))
            })
            .collect()
    }

    pub fn status(&self, subscription_id: &str, relay: &RelayUrl) -> Option<ReqStatus> {
        self.relay_state
            .get(subscription_id)
            .and_then(|relays| relays.get(relay))
            .map(|state| state.status)
    }

    /// Commands that bring `relays` in line with what the subscription wants.
    /// A changed REQ is held back while the relay is still answering the last one.
    pub fn commands_for(
        &self,
        subscription_id: &str,
        relays: &HashSet<RelayUrl>,
    ) -> Vec<(RelayUrl, Command)> {
        relays
            .iter()
            .filter_map(|relay| {
                let command = self.change_for(subscription_id, relay)?;
                if matches!(command, Command::Req { .. })
                    && matches!(
                        self.status(subscription_id, relay),
                        Some(ReqStatus::Sent | ReqStatus::QueryingPast)
                    )
                {
                    return None;
                }
                Some((relay.clone(), command))
            })
            .collect()
    }

    /// Full REQ set for a relay that just became ready or authenticated.
    pub fn sync_state(&self, relay: &RelayUrl) -> Vec<Command> {
        self.active_filters_for(relay)
            .into_iter()
            .map(|(subscription_id, filters)| Command::req(subscription_id, filters))
            .collect()
    }

    pub(crate) fn on_sent(
        &mut self,
        relay: &RelayUrl,
        command: &Command,
    ) -> Option<RequestCallback> {
        match command {
            Command::Req {
                subscription_id,
                filters,
            } => {
                self.relay_state
                    .entry(subscription_id.clone())
                    .or_default()
                    .insert(
                        relay.clone(),
                        RelayReqState {
                            status: ReqStatus::Sent,
                            filters: Some(filters.clone()),
                        },
                    );
                let listener = self.listener(subscription_id)?;
                Some(RequestCallback::Start {
                    listener,
                    relay: relay.clone(),
                    filters: filters.clone(),
                })
            }
            Command::Close { subscription_id } => {
                let relays = self.relay_state.get_mut(subscription_id)?;
                relays.remove(relay)?;
                let emptied = relays.is_empty();
                let listener = self.listener(subscription_id);
                if emptied {
                    self.relay_state.remove(subscription_id);
                    self.closing.remove(subscription_id);
                }
                Some(RequestCallback::Close {
                    listener: listener?,
                    relay: relay.clone(),
                })
            }
            Command::Count { .. } | Command::Event(_) | Command::Auth(_) => None,
        }
    }

    /// `after_eose` is the session's view at arrival, which stays right even
    /// when the EOSE was handled before this queued event.
    pub(crate) fn on_event(
        &mut self,
        relay: &RelayUrl,
        subscription_id: &str,
        event: &Event,
        after_eose: bool,
    ) -> Option<RequestCallback> {
        let state = self
            .relay_state
            .get_mut(subscription_id)
            .and_then(|relays| relays.get_mut(relay));
        let filters = state.and_then(|state| {
            if state.status == ReqStatus::Sent {
                state.status = ReqStatus::QueryingPast;
            }
            state.filters.clone()
        });
        let listener = self.listener(subscription_id)?;
        Some(RequestCallback::Event {
            listener,
            relay: relay.clone(),
            event: event.clone(),
            is_live: after_eose,
            filters,
        })
    }

    pub(crate) fn on_eose(&mut self, relay: &RelayUrl, subscription_id: &str) -> RequestUpdate {
        let filters = self.set_status(subscription_id, relay, ReqStatus::Live);
        let callback = self
            .listener(subscription_id)
            .map(|listener| RequestCallback::Eose {
                listener,
                relay: relay.clone(),
                filters,
            });
        RequestUpdate {
            callback,
            follow_up: self.change_for(subscription_id, relay),
        }
    }

    pub(crate) fn on_closed(
        &mut self,
        relay: &RelayUrl,
        subscription_id: &str,
        message: &str,
    ) -> RequestUpdate {
        // The sent filters stay recorded so the same REQ is not retried in a loop.
        let filters = self.set_status(subscription_id, relay, ReqStatus::Closed);
        let callback = self
            .listener(subscription_id)
            .map(|listener| RequestCallback::Closed {
                listener,
                relay: relay.clone(),
                message: message.to_string(),
                filters,
            });
        let follow_up = self
            .change_for(subscription_id, relay)
            .filter(|command| !matches!(command, Command::Close { .. }));
        RequestUpdate {
            callback,
            follow_up,
        }
    }

    /// The relay's connection is gone: nothing is open there anymore.
    pub(crate) fn on_disconnected(&mut self, relay: &RelayUrl) {
        self.relay_state.retain(|_, relays| {
            relays.remove(relay);
            !relays.is_empty()
        });
        let relay_state = &self.relay_state;
        self.closing
            .retain(|subscription_id, _| relay_state.contains_key(subscription_id));
    }

    pub(crate) fn on_cannot_connect(
        &mut self,
        relay: &RelayUrl,
        message: &str,
    ) -> Vec<RequestCallback> {
        self.on_disconnected(relay);
        self.wanted
            .values()
            .filter_map(|wanted| {
                let filters = wanted.filters.get(relay)?;
                let listener = wanted.listener.clone()?;
                Some(RequestCallback::CannotConnect {
                    listener,
                    relay: relay.clone(),
                    message: message.to_string(),
                    filters: Some(filters.clone()),
                })
            })
            .collect()
    }

    fn change_for(&self, subscription_id: &str, relay: &RelayUrl) -> Option<Command> {
        let sent = self
            .relay_state
            .get(subscription_id)
            .and_then(|relays| relays.get(relay))
            .and_then(|state| state.filters.as_deref());
        let wanted = self
            .wanted
            .get(subscription_id)
            .and_then(|wanted| wanted.filters.get(relay))
            .map(Vec::as_slice);

        match diff(sent, wanted) {
            FilterChange::Open(filters) => Some(Command::req(subscription_id, filters)),
            FilterChange::Close => Some(Command::close(subscription_id)),
            FilterChange::Unchanged => None,
        }
    }

    fn set_status(
        &mut self,
        subscription_id: &str,
        relay: &RelayUrl,
        status: ReqStatus,
    ) -> Option<Vec<Filter>> {
        let state = self
            .relay_state
            .get_mut(subscription_id)?
            .get_mut(relay)?;
        state.status = status;
        state.filters.clone()
    }

    fn listener(&self, subscription_id: &str) -> Option<Arc<dyn RequestListener>> {
        match self.wanted.get(subscription_id) {
            Some(wanted) => wanted.listener.clone(),
            None => self.closing.get(subscription_id).cloned(),
        }
    }
}
