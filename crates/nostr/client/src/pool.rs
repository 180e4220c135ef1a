//! Relay pool: the set of sessions the client currently needs.

use crate::config::SessionConfig;
use crate::listener::RelayListener;
use crate::message::Command;
use crate::relay::RelaySession;
use crate::stats::RelayStat;
use crate::transport::WebSocketBuilder;
use nostr::RelayUrl;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info};

/// Which pool relays are open right now, and which exist at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayPoolStatus {
    pub connected: HashSet<RelayUrl>,
    pub available: HashSet<RelayUrl>,
}

impl RelayPoolStatus {
    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }
}

/// Sessions keyed by relay. All sessions share one listener.
pub struct RelayPool {
    sessions: RwLock<HashMap<RelayUrl, Arc<RelaySession>>>,
    builder: Arc<dyn WebSocketBuilder>,
    listener: Arc<dyn RelayListener>,
    config: SessionConfig,
    runtime: Handle,
    status: watch::Sender<RelayPoolStatus>,
}

impl RelayPool {
    pub fn new(
        builder: Arc<dyn WebSocketBuilder>,
        listener: Arc<dyn RelayListener>,
        config: SessionConfig,
        runtime: Handle,
    ) -> Self {
        let (status, _) = watch::channel(RelayPoolStatus::default());
        Self {
            sessions: RwLock::new(HashMap::new()),
            builder,
            listener,
            config,
            runtime,
            status,
        }
    }

    pub fn get(&self, url: &RelayUrl) -> Option<Arc<RelaySession>> {
        self.read().get(url).cloned()
    }

    /// Existing session for `url`, or a new idle one.
    pub fn get_or_create(&self, url: &RelayUrl) -> Arc<RelaySession> {
        if let Some(session) = self.get(url) {
            return session;
        }
        let (session, created) = {
            let mut sessions = self.write();
            match sessions.get(url) {
                Some(session) => (Arc::clone(session), false),
                None => {
                    let session = self.new_session(url);
                    sessions.insert(url.clone(), Arc::clone(&session));
                    (session, true)
                }
            }
        };
        if created {
            debug!("relay {} joined the pool", url);
            self.publish_status();
        }
        session
    }

    pub fn contains(&self, url: &RelayUrl) -> bool {
        self.read().contains_key(url)
    }

    pub fn sessions(&self) -> Vec<Arc<RelaySession>> {
        self.read().values().cloned().collect()
    }

    /// Make the pool hold exactly `wanted`. Dropped sessions are disconnected.
    /// Returns whether membership changed.
    pub fn update_pool(&self, wanted: &HashSet<RelayUrl>) -> bool {
        let removed: Vec<Arc<RelaySession>> = {
            let mut sessions = self.write();
            let mut removed = Vec::new();
            sessions.retain(|url, session| {
                let keep = wanted.contains(url);
                if !keep {
                    removed.push(Arc::clone(session));
                }
                keep
            });
            let before = sessions.len();
            for url in wanted {
                if !sessions.contains_key(url) {
                    let session = self.new_session(url);
                    sessions.insert(url.clone(), session);
                }
            }
            if removed.is_empty() && sessions.len() == before {
                return false;
            }
            removed
        };

        for session in &removed {
            debug!("relay {} left the pool", session.url());
            session.disconnect();
        }
        info!("relay pool now holds {} relays", self.read().len());
        self.publish_status();
        true
    }

    pub fn connect(&self) {
        for session in self.sessions() {
            session.connect();
        }
    }

    pub fn disconnect(&self) {
        for session in self.sessions() {
            session.disconnect();
        }
    }

    /// Redial sessions whose transport died; dial idle ones once their
    /// backoff window has passed.
    pub fn reconnect_if_needs_to(&self, ignore_retry_delays: bool) {
        for session in self.sessions() {
            if session.has_stale_socket() {
                debug!("relay {} has a stale socket, redialing", session.url());
                session.disconnect();
                session.connect();
            } else {
                session.connect_and_sync_if_disconnected(ignore_retry_delays);
            }
        }
    }

    /// Drop every connection and dial again.
    pub fn reconnect_all(&self) {
        for session in self.sessions() {
            session.disconnect();
            session.connect();
        }
    }

    pub fn send_if_connected(&self, url: &RelayUrl, command: Command) {
        if let Some(session) = self.get(url) {
            session.send_if_connected(command);
        }
    }

    pub fn send_or_connect_and_sync(&self, url: &RelayUrl, command: Command) {
        self.get_or_create(url).send_or_connect_and_sync(command);
    }

    pub fn connected_relays(&self) -> HashSet<RelayUrl> {
        self.read()
            .iter()
            .filter(|(_, session)| session.is_connected())
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn available_relays(&self) -> HashSet<RelayUrl> {
        self.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> HashMap<RelayUrl, RelayStat> {
        self.read()
            .iter()
            .map(|(url, session)| (url.clone(), session.stats()))
            .collect()
    }

    /// Receiver that sees a new value whenever membership or connectivity changes.
    pub fn status(&self) -> watch::Receiver<RelayPoolStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> RelayPoolStatus {
        self.status.borrow().clone()
    }

    pub fn publish_status(&self) {
        let next = RelayPoolStatus {
            connected: self.connected_relays(),
            available: self.available_relays(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn new_session(&self, url: &RelayUrl) -> Arc<RelaySession> {
        RelaySession::new(
            url.clone(),
            Arc::clone(&self.builder),
            Arc::clone(&self.listener),
            &self.config,
            &self.runtime,
        )
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RelayUrl, Arc<RelaySession>>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RelayUrl, Arc<RelaySession>>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
