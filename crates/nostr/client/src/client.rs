//! Demand-driven client over a relay pool.
//!
//! `NostrClient` merges three demand sources (REQ subscriptions, COUNT
//! queries and the outbox) into the set of relays it keeps sessions for,
//! writes only what changed, and replays everything a relay should have
//! whenever that relay becomes ready or authenticates.

use crate::config::ClientConfig;
use crate::count::{CountCallback, CountListener, PoolCounts};
use crate::error::{ClientError, RelayError, Result};
use crate::listener::{ListenerSet, RelayListener};
use crate::message::Command;
use crate::outbox::{OutboxStatus, PoolEventOutbox};
use crate::pool::{RelayPool, RelayPoolStatus};
use crate::relay::RelaySession;
use crate::stats::RelayStat;
use crate::subscription::{PoolRequests, RequestCallback, RequestListener};
use crate::transport::WebSocketBuilder;
use nostr::{Event, Filter, RelayUrl};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signs NIP-42 replies for relays that ask for authentication.
pub trait AuthSigner: Send + Sync {
    /// A kind 22242 event carrying `challenge`, or `None` to stay anonymous.
    fn sign_auth(&self, relay: &RelayUrl, challenge: &str) -> Option<Event>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReconnectRequest {
    only_if_changed: bool,
    ignore_retry_delays: bool,
}

impl ReconnectRequest {
    /// Two requests inside one debounce window run as one sweep.
    fn merge(self, other: Self) -> Self {
        Self {
            only_if_changed: self.only_if_changed && other.only_if_changed,
            ignore_retry_delays: self.ignore_retry_delays || other.ignore_retry_delays,
        }
    }
}

pub struct NostrClient {
    config: ClientConfig,
    pool: RelayPool,
    requests: Mutex<PoolRequests>,
    counts: Mutex<PoolCounts>,
    outbox: Mutex<PoolEventOutbox>,
    listeners: ListenerSet,
    signer: RwLock<Option<Arc<dyn AuthSigner>>>,
    active: AtomicBool,
    relay_set_changed: Arc<Notify>,
    reconnects: mpsc::UnboundedSender<ReconnectRequest>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NostrClient {
    /// Build an inactive client. Must be called inside a tokio runtime.
    pub fn new(builder: Arc<dyn WebSocketBuilder>, config: ClientConfig) -> Result<Arc<Self>> {
        let runtime =
            Handle::try_current().map_err(|error| ClientError::Runtime(error.to_string()))?;
        let (reconnects, reconnect_queue) = mpsc::unbounded_channel();
        let relay_set_changed = Arc::new(Notify::new());

        let client = Arc::new_cyclic(|weak_self: &Weak<NostrClient>| {
            let hook = Arc::new(ClientHook {
                client: weak_self.clone(),
            });
            Self {
                pool: RelayPool::new(builder, hook, config.session.clone(), runtime.clone()),
                config,
                requests: Mutex::new(PoolRequests::new()),
                counts: Mutex::new(PoolCounts::new()),
                outbox: Mutex::new(PoolEventOutbox::new()),
                listeners: ListenerSet::new(),
                signer: RwLock::new(None),
                active: AtomicBool::new(false),
                relay_set_changed: Arc::clone(&relay_set_changed),
                reconnects,
                tasks: Mutex::new(Vec::new()),
            }
        });

        let weak = Arc::downgrade(&client);
        let sampler = runtime.spawn(sample_relay_set(
            weak.clone(),
            relay_set_changed,
            client.config.relay_set_sample,
        ));
        let debouncer = runtime.spawn(debounce_reconnects(
            weak,
            reconnect_queue,
            client.config.reconnect_debounce,
        ));
        client.tasks().extend([sampler, debouncer]);
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    /// Allow traffic again. Nothing is resent until `reconnect` is asked for.
    pub fn connect(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("relay client activated");
        }
    }

    /// Stop all traffic and drop every connection.
    pub fn disconnect(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("relay client deactivated");
        }
        self.pool.disconnect();
        self.pool.publish_status();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Queue a reconnect sweep. With `only_if_changed` only dead or idle
    /// sessions are dialed; otherwise every session is dropped and dialed.
    pub fn reconnect(&self, only_if_changed: bool, ignore_retry_delays: bool) {
        if !self.is_active() {
            return;
        }
        let request = ReconnectRequest {
            only_if_changed,
            ignore_retry_delays,
        };
        if self.reconnects.send(request).is_err() {
            debug!("reconnect queue is closed");
        }
    }

    /// Open or update a REQ subscription. Only relays whose filters changed
    /// are written to.
    pub fn open_req_subscription(
        &self,
        subscription_id: &str,
        filters: HashMap<RelayUrl, Vec<Filter>>,
        listener: Option<Arc<dyn RequestListener>>,
    ) {
        let commands = {
            let mut requests = self.requests();
            let affected = requests.add_or_update(subscription_id, filters, listener);
            requests.commands_for(subscription_id, &affected)
        };
        self.dispatch_all(commands);
        self.relay_set_changed.notify_one();
        self.reconnect(true, false);
    }

    /// Ask relays for a COUNT. Each relay leg ends with its answer.
    pub fn query_count(
        &self,
        query_id: &str,
        filters: HashMap<RelayUrl, Vec<Filter>>,
        listener: Option<Arc<dyn CountListener>>,
    ) {
        let commands = {
            let mut counts = self.counts();
            let affected = counts.add_or_update(query_id, filters, listener);
            counts.commands_for(query_id, &affected)
        };
        self.dispatch_all(commands);
        self.relay_set_changed.notify_one();
        self.reconnect(true, false);
    }

    /// Drop a subscription or count query. CLOSE goes only to relays that
    /// had it open.
    pub fn close(&self, subscription_id: &str) {
        let mut commands = {
            let mut requests = self.requests();
            let affected = requests.remove(subscription_id);
            requests.commands_for(subscription_id, &affected)
        };
        commands.extend({
            let mut counts = self.counts();
            let affected = counts.remove(subscription_id);
            counts.commands_for(subscription_id, &affected)
        });
        self.dispatch_all(commands);
        self.relay_set_changed.notify_one();
    }

    /// Publish `event` to `relays`. It stays queued per relay until that
    /// relay answers OK true. AUTH events skip the queue.
    pub fn send(&self, event: &Event, relays: &HashSet<RelayUrl>) {
        if event.is_auth() {
            for relay in relays {
                if let Some(session) = self.pool.get(relay) {
                    session.send(event.clone());
                }
            }
            return;
        }

        let commands = {
            let mut outbox = self.outbox();
            outbox.mark_as_sending(event, relays);
            outbox.commands_for(&event.id)
        };
        self.dispatch_all(commands);
        self.relay_set_changed.notify_one();
        self.reconnect(true, false);
    }

    /// Replay everything `session` should have: REQ and COUNT filters and
    /// unacknowledged events.
    pub fn renew_filters(&self, session: &RelaySession) {
        if !self.is_active() {
            return;
        }
        let relay = session.url();
        let mut commands = self.requests().sync_state(relay);
        commands.extend(self.counts().sync_state(relay));
        let events = self.outbox().sync_state(relay);
        debug!(
            "renewing {} filters and {} events on {}",
            commands.len(),
            events.len(),
            relay
        );

        for command in commands {
            session.send_if_connected(command);
        }
        for command in events {
            if let Command::Event(event) = command {
                session.send(event);
            }
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn RelayListener>) {
        self.listeners.add(listener);
    }

    pub fn unsubscribe(&self, listener: &Arc<dyn RelayListener>) {
        self.listeners.remove(listener);
    }

    pub fn is_subscribed(&self, listener: &Arc<dyn RelayListener>) -> bool {
        self.listeners.contains(listener)
    }

    /// Answer AUTH challenges with this signer from now on.
    pub fn set_auth_signer(&self, signer: Option<Arc<dyn AuthSigner>>) {
        *self
            .signer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = signer;
    }

    /// Wanted REQ filters on a relay, by subscription.
    pub fn active_requests(&self, relay: &RelayUrl) -> HashMap<String, Vec<Filter>> {
        self.requests().active_filters_for(relay)
    }

    pub fn active_counts(&self, relay: &RelayUrl) -> HashMap<String, Vec<Filter>> {
        self.counts().active_counts_for(relay)
    }

    pub fn active_outbox(&self, relay: &RelayUrl) -> HashMap<String, OutboxStatus> {
        self.outbox().active_outbox_for(relay)
    }

    /// Drop events relays refused for good, and the sessions only they kept.
    pub fn prune_rejected_outbox(&self) -> usize {
        let pruned = self.outbox().prune_rejected();
        if pruned > 0 {
            self.relay_set_changed.notify_one();
        }
        pruned
    }

    pub fn relay_stats(&self) -> HashMap<RelayUrl, RelayStat> {
        self.pool.stats()
    }

    pub fn relay_status(&self) -> watch::Receiver<RelayPoolStatus> {
        self.pool.status()
    }

    /// Recompute the wanted relay set now instead of at the next sample.
    pub fn update_relay_set(&self) {
        let mut wanted = self.requests().wanted_relays();
        wanted.extend(self.counts().wanted_relays());
        wanted.extend(self.outbox().wanted_relays());
        self.pool.update_pool(&wanted);
    }

    fn reconnect_now(&self, request: ReconnectRequest) {
        if !self.is_active() {
            return;
        }
        self.update_relay_set();
        if request.only_if_changed {
            self.pool.reconnect_if_needs_to(request.ignore_retry_delays);
        } else {
            info!("reconnecting every relay");
            self.pool.reconnect_all();
        }
    }

    fn dispatch_all(&self, commands: Vec<(RelayUrl, Command)>) {
        for (relay, command) in commands {
            self.dispatch(&relay, command);
        }
    }

    /// CLOSE and AUTH never dial; everything else dials on demand.
    fn dispatch(&self, relay: &RelayUrl, command: Command) {
        if !self.is_active() {
            return;
        }
        match command {
            Command::Close { .. } | Command::Auth(_) => self.pool.send_if_connected(relay, command),
            Command::Event(event) => self.pool.get_or_create(relay).send(event),
            Command::Req { .. } | Command::Count { .. } => {
                self.pool.send_or_connect_and_sync(relay, command);
            }
        }
    }

    fn auth_signer(&self) -> Option<Arc<dyn AuthSigner>> {
        self.signer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn forget_relay_state(&self, relay: &RelayUrl) {
        self.requests().on_disconnected(relay);
        self.counts().on_disconnected(relay);
        self.outbox().on_disconnected(relay);
    }

    fn requests(&self) -> MutexGuard<'_, PoolRequests> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn counts(&self) -> MutexGuard<'_, PoolCounts> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outbox(&self) -> MutexGuard<'_, PoolEventOutbox> {
        self.outbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for NostrClient {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

async fn sample_relay_set(client: Weak<NostrClient>, changed: Arc<Notify>, sample: Duration) {
    loop {
        changed.notified().await;
        tokio::time::sleep(sample).await;
        let Some(client) = client.upgrade() else {
            break;
        };
        client.update_relay_set();
    }
}

async fn debounce_reconnects(
    client: Weak<NostrClient>,
    mut queue: mpsc::UnboundedReceiver<ReconnectRequest>,
    debounce: Duration,
) {
    while let Some(mut request) = queue.recv().await {
        tokio::time::sleep(debounce).await;
        while let Ok(next) = queue.try_recv() {
            request = request.merge(next);
        }
        let Some(client) = client.upgrade() else {
            break;
        };
        client.reconnect_now(request);
    }
}

/// Session listener installed on every pool session. Feeds the trackers,
/// then fans out to external listeners.
struct ClientHook {
    client: Weak<NostrClient>,
}

impl ClientHook {
    fn with_client(&self, f: impl FnOnce(&NostrClient)) {
        if let Some(client) = self.client.upgrade() {
            f(&client);
        }
    }
}

impl RelayListener for ClientHook {
    fn on_connecting(&self, relay: &RelaySession) {
        self.with_client(|client| {
            client.forget_relay_state(relay.url());
            client.listeners.for_each(|listener| listener.on_connecting(relay));
        });
    }

    fn on_connected(&self, relay: &RelaySession, ping_ms: u64, compressed: bool) {
        self.with_client(|client| {
            client.renew_filters(relay);
            client.pool.publish_status();
            client
                .listeners
                .for_each(|listener| listener.on_connected(relay, ping_ms, compressed));
        });
    }

    fn on_disconnecting(&self, relay: &RelaySession) {
        self.with_client(|client| {
            client
                .listeners
                .for_each(|listener| listener.on_disconnecting(relay));
        });
    }

    fn on_disconnected(&self, relay: &RelaySession) {
        self.with_client(|client| {
            client.forget_relay_state(relay.url());
            client.pool.publish_status();
            client
                .listeners
                .for_each(|listener| listener.on_disconnected(relay));
        });
    }

    fn on_cannot_connect(&self, relay: &RelaySession, message: &str) {
        self.with_client(|client| {
            let url = relay.url();
            let request_callbacks = client.requests().on_cannot_connect(url, message);
            let count_callbacks = client.counts().on_cannot_connect(url, message);
            client.outbox().on_disconnected(url);

            request_callbacks.into_iter().for_each(RequestCallback::fire);
            count_callbacks.into_iter().for_each(CountCallback::fire);
            client
                .listeners
                .for_each(|listener| listener.on_cannot_connect(relay, message));
        });
    }

    fn on_before_send(&self, relay: &RelaySession, event: &Event) {
        self.with_client(|client| {
            client
                .listeners
                .for_each(|listener| listener.on_before_send(relay, event));
        });
    }

    fn on_sent(&self, relay: &RelaySession, frame: &str, command: &Command, success: bool) {
        self.with_client(|client| {
            let url = relay.url();
            let callback = if success {
                client.counts().on_sent(url, command);
                client.requests().on_sent(url, command)
            } else {
                None
            };
            client.outbox().on_sent(url, command, success);

            if let Some(callback) = callback {
                callback.fire();
            }
            client
                .listeners
                .for_each(|listener| listener.on_sent(relay, frame, command, success));
        });
    }

    fn on_event(
        &self,
        relay: &RelaySession,
        subscription_id: &str,
        event: &Event,
        arrival_secs: u64,
        after_eose: bool,
    ) {
        self.with_client(|client| {
            let callback =
                client
                    .requests()
                    .on_event(relay.url(), subscription_id, event, after_eose);
            if let Some(callback) = callback {
                callback.fire();
            }
            client.listeners.for_each(|listener| {
                listener.on_event(relay, subscription_id, event, arrival_secs, after_eose);
            });
        });
    }

    fn on_eose(&self, relay: &RelaySession, subscription_id: &str, arrival_secs: u64) {
        self.with_client(|client| {
            let update = client.requests().on_eose(relay.url(), subscription_id);
            if let Some(callback) = update.callback {
                callback.fire();
            }
            if let Some(command) = update.follow_up {
                client.dispatch(relay.url(), command);
            }
            client
                .listeners
                .for_each(|listener| listener.on_eose(relay, subscription_id, arrival_secs));
        });
    }

    fn on_ok(&self, relay: &RelaySession, event_id: &str, success: bool, message: &str) {
        self.with_client(|client| {
            let released = client
                .outbox()
                .on_ok(relay.url(), event_id, success, message);
            if released {
                client.relay_set_changed.notify_one();
            }
            client
                .listeners
                .for_each(|listener| listener.on_ok(relay, event_id, success, message));
        });
    }

    fn on_authenticated(&self, relay: &RelaySession, event_id: &str) {
        self.with_client(|client| {
            client.renew_filters(relay);
            client
                .listeners
                .for_each(|listener| listener.on_authenticated(relay, event_id));
        });
    }

    fn on_auth(&self, relay: &RelaySession, challenge: &str) {
        self.with_client(|client| {
            if client.is_active()
                && let Some(signer) = client.auth_signer()
            {
                match signer.sign_auth(relay.url(), challenge) {
                    Some(event) => relay.send(event),
                    None => debug!("signer declined challenge from {}", relay.url()),
                }
            }
            client
                .listeners
                .for_each(|listener| listener.on_auth(relay, challenge));
        });
    }

    fn on_notify(&self, relay: &RelaySession, message: &str) {
        self.with_client(|client| {
            client
                .listeners
                .for_each(|listener| listener.on_notify(relay, message));
        });
    }

    fn on_closed(&self, relay: &RelaySession, subscription_id: &str, message: &str) {
        self.with_client(|client| {
            let url = relay.url();
            let update = client.requests().on_closed(url, subscription_id, message);
            let count_callback = client.counts().on_closed(url, subscription_id, message);
            client.relay_set_changed.notify_one();

            if let Some(callback) = update.callback {
                callback.fire();
            }
            if let Some(callback) = count_callback {
                callback.fire();
            }
            if let Some(command) = update.follow_up {
                client.dispatch(url, command);
            }
            client
                .listeners
                .for_each(|listener| listener.on_closed(relay, subscription_id, message));
        });
    }

    fn on_count(&self, relay: &RelaySession, subscription_id: &str, count: u64) {
        self.with_client(|client| {
            let callback = client.counts().on_count(relay.url(), subscription_id, count);
            client.relay_set_changed.notify_one();
            if let Some(callback) = callback {
                callback.fire();
            }
            client
                .listeners
                .for_each(|listener| listener.on_count(relay, subscription_id, count));
        });
    }

    fn on_error(&self, relay: &RelaySession, error: &RelayError) {
        if matches!(error, RelayError::Fatal(_)) {
            warn!("relay {} is unavailable: {}", relay.url(), error);
        }
        self.with_client(|client| {
            client
                .listeners
                .for_each(|listener| listener.on_error(relay, error));
        });
    }
}
