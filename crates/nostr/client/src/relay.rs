//! Single relay session: one socket at a time, EOSE bookkeeping, AUTH
//! replies and reconnect backoff.

use crate::backoff::{ReconnectBackoff, is_fatal_failure, is_local_close};
use crate::config::SessionConfig;
use crate::error::RelayError;
use crate::listener::RelayListener;
use crate::message::{Command, RelayMessage, parse_relay_message};
use crate::stats::RelayStat;
use crate::transport::{WebSocket, WebSocketBuilder, WebSocketListener};
use chrono::Utc;
use nostr::{Event, Filter, RelayUrl, auth_challenge};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type AfterSync = Box<dyn FnOnce(&RelaySession) + Send>;

/// Connection state as seen from outside the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct SessionState {
    socket: Option<Arc<dyn WebSocket>>,
    ready: bool,
    compression: bool,
    /// Bumped on every dial and every local disconnect.
    epoch: u64,
    last_attempt_secs: u64,
    backoff: ReconnectBackoff,
    eose: HashMap<String, bool>,
    auth_watcher: HashMap<String, bool>,
    auth_challenges: HashSet<String>,
    after_sync: Vec<AfterSync>,
}

impl SessionState {
    fn new(config: &SessionConfig) -> Self {
        Self {
            socket: None,
            ready: false,
            compression: false,
            epoch: 0,
            last_attempt_secs: 0,
            backoff: ReconnectBackoff::new(config),
            eose: HashMap::new(),
            auth_watcher: HashMap::new(),
            auth_challenges: HashSet::new(),
            after_sync: Vec::new(),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.socket.is_some()
    }

    fn mark_closed(&mut self) -> Option<Arc<dyn WebSocket>> {
        self.ready = false;
        self.compression = false;
        self.eose.clear();
        self.auth_watcher.clear();
        self.auth_challenges.clear();
        self.after_sync.clear();
        self.socket.take()
    }
}

struct QueuedEvent {
    epoch: u64,
    subscription_id: String,
    event: Event,
    arrival_secs: u64,
    after_eose: bool,
}

/// Client side of one relay connection.
pub struct RelaySession {
    url: RelayUrl,
    builder: Arc<dyn WebSocketBuilder>,
    listener: Arc<dyn RelayListener>,
    connecting: AtomicBool,
    state: Mutex<SessionState>,
    stats: Mutex<RelayStat>,
    events: mpsc::UnboundedSender<QueuedEvent>,
    weak_self: Weak<RelaySession>,
}

impl fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("url", &self.url)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl RelaySession {
    /// Create an idle session. EVENT frames are delivered from a task on `runtime`.
    pub fn new(
        url: RelayUrl,
        builder: Arc<dyn WebSocketBuilder>,
        listener: Arc<dyn RelayListener>,
        config: &SessionConfig,
        runtime: &Handle,
    ) -> Arc<Self> {
        let (events, queue) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|weak_self| Self {
            url,
            builder,
            listener,
            connecting: AtomicBool::new(false),
            state: Mutex::new(SessionState::new(config)),
            stats: Mutex::new(RelayStat::new(config.stats_history)),
            events,
            weak_self: weak_self.clone(),
        });
        runtime.spawn(deliver_events(Arc::downgrade(&session), queue));
        session
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// Socket present and open since the last reset.
    pub fn is_connected(&self) -> bool {
        let state = self.state();
        state.socket.is_some() && state.ready
    }

    pub fn is_connection_started(&self) -> bool {
        self.state().socket.is_some()
    }

    pub fn connection_state(&self) -> ConnectionState {
        let state = self.state();
        match (&state.socket, state.ready) {
            (Some(_), true) => ConnectionState::Connected,
            (Some(_), false) => ConnectionState::Connecting,
            (None, _) => ConnectionState::Disconnected,
        }
    }

    /// Whether a fresh socket is needed: none exists or the current one died.
    pub fn needs_to_reconnect(&self) -> bool {
        self.socket().is_none_or(|socket| socket.needs_reconnect())
    }

    /// A socket exists but its transport is gone.
    pub fn has_stale_socket(&self) -> bool {
        self.socket().is_some_and(|socket| socket.needs_reconnect())
    }

    pub fn uses_compression(&self) -> bool {
        self.state().compression
    }

    pub fn reconnect_delay_secs(&self) -> u64 {
        self.state().backoff.delay_secs()
    }

    /// Whether stored events for this subscription are done on this connection.
    pub fn is_after_eose(&self, subscription_id: &str) -> bool {
        self.state()
            .eose
            .get(subscription_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn stats(&self) -> RelayStat {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn connect(&self) {
        self.connect_then(None);
    }

    /// Connect, then run `after_sync` once the socket is open and the
    /// listener has resynced. Runs right away when already connected.
    pub fn connect_and_run_after_sync(
        &self,
        after_sync: impl FnOnce(&RelaySession) + Send + 'static,
    ) {
        if self.is_connected() {
            after_sync(self);
            return;
        }
        self.connect_then(Some(Box::new(after_sync)));
    }

    /// Dial only when no socket exists and the backoff window has passed.
    pub fn connect_and_sync_if_disconnected(&self, ignore_retry_delays: bool) {
        let may_dial = {
            let state = self.state();
            state.socket.is_none()
                && (ignore_retry_delays
                    || state.backoff.may_retry(state.last_attempt_secs, now_secs()))
        };
        if may_dial && !self.connecting.load(Ordering::SeqCst) {
            self.connect();
        }
    }

    pub fn disconnect(&self) {
        let socket = {
            let mut state = self.state();
            state.epoch += 1;
            state.backoff.reset();
            state.last_attempt_secs = 0;
            state.mark_closed()
        };

        if let Some(socket) = socket {
            socket.cancel();
            info!("disconnected from {}", self.url);
            self.listener.on_disconnected(self);
        }
    }

    pub fn send_request(&self, subscription_id: &str, filters: &[Filter]) {
        self.send_or_connect_and_sync(Command::req(subscription_id, filters.to_vec()));
    }

    pub fn send_count(&self, subscription_id: &str, filters: &[Filter]) {
        self.send_or_connect_and_sync(Command::count(subscription_id, filters.to_vec()));
    }

    /// Route an event to AUTH or EVENT.
    pub fn send(&self, event: Event) {
        self.listener.on_before_send(self, &event);
        if event.is_auth() {
            self.send_auth(event);
        } else {
            self.send_event(event);
        }
    }

    /// Reply to an AUTH challenge once per challenge per connection.
    pub fn send_auth(&self, event: Event) {
        self.send_if_connected(Command::Auth(event));
    }

    pub fn send_event(&self, event: Event) {
        self.send_or_connect_and_sync(Command::Event(event));
    }

    /// CLOSE a subscription this connection has open.
    pub fn close(&self, subscription_id: &str) {
        self.send_if_connected(Command::close(subscription_id));
    }

    /// Write when open, otherwise dial on demand and let the resync replay it.
    pub fn send_or_connect_and_sync(&self, command: Command) {
        let (started, ready) = {
            let state = self.state();
            (state.socket.is_some(), state.ready)
        };
        if started {
            if ready && command.is_valid() {
                self.send_if_connected(command);
            }
        } else {
            self.connect_and_sync_if_disconnected(false);
        }
    }

    /// Write to the current socket, if any, with per-command bookkeeping.
    pub fn send_if_connected(&self, command: Command) {
        {
            let mut state = self.state();
            if state.socket.is_none() {
                return;
            }
            match &command {
                Command::Req {
                    subscription_id, ..
                }
                | Command::Count {
                    subscription_id, ..
                } => {
                    state.eose.insert(subscription_id.clone(), false);
                }
                Command::Close { subscription_id } => {
                    let Some(after_eose) = state.eose.get_mut(subscription_id) else {
                        return;
                    };
                    *after_eose = false;
                }
                Command::Auth(event) => {
                    let Some(challenge) = auth_challenge(event) else {
                        debug!("not sending auth event {} without a challenge", event.id);
                        return;
                    };
                    if !state.auth_challenges.insert(challenge.to_string()) {
                        return;
                    }
                    state.auth_watcher.insert(event.id.clone(), false);
                }
                Command::Event(_) => {}
            }
        }
        self.write(&command);
    }

    fn write(&self, command: &Command) -> bool {
        let Some(socket) = self.socket() else {
            return false;
        };

        let frame = match command.to_json() {
            Ok(frame) => frame,
            Err(error) => {
                self.record_error(format!("Failed to encode command: {}", error));
                self.listener
                    .on_error(self, &RelayError::Protocol(error.to_string()));
                return false;
            }
        };

        let success = socket.send(&frame);
        if success {
            self.with_stats(|stats| stats.add_bytes_sent(frame.len()));
        } else {
            debug!("write to {} failed", self.url);
        }
        self.listener.on_sent(self, &frame, command, success);
        success
    }

    fn connect_then(&self, after_sync: Option<AfterSync>) {
        if self.connecting.swap(true, Ordering::SeqCst) {
            if let Some(after_sync) = after_sync {
                self.state().after_sync.push(after_sync);
            }
            return;
        }
        self.dial(after_sync);
        self.connecting.store(false, Ordering::SeqCst);
    }

    fn dial(&self, after_sync: Option<AfterSync>) {
        let epoch = {
            let mut state = self.state();
            if let Some(after_sync) = after_sync {
                state.after_sync.push(after_sync);
            }
            if state.socket.is_some() {
                return;
            }
            state.last_attempt_secs = now_secs();
            state.epoch += 1;
            state.epoch
        };

        debug!("connecting to {}", self.url);
        self.listener.on_connecting(self);

        let handler = Arc::new(SocketHandler {
            session: self.weak_self.clone(),
            epoch,
        });
        match self.builder.build(&self.url, handler) {
            Ok(socket) => {
                {
                    let mut state = self.state();
                    if state.epoch != epoch {
                        return;
                    }
                    state.socket = Some(Arc::clone(&socket));
                }
                socket.connect();
            }
            Err(error) => {
                warn!("cannot create socket for {}: {}", self.url, error);
                self.record_error(format!("Error trying to connect: {}", error));
                {
                    let mut state = self.state();
                    state.backoff.pin_fatal();
                    state.mark_closed();
                }
                self.listener.on_cannot_connect(
                    self,
                    &format!("Error when trying to connect: {}", error),
                );
                self.listener.on_disconnected(self);
            }
        }
    }

    fn handle_open(&self, epoch: u64, ping_ms: u64, compression: bool) {
        let after_sync = {
            let mut state = self.state();
            if !state.is_current(epoch) {
                return;
            }
            state.ready = true;
            state.compression = compression;
            state.backoff.reset();
            state.eose.clear();
            std::mem::take(&mut state.after_sync)
        };
        self.with_stats(|stats| stats.ping_ms = Some(ping_ms));

        info!("connected to {} in {}ms", self.url, ping_ms);
        self.listener.on_connected(self, ping_ms, compression);
        for callback in after_sync {
            callback(self);
        }
    }

    fn handle_message(&self, epoch: u64, text: &str) {
        if !self.state().is_current(epoch) {
            return;
        }
        self.with_stats(|stats| stats.add_bytes_received(text.len()));

        match parse_relay_message(text) {
            Ok(message) => self.dispatch(epoch, message),
            Err(error) => {
                warn!("protocol parse error on {}: {}", self.url, error);
                self.record_error(format!("Error processing: {}", text));
                self.listener
                    .on_error(self, &RelayError::Protocol(error.to_string()));
            }
        }
    }

    fn dispatch(&self, epoch: u64, message: RelayMessage) {
        match message {
            RelayMessage::Event(subscription_id, event) => {
                let known = self.state().eose.get(&subscription_id).copied();
                if known.is_none() {
                    self.with_stats(|stats| {
                        stats.new_spam(format!(
                            "Event {} for unrequested subscription {}",
                            event.id, subscription_id
                        ));
                    });
                }
                let queued = QueuedEvent {
                    epoch,
                    subscription_id,
                    event,
                    arrival_secs: now_secs(),
                    after_eose: known.unwrap_or(false),
                };
                if self.events.send(queued).is_err() {
                    debug!("event queue for {} is closed", self.url);
                }
            }
            RelayMessage::Eose(subscription_id) => {
                self.state().eose.insert(subscription_id.clone(), true);
                self.listener.on_eose(self, &subscription_id, now_secs());
            }
            RelayMessage::Ok(event_id, success, message) => {
                let first_auth_success = {
                    let mut state = self.state();
                    match state.auth_watcher.get_mut(&event_id) {
                        Some(authenticated) => {
                            let was_authenticated = *authenticated;
                            *authenticated = success;
                            success && !was_authenticated
                        }
                        None => false,
                    }
                };
                if first_auth_success {
                    info!("authenticated to {}", self.url);
                    self.listener.on_authenticated(self, &event_id);
                }
                if !success {
                    self.with_stats(|stats| {
                        stats.new_notice(format!("Rejected event {}: {}", event_id, message));
                    });
                }
                self.listener.on_ok(self, &event_id, success, &message);
                if !success {
                    self.listener
                        .on_error(self, &RelayError::from_rejection(&event_id, &message));
                }
            }
            RelayMessage::Notice(message) => {
                self.with_stats(|stats| stats.new_notice(message.clone()));
                self.listener.on_error(self, &RelayError::Notice(message));
            }
            RelayMessage::Auth(challenge) => self.listener.on_auth(self, &challenge),
            RelayMessage::Notify(message) => self.listener.on_notify(self, &message),
            RelayMessage::Closed(subscription_id, message) => {
                self.state().eose.insert(subscription_id.clone(), false);
                self.with_stats(|stats| {
                    stats.new_notice(format!(
                        "Subscription {} closed: {}",
                        subscription_id, message
                    ));
                });
                self.listener.on_closed(self, &subscription_id, &message);
            }
            RelayMessage::Count(subscription_id, count) => {
                self.listener.on_count(self, &subscription_id, count);
            }
            RelayMessage::Unknown(raw) => {
                warn!("unsupported message from {}: {}", self.url, raw);
                self.record_error(format!("Unsupported message: {}", raw));
                self.listener.on_error(
                    self,
                    &RelayError::Protocol(format!("Unsupported message: {}", raw)),
                );
            }
        }
    }

    fn handle_closing(&self, epoch: u64, code: u16, reason: &str) {
        if !self.state().is_current(epoch) {
            return;
        }
        debug!("relay {} closing ({}): {}", self.url, code, reason);
        self.listener.on_disconnecting(self);
    }

    fn handle_closed(&self, epoch: u64, code: u16, reason: &str) {
        let socket = {
            let mut state = self.state();
            if !state.is_current(epoch) {
                return;
            }
            if !state.ready {
                state.backoff.record_failure();
            }
            state.mark_closed()
        };
        if let Some(socket) = socket {
            socket.cancel();
        }
        info!("relay {} closed ({}): {}", self.url, code, reason);
        self.listener.on_disconnected(self);
    }

    fn handle_failure(&self, epoch: u64, error: &str, code: Option<u16>, response: Option<&str>) {
        let fatal = is_fatal_failure(code, error);
        let socket = {
            let mut state = self.state();
            if !state.is_current(epoch) {
                return;
            }
            if fatal {
                state.backoff.pin_fatal();
            } else if !state.ready {
                state.backoff.record_failure();
            }
            state.mark_closed()
        };
        if let Some(socket) = socket {
            socket.cancel();
        }

        if !is_local_close(error) {
            let report = if code.is_some() || response.is_some() {
                format!(
                    "Server Misconfigured. Response: {} {}. Exception: {}",
                    code.map_or_else(|| "-".to_string(), |code| code.to_string()),
                    response.unwrap_or_default(),
                    error
                )
            } else {
                format!("WebSocket Failure: {}", error)
            };
            warn!("relay {} failed: {}", self.url, report);
            self.record_error(response.filter(|body| !body.is_empty()).unwrap_or(error));
            self.listener.on_cannot_connect(self, &report);
            let relay_error = if fatal {
                RelayError::Fatal(report)
            } else {
                RelayError::Transport(report)
            };
            self.listener.on_error(self, &relay_error);
        }
        self.listener.on_disconnected(self);
    }

    fn deliver(&self, queued: QueuedEvent) {
        if self.state().epoch != queued.epoch {
            return;
        }
        self.listener.on_event(
            self,
            &queued.subscription_id,
            &queued.event,
            queued.arrival_secs,
            queued.after_eose,
        );
    }

    fn socket(&self) -> Option<Arc<dyn WebSocket>> {
        self.state().socket.clone()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_stats(&self, update: impl FnOnce(&mut RelayStat)) {
        update(
            &mut self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }

    fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_stats(|stats| stats.new_error(message));
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        if let Some(socket) = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .socket
            .take()
        {
            socket.cancel();
        }
    }
}

/// Socket callbacks for one dial, tagged with the epoch it started in.
struct SocketHandler {
    session: Weak<RelaySession>,
    epoch: u64,
}

impl WebSocketListener for SocketHandler {
    fn on_open(&self, ping_ms: u64, compression: bool) {
        if let Some(session) = self.session.upgrade() {
            session.handle_open(self.epoch, ping_ms, compression);
        }
    }

    fn on_message(&self, text: &str) {
        if let Some(session) = self.session.upgrade() {
            session.handle_message(self.epoch, text);
        }
    }

    fn on_closing(&self, code: u16, reason: &str) {
        if let Some(session) = self.session.upgrade() {
            session.handle_closing(self.epoch, code, reason);
        }
    }

    fn on_closed(&self, code: u16, reason: &str) {
        if let Some(session) = self.session.upgrade() {
            session.handle_closed(self.epoch, code, reason);
        }
    }

    fn on_failure(&self, error: &str, code: Option<u16>, response: Option<&str>) {
        if let Some(session) = self.session.upgrade() {
            session.handle_failure(self.epoch, error, code, response);
        }
    }
}

async fn deliver_events(
    session: Weak<RelaySession>,
    mut queue: mpsc::UnboundedReceiver<QueuedEvent>,
) {
    while let Some(queued) = queue.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.deliver(queued);
    }
}

pub(crate) fn now_secs() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}
