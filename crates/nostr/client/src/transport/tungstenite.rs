//! tokio-tungstenite backed sockets.

use super::{WebSocket, WebSocketBuilder, WebSocketListener};
use crate::error::{ClientError, Result};
use futures_util::{SinkExt, StreamExt};
use nostr::RelayUrl;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_EXTENSIONS;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Builds sockets that run on the given tokio runtime.
#[derive(Debug, Clone)]
pub struct TungsteniteSocketBuilder {
    handle: Handle,
    connect_timeout: Duration,
}

impl TungsteniteSocketBuilder {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Builder bound to the runtime of the calling task.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|error| ClientError::Runtime(error.to_string()))
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl WebSocketBuilder for TungsteniteSocketBuilder {
    fn build(
        &self,
        url: &RelayUrl,
        listener: Arc<dyn WebSocketListener>,
    ) -> Result<Arc<dyn WebSocket>> {
        Ok(Arc::new(TungsteniteSocket {
            url: url.to_string(),
            handle: self.handle.clone(),
            connect_timeout: self.connect_timeout,
            listener,
            outgoing: Mutex::new(None),
            task: Mutex::new(None),
            finished: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct TungsteniteSocket {
    url: String,
    handle: Handle,
    connect_timeout: Duration,
    listener: Arc<dyn WebSocketListener>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    finished: Arc<AtomicBool>,
}

impl WebSocket for TungsteniteSocket {
    fn connect(&self) {
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            return;
        }

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        *self
            .outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(outgoing_tx);

        *task = Some(self.handle.spawn(run_socket(
            self.url.clone(),
            self.connect_timeout,
            Arc::clone(&self.listener),
            outgoing_rx,
            Arc::clone(&self.finished),
        )));
    }

    fn send(&self, text: &str) -> bool {
        self.outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|outgoing| outgoing.send(Message::Text(text.to_string().into())).is_ok())
    }

    fn cancel(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }

    fn needs_reconnect(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for TungsteniteSocket {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

async fn run_socket(
    url: String,
    connect_timeout: Duration,
    listener: Arc<dyn WebSocketListener>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    finished: Arc<AtomicBool>,
) {
    let started = Instant::now();
    let connected = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(WsError::Http(response))) => {
            let status = response.status();
            let body = response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).into_owned());
            warn!("relay {} answered handshake with {}", url, status);
            finished.store(true, Ordering::SeqCst);
            listener.on_failure(
                &format!("HTTP error: {}", status),
                Some(status.as_u16()),
                body.as_deref(),
            );
            return;
        }
        Ok(Err(error)) => {
            debug!("connect to {} failed: {}", url, error);
            finished.store(true, Ordering::SeqCst);
            listener.on_failure(&error.to_string(), None, None);
            return;
        }
        Err(_) => {
            debug!("connect to {} timed out", url);
            finished.store(true, Ordering::SeqCst);
            listener.on_failure(
                &format!("connection timeout after {:?}", connect_timeout),
                None,
                None,
            );
            return;
        }
    };

    let (stream, response) = connected;
    let compression = response
        .headers()
        .get(SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("permessage-deflate"));
    listener.on_open(started.elapsed().as_millis() as u64, compression);

    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            queued = outgoing.recv() => {
                let Some(message) = queued else {
                    let _ = writer.send(Message::Close(None)).await;
                    finished.store(true, Ordering::SeqCst);
                    return;
                };
                if let Err(error) = writer.send(message).await {
                    warn!("websocket write error on {}: {}", url, error);
                    finished.store(true, Ordering::SeqCst);
                    listener.on_failure(&error.to_string(), None, None);
                    return;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => listener.on_message(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                        .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                    listener.on_closing(code, &reason);
                    finished.store(true, Ordering::SeqCst);
                    listener.on_closed(code, &reason);
                    return;
                }
                Some(Ok(Message::Ping(payload))) => {
                    debug!("received ping from {} ({} bytes)", url, payload.len());
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!("websocket read error on {}: {}", url, error);
                    finished.store(true, Ordering::SeqCst);
                    listener.on_failure(&error.to_string(), None, None);
                    return;
                }
                None => {
                    finished.store(true, Ordering::SeqCst);
                    listener.on_closed(ABNORMAL_CLOSURE, "stream ended");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        failures: Mutex<Vec<(String, Option<u16>)>>,
        done: tokio::sync::Notify,
    }

    impl WebSocketListener for Recorder {
        fn on_open(&self, _ping_ms: u64, _compression: bool) {}
        fn on_message(&self, _text: &str) {}
        fn on_closing(&self, _code: u16, _reason: &str) {}
        fn on_closed(&self, _code: u16, _reason: &str) {}
        fn on_failure(&self, error: &str, code: Option<u16>, _response: Option<&str>) {
            self.failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((error.to_string(), code));
            self.done.notify_one();
        }
    }

    #[tokio::test]
    async fn unreachable_relay_reports_failure_and_needs_reconnect() -> Result<()> {
        let listener = Arc::new(Recorder {
            failures: Mutex::new(Vec::new()),
            done: tokio::sync::Notify::new(),
        });
        let builder = TungsteniteSocketBuilder::current()?
            .with_connect_timeout(Duration::from_secs(2));
        // Nothing listens on the discard port.
        let url = RelayUrl::parse("ws://127.0.0.1:9")?;
        let socket = builder.build(&url, listener.clone())?;

        assert!(!socket.needs_reconnect());
        socket.connect();
        listener.done.notified().await;

        assert!(socket.needs_reconnect());
        let failures = listener
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].1, None);
        Ok(())
    }

    #[test]
    fn current_requires_a_runtime() {
        assert!(matches!(
            TungsteniteSocketBuilder::current(),
            Err(ClientError::Runtime(_))
        ));
    }
}
