//! Websocket channel state machine.
//!
//! Each connection is owned by a background worker task. On transport open
//! the worker sends the credential frame before any other traffic, then
//! classifies inbound frames one at a time: session events update the shared
//! [`SessionState`], change notifications are published on the [`EventBus`],
//! and everything else is forwarded to the channel log as plain text.
//!
//! Socket errors are logged and absorbed; the channel ends up
//! `Disconnected` and does not reconnect on its own. Automatic reconnection
//! with a repeated credential handshake is a known hardening opportunity
//! left to callers.

use std::sync::{Arc, RwLock};

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::realtime::proto::{classify_frame, credential_frame, FrameClass, KEY_UPDATE_EVENT};
use crate::session::SessionState;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
}

/// Errors produced by the realtime transport and protocol handling.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization error on an outbound frame.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested transition is not valid from the current state.
    #[error("cannot {action} while {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: ChannelState,
    },

    /// Outbound frame queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,

    /// Connection contract violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Configuration for opening realtime connections.
#[derive(Clone)]
pub struct RealtimeConfig {
    url: String,
    api_key: SecretString,
}

impl RealtimeConfig {
    /// Creates a configuration from an explicit websocket endpoint.
    pub fn new(url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            url: url.into().trim().to_string(),
            api_key,
        }
    }

    /// Derives the websocket endpoint from an HTTP base URL, mirroring the
    /// transport security of the origin (`http` becomes `ws`, `https`
    /// becomes `wss`), with `path` appended.
    pub fn from_http_base(
        base: &str,
        path: &str,
        api_key: SecretString,
    ) -> Result<Self, RealtimeError> {
        Ok(Self::new(websocket_url(base, path)?, api_key))
    }

    /// The websocket endpoint this configuration connects to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Maps an `http(s)` base URL to the matching `ws(s)` endpoint with `path`
/// appended.
pub fn websocket_url(base: &str, path: &str) -> Result<String, RealtimeError> {
    let base = base.trim().trim_end_matches('/');
    let (scheme, rest) = if let Some(rest) = base.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        ("ws", rest)
    } else {
        return Err(RealtimeError::Protocol(format!(
            "unsupported base url scheme: {base}"
        )));
    };
    let path = path.trim_start_matches('/');
    Ok(format!("{scheme}://{rest}/{path}"))
}

/// Stream of human-readable log lines produced by a connection's worker.
///
/// Carries raw opaque frames unchanged, plus lifecycle lines such as
/// `--- socket opened` and `--- session opened: <id>`.
#[derive(Debug)]
pub struct ChannelLog {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelLog {
    /// Receives the next log line; `None` once the worker has stopped and
    /// the backlog is drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`ChannelLog::recv`].
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

struct Transport {
    outbound_tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Websocket protocol state machine.
///
/// Reconnecting after a disconnect creates a fresh underlying transport;
/// the channel value itself is reusable.
pub struct RealtimeChannel {
    config: RealtimeConfig,
    session: SessionState,
    bus: EventBus,
    state: Arc<RwLock<ChannelState>>,
    transport: Option<Transport>,
}

impl RealtimeChannel {
    /// Creates a disconnected channel.
    ///
    /// `session` and `bus` are shared handles: the channel writes adopted
    /// session ids into `session` and publishes key-change notifications on
    /// `bus` under [`KEY_UPDATE_EVENT`].
    pub fn new(config: RealtimeConfig, session: SessionState, bus: EventBus) -> Self {
        Self {
            config,
            session,
            bus,
            state: Arc::new(RwLock::new(ChannelState::Disconnected)),
            transport: None,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        self.state
            .read()
            .map(|guard| *guard)
            .unwrap_or(ChannelState::Disconnected)
    }

    /// The shared session state handle.
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// The shared event bus handle.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Opens the websocket transport and performs the credential handshake.
    ///
    /// The credential frame is the first message on the wire after the
    /// transport opens; the server terminates connections that violate this
    /// ordering. Returns the log stream for this connection.
    ///
    /// Connecting while a connection is already being established or open is
    /// rejected with [`RealtimeError::InvalidTransition`].
    pub async fn connect(&mut self) -> Result<ChannelLog, RealtimeError> {
        match self.state() {
            ChannelState::Disconnected => {}
            state => {
                return Err(RealtimeError::InvalidTransition {
                    action: "connect",
                    state,
                })
            }
        }
        // Reap a worker that already ran to completion on its own.
        if let Some(stale) = self.transport.take() {
            stale.task.abort();
        }

        set_state(&self.state, ChannelState::Connecting);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(channel_worker(
            self.config.url.clone(),
            self.config.api_key.clone(),
            self.session.clone(),
            self.bus.clone(),
            Arc::clone(&self.state),
            outbound_rx,
            log_tx,
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {
                self.transport = Some(Transport { outbound_tx, task });
                Ok(ChannelLog { rx: log_rx })
            }
            Ok(Err(err)) => {
                set_state(&self.state, ChannelState::Disconnected);
                Err(err)
            }
            Err(_) => {
                set_state(&self.state, ChannelState::Disconnected);
                Err(RealtimeError::Protocol(
                    "worker stopped before the handshake completed".to_string(),
                ))
            }
        }
    }

    /// Closes the transport and waits for the worker to finish.
    ///
    /// A no-op when no transport is live.
    pub async fn disconnect(&mut self) -> Result<(), RealtimeError> {
        let Some(transport) = self.transport.take() else {
            return Ok(());
        };
        // Closing the queue is the worker's shutdown signal.
        drop(transport.outbound_tx);
        let _ = transport.task.await;
        set_state(&self.state, ChannelState::Disconnected);
        Ok(())
    }

    /// Queues an outbound text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), RealtimeError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(RealtimeError::InvalidTransition {
                action: "send",
                state: ChannelState::Disconnected,
            })?;
        transport
            .outbound_tx
            .send(text.into())
            .map_err(|_| RealtimeError::SendQueueClosed)
    }

    /// Queues an outbound JSON frame.
    pub fn send_json(&self, value: &Value) -> Result<(), RealtimeError> {
        self.send_text(serde_json::to_string(value)?)
    }

    /// Sends a keep-alive heartbeat; the server answers with plain `PONG`.
    pub fn ping(&self) -> Result<(), RealtimeError> {
        self.send_text("PING")
    }
}

#[allow(clippy::too_many_arguments)]
async fn channel_worker(
    url: String,
    api_key: SecretString,
    session: SessionState,
    bus: EventBus,
    state: Arc<RwLock<ChannelState>>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    log_tx: mpsc::UnboundedSender<String>,
    ready_tx: oneshot::Sender<Result<(), RealtimeError>>,
) {
    let mut socket = match connect_async(url.as_str()).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            set_state(&state, ChannelState::Disconnected);
            let _ = ready_tx.send(Err(RealtimeError::WebSocket(err)));
            return;
        }
    };

    let _ = log_tx.send("--- socket opened".to_string());

    // The credential frame must precede any other traffic; the server drops
    // connections whose first frame is anything else.
    let credential = credential_frame(api_key.expose_secret());
    if let Err(err) = socket.send(Message::Text(credential)).await {
        set_state(&state, ChannelState::Disconnected);
        let _ = ready_tx.send(Err(RealtimeError::WebSocket(err)));
        return;
    }

    set_state(&state, ChannelState::Open);
    let _ = ready_tx.send(Ok(()));

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            warn!(error = %err, "outbound send failed");
                            let _ = log_tx.send(format!("--- error: {err}"));
                            break;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        break;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        apply_frame(&text, &session, &bus, &log_tx);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {
                        // Binary frames are not part of the protocol.
                        debug!("ignoring non-text frame");
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket error");
                        let _ = log_tx.send(format!("--- error: {err}"));
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    set_state(&state, ChannelState::Disconnected);
    let _ = log_tx.send("--- socket closed".to_string());
}

/// Applies the classification of one inbound frame: state updates, bus
/// notifications, and log lines.
fn apply_frame(
    text: &str,
    session: &SessionState,
    bus: &EventBus,
    log_tx: &mpsc::UnboundedSender<String>,
) {
    match classify_frame(text) {
        FrameClass::Opaque => {
            let _ = log_tx.send(text.to_string());
        }
        FrameClass::SessionOpened { session_id } => {
            // A re-announced identity is adopted only once.
            if session.get().as_deref() != Some(session_id.as_str()) {
                session.set(&session_id);
            }
            let _ = log_tx.send(format!("--- session opened: {session_id}"));
        }
        FrameClass::SessionClosed { session_id } => {
            let closed = session_id.unwrap_or_else(|| "unknown".to_string());
            let _ = log_tx.send(format!("--- session closed: {closed}"));
        }
        FrameClass::ServerError { exception, message } => {
            let exception = exception.unwrap_or_else(|| "Error".to_string());
            let message = message.unwrap_or_default();
            warn!(%exception, %message, "server reported an error");
            let _ = log_tx.send(format!("--- error: {exception}: {message}"));
        }
        FrameClass::KeyChanged { key } => {
            let _ = log_tx.send(text.to_string());
            bus.broadcast(KEY_UPDATE_EVENT, &Value::String(key));
        }
    }
}

fn set_state(state: &Arc<RwLock<ChannelState>>, next: ChannelState) {
    if let Ok(mut guard) = state.write() {
        *guard = next;
    }
}
