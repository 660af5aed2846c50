//! STOMP-over-WebSocket connection manager.
//!
//! DESIGN
//! ======
//! One background driver task owns the socket. Callers talk to it through an
//! unbounded command channel and observe it through a `watch` of
//! [`ConnectionState`]. The driver runs handshake, frame dispatch and
//! heart-beats for one transport session at a time, and loops back to
//! reconnect after `reconnect_delay` when a session ends on its own.
//!
//! `connect()` spawns the driver only when none is active. Every caller
//! parks a oneshot waiter that the driver resolves when the handshake
//! completes or the attempt fails; a failed attempt is reported to the
//! waiters while the driver keeps retrying in the background.
//!
//! Subscription handlers are keyed by STOMP subscription id and called on
//! the driver task, outside the lock. When a transport session ends every
//! handler is dropped and [`ConnectionManager::epoch`] advances, which is how
//! the topic registry learns its registrations went stale.
//!
//! ERROR HANDLING
//! ==============
//! Transport, broker and codec failures end the session and feed the
//! reconnect loop. A message that does not decode is logged and skipped
//! without touching the session. `send`/`subscribe` never queue while
//! disconnected; they fail with [`ConnectionError::NotConnected`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use frames::{Command, Frame, HeartBeat, Inbound};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite;

use crate::config::ConnectionConfig;
use crate::session::TokenProvider;

/// Error surfaced by the connection manager.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// No STOMP session is established.
    #[error("websocket not connected")]
    NotConnected,
    /// Opening, reading or writing the socket failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The broker answered with an ERROR frame.
    #[error("broker error: {0}")]
    Broker(String),
    /// The socket did not open, or CONNECTED did not arrive, in time.
    #[error("timed out waiting for the STOMP handshake")]
    HandshakeTimeout,
    /// The connection was shut down or the peer closed the socket.
    #[error("connection closed")]
    Closed,
    /// The broker sent text that is not valid STOMP.
    #[error("frame decode failed: {0}")]
    Codec(#[from] frames::CodecError),
}

/// Lifecycle of the single STOMP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

// =============================================================================
// TRANSPORT SEAM
// =============================================================================

pub type SocketSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;
pub type SocketStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// An open text-message socket.
pub struct Socket {
    pub sink: SocketSink,
    pub stream: SocketStream,
}

/// Opens sockets to the STOMP endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ConnectionError::Transport`] if the socket cannot be opened.
    async fn open(&self, url: &str) -> Result<Socket, ConnectionError>;
}

/// [`Transport`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Socket, ConnectionError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let (sink, stream) = ws.split();

        let sink = sink
            .with(|text: String| futures::future::ready(Ok::<_, tungstenite::Error>(tungstenite::Message::Text(text.into()))))
            .sink_map_err(|e| ConnectionError::Transport(e.to_string()));
        let stream = stream.filter_map(|message| {
            futures::future::ready(match message {
                Ok(tungstenite::Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(tungstenite::Message::Binary(bytes)) => String::from_utf8(bytes.to_vec()).ok().map(Ok),
                Ok(_) => None,
                Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
            })
        });

        Ok(Socket { sink: Box::pin(sink), stream: Box::pin(stream) })
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// Callback receiving MESSAGE frames for one subscription. Runs on the driver task.
pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// A transport-level subscription created by [`ConnectionManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    /// Epoch of the transport session the subscription lives in.
    pub epoch: u64,
}

enum DriverCommand {
    Send(Frame),
    Shutdown,
}

type Waiter = oneshot::Sender<Result<(), ConnectionError>>;

#[derive(Default)]
struct Inner {
    /// Command channel of the active driver. `None` when no driver is active.
    commands: Option<mpsc::UnboundedSender<DriverCommand>>,
    /// Id of the most recently spawned driver. Older drivers may still be
    /// winding down and must not touch shared state.
    driver_id: u64,
    waiters: Vec<Waiter>,
    handlers: HashMap<String, FrameHandler>,
}

struct Shared {
    url: String,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    config: ConnectionConfig,
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    next_subscription: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(inner: &Inner, driver_id: u64) -> bool {
        inner.driver_id == driver_id && inner.commands.is_some()
    }

    fn set_state(&self, driver_id: u64, state: ConnectionState) {
        let inner = self.lock();
        if Self::is_active(&inner, driver_id) {
            self.state.send_replace(state);
        }
    }

    fn mark_connected(&self, driver_id: u64) -> bool {
        let waiters = {
            let mut inner = self.lock();
            if !Self::is_active(&inner, driver_id) {
                return false;
            }
            self.state.send_replace(ConnectionState::Connected);
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    fn fail_waiters(&self, driver_id: u64, error: &ConnectionError) {
        let waiters = {
            let mut inner = self.lock();
            if inner.driver_id != driver_id {
                return;
            }
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Drop every handler of the session that just ended.
    fn end_session(&self, driver_id: u64) {
        let mut inner = self.lock();
        if inner.driver_id != driver_id {
            return;
        }
        inner.handlers.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if inner.commands.is_some() {
            self.state.send_replace(ConnectionState::Connecting);
        }
    }

    fn finish_driver(&self, driver_id: u64) {
        let waiters = {
            let mut inner = self.lock();
            if inner.driver_id != driver_id {
                return;
            }
            inner.commands = None;
            self.state.send_replace(ConnectionState::Disconnected);
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(ConnectionError::Closed));
        }
    }

    fn handler(&self, driver_id: u64, subscription: &str) -> Option<FrameHandler> {
        let inner = self.lock();
        if inner.driver_id != driver_id {
            return None;
        }
        inner.handlers.get(subscription).cloned()
    }
}

// =============================================================================
// CONNECTION MANAGER
// =============================================================================

/// Owns the single STOMP connection of a user session. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
        config: ConnectionConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                transport,
                tokens,
                config,
                inner: Mutex::new(Inner::default()),
                state,
                epoch: AtomicU64::new(0),
                next_subscription: AtomicU64::new(0),
            }),
        }
    }

    /// Connect, or join the attempt already in flight.
    ///
    /// Returns at once when already connected. The bearer token is read here,
    /// once; automatic reconnects reuse it.
    ///
    /// # Errors
    ///
    /// Returns the failure of the current attempt. The driver keeps retrying
    /// after it unless reconnecting is disabled.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let waiter = {
            let mut inner = self.shared.lock();
            if *self.shared.state.borrow() == ConnectionState::Connected && inner.commands.is_some() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);

            if inner.commands.is_none() {
                let (commands, command_rx) = mpsc::unbounded_channel();
                inner.commands = Some(commands);
                inner.driver_id += 1;
                let driver_id = inner.driver_id;
                let headers = self.connect_headers();
                self.shared.state.send_replace(ConnectionState::Connecting);
                tracing::info!(url = %self.shared.url, driver_id, "starting websocket driver");
                tokio::spawn(run_driver(self.shared.clone(), driver_id, command_rx, headers));
            }
            rx
        };

        waiter.await.unwrap_or(Err(ConnectionError::Closed))
    }

    /// Tear down the connection and drop every subscription. No-op when idle.
    ///
    /// A DISCONNECT frame is sent best-effort by the winding-down driver.
    pub fn disconnect(&self) {
        let waiters = {
            let mut inner = self.shared.lock();
            let Some(commands) = inner.commands.take() else {
                return;
            };
            let _ = commands.send(DriverCommand::Shutdown);
            inner.handlers.clear();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            self.shared.state.send_replace(ConnectionState::Closing);
            std::mem::take(&mut inner.waiters)
        };
        tracing::info!(url = %self.shared.url, "websocket disconnect requested");
        for waiter in waiters {
            let _ = waiter.send(Err(ConnectionError::Closed));
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver following every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Number of transport sessions that have ended so far.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Register `handler` for MESSAGE frames on `destination` and send SUBSCRIBE.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless a session is established.
    pub fn subscribe(&self, destination: &str, handler: FrameHandler) -> Result<Subscription, ConnectionError> {
        let mut inner = self.shared.lock();
        let commands = self.connected_commands(&inner)?;

        let id = format!("sub-{}", self.shared.next_subscription.fetch_add(1, Ordering::SeqCst));
        commands
            .send(DriverCommand::Send(Frame::subscribe(&id, destination)))
            .map_err(|_| ConnectionError::NotConnected)?;
        inner.handlers.insert(id.clone(), handler);

        tracing::debug!(destination, subscription = %id, "subscribed");
        Ok(Subscription { id, epoch: self.epoch() })
    }

    /// Drop the handler and send UNSUBSCRIBE if the session is still up.
    pub fn unsubscribe(&self, subscription_id: &str) {
        let mut inner = self.shared.lock();
        if inner.handlers.remove(subscription_id).is_none() {
            return;
        }
        if let Ok(commands) = self.connected_commands(&inner) {
            let _ = commands.send(DriverCommand::Send(Frame::unsubscribe(subscription_id)));
        }
    }

    /// Publish a frame.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless a session is established.
    pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        let inner = self.shared.lock();
        self.connected_commands(&inner)?
            .send(DriverCommand::Send(frame))
            .map_err(|_| ConnectionError::NotConnected)
    }

    fn connected_commands<'a>(
        &self,
        inner: &'a Inner,
    ) -> Result<&'a mpsc::UnboundedSender<DriverCommand>, ConnectionError> {
        match &inner.commands {
            Some(commands) if *self.shared.state.borrow() == ConnectionState::Connected => Ok(commands),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    fn connect_headers(&self) -> Vec<(String, String)> {
        self.shared
            .tokens
            .token()
            .map(|token| vec![("Authorization".to_owned(), format!("Bearer {token}"))])
            .unwrap_or_default()
    }
}

// =============================================================================
// DRIVER
// =============================================================================

enum SessionEnd {
    Shutdown,
    Failed(ConnectionError),
}

async fn run_driver(
    shared: Arc<Shared>,
    driver_id: u64,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    headers: Vec<(String, String)>,
) {
    let mut attempt = 0_u32;
    loop {
        shared.set_state(driver_id, ConnectionState::Connecting);
        let end = run_session(&shared, driver_id, &mut commands, &headers).await;
        shared.end_session(driver_id);

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Failed(error) => {
                attempt = attempt.saturating_add(1);
                shared.fail_waiters(driver_id, &error);
                let delay = shared.config.reconnect_delay;
                if delay.is_zero() {
                    tracing::warn!(error = %error, "websocket session ended; reconnect disabled");
                    break;
                }
                tracing::warn!(error = %error, attempt, ?delay, "websocket session ended; reconnecting");
                if !wait_before_reconnect(delay, &mut commands).await {
                    break;
                }
            }
        }
    }
    shared.finish_driver(driver_id);
    tracing::debug!(driver_id, "websocket driver stopped");
}

/// Sleep out the reconnect delay. Returns `false` if shutdown was requested.
async fn wait_before_reconnect(delay: Duration, commands: &mut mpsc::UnboundedReceiver<DriverCommand>) -> bool {
    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => return true,
            command = commands.recv() => match command {
                Some(DriverCommand::Send(frame)) => {
                    tracing::debug!(command = %frame.command, "dropping frame queued while reconnecting");
                }
                Some(DriverCommand::Shutdown) | None => return false,
            },
        }
    }
}

async fn run_session(
    shared: &Shared,
    driver_id: u64,
    commands: &mut mpsc::UnboundedReceiver<DriverCommand>,
    headers: &[(String, String)],
) -> SessionEnd {
    let handshake_timeout = shared.config.handshake_timeout;
    let socket = match tokio::time::timeout(handshake_timeout, shared.transport.open(&shared.url)).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(error)) => return SessionEnd::Failed(error),
        Err(_) => return SessionEnd::Failed(ConnectionError::HandshakeTimeout),
    };
    let Socket { mut sink, mut stream } = socket;

    let connect = Frame::connect(&host_of(&shared.url), shared.config.heart_beat, headers);
    if let Err(error) = sink.send(frames::encode_frame(&connect)).await {
        return SessionEnd::Failed(error);
    }
    let agreed = match tokio::time::timeout(handshake_timeout, await_connected(&mut stream)).await {
        Ok(Ok(server)) => HeartBeat::negotiate(shared.config.heart_beat, server),
        Ok(Err(error)) => return SessionEnd::Failed(error),
        Err(_) => return SessionEnd::Failed(ConnectionError::HandshakeTimeout),
    };

    if !shared.mark_connected(driver_id) {
        let _ = sink.close().await;
        return SessionEnd::Shutdown;
    }
    tracing::info!(
        url = %shared.url,
        outgoing_ms = agreed.outgoing,
        incoming_ms = agreed.incoming,
        "stomp session established"
    );

    let mut heartbeat = agreed.outgoing_interval().map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    // Silence for twice the agreed incoming interval means the link is dead.
    let silence_limit = agreed.incoming_interval().map(|period| period * 2);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(DriverCommand::Send(frame)) => {
                    if let Err(error) = sink.send(frames::encode_frame(&frame)).await {
                        return SessionEnd::Failed(error);
                    }
                }
                Some(DriverCommand::Shutdown) | None => {
                    let _ = sink.send(frames::encode_frame(&Frame::disconnect("disconnect"))).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
            },
            item = stream.next() => match item {
                Some(Ok(text)) => {
                    last_inbound = Instant::now();
                    if let Err(error) = dispatch(shared, driver_id, &text) {
                        return SessionEnd::Failed(error);
                    }
                }
                Some(Err(error)) => return SessionEnd::Failed(error),
                None => return SessionEnd::Failed(ConnectionError::Closed),
            },
            () = next_tick(heartbeat.as_mut()) => {
                if let Err(error) = sink.send(frames::HEARTBEAT.to_owned()).await {
                    return SessionEnd::Failed(error);
                }
            },
            () = silence_deadline(last_inbound, silence_limit) => {
                return SessionEnd::Failed(ConnectionError::Transport("heart-beat timeout".to_owned()));
            },
        }
    }
}

/// Read until CONNECTED and return the broker's heart-beat offer.
async fn await_connected(stream: &mut SocketStream) -> Result<HeartBeat, ConnectionError> {
    while let Some(text) = stream.next().await {
        for item in frames::decode(&text?)? {
            let Inbound::Frame(frame) = item else { continue };
            match frame.command {
                Command::Connected => {
                    return match frame.header("heart-beat") {
                        Some(value) => Ok(HeartBeat::parse(value)?),
                        None => Ok(HeartBeat::default()),
                    };
                }
                Command::Error => return Err(ConnectionError::Broker(frame.error_message())),
                other => tracing::debug!(command = %other, "ignoring frame before CONNECTED"),
            }
        }
    }
    Err(ConnectionError::Closed)
}

/// Route one WebSocket message to subscription handlers.
fn dispatch(shared: &Shared, driver_id: u64, text: &str) -> Result<(), ConnectionError> {
    let items = match frames::decode(text) {
        Ok(items) => items,
        Err(error) => {
            tracing::warn!(error = %error, "dropping undecodable websocket message");
            return Ok(());
        }
    };

    for item in items {
        let Inbound::Frame(frame) = item else { continue };
        match frame.command {
            Command::Message => {
                let handler = frame
                    .header("subscription")
                    .and_then(|subscription| shared.handler(driver_id, subscription));
                match handler {
                    Some(handler) => handler(&frame),
                    None => tracing::debug!(
                        destination = frame.header("destination").unwrap_or_default(),
                        "message for unknown subscription"
                    ),
                }
            }
            Command::Error => return Err(ConnectionError::Broker(frame.error_message())),
            other => tracing::debug!(command = %other, "ignoring frame"),
        }
    }
    Ok(())
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn silence_deadline(last_inbound: Instant, limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep_until(last_inbound + limit).await,
        None => std::future::pending::<()>().await,
    }
}

/// Host part of a WebSocket URL, for the CONNECT `host` header.
fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    authority.rsplit_once('@').map_or(authority, |(_, host)| host).to_owned()
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
