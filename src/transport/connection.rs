//! WebSocket connection and event loop.
//!
//! This module implements the transport every caller uses to talk to the
//! peer: request/response correlation, alert dispatch, inbound request
//! handling and lifecycle events.
//!
//! # Event Loop
//!
//! Starting a connection spawns a tokio task that owns the socket and:
//!
//! - Queues outgoing frames until the socket opens, then flushes them in order
//! - Routes incoming responses to pending requests by `reqId`
//! - Runs inbound requests through registered handlers, started in arrival order
//! - Fires alerts and lifecycle events through the [`EventRegistry`]
//! - Drives the [`LivenessMonitor`] from the moment it starts, and answers keepalives
//!
//! # Lifecycle
//!
//! 1. [`Connection::new`] - unstarted; listeners may be attached and requests queued
//! 2. [`Connection::connect`] or [`Connection::attach`] - event loop starts
//! 3. `open` - queue flushed, [`Connection::is_connected`] turns `true`
//! 4. `close` - pending requests rejected with [`Error::ConnectionClosed`],
//!    liveness timers cancelled
//!
//! A connection handles one socket lifetime. Reconnecting means creating a
//! new `Connection`.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::future::{Future, ready};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, SplitSink};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Sleep, sleep};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, ListenerId, RequestId};
use crate::protocol::{
    Alert, Failure, Frame, HandlerResult, KEEPALIVE, KEEPALIVE_ACK, Message, Request, Response,
};
use crate::registry::EventRegistry;

use super::config::{ConnectionConfig, millis};
use super::handler::{AsyncFnHandler, RequestHandler, SyncFnHandler, TypedHandler};
use super::liveness::{LivenessAction, LivenessMonitor};

// ============================================================================
// Constants
// ============================================================================

/// Registry channel for the `open` lifecycle event.
const OPEN_EVENT: &str = "open";

/// Registry channel for the `close` lifecycle event.
const CLOSE_EVENT: &str = "close";

/// Registry channel for the `error` lifecycle event.
const ERROR_EVENT: &str = "error";

/// Alert channels are namespaced so alert names never collide with
/// lifecycle channels.
const ALERT_PREFIX: &str = "alert:";

// ============================================================================
// Types
// ============================================================================

/// Map of request IDs to response channels.
type PendingTable = FxHashMap<RequestId, oneshot::Sender<Result<Value>>>;

/// Map of request names to handlers.
type HandlerMap = FxHashMap<String, Arc<dyn RequestHandler>>;

/// Write half of the socket.
type SocketSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;

/// A running request handler. Yields the encoded reply, if one could be built.
type HandlerCall = BoxFuture<'static, Option<String>>;

/// Result of handling one inbound text frame.
enum Inbound {
    /// Send this frame back immediately.
    Reply(String),
    /// Drive this handler on the event loop; it yields the reply.
    Dispatch(HandlerCall),
    /// Nothing to send.
    Ignore,
}

/// Lifecycle events a caller can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Socket opened and the outbound queue was flushed.
    Open,
    /// Socket closed, for any reason.
    Close,
    /// Socket-level error; always followed by `Close`.
    Error,
}

impl Lifecycle {
    #[inline]
    const fn channel(self) -> &'static str {
        match self {
            Self::Open => OPEN_EVENT,
            Self::Close => CLOSE_EVENT,
            Self::Error => ERROR_EVENT,
        }
    }
}

/// Payload delivered to registry listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// See [`Lifecycle::Open`].
    Open,
    /// See [`Lifecycle::Close`].
    Close(CloseInfo),
    /// See [`Lifecycle::Error`].
    Error(String),
    /// Alert pushed by the peer.
    Alert(Alert),
}

/// Why the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer sent a close frame.
    Remote,
    /// Closed from this side: shutdown, or every handle dropped.
    Local,
    /// The liveness monitor saw no traffic within the silence timeout.
    LivenessTimeout,
    /// A socket error.
    Error,
    /// The stream ended without a close frame.
    StreamEnded,
    /// The socket never opened.
    ConnectFailed,
}

/// Details of a closed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// What triggered the close.
    pub cause: CloseCause,
    /// WebSocket close code, if the peer sent one.
    pub code: Option<u16>,
    /// Close reason or error text.
    pub reason: String,
}

impl CloseInfo {
    fn new(cause: CloseCause, reason: impl Into<String>) -> Self {
        Self {
            cause,
            code: None,
            reason: reason.into(),
        }
    }

    fn remote(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self {
                cause: CloseCause::Remote,
                code: Some(u16::from(frame.code)),
                reason: frame.reason.as_str().to_string(),
            },
            None => Self::new(CloseCause::Remote, ""),
        }
    }
}

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Send a serialized frame (queued while the socket is not open).
    Send(String),
    /// Close the connection.
    Shutdown,
}

// ============================================================================
// Shared
// ============================================================================

/// State shared between handles and the event loop.
struct Shared {
    id: ConnectionId,
    config: ConnectionConfig,
    events: EventRegistry<TransportEvent>,
    pending: Mutex<PendingTable>,
    handlers: RwLock<HandlerMap>,
    connected: AtomicBool,
    last_request_id: AtomicU64,
}

// ============================================================================
// Connection
// ============================================================================

/// Bidirectional request/alert transport over one WebSocket.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync` and cheap to clone; clones share the same
/// socket. No method blocks: requests return a [`ResponseFuture`]
/// immediately.
pub struct Connection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Command receiver until the event loop takes it.
    startup: Arc<Mutex<Option<mpsc::UnboundedReceiver<ConnectionCommand>>>>,
    /// State shared with the event loop.
    shared: Arc<Shared>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            startup: Arc::clone(&self.startup),
            shared: Arc::clone(&self.shared),
        }
    }
}

// ============================================================================
// Connection - Constructors
// ============================================================================

impl Connection {
    /// Creates an unstarted connection.
    ///
    /// Requests and alerts sent before [`connect`](Self::connect) or
    /// [`attach`](Self::attach) are queued and flushed once the socket opens.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id: ConnectionId::generate(),
            config,
            events: EventRegistry::new(),
            pending: Mutex::new(PendingTable::default()),
            handlers: RwLock::new(HandlerMap::default()),
            connected: AtomicBool::new(false),
            last_request_id: AtomicU64::new(0),
        });

        Self {
            command_tx,
            startup: Arc::new(Mutex::new(Some(command_rx))),
            shared,
        }
    }

    /// Dials `url` in the background and starts the event loop.
    ///
    /// Returns immediately; the outcome is reported through the `open` or
    /// `error` + `close` lifecycle events.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL is invalid, not `ws`/`wss`, or the
    ///   config fails validation
    /// - [`Error::Connection`] if the connection was already started
    pub fn connect(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).map_err(|e| Error::config(format!("invalid URL {url}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        self.shared.config.validate()?;

        let command_rx = self.take_receiver()?;
        debug!(connection_id = %self.shared.id, %url, "Connecting");

        let opening = async move {
            let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            Ok::<_, Error>(stream)
        };

        self.spawn_event_loop(opening, command_rx);
        Ok(())
    }

    /// Adopts an already-open WebSocket stream and starts the event loop.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the config fails validation
    /// - [`Error::Connection`] if the connection was already started
    pub fn attach<S>(&self, stream: WebSocketStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.shared.config.validate()?;
        let command_rx = self.take_receiver()?;
        self.spawn_event_loop(ready(Ok(stream)), command_rx);
        Ok(())
    }

    fn take_receiver(&self) -> Result<mpsc::UnboundedReceiver<ConnectionCommand>> {
        self.startup
            .lock()
            .take()
            .ok_or_else(|| Error::connection("connection already started"))
    }

    fn spawn_event_loop<S, F>(
        &self,
        opening: F,
        command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = Result<WebSocketStream<S>>> + Send + 'static,
    {
        tokio::spawn(Self::run_event_loop(
            opening,
            command_rx,
            Arc::clone(&self.shared),
        ));
    }
}

// ============================================================================
// Connection - Requests
// ============================================================================

impl Connection {
    /// Sends a request and returns a future for its response data.
    ///
    /// The request ID is allocated, the pending entry recorded and the frame
    /// queued before this returns, so requests go out in call order. The
    /// future resolves with the response `data` on success, or fails with
    /// [`Error::Remote`] on an error response, [`Error::ConnectionClosed`] if
    /// the connection closes first, or [`Error::RequestTimeout`] if
    /// [`ConnectionConfig::request_timeout`] is set and expires.
    pub fn send_request(&self, request_name: &str, data: Value) -> ResponseFuture {
        self.send_request_inner(request_name, data, self.shared.config.request_timeout)
    }

    /// Like [`send_request`](Self::send_request) with an explicit timeout.
    ///
    /// On timeout the pending entry is removed; a late response is dropped
    /// as an orphan.
    pub fn send_request_with_timeout(
        &self,
        request_name: &str,
        data: Value,
        request_timeout: Duration,
    ) -> ResponseFuture {
        self.send_request_inner(request_name, data, Some(request_timeout))
    }

    /// Sends a typed request and deserializes the response data.
    ///
    /// # Errors
    ///
    /// As [`send_request`](Self::send_request), plus [`Error::Json`] if the
    /// input or output does not (de)serialize.
    pub async fn request<T, R>(&self, request_name: &str, data: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = serde_json::to_value(data)?;
        let value = self.send_request(request_name, data).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Returns the number of requests awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn send_request_inner(
        &self,
        request_name: &str,
        data: Value,
        request_timeout: Option<Duration>,
    ) -> ResponseFuture {
        match self.register_request(request_name, data) {
            Ok((request_id, response_rx)) => ResponseFuture::waiting(
                request_id,
                response_rx,
                request_timeout,
                Arc::downgrade(&self.shared),
            ),
            Err(e) => ResponseFuture::failed(e),
        }
    }

    fn register_request(
        &self,
        request_name: &str,
        data: Value,
    ) -> Result<(RequestId, oneshot::Receiver<Result<Value>>)> {
        let counter = self.shared.last_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request_id = RequestId::new(counter);

        let request = Request::new(request_id.clone(), request_name, data);
        let frame = Message::Request(request).encode()?;
        let (response_tx, response_rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock();
            if let Some(max) = self.shared.config.max_pending_requests
                && pending.len() >= max
            {
                warn!(pending = pending.len(), max, "Too many pending requests");
                return Err(Error::protocol(format!(
                    "Too many pending requests: {}/{}",
                    pending.len(),
                    max
                )));
            }
            pending.insert(request_id.clone(), response_tx);
        }

        if self
            .command_tx
            .send(ConnectionCommand::Send(frame))
            .is_err()
        {
            self.shared.pending.lock().remove(&request_id);
            return Err(Error::ConnectionClosed);
        }

        trace!(%request_id, request_name, "Request issued");
        Ok((request_id, response_rx))
    }
}

// ============================================================================
// Connection - Alerts & Lifecycle
// ============================================================================

impl Connection {
    /// Pushes an alert to the peer.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the payload does not serialize
    /// - [`Error::ConnectionClosed`] if the connection has closed
    pub fn send_alert(&self, alert_name: &str, data: Value) -> Result<()> {
        let frame = Message::Alert(Alert::new(alert_name, data)).encode()?;
        self.command_tx
            .send(ConnectionCommand::Send(frame))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Subscribes to an alert. The callback receives the alert's data.
    pub fn on_alert<F>(&self, alert_name: &str, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared
            .events
            .on(alert_channel(alert_name), alert_listener(callback))
    }

    /// Subscribes to the next occurrence of an alert only.
    pub fn one_alert<F>(&self, alert_name: &str, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared
            .events
            .one(alert_channel(alert_name), alert_listener(callback))
    }

    /// Cancels an alert subscription. Unknown IDs are ignored.
    #[inline]
    pub fn off_alert(&self, listener_id: ListenerId) {
        self.shared.events.off(listener_id);
    }

    /// Returns `true` if anything is subscribed to the alert.
    #[inline]
    #[must_use]
    pub fn is_listener_for_alert(&self, alert_name: &str) -> bool {
        self.shared.events.is_listener_for(&alert_channel(alert_name))
    }

    /// Subscribes to a lifecycle event.
    pub fn on<F>(&self, event: Lifecycle, callback: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(event.channel(), callback)
    }

    /// Subscribes to the next occurrence of a lifecycle event only.
    pub fn one<F>(&self, event: Lifecycle, callback: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.shared.events.one(event.channel(), callback)
    }

    /// Cancels a lifecycle subscription. Unknown IDs are ignored.
    #[inline]
    pub fn off(&self, listener_id: ListenerId) {
        self.shared.events.off(listener_id);
    }

    /// Removes every lifecycle and alert listener.
    #[inline]
    pub fn cancel_all_listeners(&self) {
        self.shared.events.cancel_all();
    }

    /// Returns `true` while the socket is open.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Returns the connection's log ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Closes the connection gracefully.
    ///
    /// Pending requests are rejected and `close` fires with
    /// [`CloseCause::Local`]. Not called on drop: clones share the socket.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }
}

// ============================================================================
// Connection - Request Handlers
// ============================================================================

impl Connection {
    /// Registers the responder for `request_name`, replacing any previous one.
    pub fn add_request_handler<H>(&self, request_name: impl Into<String>, handler: H)
    where
        H: RequestHandler,
    {
        let request_name = request_name.into();
        let previous = self
            .shared
            .handlers
            .write()
            .insert(request_name.clone(), Arc::new(handler));

        if previous.is_some() {
            debug!(request_name, "Request handler replaced");
        }
    }

    /// Registers an async closure as the responder for `request_name`.
    pub fn add_async_request_handler<F, Fut>(&self, request_name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_request_handler(request_name, AsyncFnHandler(handler));
    }

    /// Registers a synchronous closure as the responder for `request_name`.
    pub fn add_sync_request_handler<F>(&self, request_name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_request_handler(request_name, SyncFnHandler(handler));
    }

    /// Registers a typed responder.
    ///
    /// Requests whose data does not deserialize into `T` are declined with
    /// `InvalidType` without calling the handler.
    pub fn add_typed_request_handler<T, R, F, Fut>(
        &self,
        request_name: impl Into<String>,
        handler: F,
    ) where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, Failure>> + Send + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.add_request_handler(request_name, TypedHandler::<F, T, R>::new(handler));
    }

    /// Removes the responder for `request_name`. Returns `true` if one existed.
    pub fn clear_request_handler(&self, request_name: &str) -> bool {
        self.shared.handlers.write().remove(request_name).is_some()
    }

    /// Returns `true` if a responder is registered for `request_name`.
    #[must_use]
    pub fn has_request_handler(&self, request_name: &str) -> bool {
        self.shared.handlers.read().contains_key(request_name)
    }
}

// ============================================================================
// Connection - Event Loop
// ============================================================================

impl Connection {
    /// Event loop that owns the socket for its whole lifetime.
    async fn run_event_loop<S, F>(
        opening: F,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        shared: Arc<Shared>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = Result<WebSocketStream<S>>> + Send,
    {
        let mut queue = VecDeque::new();
        let mut liveness = LivenessMonitor::new(&shared.config);

        let opened =
            Self::await_open(opening, &mut command_rx, &mut queue, &mut liveness, &shared).await;
        let ws_stream = match opened {
            Ok(stream) => stream,
            Err(close) => {
                liveness.stop();
                Self::finish(&mut command_rx, &shared, close);
                return;
            }
        };

        // The upgrade response is traffic from the peer
        liveness.observe_traffic();

        let (mut ws_write, mut ws_read) = ws_stream.split();

        // Flush everything queued before open, in order
        let flushed = queue.len();
        for frame in queue.drain(..) {
            if let Err(e) = ws_write.send(WsMessage::Text(frame.into())).await {
                let close = Self::socket_error(&shared, e);
                liveness.stop();
                Self::finish(&mut command_rx, &shared, close);
                return;
            }
        }

        shared.connected.store(true, Ordering::Release);
        info!(connection_id = %shared.id, flushed, "Connection open");
        shared.events.fire(OPEN_EVENT, &TransportEvent::Open);

        let mut in_flight: FuturesUnordered<HandlerCall> = FuturesUnordered::new();

        let close = loop {
            tokio::select! {
                // Incoming frames from the peer
                message = ws_read.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            liveness.observe_traffic();

                            match Self::handle_incoming_text(&text, &shared) {
                                Inbound::Reply(reply) => {
                                    if let Err(e) = Self::send_text(&mut ws_write, &reply).await {
                                        break Self::socket_error(&shared, e);
                                    }
                                }
                                Inbound::Dispatch(call) => in_flight.push(call),
                                Inbound::Ignore => {}
                            }
                        }

                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!(connection_id = %shared.id, "WebSocket closed by remote");
                            break CloseInfo::remote(frame);
                        }

                        // Binary, Ping, Pong still prove the peer is alive
                        Some(Ok(_)) => {
                            liveness.observe_traffic();
                            trace!("Ignoring non-text frame");
                        }

                        Some(Err(e)) => break Self::socket_error(&shared, e),

                        None => {
                            debug!(connection_id = %shared.id, "WebSocket stream ended");
                            break CloseInfo::new(CloseCause::StreamEnded, "stream ended");
                        }
                    }
                }

                // Replies from request handlers, in completion order
                Some(reply) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Some(reply) = reply
                        && let Err(e) = Self::send_text(&mut ws_write, &reply).await
                    {
                        break Self::socket_error(&shared, e);
                    }
                }

                // Commands from API handles
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send(frame)) => {
                            trace!(len = frame.len(), "Sending frame");
                            if let Err(e) = ws_write.send(WsMessage::Text(frame.into())).await {
                                break Self::socket_error(&shared, e);
                            }
                        }

                        Some(ConnectionCommand::Shutdown) => {
                            debug!(connection_id = %shared.id, "Shutdown command received");
                            let _ = ws_write.close().await;
                            break CloseInfo::new(CloseCause::Local, "shutdown");
                        }

                        None => {
                            debug!(connection_id = %shared.id, "All connection handles dropped");
                            let _ = ws_write.close().await;
                            break CloseInfo::new(CloseCause::Local, "dropped");
                        }
                    }
                }

                // Keepalive ticks and silence detection
                action = liveness.next_action(shared.connected.load(Ordering::Acquire)) => {
                    match action {
                        LivenessAction::SendKeepalive => {
                            if let Err(e) = Self::send_text(&mut ws_write, KEEPALIVE).await {
                                break Self::socket_error(&shared, e);
                            }
                        }

                        LivenessAction::ForceClose => {
                            warn!(
                                connection_id = %shared.id,
                                "No traffic from peer, closing socket"
                            );
                            let _ = ws_write.close().await;
                            break CloseInfo::new(CloseCause::LivenessTimeout, "keepalive timeout");
                        }
                    }
                }
            }
        };

        if !in_flight.is_empty() {
            debug!(count = in_flight.len(), "Dropping unfinished request handlers");
        }
        liveness.stop();
        Self::finish(&mut command_rx, &shared, close);
    }

    /// Waits for the socket to open, queueing frames in the meantime.
    ///
    /// A keepalive tick while still opening gives up on the socket.
    async fn await_open<S, F>(
        opening: F,
        command_rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
        queue: &mut VecDeque<String>,
        liveness: &mut LivenessMonitor,
        shared: &Shared,
    ) -> std::result::Result<WebSocketStream<S>, CloseInfo>
    where
        F: Future<Output = Result<WebSocketStream<S>>>,
    {
        tokio::pin!(opening);

        loop {
            tokio::select! {
                result = &mut opening => {
                    return result.map_err(|e| {
                        error!(connection_id = %shared.id, error = %e, "Failed to open WebSocket");
                        shared.events.fire(ERROR_EVENT, &TransportEvent::Error(e.to_string()));
                        CloseInfo::new(CloseCause::ConnectFailed, e.to_string())
                    });
                }

                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send(frame)) => {
                            queue.push_back(frame);
                            debug!(queued = queue.len(), "Socket not open yet, message queued");
                        }
                        Some(ConnectionCommand::Shutdown) => {
                            return Err(CloseInfo::new(CloseCause::Local, "shutdown before open"));
                        }
                        None => {
                            return Err(CloseInfo::new(CloseCause::Local, "dropped before open"));
                        }
                    }
                }

                action = liveness.next_action(false) => {
                    // Not open yet, so every action is a forced close
                    warn!(connection_id = %shared.id, ?action, "WebSocket did not open in time");
                    return Err(CloseInfo::new(CloseCause::LivenessTimeout, "socket never opened"));
                }
            }
        }
    }

    /// Handles one incoming text frame.
    fn handle_incoming_text(text: &str, shared: &Shared) -> Inbound {
        let message = match Frame::parse(text) {
            Ok(Frame::Keepalive) => return Inbound::Reply(KEEPALIVE_ACK.to_string()),
            Ok(Frame::KeepaliveAck) => return Inbound::Ignore,
            Ok(Frame::Message(message)) => message,
            Err(e) => {
                warn!(error = %e, text = %text, "Dropping malformed message");
                return Inbound::Ignore;
            }
        };

        trace!(kind = message.kind(), "Message received");

        match message {
            Message::Request(request) => Self::handle_request(request, shared),

            Message::Response(response) => {
                Self::settle_pending(response, shared);
                Inbound::Ignore
            }

            Message::Alert(alert) => {
                let channel = alert_channel(&alert.alert_name);
                let delivered = shared.events.fire(&channel, &TransportEvent::Alert(alert));
                trace!(channel, delivered, "Alert dispatched");
                Inbound::Ignore
            }
        }
    }

    /// Runs an inbound request through its handler.
    ///
    /// Unknown requests are answered inline. Known requests become a
    /// [`HandlerCall`] driven by the event loop, so handlers start in arrival
    /// order and never run in parallel with each other.
    fn handle_request(request: Request, shared: &Shared) -> Inbound {
        let Request {
            req_id,
            request_name,
            data,
        } = request;

        let handler = shared.handlers.read().get(&request_name).cloned();
        let Some(handler) = handler else {
            warn!(request_name, "No handler for request");
            let outcome = Err(Failure::unknown_request(&request_name));
            return match encode_reply(Response::from_outcome(req_id, outcome)) {
                Some(reply) => Inbound::Reply(reply),
                None => Inbound::Ignore,
            };
        };

        // Panics from both the call and every poll are caught
        let call = async move {
            let outcome = AssertUnwindSafe(async move { handler.handle(data).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(request_name, "Request handler panicked");
                    Err(Failure::server_error())
                });

            encode_reply(Response::from_outcome(req_id, outcome))
        };

        Inbound::Dispatch(call.boxed())
    }

    /// Settles the pending request a response belongs to.
    fn settle_pending(response: Response, shared: &Shared) {
        let response_tx = shared.pending.lock().remove(&response.req_id);

        let Some(response_tx) = response_tx else {
            warn!(req_id = %response.req_id, "Response for unknown request");
            return;
        };

        trace!(req_id = %response.req_id, status = %response.status, "Response received");
        let _ = response_tx.send(response.into_result());
    }

    async fn send_text<S>(
        ws_write: &mut SocketSink<S>,
        text: &str,
    ) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        ws_write.send(WsMessage::Text(text.into())).await
    }

    fn socket_error(shared: &Shared, e: tokio_tungstenite::tungstenite::Error) -> CloseInfo {
        error!(connection_id = %shared.id, error = %e, "WebSocket error");
        shared.events.fire(ERROR_EVENT, &TransportEvent::Error(e.to_string()));
        CloseInfo::new(CloseCause::Error, e.to_string())
    }

    /// Tears the connection down and fires `close`.
    fn finish(
        command_rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
        shared: &Shared,
        close: CloseInfo,
    ) {
        // Stop accepting frames before draining, so no new entry can slip in
        command_rx.close();
        shared.connected.store(false, Ordering::Release);
        Self::fail_pending_requests(shared);

        info!(
            connection_id = %shared.id,
            cause = ?close.cause,
            code = ?close.code,
            reason = %close.reason,
            "Connection closed"
        );
        shared.events.fire(CLOSE_EVENT, &TransportEvent::Close(close));
    }

    /// Fails all pending requests with ConnectionClosed error.
    fn fail_pending_requests(shared: &Shared) {
        let pending: Vec<_> = shared.pending.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on close");
        }
    }
}

// ============================================================================
// ResponseFuture
// ============================================================================

/// Future returned by [`Connection::send_request`].
///
/// Resolves to the response data. Dropping it forgets the request: its
/// pending entry is removed and a late response is dropped as an orphan.
pub struct ResponseFuture {
    state: ResponseState,
}

enum ResponseState {
    Waiting {
        request_id: RequestId,
        response_rx: oneshot::Receiver<Result<Value>>,
        deadline: Option<(Pin<Box<Sleep>>, Duration)>,
        shared: Weak<Shared>,
    },
    Failed(Option<Error>),
}

impl ResponseFuture {
    fn waiting(
        request_id: RequestId,
        response_rx: oneshot::Receiver<Result<Value>>,
        request_timeout: Option<Duration>,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            state: ResponseState::Waiting {
                request_id,
                response_rx,
                deadline: request_timeout.map(|t| (Box::pin(sleep(t)), t)),
                shared,
            },
        }
    }

    fn failed(error: Error) -> Self {
        Self {
            state: ResponseState::Failed(Some(error)),
        }
    }

    /// Returns the request ID, unless the request failed before being sent.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match &self.state {
            ResponseState::Waiting { request_id, .. } => Some(request_id),
            ResponseState::Failed(_) => None,
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            ResponseState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(Error::ConnectionClosed)))
            }

            ResponseState::Waiting {
                request_id,
                response_rx,
                deadline,
                shared,
            } => {
                if let Poll::Ready(result) = Pin::new(response_rx).poll(cx) {
                    return Poll::Ready(result.unwrap_or(Err(Error::ConnectionClosed)));
                }

                if let Some((sleep, request_timeout)) = deadline
                    && sleep.as_mut().poll(cx).is_ready()
                {
                    if let Some(shared) = shared.upgrade() {
                        shared.pending.lock().remove(&*request_id);
                    }
                    debug!(%request_id, "Request timed out");
                    return Poll::Ready(Err(Error::request_timeout(
                        request_id.clone(),
                        millis(*request_timeout),
                    )));
                }

                Poll::Pending
            }
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if let ResponseState::Waiting {
            request_id, shared, ..
        } = &self.state
            && let Some(shared) = shared.upgrade()
            && shared.pending.lock().remove(request_id).is_some()
        {
            trace!(%request_id, "Response future dropped before settling");
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Registry channel for an alert name.
fn alert_channel(alert_name: &str) -> String {
    format!("{ALERT_PREFIX}{alert_name}")
}

/// Wraps a data callback as a registry listener.
fn alert_listener<F>(callback: F) -> impl Fn(&TransportEvent) + Send + Sync + 'static
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    move |event: &TransportEvent| {
        if let TransportEvent::Alert(alert) = event {
            callback(&alert.data);
        }
    }
}

/// Serializes a reply, logging failures.
fn encode_reply(response: Response) -> Option<String> {
    match Message::Response(response).encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, task};

    use crate::protocol::{SERVER_ERROR, Success, UNKNOWN_REQUEST};
    use crate::transport::{ConnectionListener, ListenerConfig};

    const WAIT: Duration = Duration::from_secs(5);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Resolves once the lifecycle event fires. Register before starting.
    fn lifecycle_signal(conn: &Connection, event: Lifecycle) -> oneshot::Receiver<TransportEvent> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        conn.one(event, move |payload| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(payload.clone());
            }
        });
        rx
    }

    async fn await_close(closed: oneshot::Receiver<TransportEvent>) -> CloseInfo {
        match timeout(WAIT, closed).await.expect("in time").expect("fired") {
            TransportEvent::Close(info) => info,
            other => panic!("expected close payload, got {other:?}"),
        }
    }

    /// A connected (client, server) pair over localhost.
    async fn connected_pair(server: Connection) -> (Connection, Connection) {
        init_tracing();
        let listener = ConnectionListener::bind(ListenerConfig::new())
            .await
            .expect("bind should succeed");

        let client = Connection::new(ConnectionConfig::new());
        let opened = lifecycle_signal(&client, Lifecycle::Open);

        client.connect(&listener.ws_url()).expect("connect");
        listener.accept_into(&server).await.expect("accept");
        timeout(WAIT, opened).await.expect("open in time").expect("open fired");

        (client, server)
    }

    /// A raw WebSocket peer the client dials, for scripting the other side.
    async fn raw_peer(client: &Connection) -> WebSocketStream<tokio::net::TcpStream> {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        client
            .connect(&format!("ws://127.0.0.1:{port}/controlWS"))
            .expect("connect");

        let (stream, _) = listener.accept().await.expect("accept");
        tokio_tungstenite::accept_async(stream)
            .await
            .expect("handshake")
    }

    async fn next_text(peer: &mut WebSocketStream<tokio::net::TcpStream>) -> String {
        loop {
            let message = timeout(WAIT, peer.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .expect("valid frame");
            if let WsMessage::Text(text) = message {
                return text.as_str().to_string();
            }
        }
    }

    async fn explode_later(_data: Value) -> HandlerResult {
        tokio::task::yield_now().await;
        panic!("async handler exploded")
    }

    #[tokio::test]
    async fn test_echo_round_trip() -> anyhow::Result<()> {
        let server = Connection::new(ConnectionConfig::new());
        server.add_sync_request_handler("echo", |data| Ok(Success::new(data)));
        let (client, _server) = connected_pair(server).await;

        let result = client.send_request("echo", json!({"x": 1})).await?;
        assert_eq!(result, json!({"x": 1}));
        assert_eq!(client.pending_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_request_rejected() {
        let (client, _server) = connected_pair(Connection::new(ConnectionConfig::new())).await;

        let err = client
            .send_request("doesNotExist", json!({}))
            .await
            .expect_err("should be rejected");

        assert_eq!(err.error_code(), Some(UNKNOWN_REQUEST));
        assert!(err.to_string().contains("doesNotExist"));
    }

    #[tokio::test]
    async fn test_panicking_handlers_yield_server_error() {
        let server = Connection::new(ConnectionConfig::new());
        server.add_sync_request_handler("boom", |_| panic!("handler exploded"));
        server.add_async_request_handler("lateBoom", explode_later);
        server.add_sync_request_handler("ok", |_| Ok(Success::new(json!(true))));
        let (client, _server) = connected_pair(server).await;

        let sync_err = client.send_request("boom", Value::Null).await.expect_err("fault");
        assert_eq!(sync_err.error_code(), Some(SERVER_ERROR));
        assert!(!sync_err.to_string().contains("exploded"));

        let async_err = client.send_request("lateBoom", Value::Null).await.expect_err("fault");
        assert_eq!(async_err.error_code(), Some(SERVER_ERROR));

        // The transport survives
        let ok = client.send_request("ok", Value::Null).await.expect("still serving");
        assert_eq!(ok, json!(true));
    }

    #[tokio::test]
    async fn test_typed_handler_and_custom_status() {
        #[derive(serde::Deserialize)]
        struct Volume {
            level: u8,
        }

        let server = Connection::new(ConnectionConfig::new());
        server.add_typed_request_handler("setVolume", |volume: Volume| async move {
            Ok::<_, Failure>(json!({ "applied": volume.level }))
        });
        server.add_sync_request_handler("enqueue", |data| {
            Ok(Success::new(data).with_status("queued").with_message("added"))
        });
        let (client, _server) = connected_pair(server).await;

        let applied: Value = client
            .request("setVolume", &json!({"level": 7}))
            .await
            .expect("typed request");
        assert_eq!(applied, json!({"applied": 7}));

        let err = client
            .send_request("setVolume", json!({"level": "loud"}))
            .await
            .expect_err("type guard");
        assert_eq!(err.error_code(), Some("InvalidType"));

        let queued = client.send_request("enqueue", json!(3)).await.expect("custom status");
        assert_eq!(queued, json!(3));
    }

    #[tokio::test]
    async fn test_requests_before_open_are_flushed_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let server = Connection::new(ConnectionConfig::new());
        {
            let seen = Arc::clone(&seen);
            server.add_sync_request_handler("seq", move |data| {
                seen.lock().push(data.clone());
                Ok(Success::new(data))
            });
        }

        let listener = ConnectionListener::bind(ListenerConfig::new())
            .await
            .expect("bind should succeed");
        let client = Connection::new(ConnectionConfig::new());
        let opened = Arc::new(AtomicBool::new(false));
        {
            let opened = Arc::clone(&opened);
            client.on(Lifecycle::Open, move |_| opened.store(true, Ordering::SeqCst));
        }

        let futures: Vec<_> = (0..10)
            .map(|i| client.send_request("seq", json!(i)))
            .collect();

        let mut last = task::spawn(client.send_request("seq", json!(10)));
        assert_pending!(last.poll());
        assert!(!client.is_connected());
        assert!(!opened.load(Ordering::SeqCst));
        assert_eq!(client.pending_count(), 11);

        client.connect(&listener.ws_url()).expect("connect");
        listener.accept_into(&server).await.expect("accept");

        for (i, future) in futures.into_iter().enumerate() {
            let value = timeout(WAIT, future).await.expect("in time").expect("response");
            assert_eq!(value, json!(i));
        }
        let last = timeout(WAIT, last.into_inner()).await.expect("in time");
        assert_eq!(last.expect("response"), json!(10));

        let expected: Vec<Value> = (0..=10).map(|i| json!(i)).collect();
        assert_eq!(*seen.lock(), expected);
        assert!(opened.load(Ordering::SeqCst));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_alerts_reach_listeners_in_order() {
        let (client, server) = connected_pair(Connection::new(ConnectionConfig::new())).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = {
            let tx = tx.clone();
            client.on_alert("foo", move |data| {
                let _ = tx.send(("first", data.clone()));
            })
        };
        {
            let tx = tx.clone();
            client.on_alert("foo", move |data| {
                let _ = tx.send(("second", data.clone()));
            });
        }
        assert!(client.is_listener_for_alert("foo"));

        server.send_alert("foo", json!(1)).expect("send alert");
        assert_eq!(rx.recv().await, Some(("first", json!(1))));
        assert_eq!(rx.recv().await, Some(("second", json!(1))));

        client.off_alert(first);
        server.send_alert("foo", json!(2)).expect("send alert");
        assert_eq!(rx.recv().await, Some(("second", json!(2))));
    }

    #[tokio::test]
    async fn test_one_alert_and_namespacing() {
        let (client, server) = connected_pair(Connection::new(ConnectionConfig::new())).await;

        let once = Arc::new(AtomicUsize::new(0));
        {
            let once = Arc::clone(&once);
            client.one_alert("tick", move |_| {
                once.fetch_add(1, Ordering::SeqCst);
            });
        }

        // An alert named like a lifecycle event must not reach lifecycle listeners
        let lifecycle_hits = Arc::new(AtomicUsize::new(0));
        {
            let lifecycle_hits = Arc::clone(&lifecycle_hits);
            client.on(Lifecycle::Close, move |_| {
                lifecycle_hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        client.on_alert("done", move |_| {
            let _ = done_tx.send(());
        });

        for _ in 0..3 {
            server.send_alert("tick", Value::Null).expect("send alert");
        }
        server.send_alert("close", Value::Null).expect("send alert");
        server.send_alert("done", Value::Null).expect("send alert");
        timeout(WAIT, done_rx.recv()).await.expect("in time");

        assert_eq!(once.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle_hits.load(Ordering::SeqCst), 0);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_close_rejects_pending_requests() {
        let server = Connection::new(ConnectionConfig::new());
        server.add_async_request_handler("never", |_| std::future::pending());
        let (client, server) = connected_pair(server).await;
        let closed = lifecycle_signal(&client, Lifecycle::Close);

        let pending = client.send_request("never", Value::Null);
        tokio::task::yield_now().await;
        server.shutdown();

        let err = timeout(WAIT, pending).await.expect("settled").expect_err("rejected");
        assert!(matches!(err, Error::ConnectionClosed));

        let info = await_close(closed).await;
        assert_eq!(info.cause, CloseCause::Remote);
        assert!(!client.is_connected());
        assert_eq!(client.pending_count(), 0);

        // Requests after close fail immediately
        let late = client.send_request("never", Value::Null).await;
        assert!(matches!(late, Err(Error::ConnectionClosed)));
        assert!(matches!(client.send_alert("x", Value::Null), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_duplicate_and_malformed_frames_are_dropped() {
        let client = Connection::new(ConnectionConfig::new());
        let first = client.send_request("status", Value::Null);
        let mut peer = raw_peer(&client).await;

        let request: Value = serde_json::from_str(&next_text(&mut peer).await).expect("json");
        assert_eq!(request["req"], json!("status"));
        let req_id = request["reqId"].clone();

        peer.send(WsMessage::Text("garbage".into())).await.expect("send");
        peer.send(WsMessage::Text(r#"{"reqId":"1","alertName":"x"}"#.into()))
            .await
            .expect("send");
        for data in ["first", "second"] {
            let response = json!({
                "reqId": req_id,
                "status": "okay",
                "message": null,
                "data": data,
                "errorCode": null
            });
            peer.send(WsMessage::Text(response.to_string().into()))
                .await
                .expect("send");
        }

        assert_eq!(timeout(WAIT, first).await.expect("in time").expect("ok"), json!("first"));

        // Still alive and correlating after the junk
        let second = client.send_request("status", Value::Null);
        let request: Value = serde_json::from_str(&next_text(&mut peer).await).expect("json");
        assert_ne!(request["reqId"], req_id);
        let response = json!({"reqId": request["reqId"], "status": "okay", "data": 2});
        peer.send(WsMessage::Text(response.to_string().into()))
            .await
            .expect("send");

        assert_eq!(timeout(WAIT, second).await.expect("in time").expect("ok"), json!(2));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_is_acknowledged() {
        let client = Connection::new(ConnectionConfig::new());
        let mut peer = raw_peer(&client).await;

        peer.send(WsMessage::Text(KEEPALIVE.into())).await.expect("send");
        assert_eq!(next_text(&mut peer).await, KEEPALIVE_ACK);
    }

    #[tokio::test]
    async fn test_silent_peer_is_force_closed() {
        let config = ConnectionConfig::new()
            .with_keepalive_interval(Duration::from_millis(100))
            .with_grace_margin(Duration::from_millis(50));
        let client = Connection::new(config);
        let closed = lifecycle_signal(&client, Lifecycle::Close);
        let mut peer = raw_peer(&client).await;

        // Read (and ignore) the keepalives, never answer
        let reader = tokio::spawn(async move { while let Some(Ok(_)) = peer.next().await {} });

        let info = await_close(closed).await;
        assert_eq!(info.cause, CloseCause::LivenessTimeout);
        assert!(!client.is_connected());
        reader.abort();
    }

    #[tokio::test]
    async fn test_stalled_handshake_is_force_closed() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        // Accept TCP, never answer the upgrade
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            std::future::pending::<()>().await;
            drop(stream);
        });

        let config = ConnectionConfig::new()
            .with_keepalive_interval(Duration::from_millis(100))
            .with_grace_margin(Duration::from_millis(50));
        let client = Connection::new(config);
        let closed = lifecycle_signal(&client, Lifecycle::Close);
        let queued = client.send_request("status", Value::Null);

        client
            .connect(&format!("ws://127.0.0.1:{port}/controlWS"))
            .expect("connect");

        let info = await_close(closed).await;
        assert_eq!(info.cause, CloseCause::LivenessTimeout);
        assert!(matches!(queued.await, Err(Error::ConnectionClosed)));
        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_connected());
        holder.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handlers_start_in_arrival_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let server = Connection::new(ConnectionConfig::new());
        {
            let order = Arc::clone(&order);
            server.add_sync_request_handler("set", move |data| {
                if data == json!(1) {
                    std::thread::sleep(Duration::from_millis(200));
                }
                order.lock().push(data.clone());
                Ok(Success::new(data))
            });
        }
        let (client, _server) = connected_pair(server).await;

        let first = client.send_request("set", json!(1));
        let second = client.send_request("set", json!(2));
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.expect("set 1"), json!(1));
        assert_eq!(second.expect("set 2"), json!(2));
        assert_eq!(*order.lock(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_others() {
        let server = Connection::new(ConnectionConfig::new());
        server.add_async_request_handler("slow", |data| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Success::new(data))
        });
        server.add_sync_request_handler("fast", |data| Ok(Success::new(data)));
        let (client, _server) = connected_pair(server).await;

        let mut slow = task::spawn(client.send_request("slow", json!("s")));
        let fast = timeout(Duration::from_millis(150), client.send_request("fast", json!("f")))
            .await
            .expect("fast reply overtakes slow one");
        assert_eq!(fast.expect("fast"), json!("f"));
        assert_pending!(slow.poll());

        let slow = timeout(WAIT, slow.into_inner()).await.expect("in time");
        assert_eq!(slow.expect("slow"), json!("s"));
    }

    #[tokio::test]
    async fn test_dropped_response_future_releases_entry() {
        let client = Connection::new(ConnectionConfig::new());
        let kept = client.send_request("kept", Value::Null);
        let dropped = client.send_request("dropped", Value::Null);
        assert_eq!(client.pending_count(), 2);

        drop(dropped);
        assert_eq!(client.pending_count(), 1);
        assert_eq!(kept.request_id(), Some(&RequestId::new(1)));
    }

    #[tokio::test]
    async fn test_request_timeout_removes_entry() {
        let client = Connection::new(ConnectionConfig::new());
        let err = client
            .send_request_with_timeout("slow", Value::Null, Duration::from_millis(20))
            .await
            .expect_err("timeout");

        assert!(err.is_timeout());
        assert!(matches!(err, Error::RequestTimeout { timeout_ms: 20, .. }));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_fires_error_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let client = Connection::new(ConnectionConfig::new());
        let errored = lifecycle_signal(&client, Lifecycle::Error);
        let closed = lifecycle_signal(&client, Lifecycle::Close);
        let queued = client.send_request("x", Value::Null);

        client.connect(&format!("ws://127.0.0.1:{port}/controlWS")).expect("spawned");

        assert!(matches!(
            timeout(WAIT, errored).await.expect("in time").expect("fired"),
            TransportEvent::Error(_)
        ));
        let info = await_close(closed).await;
        assert_eq!(info.cause, CloseCause::ConnectFailed);
        assert!(matches!(queued.await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_start_validation() {
        let client = Connection::new(ConnectionConfig::new());
        assert!(matches!(client.connect("http://example.com"), Err(Error::Config { .. })));
        assert!(matches!(client.connect("not a url"), Err(Error::Config { .. })));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let url = format!("ws://127.0.0.1:{port}/controlWS");
        client.connect(&url).expect("first start");
        assert!(matches!(client.connect(&url), Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_max_pending_requests() {
        let client = Connection::new(ConnectionConfig::new().with_max_pending_requests(1));
        let _first = client.send_request("a", Value::Null);

        let second = client.send_request("b", Value::Null);
        assert!(second.request_id().is_none());
        assert!(matches!(second.await, Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_request_ids_are_per_connection() {
        let a = Connection::new(ConnectionConfig::new());
        let b = Connection::new(ConnectionConfig::new());

        let a1 = a.send_request("x", Value::Null);
        let a2 = a.send_request("x", Value::Null);
        let b1 = b.send_request("x", Value::Null);

        assert_eq!(a1.request_id(), Some(&RequestId::new(1)));
        assert_eq!(a2.request_id(), Some(&RequestId::new(2)));
        assert_eq!(b1.request_id(), Some(&RequestId::new(1)));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_alert_channels_do_not_collide_with_lifecycle() {
        for event in [Lifecycle::Open, Lifecycle::Close, Lifecycle::Error] {
            assert_ne!(alert_channel(event.channel()), event.channel());
        }
    }
}
