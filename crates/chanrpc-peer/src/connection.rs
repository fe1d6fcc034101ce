//! The RPC engine.
//!
//! A [`Connection`] owns one message [`Transport`]. Outbound requests get a
//! per-connection id and wait for the matching `Response` or `Error`; inbound
//! requests are dispatched to registered handlers and answered on the same
//! transport.
//!
//! Handlers run on spawned tasks, so a slow handler never blocks the reader.
//! Inbound messages are decoded and dispatched in arrival order.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use chanrpc_frame::{FrameError, DEFAULT_MAX_PAYLOAD};
use chanrpc_protocol::{
    ProtocolEntry, ProtocolError, ProtocolRepository, RemoteError, RequestHeaders,
    ResponseHeaders, Value, WireMessage,
};
use chanrpc_transport::{Incoming, MessageSink, Transport};
use futures_util::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{PeerError, Result};
use crate::handler::{NotificationHandler, Outcome, RequestContext, RequestHandler};
use crate::reply::{Reply, ReplyStream};
use crate::sync::{lock, read, write};

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// How long a request waits for its response. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Largest encoded message this connection will send.
    pub max_payload_size: usize,
}

impl ConnectionOptions {
    /// Fail requests that get no response within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Let requests wait for their response indefinitely.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

type ErrorSink = Arc<dyn Fn(&PeerError) + Send + Sync>;

const MAX_EARLY_CANCELS: usize = 256;

/// Whether `id` comes after `last` in the wrapping id sequence.
fn is_ahead(id: u32, last: u32) -> bool {
    (id.wrapping_sub(last) as i32) > 0
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Reply>>,
}

#[derive(Default)]
struct CallState {
    pending: HashMap<u32, PendingCall>,
    cancellation_sources: HashMap<u32, CancellationToken>,
    // Cancels that arrived before their request. Only ids ahead of
    // `last_request` are kept, at most MAX_EARLY_CANCELS of them.
    known_canceled: HashSet<u32>,
    last_request: Option<u32>,
    streams: HashMap<u32, mpsc::UnboundedSender<Result<Bytes>>>,
}

#[derive(Default)]
struct Handlers {
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    request_not_found: Option<Arc<dyn RequestHandler>>,
    notifications: HashMap<String, NotificationHandler>,
    notification_not_found: Option<NotificationHandler>,
}

struct Inner {
    sink: Arc<dyn MessageSink>,
    incoming: Mutex<Option<Incoming>>,
    repository: RwLock<ProtocolRepository>,
    options: ConnectionOptions,
    next_id: AtomicU32,
    calls: Mutex<CallState>,
    handlers: RwLock<Handlers>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    close_listeners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    error_sink: Mutex<Option<ErrorSink>>,
}

/// An RPC connection over one message transport.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection with default options.
    pub fn new(transport: Transport) -> Self {
        Self::with_options(transport, ConnectionOptions::default())
    }

    /// Create a connection with explicit options.
    pub fn with_options(transport: Transport, options: ConnectionOptions) -> Self {
        let (sink, incoming) = transport.into_parts();
        Self {
            inner: Arc::new(Inner {
                sink,
                incoming: Mutex::new(Some(incoming)),
                repository: RwLock::new(ProtocolRepository::new()),
                options,
                next_id: AtomicU32::new(0),
                calls: Mutex::new(CallState::default()),
                handlers: RwLock::new(Handlers::default()),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                close_listeners: Mutex::new(Vec::new()),
                error_sink: Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Replace the protocol repository.
    pub fn set_protocol_repository(&self, repository: ProtocolRepository) {
        *write(&self.inner.repository) = repository;
    }

    /// Register a typed protocol entry. Both peers must register it.
    pub fn register_protocol(&self, entry: ProtocolEntry) -> Result<()> {
        write(&self.inner.repository).register(entry)?;
        Ok(())
    }

    /// Register several protocol entries.
    pub fn load_protocol<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = ProtocolEntry>,
    {
        write(&self.inner.repository).load_entries(entries)?;
        Ok(())
    }

    pub fn has_protocol(&self, method: &str) -> bool {
        read(&self.inner.repository).has_entry(method)
    }

    /// Start reading the transport. Must be called exactly once.
    pub fn listen(&self) -> Result<()> {
        let incoming = lock(&self.inner.incoming)
            .take()
            .ok_or(PeerError::AlreadyListening)?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.read_loop(incoming));
        Ok(())
    }

    /// Call `method` and wait for its reply.
    ///
    /// A remote without a handler for `method` yields
    /// [`Reply::MethodNotRegistered`], not an error.
    pub async fn send_request(&self, method: &str, args: Vec<Value>) -> Result<Reply> {
        self.call(method, args, None).await
    }

    /// Call `method` as a cancelable request.
    ///
    /// If `token` is already cancelled nothing is sent. Cancelling it later
    /// sends a `Cancel` to the remote handler; the call still waits for the
    /// remote's reply.
    pub async fn send_request_with_cancellation(
        &self,
        method: &str,
        args: Vec<Value>,
        token: CancellationToken,
    ) -> Result<Reply> {
        self.call(method, args, Some(token)).await
    }

    /// Fire-and-forget call.
    pub fn send_notification(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.send_message(&WireMessage::Notification {
            id,
            method: method.to_string(),
            headers: RequestHeaders::default(),
            args,
        })
    }

    /// Ask the remote to cancel an in-flight request.
    pub fn cancel_request(&self, id: u32) -> Result<()> {
        debug!(request_id = id, "sending cancel");
        self.inner.send_message(&WireMessage::Cancel { id })
    }

    /// Serve requests for `method`, replacing any previous handler.
    pub fn on_request(&self, method: &str, handler: impl RequestHandler) -> Registration {
        write(&self.inner.handlers)
            .requests
            .insert(method.to_string(), Arc::new(handler));
        self.registration(Slot::Request(method.to_string()))
    }

    /// Serve requests for every method without its own handler.
    pub fn on_request_not_found(&self, handler: impl RequestHandler) -> Registration {
        write(&self.inner.handlers).request_not_found = Some(Arc::new(handler));
        self.registration(Slot::RequestNotFound)
    }

    /// Receive notifications for `method`.
    pub fn on_notification<F>(&self, method: &str, handler: F) -> Registration
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |_: &str, args| handler(args));
        write(&self.inner.handlers)
            .notifications
            .insert(method.to_string(), handler);
        self.registration(Slot::Notification(method.to_string()))
    }

    /// Receive notifications for every method without its own handler.
    pub fn on_notification_not_found<F>(&self, handler: F) -> Registration
    where
        F: Fn(&str, Vec<Value>) + Send + Sync + 'static,
    {
        write(&self.inner.handlers).notification_not_found = Some(Arc::new(handler));
        self.registration(Slot::NotificationNotFound)
    }

    /// Install the sink that receives decode failures before the
    /// connection closes.
    pub fn on_error<F>(&self, sink: F)
    where
        F: Fn(&PeerError) + Send + Sync + 'static,
    {
        *lock(&self.inner.error_sink) = Some(Arc::new(sink));
    }

    /// Run `listener` once the connection closes (immediately if it is
    /// already closed).
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut listeners = lock(&self.inner.close_listeners);
        if self.is_closed() {
            drop(listeners);
            listener();
        } else {
            listeners.push(Box::new(listener));
        }
    }

    /// Close the transport and fail every pending call.
    pub fn close(&self) {
        self.inner.close("connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.calls).pending.len()
    }

    fn registration(&self, slot: Slot) -> Registration {
        Registration {
            inner: Arc::downgrade(&self.inner),
            slot,
        }
    }

    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        token: Option<CancellationToken>,
    ) -> Result<Reply> {
        if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(PeerError::Canceled);
        }
        if self.is_closed() {
            return Err(PeerError::Disconnected("connection closed".to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.calls).pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };

        self.inner.send_message(&WireMessage::Request {
            id,
            method: method.to_string(),
            headers: RequestHeaders {
                cancelable: token.is_some(),
            },
            args,
        })?;
        debug!(request_id = id, method, "request sent");

        let wait = self.wait_reply(id, rx, token);
        match self.inner.options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(request_id = id, method, ?timeout, "request timed out");
                    Err(PeerError::MethodTimeout {
                        method: method.to_string(),
                        timeout,
                    })
                }
            },
            None => wait.await,
        }
    }

    async fn wait_reply(
        &self,
        id: u32,
        mut rx: oneshot::Receiver<Result<Reply>>,
        token: Option<CancellationToken>,
    ) -> Result<Reply> {
        if let Some(token) = token {
            tokio::select! {
                reply = &mut rx => return reply_or_disconnected(reply),
                _ = token.cancelled() => {
                    if let Err(err) = self.cancel_request(id) {
                        debug!(request_id = id, error = %err, "failed to send cancel");
                    }
                }
            }
        }
        reply_or_disconnected(rx.await)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_requests())
            .field("options", &self.inner.options)
            .finish()
    }
}

fn reply_or_disconnected(
    reply: std::result::Result<Result<Reply>, oneshot::error::RecvError>,
) -> Result<Reply> {
    reply.unwrap_or_else(|_| Err(PeerError::Disconnected("connection closed".to_string())))
}

struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(call) = lock(&self.inner.calls).pending.remove(&self.id) {
            debug!(request_id = self.id, method = %call.method, "removed pending call");
        }
    }
}

enum Slot {
    Request(String),
    RequestNotFound,
    Notification(String),
    NotificationNotFound,
}

/// Handle for an installed handler.
///
/// Dropping it leaves the handler installed; call
/// [`Registration::dispose`] to remove it.
pub struct Registration {
    inner: Weak<Inner>,
    slot: Slot,
}

impl Registration {
    /// Remove the handler.
    pub fn dispose(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut handlers = write(&inner.handlers);
        match self.slot {
            Slot::Request(method) => {
                handlers.requests.remove(&method);
            }
            Slot::RequestNotFound => handlers.request_not_found = None,
            Slot::Notification(method) => {
                handlers.notifications.remove(&method);
            }
            Slot::NotificationNotFound => handlers.notification_not_found = None,
        }
    }
}

impl Inner {
    async fn read_loop(self: Arc<Self>, mut incoming: Incoming) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = incoming.recv() => message,
            };
            let Some(data) = message else {
                debug!("transport closed");
                break;
            };
            if let Err(err) = self.handle_message(data) {
                error!(error = %err, "failed to decode inbound message");
                self.report(&err);
                break;
            }
        }
        self.close("transport closed");
    }

    fn handle_message(self: &Arc<Self>, data: Bytes) -> Result<()> {
        let message = {
            let repository = read(&self.repository);
            WireMessage::decode(data, &repository)?
        };
        match message {
            WireMessage::Response {
                id,
                method,
                headers,
                result,
            } if headers.chunked => self.on_chunk(id, &method, result),
            WireMessage::Response { id, result, .. } => self.complete(id, Ok(Reply::Value(result))),
            WireMessage::Error { id, error, .. } => self.on_error_reply(id, error),
            WireMessage::Request {
                id,
                method,
                headers,
                args,
            } => self.dispatch_request(id, method, headers, args),
            WireMessage::Notification { method, args, .. } => {
                self.dispatch_notification(&method, args)
            }
            WireMessage::Cancel { id } => self.on_cancel(id),
        }
        Ok(())
    }

    fn complete(&self, id: u32, reply: Result<Reply>) {
        let call = lock(&self.calls).pending.remove(&id);
        match call {
            // The receiver is gone if the caller timed out.
            Some(call) => {
                let _ = call.tx.send(reply);
            }
            None => warn!(request_id = id, "no pending call for response"),
        }
    }

    fn on_chunk(&self, id: u32, method: &str, result: Value) {
        let chunk = match result {
            Value::Null | Value::Undefined => None,
            Value::Buffer(bytes) => Some(Ok(bytes)),
            Value::String(text) => Some(Ok(Bytes::from(text))),
            other => Some(Err(PeerError::Protocol(ProtocolError::TypeMismatch {
                expected: "buffer",
                found: other.kind(),
            }))),
        };

        let mut calls = lock(&self.calls);
        if let Some(tx) = calls.streams.get(&id) {
            match chunk {
                Some(chunk) => {
                    let _ = tx.send(chunk);
                }
                None => {
                    calls.streams.remove(&id);
                    debug!(request_id = id, method, "stream ended");
                }
            }
            return;
        }

        let Some(call) = calls.pending.remove(&id) else {
            warn!(request_id = id, method, "no pending call for stream chunk");
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(chunk) = chunk {
            let _ = tx.send(chunk);
            calls.streams.insert(id, tx);
        }
        drop(calls);
        debug!(request_id = id, method, "stream started");
        let _ = call.tx.send(Ok(Reply::Stream(ReplyStream::new(rx))));
    }

    fn on_error_reply(&self, id: u32, error: RemoteError) {
        let stream = lock(&self.calls).streams.remove(&id);
        if let Some(tx) = stream {
            let _ = tx.send(Err(PeerError::Remote(error)));
            return;
        }
        let reply = if error.is_method_not_registered() {
            Ok(Reply::MethodNotRegistered)
        } else {
            Err(PeerError::Remote(error))
        };
        self.complete(id, reply);
    }

    fn on_cancel(&self, id: u32) {
        let mut calls = lock(&self.calls);
        if let Some(token) = calls.cancellation_sources.get(&id) {
            token.cancel();
            debug!(request_id = id, "cancel received");
            return;
        }
        let unseen = calls.last_request.is_none_or(|last| is_ahead(id, last));
        if !unseen {
            debug!(request_id = id, "cancel for finished or non-cancelable request");
        } else if calls.known_canceled.len() < MAX_EARLY_CANCELS {
            calls.known_canceled.insert(id);
            debug!(request_id = id, "cancel received before its request");
        } else {
            warn!(request_id = id, "too many early cancels, dropping");
        }
    }

    fn cancellation_for(&self, id: u32, headers: RequestHeaders) -> Option<CancellationToken> {
        let mut calls = lock(&self.calls);
        calls.last_request = Some(id);
        let canceled_early = calls.known_canceled.remove(&id);
        calls.known_canceled.retain(|&early| is_ahead(early, id));
        if !headers.cancelable {
            return None;
        }
        let token = self.shutdown.child_token();
        if canceled_early {
            token.cancel();
        }
        calls.cancellation_sources.insert(id, token.clone());
        Some(token)
    }

    fn forget_cancellation(&self, id: u32) {
        lock(&self.calls).cancellation_sources.remove(&id);
    }

    fn dispatch_request(
        self: &Arc<Self>,
        id: u32,
        method: String,
        headers: RequestHeaders,
        args: Vec<Value>,
    ) {
        let cancellation = self.cancellation_for(id, headers);
        let handler = {
            let handlers = read(&self.handlers);
            handlers
                .requests
                .get(&method)
                .or(handlers.request_not_found.as_ref())
                .cloned()
        };
        let Some(handler) = handler else {
            debug!(request_id = id, %method, "no handler for request");
            self.forget_cancellation(id);
            self.send_or_log(&WireMessage::Error {
                id,
                method,
                headers: ResponseHeaders::default(),
                error: RemoteError::method_not_registered(),
            });
            return;
        };

        let ctx = RequestContext {
            method: method.clone(),
            args,
            cancellation,
        };
        let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(ctx)));
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match started {
                Ok(future) => AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_error(panic))),
                Err(panic) => Err(panic_error(panic)),
            };
            inner.respond(id, method, outcome).await;
            inner.forget_cancellation(id);
        });
    }

    fn dispatch_notification(&self, method: &str, args: Vec<Value>) {
        let handler = {
            let handlers = read(&self.handlers);
            handlers
                .notifications
                .get(method)
                .or(handlers.notification_not_found.as_ref())
                .cloned()
        };
        let Some(handler) = handler else {
            debug!(method, "no handler for notification");
            return;
        };
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(method, args))) {
            warn!(method, error = %panic_error(panic), "notification handler panicked");
        }
    }

    async fn respond(
        &self,
        id: u32,
        method: String,
        outcome: std::result::Result<Outcome, RemoteError>,
    ) {
        match outcome {
            Ok(Outcome::Value(result)) => {
                let response = WireMessage::Response {
                    id,
                    method: method.clone(),
                    headers: ResponseHeaders::default(),
                    result,
                };
                if let Err(err) = self.send_message(&response) {
                    warn!(request_id = id, %method, error = %err, "failed to send response");
                    self.send_or_log(&WireMessage::Error {
                        id,
                        method,
                        headers: ResponseHeaders::default(),
                        error: RemoteError::new(err.to_string()),
                    });
                }
            }
            Ok(Outcome::Stream(mut chunks)) => {
                let headers = ResponseHeaders { chunked: true };
                loop {
                    let chunk = tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        chunk = chunks.next() => chunk,
                    };
                    let message = match chunk {
                        Some(Ok(bytes)) => WireMessage::Response {
                            id,
                            method: method.clone(),
                            headers,
                            result: Value::Buffer(bytes),
                        },
                        Some(Err(error)) => {
                            self.send_or_log(&WireMessage::Error {
                                id,
                                method,
                                headers,
                                error,
                            });
                            return;
                        }
                        None => break,
                    };
                    if !self.send_or_log(&message) {
                        return;
                    }
                }
                self.send_or_log(&WireMessage::Response {
                    id,
                    method,
                    headers,
                    result: Value::Null,
                });
            }
            Ok(Outcome::NotRegistered) => {
                self.send_or_log(&WireMessage::Error {
                    id,
                    method,
                    headers: ResponseHeaders::default(),
                    error: RemoteError::method_not_registered(),
                });
            }
            Err(error) => {
                self.send_or_log(&WireMessage::Error {
                    id,
                    method,
                    headers: ResponseHeaders::default(),
                    error,
                });
            }
        }
    }

    fn send_message(&self, message: &WireMessage) -> Result<()> {
        let bytes = {
            let repository = read(&self.repository);
            message.encode(&repository)?
        };
        if bytes.len() > self.options.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: bytes.len(),
                max: self.options.max_payload_size,
            }
            .into());
        }
        match message.method() {
            Some(method) => self.sink.send_keyed(method, bytes)?,
            None => self.sink.send(bytes)?,
        }
        Ok(())
    }

    fn send_or_log(&self, message: &WireMessage) -> bool {
        match self.send_message(message) {
            Ok(()) => true,
            Err(err) => {
                warn!(request_id = message.id(), error = %err, "failed to send reply");
                false
            }
        }
    }

    fn report(&self, err: &PeerError) {
        let sink = lock(&self.error_sink).clone();
        if let Some(sink) = sink {
            sink(err);
        }
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(reason, "closing connection");
        self.shutdown.cancel();
        self.sink.close();

        // Handler tokens are children of `shutdown` and are already cancelled.
        let state = std::mem::take(&mut *lock(&self.calls));
        for (_, call) in state.pending {
            let _ = call.tx.send(Err(PeerError::Disconnected(reason.to_string())));
        }
        for (_, stream) in state.streams {
            let _ = stream.send(Err(PeerError::Disconnected(reason.to_string())));
        }

        let listeners = std::mem::take(&mut *lock(&self.close_listeners));
        for listener in listeners {
            listener();
        }
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> RemoteError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    };
    RemoteError::new(message)
}
