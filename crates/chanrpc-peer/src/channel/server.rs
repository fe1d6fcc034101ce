use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use chanrpc_transport::{Incoming, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::logical::{Channel, ChannelState, CloseInfo, SocketSlot};
use super::control::{ChannelMessage, ERROR_NO_ROUTE};
use super::router::{PathHandler, PathRouter};
use crate::error::PeerError;
use crate::sync::lock;

/// Accepts physical sockets and serves channel requests on them.
pub struct ChannelServer {
    router: Arc<PathRouter>,
    next_connection: AtomicU64,
}

impl ChannelServer {
    pub fn new(router: PathRouter) -> Self {
        Self {
            router: Arc::new(router),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn router(&self) -> &PathRouter {
        &self.router
    }

    /// Serve the channel protocol on `transport`. Must be called within a
    /// tokio runtime.
    pub fn accept(&self, transport: Transport) -> ServerSession {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (socket, incoming) = transport.into_parts();
        let inner = Arc::new(SessionInner {
            connection_id,
            socket: Arc::new(Mutex::new(socket)),
            router: Arc::clone(&self.router),
            channels: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
        });
        debug!(connection_id, "channel session accepted");
        tokio::spawn(Arc::clone(&inner).read_loop(incoming));
        ServerSession { inner }
    }
}

/// One accepted physical socket and the channels opened on it.
#[derive(Clone)]
pub struct ServerSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    connection_id: u64,
    socket: SocketSlot,
    router: Arc<PathRouter>,
    channels: Mutex<HashMap<String, Channel>>,
    /// Handlers that served a channel here, told on disconnect.
    handlers: Mutex<Vec<Arc<dyn PathHandler>>>,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

impl ServerSession {
    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    /// Ids of the open channels, sorted.
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.channels).keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.is_cancelled()
    }

    /// Wait until the socket is gone and every channel is closed.
    pub async fn closed(&self) {
        self.inner.finished.cancelled().await;
    }

    /// Drop the socket, closing every channel on it.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        lock(&self.inner.socket).close();
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("connection_id", &self.inner.connection_id)
            .field("channels", &lock(&self.inner.channels).len())
            .finish()
    }
}

impl SessionInner {
    async fn read_loop(self: Arc<Self>, mut incoming: Incoming) {
        loop {
            let data = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                data = incoming.recv() => data,
            };
            let Some(data) = data else {
                break;
            };
            match ChannelMessage::decode(data) {
                Ok(message) => self.handle(message),
                Err(err) => {
                    error!(connection_id = self.connection_id, error = %err, "malformed channel message");
                    break;
                }
            }
        }
        self.teardown();
    }

    fn handle(self: &Arc<Self>, message: ChannelMessage) {
        match message {
            ChannelMessage::Open { id, path, client_id } => self.open(id, path, client_id),
            ChannelMessage::Binary { id, binary } => self.deliver(&id, binary),
            ChannelMessage::Data { id, content } => self.deliver(&id, Bytes::from(content)),
            ChannelMessage::Close { id, code, reason } => {
                if let Some(channel) = self.channel(&id) {
                    channel.close_with(
                        CloseInfo {
                            code,
                            reason,
                            error: false,
                        },
                        false,
                    );
                }
            }
            ChannelMessage::Error { id, code, message } => {
                warn!(channel_id = %id, code, message = %message, "channel error from client");
                if let Some(channel) = self.channel(&id) {
                    channel.close_with(CloseInfo::error(code, message), false);
                }
            }
            ChannelMessage::Ping { id } => self.reply(&ChannelMessage::Pong { id }),
            ChannelMessage::Pong { id } => trace!(ping = id, "pong"),
            ChannelMessage::ServerReady { id } => {
                warn!(channel_id = %id, "ignoring server-ready sent to a server");
            }
        }
    }

    fn open(self: &Arc<Self>, id: String, path: String, client_id: String) {
        if self.channel(&id).is_some() {
            debug!(channel_id = %id, "channel already open; acknowledging again");
            self.reply(&ChannelMessage::ServerReady { id });
            return;
        }
        let Some(route) = self.router.resolve(&path) else {
            warn!(channel_id = %id, path = %path, "no route for channel");
            self.reply(&ChannelMessage::Error {
                id,
                code: ERROR_NO_ROUTE,
                message: format!("no handler for path {path}"),
            });
            return;
        };

        let channel = Channel::new(
            id.clone(),
            path,
            client_id,
            Arc::clone(&self.socket),
            ChannelState::Ready,
        );
        lock(&self.channels).insert(id.clone(), channel.clone());
        let weak: Weak<SessionInner> = Arc::downgrade(self);
        let key = id.clone();
        channel.on_close(move |_| {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.channels).remove(&key);
            }
        });
        {
            let mut handlers = lock(&self.handlers);
            if !handlers.iter().any(|h| Arc::ptr_eq(h, &route.handler)) {
                handlers.push(Arc::clone(&route.handler));
            }
        }

        debug!(
            connection_id = self.connection_id,
            channel_id = %id,
            path = %channel.path(),
            route = %route.pattern,
            "channel opened"
        );
        self.reply(&ChannelMessage::ServerReady { id });
        route.handler.handle(channel, self.connection_id, route.params);
    }

    fn channel(&self, id: &str) -> Option<Channel> {
        lock(&self.channels).get(id).cloned()
    }

    fn deliver(&self, id: &str, data: Bytes) {
        match self.channel(id) {
            Some(channel) => channel.deliver(data),
            None => warn!(channel_id = %id, "data for unknown channel"),
        }
    }

    fn reply(&self, message: &ChannelMessage) {
        let sent = message.encode().and_then(|encoded| {
            let socket = Arc::clone(&*lock(&self.socket));
            socket.send(encoded).map_err(PeerError::from)
        });
        if let Err(err) = sent {
            trace!(connection_id = self.connection_id, error = %err, "control reply not sent");
        }
    }

    fn teardown(&self) {
        let channels: Vec<Channel> = lock(&self.channels).drain().map(|(_, c)| c).collect();
        debug!(
            connection_id = self.connection_id,
            channels = channels.len(),
            "channel session ended"
        );
        for channel in channels {
            channel.close_with(CloseInfo::abnormal("connection lost"), false);
        }
        let handlers = std::mem::take(&mut *lock(&self.handlers));
        for handler in handlers {
            handler.dispose(self.connection_id);
        }
        lock(&self.socket).close();
        self.finished.cancel();
    }
}
