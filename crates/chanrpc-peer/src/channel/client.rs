use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use chanrpc_transport::{Incoming, MessageSink, Transport};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::logical::{Channel, ChannelState, CloseInfo, SocketSlot};
use super::control::ChannelMessage;
use crate::error::{PeerError, Result};
use crate::sync::lock;

/// Channel client settings.
#[derive(Debug, Clone)]
pub struct ChannelClientConfig {
    /// Idle time after which a ping is sent.
    pub heartbeat_interval: Duration,
    /// How long `open_channel` waits for `server-ready`.
    pub open_timeout: Duration,
    /// Keep channels across a lost socket and wait for
    /// [`ChannelClient::reconnect`].
    pub reconnect: bool,
}

impl Default for ChannelClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            open_timeout: Duration::from_secs(10),
            reconnect: false,
        }
    }
}

impl ChannelClientConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }
}

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// Records when anything was last sent, for the heartbeat.
struct ActivitySink {
    socket: Arc<dyn MessageSink>,
    last_send: Arc<Mutex<Instant>>,
}

impl ActivitySink {
    fn touch(&self) {
        *lock(&self.last_send) = Instant::now();
    }
}

impl MessageSink for ActivitySink {
    fn send(&self, message: Bytes) -> chanrpc_transport::Result<()> {
        self.socket.send(message)?;
        self.touch();
        Ok(())
    }

    fn send_keyed(&self, key: &str, message: Bytes) -> chanrpc_transport::Result<()> {
        self.socket.send_keyed(key, message)?;
        self.touch();
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.socket.buffered_amount()
    }

    fn close(&self) {
        self.socket.close();
    }

    fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }
}

/// Client side of the channel protocol over one physical socket.
///
/// Opens channels by path, keeps the socket alive with pings while it is
/// idle, and routes inbound payloads to their channels.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    client_id: String,
    config: ChannelClientConfig,
    socket: SocketSlot,
    last_send: Arc<Mutex<Instant>>,
    channels: Mutex<HashMap<String, Channel>>,
    next_channel: AtomicU64,
    next_ping: AtomicU64,
    /// Bumped on every reconnect so a stale reader does not act on the
    /// end of a replaced socket.
    generation: AtomicU64,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl ChannelClient {
    /// Start a client on `transport`. Must be called within a tokio runtime.
    pub fn new(transport: Transport, config: ChannelClientConfig) -> Self {
        let client_id = format!(
            "client-{}-{}",
            std::process::id(),
            NEXT_CLIENT.fetch_add(1, Ordering::Relaxed)
        );
        let last_send = Arc::new(Mutex::new(Instant::now()));
        let (socket, incoming) = transport.into_parts();
        let socket: Arc<dyn MessageSink> = Arc::new(ActivitySink {
            socket,
            last_send: Arc::clone(&last_send),
        });
        let inner = Arc::new(ClientInner {
            client_id,
            config,
            socket: Arc::new(Mutex::new(socket)),
            last_send,
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
            next_ping: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        debug!(client_id = %inner.client_id, "channel client started");
        tokio::spawn(Arc::clone(&inner).read_loop(0, incoming));
        tokio::spawn(heartbeat_loop(Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn config(&self) -> &ChannelClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Ids of the channels that are not closed, sorted.
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.channels).keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Create a channel for `path` without opening it.
    pub fn create_channel(&self, path: &str) -> Result<Channel> {
        if self.is_closed() {
            return Err(PeerError::Disconnected("channel client closed".to_string()));
        }
        let n = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}:{n}", self.inner.client_id);
        let channel = Channel::new(
            id.clone(),
            path.to_string(),
            self.inner.client_id.clone(),
            Arc::clone(&self.inner.socket),
            ChannelState::Opening,
        );
        lock(&self.inner.channels).insert(id.clone(), channel.clone());

        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        channel.on_close(move |_| {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.channels).remove(&id);
            }
        });
        Ok(channel)
    }

    /// Open a channel for `path` and wait for the server to accept it.
    pub async fn open_channel(&self, path: &str) -> Result<Channel> {
        let channel = self.create_channel(path)?;
        channel.open()?;
        let wait = self.inner.config.open_timeout;
        match timeout(wait, channel.ready()).await {
            Ok(Ok(())) => Ok(channel),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(channel_id = %channel.id(), path, "channel not acknowledged in time");
                channel.close();
                Err(PeerError::OpenTimeout {
                    id: channel.id().to_string(),
                    timeout: wait,
                })
            }
        }
    }

    /// Replace the physical socket and re-open every live channel on it.
    ///
    /// Sends made while a channel is waiting for the new `server-ready`
    /// are queued and flushed in order.
    pub fn reconnect(&self, transport: Transport) -> Result<()> {
        if self.is_closed() {
            return Err(PeerError::Disconnected("channel client closed".to_string()));
        }
        let (socket, incoming) = transport.into_parts();
        let socket: Arc<dyn MessageSink> = Arc::new(ActivitySink {
            socket,
            last_send: Arc::clone(&self.inner.last_send),
        });
        let previous = std::mem::replace(&mut *lock(&self.inner.socket), socket);
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        previous.close();
        tokio::spawn(Arc::clone(&self.inner).read_loop(generation, incoming));

        let channels: Vec<Channel> = lock(&self.inner.channels).values().cloned().collect();
        debug!(client_id = %self.inner.client_id, channels = channels.len(), "reconnecting");
        for channel in channels.iter().filter(|c| c.was_opened()) {
            channel.reset_opening();
            channel.send_open()?;
        }
        Ok(())
    }

    /// Close every channel and the socket.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        for channel in self.inner.take_channels() {
            channel.close();
        }
        lock(&self.inner.socket).close();
        debug!(client_id = %self.inner.client_id, "channel client closed");
    }
}

impl fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient")
            .field("client_id", &self.inner.client_id)
            .field("channels", &lock(&self.inner.channels).len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientInner {
    async fn read_loop(self: Arc<Self>, generation: u64, mut incoming: Incoming) {
        loop {
            let data = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                data = incoming.recv() => data,
            };
            let Some(data) = data else {
                break;
            };
            match ChannelMessage::decode(data) {
                Ok(message) => self.handle(message),
                Err(err) => {
                    error!(client_id = %self.client_id, error = %err, "malformed channel message");
                    break;
                }
            }
        }
        self.socket_lost(generation);
    }

    fn handle(&self, message: ChannelMessage) {
        match message {
            ChannelMessage::ServerReady { id } => match self.channel(&id) {
                Some(channel) => channel.mark_ready(),
                None => warn!(channel_id = %id, "server-ready for unknown channel"),
            },
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
                warn!(channel_id = %id, code, message = %message, "channel error from server");
                if let Some(channel) = self.channel(&id) {
                    channel.close_with(CloseInfo::error(code, message), false);
                }
            }
            ChannelMessage::Ping { id } => {
                let socket = Arc::clone(&*lock(&self.socket));
                if let Ok(pong) = (ChannelMessage::Pong { id }).encode() {
                    if let Err(err) = socket.send(pong) {
                        trace!(error = %err, "pong not sent");
                    }
                }
            }
            ChannelMessage::Pong { id } => trace!(ping = id, "pong"),
            ChannelMessage::Open { id, .. } => {
                warn!(channel_id = %id, "ignoring open sent to a client");
            }
        }
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

    fn socket_lost(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation || self.shutdown.is_cancelled() {
            return;
        }
        if self.config.reconnect {
            debug!(client_id = %self.client_id, "socket lost; waiting for reconnect");
            for channel in lock(&self.channels).values() {
                channel.reset_opening();
            }
            return;
        }
        debug!(client_id = %self.client_id, "socket lost; closing channels");
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        for channel in self.take_channels() {
            channel.close_with(CloseInfo::abnormal("socket closed"), false);
        }
    }

    fn take_channels(&self) -> Vec<Channel> {
        lock(&self.channels).drain().map(|(_, channel)| channel).collect()
    }

    fn ping(&self) {
        let id = self.next_ping.fetch_add(1, Ordering::Relaxed);
        let socket = Arc::clone(&*lock(&self.socket));
        if socket.is_closed() {
            return;
        }
        trace!(client_id = %self.client_id, ping = id, "heartbeat");
        match (ChannelMessage::Ping { id }).encode() {
            Ok(ping) => {
                if let Err(err) = socket.send(ping) {
                    trace!(error = %err, "ping not sent");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode ping"),
        }
    }
}

/// Ping whenever nothing was sent for a full interval.
async fn heartbeat_loop(inner: Weak<ClientInner>) {
    loop {
        let (deadline, shutdown) = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let last = *lock(&inner.last_send);
            (last + inner.config.heartbeat_interval, inner.shutdown.clone())
        };
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep_until(deadline) => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let idle = Instant::now().duration_since(*lock(&inner.last_send));
        if idle >= inner.config.heartbeat_interval {
            inner.ping();
        }
    }
}

#[cfg(test)]
mod tests {
    use chanrpc_transport::memory_pair;

    use super::*;
    use crate::channel::control::CLOSE_ABNORMAL;

    async fn next(remote: &mut Transport) -> ChannelMessage {
        ChannelMessage::decode(remote.recv().await.unwrap()).unwrap()
    }

    fn send(remote: &Transport, message: ChannelMessage) {
        remote.send(message.encode().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn open_channel_waits_for_server_ready() {
        let (local, mut remote) = memory_pair();
        let client = ChannelClient::new(local, ChannelClientConfig::default());

        let opener = {
            let client = client.clone();
            tokio::spawn(async move { client.open_channel("echo").await })
        };

        let ChannelMessage::Open { id, path, client_id } = next(&mut remote).await else {
            panic!("expected open");
        };
        assert_eq!(path, "echo");
        assert_eq!(client_id, client.client_id());
        assert!(id.starts_with(client.client_id()));
        assert!(!opener.is_finished());

        send(&remote, ChannelMessage::ServerReady { id: id.clone() });
        let channel = opener.await.unwrap().unwrap();
        assert!(channel.is_ready());

        channel.send(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(
            next(&mut remote).await,
            ChannelMessage::Binary {
                id,
                binary: Bytes::from_static(b"hi"),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_times_out_without_server_ready() {
        let (local, _remote) = memory_pair();
        let config = ChannelClientConfig::default().with_open_timeout(Duration::from_secs(2));
        let client = ChannelClient::new(local, config);
        match client.open_channel("echo").await {
            Err(PeerError::OpenTimeout { timeout, .. }) => assert_eq!(timeout, Duration::from_secs(2)),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(client.channel_ids().is_empty());
    }

    #[tokio::test]
    async fn server_error_rejects_open() {
        let (local, mut remote) = memory_pair();
        let client = ChannelClient::new(local, ChannelClientConfig::default());
        let opener = {
            let client = client.clone();
            tokio::spawn(async move { client.open_channel("missing").await })
        };
        let ChannelMessage::Open { id, .. } = next(&mut remote).await else {
            panic!("expected open");
        };
        send(
            &remote,
            ChannelMessage::Error {
                id,
                code: 404,
                message: "no handler".into(),
            },
        );
        assert!(matches!(
            opener.await.unwrap(),
            Err(PeerError::OpenRejected { code: 404, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_only_while_idle() {
        let (local, mut remote) = memory_pair();
        let client = ChannelClient::new(local, ChannelClientConfig::default());
        let start = Instant::now();

        assert!(matches!(next(&mut remote).await, ChannelMessage::Ping { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let channel = client.create_channel("echo").unwrap();
        channel.open().unwrap();
        assert!(matches!(next(&mut remote).await, ChannelMessage::Open { .. }));

        // Traffic at 6s pushes the next ping to 11s.
        assert!(matches!(next(&mut remote).await, ChannelMessage::Ping { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(11));
    }

    #[tokio::test]
    async fn ping_is_answered() {
        let (local, mut remote) = memory_pair();
        let _client = ChannelClient::new(local, ChannelClientConfig::default());
        send(&remote, ChannelMessage::Ping { id: 9 });
        assert_eq!(next(&mut remote).await, ChannelMessage::Pong { id: 9 });
    }

    #[tokio::test]
    async fn lost_socket_closes_channels() {
        let (local, mut remote) = memory_pair();
        let client = ChannelClient::new(local, ChannelClientConfig::default());
        let channel = client.create_channel("echo").unwrap();
        channel.open().unwrap();
        next(&mut remote).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        channel.on_close(move |info| {
            let _ = tx.send(info.code);
        });
        drop(remote);
        assert_eq!(rx.await.unwrap(), CLOSE_ABNORMAL);
        assert!(client.is_closed());
        assert!(client.create_channel("echo").is_err());
    }

    #[tokio::test]
    async fn reconnect_reopens_live_channels() {
        let (local, mut remote) = memory_pair();
        let config = ChannelClientConfig::default().with_reconnect(true);
        let client = ChannelClient::new(local, config);

        let channel = client.create_channel("echo").unwrap();
        channel.open().unwrap();
        let ChannelMessage::Open { id, .. } = next(&mut remote).await else {
            panic!("expected open");
        };
        send(&remote, ChannelMessage::ServerReady { id: id.clone() });
        channel.ready().await.unwrap();

        drop(remote);
        while channel.is_ready() {
            tokio::task::yield_now().await;
        }
        assert_eq!(channel.state(), ChannelState::Opening);
        channel.send(Bytes::from_static(b"queued")).unwrap();

        let (local, mut remote) = memory_pair();
        client.reconnect(local).unwrap();
        let ChannelMessage::Open { id: reopened, .. } = next(&mut remote).await else {
            panic!("expected open");
        };
        assert_eq!(reopened, id);

        send(&remote, ChannelMessage::ServerReady { id: id.clone() });
        assert_eq!(
            next(&mut remote).await,
            ChannelMessage::Binary {
                id,
                binary: Bytes::from_static(b"queued"),
            }
        );
        assert!(!client.is_closed());
    }
}
