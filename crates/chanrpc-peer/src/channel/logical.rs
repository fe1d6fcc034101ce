use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chanrpc_transport::{Incoming, MessageSink, Transport, TransportError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::control::{ChannelMessage, CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::error::{PeerError, Result};
use crate::sync::lock;

/// Physical socket a channel currently sends through. Shared by every
/// channel of one client or session so it can be swapped on reconnect.
pub(crate) type SocketSlot = Arc<Mutex<Arc<dyn MessageSink>>>;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// `open` sent (or about to be); waiting for `server-ready`.
    Opening,
    /// Acknowledged by the server; sends go straight to the socket.
    Ready,
    Closed,
}

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// The remote closed the channel with an `error` message.
    pub error: bool,
}

impl CloseInfo {
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: reason.into(),
            error: false,
        }
    }

    /// The physical socket went away.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            error: false,
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: message.into(),
            error: true,
        }
    }
}

type CloseListener = Box<dyn FnOnce(&CloseInfo) + Send>;

/// A logical sub-connection multiplexed over one physical socket.
///
/// Client channels start `Opening` and queue outbound data until the server
/// acknowledges them. Server channels are created `Ready`. Cloning shares
/// the channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: String,
    path: String,
    client_id: String,
    socket: SocketSlot,
    state: watch::Sender<ChannelState>,
    /// Messages sent while `Opening`, flushed on `server-ready`.
    queue: Mutex<Vec<ChannelMessage>>,
    opened: AtomicBool,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    incoming_rx: Mutex<Option<Incoming>>,
    close_info: Mutex<Option<CloseInfo>>,
    close_listeners: Mutex<Vec<CloseListener>>,
}

impl Channel {
    pub(crate) fn new(
        id: String,
        path: String,
        client_id: String,
        socket: SocketSlot,
        initial: ChannelState,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(initial);
        Self {
            inner: Arc::new(ChannelInner {
                id,
                path,
                client_id,
                socket,
                state,
                opened: AtomicBool::new(initial != ChannelState::Opening),
                queue: Mutex::new(Vec::new()),
                incoming_tx: Mutex::new(Some(incoming_tx)),
                incoming_rx: Mutex::new(Some(incoming_rx)),
                close_info: Mutex::new(None),
                close_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Why the channel closed, once it has.
    pub fn close_info(&self) -> Option<CloseInfo> {
        lock(&self.inner.close_info).clone()
    }

    /// Send the `open` request. Allowed exactly once per channel.
    pub fn open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PeerError::ChannelClosed(self.inner.id.clone()));
        }
        if self.inner.opened.swap(true, Ordering::AcqRel) {
            return Err(PeerError::AlreadyOpened(self.inner.id.clone()));
        }
        debug!(channel_id = %self.inner.id, path = %self.inner.path, "opening channel");
        self.send_open()
    }

    /// Wait until the server acknowledges the channel.
    pub async fn ready(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let reached = state
            .wait_for(|state| *state != ChannelState::Opening)
            .await
            .map(|state| *state)
            .unwrap_or(ChannelState::Closed);
        match reached {
            ChannelState::Ready => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    /// Send binary data. Queued while the channel is opening.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_message(
            None,
            ChannelMessage::Binary {
                id: self.inner.id.clone(),
                binary: data.into(),
            },
        )
    }

    /// Send a text payload as a `data` message.
    pub fn send_text(&self, content: impl Into<String>) -> Result<()> {
        self.send_message(
            None,
            ChannelMessage::Data {
                id: self.inner.id.clone(),
                content: content.into(),
            },
        )
    }

    /// Message transport over this channel, for running a connection on
    /// top of it. Can be taken once.
    pub fn transport(&self) -> Result<Transport> {
        let incoming = lock(&self.inner.incoming_rx)
            .take()
            .ok_or(PeerError::AlreadyListening)?;
        let sink = Arc::new(ChannelSink {
            channel: self.clone(),
        });
        Ok(Transport::new(sink, incoming))
    }

    /// Close the channel and tell the remote.
    pub fn close(&self) {
        self.close_with(CloseInfo::normal(""), true);
    }

    /// Run `listener` once the channel closes (immediately if it already
    /// has).
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce(&CloseInfo) + Send + 'static,
    {
        let mut listeners = lock(&self.inner.close_listeners);
        if let Some(info) = self.close_info() {
            drop(listeners);
            listener(&info);
        } else {
            listeners.push(Box::new(listener));
        }
    }

    pub(crate) fn send_open(&self) -> Result<()> {
        let open = ChannelMessage::Open {
            id: self.inner.id.clone(),
            path: self.inner.path.clone(),
            client_id: self.inner.client_id.clone(),
        };
        self.write(None, &open)
    }

    pub(crate) fn was_opened(&self) -> bool {
        self.inner.opened.load(Ordering::Acquire)
    }

    /// Mark the channel acknowledged and flush queued sends in order.
    pub(crate) fn mark_ready(&self) {
        let mut queue = lock(&self.inner.queue);
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ChannelState::Opening {
                *state = ChannelState::Ready;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        debug!(channel_id = %self.inner.id, queued = queue.len(), "channel ready");
        for message in queue.drain(..) {
            if let Err(err) = self.write(None, &message) {
                warn!(channel_id = %self.inner.id, error = %err, "failed to flush queued message");
            }
        }
    }

    /// Move a live channel back to `Opening` after its socket was lost.
    pub(crate) fn reset_opening(&self) {
        let _queue = lock(&self.inner.queue);
        self.inner.state.send_if_modified(|state| {
            if *state == ChannelState::Ready {
                *state = ChannelState::Opening;
                true
            } else {
                false
            }
        });
    }

    /// Hand received payload to whoever reads this channel.
    pub(crate) fn deliver(&self, data: Bytes) {
        let delivered = lock(&self.inner.incoming_tx)
            .as_ref()
            .is_some_and(|tx| tx.send(data).is_ok());
        if !delivered {
            warn!(channel_id = %self.inner.id, "dropping data for closed channel");
        }
    }

    /// Close locally, optionally telling the remote, and notify listeners.
    pub(crate) fn close_with(&self, info: CloseInfo, notify_remote: bool) {
        {
            let mut queue = lock(&self.inner.queue);
            if self.state() == ChannelState::Closed {
                return;
            }
            queue.clear();
            *lock(&self.inner.close_info) = Some(info.clone());
            self.inner.state.send_replace(ChannelState::Closed);
        }
        debug!(channel_id = %self.inner.id, code = info.code, reason = %info.reason, "channel closed");
        if notify_remote {
            let close = ChannelMessage::Close {
                id: self.inner.id.clone(),
                code: info.code,
                reason: info.reason.clone(),
            };
            if let Err(err) = self.write(None, &close) {
                trace!(channel_id = %self.inner.id, error = %err, "close not sent");
            }
        }
        lock(&self.inner.incoming_tx).take();
        let listeners = std::mem::take(&mut *lock(&self.inner.close_listeners));
        for listener in listeners {
            listener(&info);
        }
    }

    fn send_message(&self, key: Option<&str>, message: ChannelMessage) -> Result<()> {
        let mut queue = lock(&self.inner.queue);
        match self.state() {
            ChannelState::Closed => Err(PeerError::ChannelClosed(self.inner.id.clone())),
            ChannelState::Opening => {
                trace!(channel_id = %self.inner.id, "queueing until ready");
                queue.push(message);
                Ok(())
            }
            ChannelState::Ready => self.write(key, &message),
        }
    }

    fn write(&self, key: Option<&str>, message: &ChannelMessage) -> Result<()> {
        let encoded = message.encode()?;
        let socket = Arc::clone(&*lock(&self.inner.socket));
        socket.send_keyed(key.unwrap_or(&self.inner.id), encoded)?;
        Ok(())
    }

    fn closed_error(&self) -> PeerError {
        match self.close_info() {
            Some(info) if info.error => PeerError::OpenRejected {
                id: self.inner.id.clone(),
                code: info.code,
                message: info.reason,
            },
            _ => PeerError::ChannelClosed(self.inner.id.clone()),
        }
    }

    fn buffered_amount(&self) -> usize {
        lock(&self.inner.socket).buffered_amount()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .finish()
    }
}

/// Outbound half of a channel's transport.
struct ChannelSink {
    channel: Channel,
}

impl ChannelSink {
    fn send_with(&self, key: Option<&str>, message: Bytes) -> chanrpc_transport::Result<()> {
        let binary = ChannelMessage::Binary {
            id: self.channel.inner.id.clone(),
            binary: message,
        };
        self.channel
            .send_message(key, binary)
            .map_err(|err| match err {
                PeerError::Transport(err) => err,
                _ => TransportError::Closed,
            })
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, message: Bytes) -> chanrpc_transport::Result<()> {
        self.send_with(None, message)
    }

    fn send_keyed(&self, key: &str, message: Bytes) -> chanrpc_transport::Result<()> {
        self.send_with(Some(key), message)
    }

    fn buffered_amount(&self) -> usize {
        self.channel.buffered_amount()
    }

    fn close(&self) {
        self.channel.close();
    }

    fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use chanrpc_transport::memory_pair;

    use super::*;

    fn client_channel() -> (Channel, Incoming) {
        let (local, remote) = memory_pair();
        let (sink, _incoming) = local.into_parts();
        let slot: SocketSlot = Arc::new(Mutex::new(sink));
        let channel = Channel::new(
            "c:1".into(),
            "echo".into(),
            "c".into(),
            slot,
            ChannelState::Opening,
        );
        let (_remote_sink, incoming) = remote.into_parts();
        (channel, incoming)
    }

    async fn next(remote: &mut Incoming) -> ChannelMessage {
        ChannelMessage::decode(remote.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn open_is_allowed_once() {
        let (channel, mut remote) = client_channel();
        channel.open().unwrap();
        assert!(matches!(channel.open(), Err(PeerError::AlreadyOpened(_))));
        assert!(matches!(next(&mut remote).await, ChannelMessage::Open { .. }));
    }

    #[tokio::test]
    async fn sends_queue_until_ready() {
        let (channel, mut remote) = client_channel();
        channel.open().unwrap();
        channel.send(Bytes::from_static(b"one")).unwrap();
        channel.send_text("two").unwrap();
        assert!(matches!(next(&mut remote).await, ChannelMessage::Open { .. }));
        assert!(remote.try_recv().is_err());

        channel.mark_ready();
        assert_eq!(
            next(&mut remote).await,
            ChannelMessage::Binary {
                id: "c:1".into(),
                binary: Bytes::from_static(b"one"),
            }
        );
        assert_eq!(
            next(&mut remote).await,
            ChannelMessage::Data {
                id: "c:1".into(),
                content: "two".into(),
            }
        );
        channel.ready().await.unwrap();
    }

    #[tokio::test]
    async fn close_notifies_remote_and_listeners() {
        let (channel, mut remote) = client_channel();
        channel.mark_ready();
        let (tx, rx) = tokio::sync::oneshot::channel();
        channel.on_close(move |info| {
            let _ = tx.send(info.code);
        });
        channel.close();
        channel.close();

        assert_eq!(rx.await.unwrap(), CLOSE_NORMAL);
        assert!(matches!(next(&mut remote).await, ChannelMessage::Close { code: CLOSE_NORMAL, .. }));
        assert!(matches!(channel.send_text("late"), Err(PeerError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn error_close_rejects_ready() {
        let (channel, _remote) = client_channel();
        channel.open().unwrap();
        channel.close_with(CloseInfo::error(404, "no route"), false);
        match channel.ready().await {
            Err(PeerError::OpenRejected { code, message, .. }) => {
                assert_eq!(code, 404);
                assert_eq!(message, "no route");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_reads_delivered_data() {
        let (channel, _remote) = client_channel();
        let mut transport = channel.transport().unwrap();
        assert!(matches!(channel.transport(), Err(PeerError::AlreadyListening)));

        channel.deliver(Bytes::from_static(b"hello"));
        assert_eq!(transport.recv().await.unwrap().as_ref(), b"hello");

        channel.close_with(CloseInfo::normal("done"), false);
        assert!(transport.recv().await.is_none());
        assert!(transport.sink().is_closed());
    }
}
