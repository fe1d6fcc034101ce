use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// Ordered inbound messages of a transport.
///
/// `recv()` returning `None` means the transport is closed and no further
/// messages will arrive.
pub type Incoming = mpsc::UnboundedReceiver<Bytes>;

/// Outbound half of a message transport.
///
/// Implementations must preserve send order and must be safe to call from
/// any task. A send after [`MessageSink::close`] fails with
/// [`TransportError::Closed`](crate::TransportError::Closed).
pub trait MessageSink: Send + Sync + 'static {
    /// Queue one message for delivery.
    fn send(&self, message: Bytes) -> Result<()>;

    /// Queue one message that shares a routing key with related traffic.
    ///
    /// Single-socket transports ignore the key. Pooled transports use it to
    /// keep messages with the same key on the same socket.
    fn send_keyed(&self, key: &str, message: Bytes) -> Result<()> {
        let _ = key;
        self.send(message)
    }

    /// Bytes accepted by `send` that have not been written out yet.
    fn buffered_amount(&self) -> usize {
        0
    }

    /// Close the outbound direction. The remote side observes end of stream.
    fn close(&self);

    /// Whether this sink has been closed.
    fn is_closed(&self) -> bool;
}

/// A connected message transport: outbound sink plus ordered inbound messages.
pub struct Transport {
    sink: Arc<dyn MessageSink>,
    incoming: Incoming,
}

impl Transport {
    /// Assemble a transport from its two halves.
    pub fn new(sink: Arc<dyn MessageSink>, incoming: Incoming) -> Self {
        Self { sink, incoming }
    }

    /// The outbound half.
    pub fn sink(&self) -> &Arc<dyn MessageSink> {
        &self.sink
    }

    /// Send one message through the outbound half.
    pub fn send(&self, message: impl Into<Bytes>) -> Result<()> {
        self.sink.send(message.into())
    }

    /// Receive the next inbound message, or `None` once closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    /// Split into the outbound sink and inbound receiver.
    pub fn into_parts(self) -> (Arc<dyn MessageSink>, Incoming) {
        (self.sink, self.incoming)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.sink.is_closed())
            .field("buffered", &self.sink.buffered_amount())
            .finish()
    }
}
