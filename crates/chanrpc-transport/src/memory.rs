use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::{MessageSink, Transport};

/// Sink feeding the inbound queue of an in-process peer.
pub struct MemorySink {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl MemorySink {
    /// Wrap the sending side of an unbounded queue.
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl MessageSink for MemorySink {
    fn send(&self, message: Bytes) -> Result<()> {
        let guard = self.tx.lock().map_err(|_| TransportError::Closed)?;
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        trace!(len = message.len(), "memory transport send");
        tx.send(message).map_err(|_| TransportError::PeerGone)
    }

    fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    fn is_closed(&self) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.as_ref().is_none_or(|tx| tx.is_closed()),
            Err(_) => true,
        }
    }
}

/// Create two connected in-process transports.
///
/// Messages sent on one side arrive, in order, on the other. Closing one
/// side's sink ends the other side's inbound stream.
pub fn memory_pair() -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = Transport::new(Arc::new(MemorySink::new(b_tx)), a_rx);
    let b = Transport::new(Arc::new(MemorySink::new(a_tx)), b_rx);
    (a, b)
}
