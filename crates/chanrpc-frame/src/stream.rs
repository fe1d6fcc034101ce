use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use chanrpc_transport::{MessageSink, Transport, TransportError};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::codec::FrameCodec;
use crate::decoder::{encode_frame, FrameConfig};

/// Outbound half of a framed byte stream.
///
/// Messages are queued to a writer task that frames and writes them in
/// order. `buffered_amount` reports payload bytes not yet written.
pub struct StreamSink {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    queued: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl MessageSink for StreamSink {
    fn send(&self, message: Bytes) -> chanrpc_transport::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let guard = self.tx.lock().map_err(|_| TransportError::Closed)?;
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        let len = message.len();
        self.queued.fetch_add(len, Ordering::AcqRel);
        tx.send(message).map_err(|_| {
            self.queued.fetch_sub(len, Ordering::AcqRel);
            TransportError::PeerGone
        })
    }

    fn buffered_amount(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Turn a byte stream into a message [`Transport`] using indicator framing.
///
/// Spawns a reader task and a writer task on the current tokio runtime.
/// End of stream, an I/O error or a decode error closes the transport: the
/// inbound side ends and further sends fail.
pub fn framed_transport<S>(stream: S, config: FrameConfig) -> Transport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Bytes>();
    let queued = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));

    let writer_queued = Arc::clone(&queued);
    let writer_closed = Arc::clone(&closed);
    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(message) = out_rx.recv().await {
            let len = message.len();
            buf.clear();
            let result = match encode_frame(&message, &mut buf) {
                Ok(()) => write_half.write_all(&buf).await.map_err(Into::into),
                Err(err) => Err(err),
            };
            writer_queued.fetch_sub(len, Ordering::AcqRel);
            if let Err(err) = result {
                warn!(error = %err, "framed transport write failed");
                break;
            }
        }
        writer_closed.store(true, Ordering::Release);
        let _ = write_half.shutdown().await;
        debug!("framed transport writer finished");
    });

    let reader_closed = Arc::clone(&closed);
    tokio::spawn(async move {
        let mut frames = FramedRead::new(read_half, FrameCodec::with_config(config));
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(payload) => {
                    if in_tx.send(payload).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "framed transport read failed");
                    break;
                }
            }
        }
        reader_closed.store(true, Ordering::Release);
        debug!("framed transport reader finished");
    });

    let sink = StreamSink {
        tx: Mutex::new(Some(out_tx)),
        queued,
        closed,
    };
    Transport::new(Arc::new(sink), in_rx)
}
