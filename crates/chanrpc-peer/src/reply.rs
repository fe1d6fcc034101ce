use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use chanrpc_protocol::Value;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::error::{PeerError, Result};

/// Successful outcome of a request.
#[derive(Debug)]
pub enum Reply {
    /// A single result value.
    Value(Value),
    /// The handler streamed its result.
    Stream(ReplyStream),
    /// The remote has no handler for the method.
    MethodNotRegistered,
}

impl Reply {
    /// The single value, or `None` for the not-registered reply.
    pub fn into_value(self, method: &str) -> Result<Option<Value>> {
        match self {
            Reply::Value(value) => Ok(Some(value)),
            Reply::MethodNotRegistered => Ok(None),
            Reply::Stream(_) => Err(PeerError::UnexpectedStream(method.to_string())),
        }
    }

    pub fn is_method_not_registered(&self) -> bool {
        matches!(self, Reply::MethodNotRegistered)
    }
}

/// Chunks of a streamed reply, in arrival order.
///
/// The stream ends after the terminating chunk. A remote error or a lost
/// connection is yielded once as an `Err` item, then the stream ends.
#[derive(Debug)]
pub struct ReplyStream {
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl ReplyStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Result<Bytes>>) -> Self {
        Self { rx }
    }

    /// Concatenate every chunk.
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ReplyStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
