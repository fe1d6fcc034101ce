use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use chanrpc_protocol::{RemoteError, Value};
use futures_core::Stream;
use tokio_util::sync::CancellationToken;

/// Chunks produced by a streaming handler.
pub type ChunkStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, RemoteError>> + Send>>;

/// Future returned by a [`RequestHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Outcome, RemoteError>> + Send>>;

/// One inbound request as seen by a handler.
#[derive(Debug)]
pub struct RequestContext {
    /// Full method name as sent on the wire.
    pub method: String,
    pub args: Vec<Value>,
    /// Present when the caller sent the request as cancelable.
    pub cancellation: Option<CancellationToken>,
}

impl RequestContext {
    /// Whether the caller has cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Argument at `index`, undefined when absent.
    pub fn arg(&self, index: usize) -> &Value {
        static UNDEFINED: Value = Value::Undefined;
        self.args.get(index).unwrap_or(&UNDEFINED)
    }
}

/// What a request handler produced.
pub enum Outcome {
    /// A single result, sent as one response.
    Value(Value),
    /// A chunk sequence, sent as chunked responses ending with a null result.
    Stream(ChunkStream),
    /// The handler does not serve this method. The caller receives the
    /// "method not registered" reply rather than an error.
    NotRegistered,
}

impl Outcome {
    /// Wrap a chunk stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, RemoteError>> + Send + 'static,
    {
        Outcome::Stream(Box::pin(stream))
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Outcome::Stream(_) => f.write_str("Stream(..)"),
            Outcome::NotRegistered => f.write_str("NotRegistered"),
        }
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

/// Serves requests for one method, or for every method without its own
/// handler when installed with `on_request_not_found`.
pub trait RequestHandler: Send + Sync + 'static {
    fn call(&self, ctx: RequestContext) -> HandlerFuture;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Outcome, RemoteError>> + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> HandlerFuture {
        Box::pin(self(ctx))
    }
}

/// Receives notifications. Called with the full method name and arguments.
pub type NotificationHandler = std::sync::Arc<dyn Fn(&str, Vec<Value>) + Send + Sync>;
