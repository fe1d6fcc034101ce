//! RPC connections, service multiplexing and logical channels.
//!
//! A [`Connection`] runs the request/response protocol over any
//! [`Transport`](chanrpc_transport::Transport): it matches replies to
//! pending calls, streams chunked results, forwards cancellation and
//! enforces per-call timeouts. [`ServiceMultiplexer`] hosts many named
//! services on one connection. The [`channel`] module splits one physical
//! socket into many logical channels, each able to carry its own
//! connection.

pub mod broadcast;
pub mod channel;
pub mod connection;
pub mod error;
pub mod handler;
pub mod multiplexer;
pub mod reply;
mod sync;
pub mod typed;

pub use broadcast::broadcast_request;
pub use channel::{
    Channel, ChannelClient, ChannelClientConfig, ChannelServer, ChannelState, CloseInfo,
    PathHandler, PathRouter, PoolConfig, RouteParams, ServerSession,
};
pub use connection::{Connection, ConnectionOptions, Registration};
pub use error::{PeerError, Result};
pub use handler::{ChunkStream, HandlerFuture, NotificationHandler, Outcome, RequestContext, RequestHandler};
pub use multiplexer::{
    normalize_service_id, service_method, Invoker, LocalService, ServiceMultiplexer, ServiceProxy,
    SERVICE_SEPARATOR,
};
pub use reply::{Reply, ReplyStream};
pub use typed::{typed_handler, FromArgs, IntoArgs, RemoteMethod};
