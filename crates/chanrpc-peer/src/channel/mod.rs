//! Logical channels over one physical socket.
//!
//! A socket carries a small control protocol next to the payload traffic:
//! `ping`/`pong` for liveness, `open`/`server-ready` to set up a channel on
//! a path, `data`/`binary` for payload, `close`/`error` to tear one down.
//! A [`Channel`] exposes its payload as a [`Transport`](chanrpc_transport::Transport),
//! so a [`Connection`](crate::Connection) can run on top of it.

pub mod client;
pub mod control;
pub mod logical;
pub mod pool;
pub mod router;
pub mod server;

pub use client::{ChannelClient, ChannelClientConfig};
pub use control::{ChannelMessage, CLOSE_ABNORMAL, CLOSE_NORMAL, ERROR_NO_ROUTE};
pub use logical::{Channel, ChannelState, CloseInfo};
pub use pool::{connect_pool, pooled_transport, PoolConfig, SocketPool, DEFAULT_POOL_SIZE};
pub use router::{PathHandler, PathRouter, RouteMatch, RouteParams};
pub use server::{ChannelServer, ServerSession};
