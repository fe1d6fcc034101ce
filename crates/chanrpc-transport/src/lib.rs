//! Message transport contract for chanrpc.
//!
//! Everything above this layer talks to a [`Transport`]: an outbound
//! [`MessageSink`] plus an ordered stream of inbound messages. A transport is
//! message oriented; byte-stream sockets are adapted by `chanrpc-frame`.
//!
//! Provided here:
//! - [`memory_pair`] for in-process peers and tests
//! - [`UnixDomainSocket`] for listening on and connecting to local sockets

pub mod error;
pub mod memory;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::{memory_pair, MemorySink};
pub use traits::{Incoming, MessageSink, Transport};

#[cfg(unix)]
pub use uds::UnixDomainSocket;
