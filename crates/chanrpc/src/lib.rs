//! Binary RPC with streaming replies, service multiplexing and logical
//! channels.
//!
//! # Crate Structure
//!
//! - [`transport`]: message transport contract, in-process pairs, Unix sockets
//! - [`frame`]: chunk buffering, frame recovery, framed byte-stream transports
//! - [`protocol`]: value codecs, protocol repository, wire messages
//! - [`peer`]: connections, multiplexer, channels (behind the `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use chanrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use chanrpc_frame::*;
}

/// Re-export protocol types.
pub mod protocol {
    pub use chanrpc_protocol::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use chanrpc_peer::*;
}
