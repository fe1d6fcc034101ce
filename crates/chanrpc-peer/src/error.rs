use std::time::Duration;

use chanrpc_protocol::RemoteError;

/// Errors that can occur in connection, multiplexer and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] chanrpc_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] chanrpc_frame::FrameError),

    /// Wire message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] chanrpc_protocol::ProtocolError),

    /// The remote handler failed.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// No response arrived within the configured timeout.
    #[error("method {method} timed out after {timeout:?}")]
    MethodTimeout { method: String, timeout: Duration },

    /// The cancellation token was already cancelled when the call was made.
    #[error("request canceled")]
    Canceled,

    /// The connection closed while the call was in flight.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// `listen` was already called, or the inbound side was already taken.
    #[error("already listening")]
    AlreadyListening,

    /// The channel is closed.
    #[error("channel {0} is closed")]
    ChannelClosed(String),

    /// `open` was already called on this channel.
    #[error("channel {0} already opened")]
    AlreadyOpened(String),

    /// The server did not acknowledge a channel in time.
    #[error("channel {id} not ready after {timeout:?}")]
    OpenTimeout { id: String, timeout: Duration },

    /// The server refused to open a channel.
    #[error("channel {id} rejected: {message}")]
    OpenRejected { id: String, code: u16, message: String },

    /// A route pattern is not usable.
    #[error("invalid route {0}")]
    InvalidRoute(String),

    /// A streamed reply arrived where a single value was expected.
    #[error("method {0} returned a stream")]
    UnexpectedStream(String),
}

impl From<RemoteError> for PeerError {
    fn from(err: RemoteError) -> Self {
        PeerError::Remote(err)
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
