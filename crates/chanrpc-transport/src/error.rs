use std::path::PathBuf;

/// Why a socket could not be set up or a message could not be handed off.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The path does not fit in `sockaddr_un`.
    #[error("socket path {path} is {len} bytes, limit is {max}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// Something other than a socket already sits at the socket path.
    /// It is never removed.
    #[error("{path} exists and is not a socket")]
    PathOccupied { path: PathBuf },

    /// Creating the listener or applying its file mode failed.
    #[error("cannot listen on {path}: {source}")]
    Listen {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Nothing accepted a connection at the path.
    #[error("cannot reach {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Socket failure after setup, while accepting or moving bytes.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// A message was sent after this side closed its sink.
    #[error("sink closed")]
    Closed,

    /// The receiving end went away before the message could be queued.
    #[error("peer is gone")]
    PeerGone,
}

impl TransportError {
    /// Whether no further message can be sent on this transport.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::PeerGone)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sink_failures_are_disconnects() {
        assert!(TransportError::Closed.is_disconnect());
        assert!(TransportError::PeerGone.is_disconnect());
        let occupied = TransportError::PathOccupied {
            path: "/tmp/file".into(),
        };
        assert!(!occupied.is_disconnect());
        assert_eq!(occupied.to_string(), "/tmp/file exists and is not a socket");
    }
}
