use std::fmt;
use std::io;

use chanrpc_frame::FrameError;
use chanrpc_peer::PeerError;
use chanrpc_protocol::ProtocolError;
use chanrpc_transport::TransportError;

// Process exit codes. Stable across releases; scripts depend on them.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Listen { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Io(source) => io_error(context, source),
        TransportError::PathTooLong { .. } | TransportError::PathOccupied { .. } => {
            CliError::usage(format!("{context}: {err}"))
        }
        err if err.is_disconnect() => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } | FrameError::MalformedVarint => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn protocol_error(context: &str, err: ProtocolError) -> CliError {
    match err {
        ProtocolError::Frame(err) => frame_error(context, err),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn peer_error(context: &str, err: PeerError) -> CliError {
    match err {
        PeerError::Transport(err) => transport_error(context, err),
        PeerError::Frame(err) => frame_error(context, err),
        PeerError::Protocol(err) => protocol_error(context, err),
        PeerError::Remote(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        PeerError::MethodTimeout { .. } | PeerError::OpenTimeout { .. } => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        PeerError::Disconnected(_) | PeerError::ChannelClosed(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        PeerError::OpenRejected { .. } | PeerError::InvalidRoute(_) => {
            CliError::usage(format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chanrpc_protocol::RemoteError;

    use super::*;

    #[test]
    fn connection_refused_is_a_transport_error() {
        let err = transport_error(
            "connect failed",
            TransportError::Connect {
                path: "/tmp/missing.sock".into(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            },
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn socket_path_problems_are_usage_errors() {
        let occupied = TransportError::PathOccupied {
            path: "/tmp/notes.txt".into(),
        };
        assert_eq!(transport_error("bind failed", occupied).code, USAGE);
        assert_eq!(
            transport_error("call failed", TransportError::PeerGone).code,
            TRANSPORT_ERROR
        );
    }

    #[test]
    fn peer_errors_map_to_stable_codes() {
        let timeout = PeerError::MethodTimeout {
            method: "demo/$add".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(peer_error("call", timeout).code, TIMEOUT);
        assert_eq!(
            peer_error("call", PeerError::Remote(RemoteError::new("boom"))).code,
            FAILURE
        );
        assert_eq!(
            peer_error("call", ProtocolError::UnknownTag(9).into()).code,
            DATA_INVALID
        );
        let rejected = PeerError::OpenRejected {
            id: "c:1".into(),
            code: 404,
            message: "no handler".into(),
        };
        assert_eq!(peer_error("open", rejected).code, USAGE);
    }
}
