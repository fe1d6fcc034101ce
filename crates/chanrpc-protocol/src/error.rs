use chanrpc_frame::FrameError;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The message ended before a field was complete.
    #[error("unexpected end of message (needed {needed} bytes, {remaining} left)")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A string field is not valid UTF-8.
    #[error("invalid utf-8 in string field: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The envelope carries a protocol version this build does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// The envelope carries an unknown operation kind.
    #[error("unknown operation kind {0}")]
    UnknownOperation(u8),

    /// A generic-codec value carries an unknown type tag.
    #[error("unknown value tag {0}")]
    UnknownTag(u8),

    /// A value does not match the declared type of its slot.
    #[error("type mismatch (expected {expected}, found {found})")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// More arguments were supplied than the method declares.
    #[error("method {method} takes {expected} arguments, got {found}")]
    ArityMismatch {
        method: String,
        expected: usize,
        found: usize,
    },

    /// Arrays are nested deeper than the configured limit.
    #[error("values nested deeper than {0} levels")]
    NestingTooDeep(usize),

    /// Bytes remained after the last field of a message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// A protocol entry is not usable.
    #[error("invalid protocol entry: {0}")]
    InvalidEntry(String),

    /// A JSON escape-hatch value failed to (de)serialize.
    #[error("invalid JSON value: {0}")]
    Json(#[from] serde_json::Error),

    /// A length prefix is malformed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
