/// Errors that can occur while buffering, encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A byte position outside the buffered range was requested.
    #[error("position {index} out of range (length {len})")]
    OutOfRange { index: usize, len: usize },

    /// The declared payload length exceeds the configured maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A variable-length integer did not terminate within its maximum width.
    #[error("malformed varint length prefix")]
    MalformedVarint,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended in the middle of a frame.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
