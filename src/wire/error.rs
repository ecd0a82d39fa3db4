use thiserror::Error;

/// Errors produced by the framing and codec layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// The first frame on the stream was not a valid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// A message length prefix exceeds the frame payload cap.
    #[error("frame payload of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// A known message was shorter than its fixed payload requires.
    #[error("truncated message: {0}")]
    Truncated(&'static str),

    /// The message id byte is outside the known set.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),
}
