use crate::wire::WireError;
use thiserror::Error;

/// Errors that tear down a peer connection.
///
/// Recoverable faults (unknown message ids, upload read failures, request
/// timeouts) never surface here; they are absorbed where they occur.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Framing or codec violation on the inbound stream.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The handshake carried our own peer id.
    #[error("connected to ourselves")]
    OwnConnection,

    /// A bitfield message that cannot cover the torrent's pieces.
    #[error("bitfield of {got} bytes cannot cover {expected} byte field")]
    BitfieldLength { got: usize, expected: usize },

    /// A bitfield message with nonzero bits past the piece count.
    #[error("bitfield has nonzero spare bits")]
    BitfieldSpareBits,

    /// A request message with a zero or oversized block length.
    #[error("request length {0} out of bounds")]
    RequestLength(u32),
}
