//! Wire format: stream framing and the message codec.
//!
//! The framer turns arbitrary byte chunks into complete frames under a
//! switchable unpack rule; the codec maps frames to and from typed
//! messages, bit-exact with the classic peer wire protocol.

mod error;
mod framer;
mod message;

pub use error::WireError;
pub use framer::{Framer, UnpackRule};
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL};

#[cfg(test)]
mod tests;
