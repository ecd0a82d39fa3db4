use super::error::WireError;
use super::message::HANDSHAKE_LEN;
use crate::constants::MAX_FRAME_PAYLOAD;
use bytes::{Bytes, BytesMut};

/// How the next frame on the stream is delimited.
///
/// A connection starts in [`UnpackRule::Handshake`] and switches to
/// [`UnpackRule::Message`] once the 68-byte handshake has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackRule {
    /// Fixed 68-byte handshake frame.
    Handshake,
    /// 4-byte big-endian length prefix followed by that many payload bytes.
    Message,
}

impl UnpackRule {
    /// Inspects a buffer prefix and returns the length of the next complete
    /// frame, or `None` when more bytes are needed.
    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, WireError> {
        match self {
            UnpackRule::Handshake => {
                if buf.is_empty() {
                    return Ok(None);
                }
                // fail fast on a stream that can never become a handshake
                if buf[0] != 19 {
                    return Err(WireError::InvalidHandshake);
                }
                if buf.len() < HANDSHAKE_LEN {
                    Ok(None)
                } else {
                    Ok(Some(HANDSHAKE_LEN))
                }
            }
            UnpackRule::Message => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let payload = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if payload > MAX_FRAME_PAYLOAD {
                    return Err(WireError::FrameTooLarge(payload));
                }
                if buf.len() < 4 + payload {
                    Ok(None)
                } else {
                    Ok(Some(4 + payload))
                }
            }
        }
    }
}

/// Buffers an incoming byte stream and splits it into protocol frames.
///
/// Bytes are pushed with [`feed`](Framer::feed) and complete frames pulled
/// with [`next_frame`](Framer::next_frame). After the pull loop drains, the
/// internal buffer holds exactly the trailing bytes that do not yet form a
/// complete frame.
pub struct Framer {
    buf: BytesMut,
    rule: UnpackRule,
}

impl Framer {
    pub fn new(rule: UnpackRule) -> Self {
        Self {
            buf: BytesMut::with_capacity(32 * 1024),
            rule,
        }
    }

    /// Appends raw transport bytes to the frame buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete frame under the current rule, if buffered.
    ///
    /// The returned frame includes its length prefix (message rule) or is
    /// the full 68 handshake bytes (handshake rule).
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        match self.rule.frame_len(&self.buf)? {
            Some(len) => Ok(Some(self.buf.split_to(len).freeze())),
            None => Ok(None),
        }
    }

    /// Switches the delimiting rule for subsequent frames.
    pub fn set_rule(&mut self, rule: UnpackRule) {
        self.rule = rule;
    }

    pub fn rule(&self) -> UnpackRule {
        self.rule
    }

    /// Discards all buffered bytes. Used on transport reset.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Number of residual bytes not yet delivered as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
