//! Per-peer protocol state and the connection engine.
//!
//! One [`PeerConnection`] owns the handshake state machine, the four
//! choke/interest flags, the peer's bitfield, and the three request
//! lists the scheduler moves blocks between.

mod bitfield;
mod connection;
mod error;
mod peer_id;
mod request_list;
mod state;

pub use bitfield::Bitfield;
pub use connection::{ConnEvent, HandshakeState, PeerConnection};
pub use error::PeerError;
pub use peer_id::PeerId;
pub use request_list::{BlockRef, RequestId, RequestList};
pub use state::{ConnectionState, PeerData};
