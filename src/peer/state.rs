use super::bitfield::Bitfield;
use super::peer_id::PeerId;

/// The four choke/interest flags of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl ConnectionState {
    /// Resets all four flags to their initial values.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// What we know about the remote peer after the handshake: its identity
/// and which pieces it claims to have.
#[derive(Debug)]
pub struct PeerData {
    id: PeerId,
    bitfield: Bitfield,
}

impl PeerData {
    pub fn new(id: PeerId, piece_count: usize) -> Self {
        Self {
            id,
            bitfield: Bitfield::new(piece_count),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.id
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Replaces the bitfield wholesale (bitfield message).
    pub fn set_bitfield(&mut self, bitfield: Bitfield) {
        self.bitfield = bitfield;
    }

    /// Records a single piece announcement (have message).
    pub fn record_have(&mut self, piece: u32) {
        self.bitfield.set_piece(piece as usize);
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.bitfield.has_piece(piece as usize)
    }

    /// True when the peer holds at least one piece missing from `ours`.
    pub fn wants_any(&self, ours: &Bitfield) -> bool {
        (0..self.bitfield.piece_count())
            .any(|i| self.bitfield.has_piece(i) && !ours.has_piece(i))
    }
}
