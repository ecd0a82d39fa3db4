//! Per-torrent shared state: identity, piece geometry, our bitfield,
//! and the piece-progress observer connections subscribe to.

use crate::peer::Bitfield;
use crate::session::ConnId;
use std::collections::HashSet;
use std::fmt;

/// A BitTorrent info hash (20-byte SHA1).
///
/// The info hash uniquely identifies a torrent across the network and is
/// negotiated during the handshake; once a connection completes its
/// handshake the hash is immutable.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Converts to a lowercase hexadecimal string.
    pub fn to_hex(&self) -> String {
        self.0
            .iter()
            .fold(String::with_capacity(40), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{:02x}", b);
                s
            })
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A change in the download state of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Blocks of the piece are being fetched for the first time.
    Started(u32),
    /// The piece was assembled and passed verification.
    Completed(u32),
    /// The piece was assembled but failed verification.
    Failed(u32),
}

impl ProgressEvent {
    pub fn piece(&self) -> u32 {
        match self {
            ProgressEvent::Started(p) | ProgressEvent::Completed(p) | ProgressEvent::Failed(p) => {
                *p
            }
        }
    }
}

/// Tracks which pieces are in flight and fans piece events out to the
/// connections subscribed at the moment an event fires.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    downloading: HashSet<u32>,
    subscribers: HashSet<ConnId>,
    events: Vec<ProgressEvent>,
}

impl DownloadProgress {
    pub fn subscribe(&mut self, conn: ConnId) {
        self.subscribers.insert(conn);
    }

    pub fn unsubscribe(&mut self, conn: ConnId) {
        self.subscribers.remove(&conn);
    }

    /// Snapshot of the live subscribers, for event delivery.
    pub fn subscribers(&self) -> Vec<ConnId> {
        self.subscribers.iter().copied().collect()
    }

    pub fn is_downloading(&self, piece: u32) -> bool {
        self.downloading.contains(&piece)
    }

    pub fn note_started(&mut self, piece: u32) {
        if self.downloading.insert(piece) {
            self.events.push(ProgressEvent::Started(piece));
        }
    }

    pub fn note_completed(&mut self, piece: u32) {
        self.downloading.remove(&piece);
        self.events.push(ProgressEvent::Completed(piece));
    }

    pub fn note_failed(&mut self, piece: u32) {
        self.downloading.remove(&piece);
        self.events.push(ProgressEvent::Failed(piece));
    }

    /// Drains the events accumulated since the last call.
    pub fn take_events(&mut self) -> Vec<ProgressEvent> {
        std::mem::take(&mut self.events)
    }
}

/// The shared per-torrent object: identity, piece geometry, expected
/// piece hashes, our own bitfield, and the download progress tracker.
#[derive(Debug)]
pub struct Torrent {
    info_hash: InfoHash,
    piece_length: u32,
    total_length: u64,
    piece_count: u32,
    piece_hashes: Vec<[u8; 20]>,
    local: Bitfield,
    /// Piece progress observer; connections subscribe by id.
    pub progress: DownloadProgress,
}

impl Torrent {
    /// Creates the shared state for one torrent.
    ///
    /// `piece_hashes` may be empty, in which case assembled pieces are
    /// accepted without verification (useful in tests and for
    /// hash-checked-elsewhere setups).
    pub fn new(
        info_hash: InfoHash,
        piece_length: u32,
        total_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Self {
        let piece_count = total_length.div_ceil(piece_length as u64) as u32;
        Self {
            info_hash,
            piece_length,
            total_length,
            piece_count,
            piece_hashes,
            local: Bitfield::new(piece_count as usize),
            progress: DownloadProgress::default(),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Returns the size of a piece; the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        if index + 1 < self.piece_count {
            self.piece_length
        } else {
            let remainder = self.total_length % self.piece_length as u64;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder as u32
            }
        }
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    pub fn local_bitfield(&self) -> &Bitfield {
        &self.local
    }

    pub fn have_any_piece(&self) -> bool {
        !self.local.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.local.is_complete()
    }

    /// Marks a piece as verified and owned, and queues the completion
    /// event for the observers.
    pub fn mark_piece_complete(&mut self, piece: u32) {
        self.local.set_piece(piece as usize);
        self.progress.note_completed(piece);
    }

    /// Records a verification failure; the piece becomes plannable again.
    pub fn mark_piece_failed(&mut self, piece: u32) {
        self.progress.note_failed(piece);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(pieces: u32, piece_len: u32, total: u64) -> Torrent {
        let t = Torrent::new(InfoHash([0xaa; 20]), piece_len, total, Vec::new());
        assert_eq!(t.piece_count(), pieces);
        t
    }

    #[test]
    fn test_piece_size_math() {
        let t = Torrent::new(InfoHash([0; 20]), 16384, 16384 * 3 + 100, Vec::new());
        assert_eq!(t.piece_count(), 4);
        assert_eq!(t.piece_size(0), 16384);
        assert_eq!(t.piece_size(2), 16384);
        assert_eq!(t.piece_size(3), 100);

        let even = Torrent::new(InfoHash([0; 20]), 16384, 16384 * 2, Vec::new());
        assert_eq!(even.piece_count(), 2);
        assert_eq!(even.piece_size(1), 16384);
    }

    #[test]
    fn test_progress_events_drain() {
        let mut t = torrent(4, 16384, 16384 * 4);
        t.progress.note_started(1);
        t.progress.note_started(1);
        t.mark_piece_complete(1);
        let events = t.progress.take_events();
        assert_eq!(
            events,
            vec![ProgressEvent::Started(1), ProgressEvent::Completed(1)]
        );
        assert!(t.progress.take_events().is_empty());
        assert!(t.local_bitfield().has_piece(1));
    }

    #[test]
    fn test_info_hash_hex() {
        let hash = InfoHash([0xab; 20]);
        assert_eq!(hash.to_hex(), "ab".repeat(20));
    }
}
