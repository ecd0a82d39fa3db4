//! Download and upload dispatchers.
//!
//! The download dispatcher plans which blocks a connection should
//! request next; the upload dispatcher funnels peer requests through the
//! cache and back to the connection as a posted completion. Selection
//! policy is deliberately simple here; the traits are the seam where a
//! rarest-first or endgame planner would plug in.

use crate::cache::BlockCache;
use crate::constants::BLOCK_SIZE;
use crate::peer::{Bitfield, BlockRef};
use crate::session::{ConnId, Post};
use crate::torrent::Torrent;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

/// Picks blocks for connections to request and takes back the ones they
/// will not fulfill.
pub trait DownloadDispatcher {
    /// Returns up to `max` blocks the peer has, we lack, and no other
    /// connection is currently requesting.
    fn request_blocks(&mut self, peer_has: &Bitfield, max: usize) -> Vec<BlockRef>;

    /// Takes back a block a connection gave up on (timeout, choke, drop).
    fn return_block(&mut self, block: BlockRef);

    /// A piece finished; pending plans for it are void.
    fn piece_completed(&mut self, piece: u32);

    /// A piece failed verification; it must be planned from scratch.
    fn piece_failed(&mut self, piece: u32);
}

/// Accepts upload requests from connections and delivers block reads
/// back through the reactor.
pub trait UploadDispatcher {
    fn push_upload_request(&mut self, conn: ConnId, block: BlockRef);
}

/// Sequential block planner over the torrent's missing pieces.
///
/// Pieces are planned front to back; each started piece is split into
/// 16 KiB blocks which are handed out at most once until returned.
pub struct PiecePicker {
    torrent: Rc<RefCell<Torrent>>,
    outstanding: HashSet<BlockRef>,
    pending: HashMap<u32, Vec<BlockRef>>,
}

impl PiecePicker {
    pub fn new(torrent: Rc<RefCell<Torrent>>) -> Self {
        Self {
            torrent,
            outstanding: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    fn plan_piece(piece: u32, piece_size: u32) -> Vec<BlockRef> {
        let mut blocks = Vec::new();
        let mut begin = 0u32;
        while begin < piece_size {
            let length = BLOCK_SIZE.min(piece_size - begin);
            blocks.push(BlockRef::new(piece, begin, length));
            begin += length;
        }
        // pop() drains from the back
        blocks.reverse();
        blocks
    }

    /// Blocks handed out and not yet returned or completed.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

impl DownloadDispatcher for PiecePicker {
    fn request_blocks(&mut self, peer_has: &Bitfield, max: usize) -> Vec<BlockRef> {
        let mut picked = Vec::new();

        // drain already-started pieces the peer can serve
        for (&piece, blocks) in self.pending.iter_mut() {
            if !peer_has.has_piece(piece as usize) {
                continue;
            }
            while picked.len() < max {
                match blocks.pop() {
                    Some(block) => picked.push(block),
                    None => break,
                }
            }
            if picked.len() >= max {
                break;
            }
        }
        self.pending.retain(|_, blocks| !blocks.is_empty());

        // start new pieces front to back
        while picked.len() < max {
            let mut torrent = self.torrent.borrow_mut();
            let next = (0..torrent.piece_count()).find(|&p| {
                peer_has.has_piece(p as usize)
                    && !torrent.local_bitfield().has_piece(p as usize)
                    && !torrent.progress.is_downloading(p)
                    && !self.pending.contains_key(&p)
            });
            let Some(piece) = next else {
                break;
            };
            torrent.progress.note_started(piece);
            let mut blocks = Self::plan_piece(piece, torrent.piece_size(piece));
            drop(torrent);

            while picked.len() < max {
                match blocks.pop() {
                    Some(block) => picked.push(block),
                    None => break,
                }
            }
            if !blocks.is_empty() {
                self.pending.insert(piece, blocks);
            }
        }

        self.outstanding.extend(picked.iter().copied());
        trace!(count = picked.len(), "blocks handed out");
        picked
    }

    fn return_block(&mut self, block: BlockRef) {
        if self.outstanding.remove(&block) {
            self.pending.entry(block.piece).or_default().push(block);
        }
    }

    fn piece_completed(&mut self, piece: u32) {
        self.pending.remove(&piece);
        self.outstanding.retain(|b| b.piece != piece);
    }

    fn piece_failed(&mut self, piece: u32) {
        // forget everything; the piece re-enters planning untouched
        self.pending.remove(&piece);
        self.outstanding.retain(|b| b.piece != piece);
    }
}

/// Upload funnel: reads go to the cache, completions post back into the
/// reactor addressed to the requesting connection.
pub struct UploadQueue {
    cache: Rc<RefCell<dyn BlockCache>>,
    post: UnboundedSender<Post>,
}

impl UploadQueue {
    pub fn new(cache: Rc<RefCell<dyn BlockCache>>, post: UnboundedSender<Post>) -> Self {
        Self { cache, post }
    }
}

impl UploadDispatcher for UploadQueue {
    fn push_upload_request(&mut self, conn: ConnId, block: BlockRef) {
        let post = self.post.clone();
        self.cache.borrow_mut().read_block(
            block.piece,
            block.begin,
            block.length,
            Box::new(move |ok, data| {
                let _ = post.send(Post::UploadRead {
                    conn,
                    block,
                    ok,
                    data,
                });
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;

    fn picker(pieces: u32) -> PiecePicker {
        let torrent = Torrent::new(
            InfoHash([1; 20]),
            BLOCK_SIZE,
            BLOCK_SIZE as u64 * pieces as u64,
            Vec::new(),
        );
        PiecePicker::new(Rc::new(RefCell::new(torrent)))
    }

    fn full_bitfield(pieces: usize) -> Bitfield {
        let mut bf = Bitfield::new(pieces);
        for i in 0..pieces {
            bf.set_piece(i);
        }
        bf
    }

    #[test]
    fn test_hands_out_each_block_once() {
        let mut picker = picker(2);
        let peer = full_bitfield(2);

        let first = picker.request_blocks(&peer, 1);
        assert_eq!(first, vec![BlockRef::new(0, 0, BLOCK_SIZE)]);

        let second = picker.request_blocks(&peer, 4);
        assert_eq!(second, vec![BlockRef::new(1, 0, BLOCK_SIZE)]);

        assert!(picker.request_blocks(&peer, 4).is_empty());
    }

    #[test]
    fn test_skips_pieces_peer_lacks() {
        let mut picker = picker(3);
        let mut peer = Bitfield::new(3);
        peer.set_piece(2);

        let picked = picker.request_blocks(&peer, 4);
        assert_eq!(picked, vec![BlockRef::new(2, 0, BLOCK_SIZE)]);
    }

    #[test]
    fn test_returned_block_is_replanned() {
        let mut picker = picker(1);
        let peer = full_bitfield(1);

        let picked = picker.request_blocks(&peer, 1);
        picker.return_block(picked[0]);
        assert_eq!(picker.outstanding_count(), 0);

        let again = picker.request_blocks(&peer, 1);
        assert_eq!(again, picked);
    }

    #[test]
    fn test_failed_piece_replans_from_scratch() {
        let mut picker = picker(1);
        let peer = full_bitfield(1);

        let picked = picker.request_blocks(&peer, 1);
        assert_eq!(picked.len(), 1);

        // hash failure clears the downloading mark and the picker's plans
        picker.torrent.borrow_mut().mark_piece_failed(0);
        picker.piece_failed(0);

        let again = picker.request_blocks(&peer, 1);
        assert_eq!(again, picked);
    }

    #[test]
    fn test_short_last_piece_blocks() {
        let torrent = Torrent::new(
            InfoHash([1; 20]),
            BLOCK_SIZE,
            BLOCK_SIZE as u64 + 100,
            Vec::new(),
        );
        let mut picker = PiecePicker::new(Rc::new(RefCell::new(torrent)));
        let peer = full_bitfield(2);

        let picked = picker.request_blocks(&peer, 8);
        assert_eq!(
            picked,
            vec![
                BlockRef::new(0, 0, BLOCK_SIZE),
                BlockRef::new(1, 0, 100),
            ]
        );
    }
}
