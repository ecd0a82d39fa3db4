use super::{BlockCache, BufferPool, ReadCallback};
use crate::torrent::Torrent;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::{debug, warn};

// One piece being assembled out of arbitrary-order blocks.
struct PieceBuild {
    buf: BytesMut,
    received: HashSet<u32>,
    bytes: u32,
    size: u32,
}

/// In-memory assembling and verifying piece store.
///
/// Blocks arrive in any order; once a piece's byte coverage is complete
/// it is SHA-1 verified against the torrent's expected hash. Verified
/// pieces are kept for serving uploads; failures release the assembly
/// buffer and report through the progress tracker so the piece can be
/// planned again.
pub struct MemoryCache {
    torrent: Rc<RefCell<Torrent>>,
    pool: Rc<RefCell<BufferPool>>,
    building: HashMap<u32, PieceBuild>,
    complete: HashMap<u32, BytesMut>,
}

impl MemoryCache {
    pub fn new(torrent: Rc<RefCell<Torrent>>, pool: Rc<RefCell<BufferPool>>) -> Self {
        Self {
            torrent,
            pool,
            building: HashMap::new(),
            complete: HashMap::new(),
        }
    }

    /// Preloads a verified piece, e.g. when seeding existing data.
    pub fn insert_piece(&mut self, piece: u32, data: &[u8]) {
        let mut buf = self.pool.borrow_mut().acquire(data.len());
        buf.extend_from_slice(data);
        self.complete.insert(piece, buf);
        self.torrent.borrow_mut().mark_piece_complete(piece);
    }

    /// True once the piece has been assembled and verified.
    pub fn piece_ready(&self, piece: u32) -> bool {
        self.complete.contains_key(&piece)
    }

    /// Bytes of the piece received so far while assembling.
    pub fn bytes_received(&self, piece: u32) -> u32 {
        self.building.get(&piece).map_or(0, |b| b.bytes)
    }

    fn finalize(&mut self, piece: u32, build: PieceBuild) {
        let verified = {
            let torrent = self.torrent.borrow();
            match torrent.piece_hash(piece) {
                Some(expected) => {
                    let digest: [u8; 20] = Sha1::digest(&build.buf[..]).into();
                    digest == *expected
                }
                None => true,
            }
        };

        if verified {
            debug!(piece, "piece assembled and verified");
            self.complete.insert(piece, build.buf);
            self.torrent.borrow_mut().mark_piece_complete(piece);
        } else {
            warn!(piece, "piece failed hash check");
            self.pool.borrow_mut().release(build.buf);
            self.torrent.borrow_mut().mark_piece_failed(piece);
        }
    }
}

impl BlockCache for MemoryCache {
    fn write_block(&mut self, piece: u32, begin: u32, data: Bytes) {
        let size = {
            let torrent = self.torrent.borrow();
            if piece >= torrent.piece_count() {
                warn!(piece, "block for out-of-range piece");
                return;
            }
            if torrent.local_bitfield().has_piece(piece as usize) {
                // late duplicate of a piece we already hold
                return;
            }
            torrent.piece_size(piece)
        };

        let end = begin as u64 + data.len() as u64;
        if end > size as u64 {
            warn!(piece, begin, len = data.len(), "block overruns piece");
            return;
        }

        let build = self.building.entry(piece).or_insert_with(|| {
            let mut buf = self.pool.borrow_mut().acquire(size as usize);
            buf.resize(size as usize, 0);
            PieceBuild {
                buf,
                received: HashSet::new(),
                bytes: 0,
                size,
            }
        });

        if !build.received.insert(begin) {
            return;
        }
        build.buf[begin as usize..end as usize].copy_from_slice(&data);
        build.bytes += data.len() as u32;

        if build.bytes >= build.size {
            if let Some(build) = self.building.remove(&piece) {
                self.finalize(piece, build);
            }
        }
    }

    fn read_block(&mut self, piece: u32, begin: u32, length: u32, done: ReadCallback) {
        match self.complete.get(&piece) {
            Some(buf) if (begin as u64 + length as u64) <= buf.len() as u64 => {
                let data = Bytes::copy_from_slice(&buf[begin as usize..(begin + length) as usize]);
                done(true, data);
            }
            _ => done(false, Bytes::new()),
        }
    }
}
