use super::*;
use crate::constants::POOL_MAX_BUFFER;
use crate::torrent::{InfoHash, ProgressEvent, Torrent};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_pool_bucket_round_trip() {
    let mut pool = BufferPool::new();
    let buf = pool.acquire(100);
    assert!(buf.capacity() >= 100);
    assert_eq!(buf.capacity() % 8, 0);
    let cap = buf.capacity();

    pool.release(buf);
    assert_eq!(pool.free_count(100), 1);

    // 97 and 100 round up to the same bucket
    let again = pool.acquire(97);
    assert_eq!(again.capacity(), cap);
    assert_eq!(pool.free_count(100), 0);
}

#[test]
fn test_pool_oversize_bypasses() {
    let mut pool = BufferPool::new();
    let big = pool.acquire(POOL_MAX_BUFFER + 1);
    assert!(big.capacity() >= POOL_MAX_BUFFER + 1);
    pool.release(big);
    assert_eq!(pool.free_count(POOL_MAX_BUFFER), 0);
}

fn setup(
    piece_len: u32,
    total: u64,
    hashes: Vec<[u8; 20]>,
) -> (MemoryCache, Rc<RefCell<Torrent>>) {
    let torrent = Rc::new(RefCell::new(Torrent::new(
        InfoHash([9; 20]),
        piece_len,
        total,
        hashes,
    )));
    let pool = Rc::new(RefCell::new(BufferPool::new()));
    (MemoryCache::new(torrent.clone(), pool), torrent)
}

fn read(cache: &mut MemoryCache, piece: u32, begin: u32, length: u32) -> (bool, Bytes) {
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    cache.read_block(
        piece,
        begin,
        length,
        Box::new(move |ok, data| {
            *slot.borrow_mut() = Some((ok, data));
        }),
    );
    let taken = result.borrow_mut().take();
    taken.expect("read callback did not run")
}

#[test]
fn test_blocks_assemble_in_any_order() {
    let content = vec![0xab_u8; 32768];
    let hash: [u8; 20] = Sha1::digest(&content).into();
    let (mut cache, torrent) = setup(32768, 32768, vec![hash]);

    cache.write_block(0, 16384, Bytes::copy_from_slice(&content[16384..]));
    assert!(!cache.piece_ready(0));
    assert_eq!(cache.bytes_received(0), 16384);

    cache.write_block(0, 0, Bytes::copy_from_slice(&content[..16384]));
    assert!(cache.piece_ready(0));
    assert!(torrent.borrow().local_bitfield().has_piece(0));
    assert_eq!(
        torrent.borrow_mut().progress.take_events(),
        vec![ProgressEvent::Completed(0)]
    );

    let (ok, data) = read(&mut cache, 0, 100, 50);
    assert!(ok);
    assert_eq!(&data[..], &content[100..150]);
}

#[test]
fn test_hash_mismatch_reports_failure() {
    let content = vec![0x11_u8; 16384];
    let (mut cache, torrent) = setup(16384, 16384, vec![[0u8; 20]]);

    cache.write_block(0, 0, Bytes::copy_from_slice(&content));
    assert!(!cache.piece_ready(0));
    assert!(!torrent.borrow().local_bitfield().has_piece(0));
    assert_eq!(
        torrent.borrow_mut().progress.take_events(),
        vec![ProgressEvent::Failed(0)]
    );

    // the assembly slot was reset; the piece can be rebuilt
    assert_eq!(cache.bytes_received(0), 0);
    cache.write_block(0, 0, Bytes::copy_from_slice(&content));
    assert_eq!(cache.bytes_received(0), 0); // completed again, failed again
}

#[test]
fn test_duplicate_block_is_absorbed() {
    let (mut cache, _torrent) = setup(32768, 32768, Vec::new());
    let block = Bytes::from(vec![0x22_u8; 16384]);
    cache.write_block(0, 0, block.clone());
    cache.write_block(0, 0, block);
    assert_eq!(cache.bytes_received(0), 16384);
}

#[test]
fn test_stale_and_out_of_range_blocks_are_dropped() {
    let (mut cache, torrent) = setup(16384, 16384, Vec::new());

    // out-of-range piece
    cache.write_block(5, 0, Bytes::from_static(&[1, 2, 3]));
    assert_eq!(cache.bytes_received(5), 0);

    // block overrunning the piece
    cache.write_block(0, 16000, Bytes::from(vec![0u8; 1000]));
    assert_eq!(cache.bytes_received(0), 0);

    // a late block for a piece we already hold
    cache.write_block(0, 0, Bytes::from(vec![0u8; 16384]));
    assert!(cache.piece_ready(0));
    assert!(torrent.borrow().local_bitfield().has_piece(0));
    cache.write_block(0, 0, Bytes::from(vec![1u8; 16384]));
    let (ok, data) = read(&mut cache, 0, 0, 4);
    assert!(ok);
    assert_eq!(&data[..], &[0, 0, 0, 0]);
}

#[test]
fn test_read_of_unknown_piece_fails() {
    let (mut cache, _torrent) = setup(16384, 16384, Vec::new());
    let (ok, data) = read(&mut cache, 0, 0, 100);
    assert!(!ok);
    assert!(data.is_empty());
}

#[test]
fn test_insert_piece_for_seeding() {
    let (mut cache, torrent) = setup(16384, 16384 * 2, Vec::new());
    cache.insert_piece(1, &[0x7f; 16384]);
    assert!(cache.piece_ready(1));
    assert!(torrent.borrow().local_bitfield().has_piece(1));

    let (ok, data) = read(&mut cache, 1, 0, 8);
    assert!(ok);
    assert_eq!(&data[..], &[0x7f; 8]);
}
