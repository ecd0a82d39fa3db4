//! peerwire - a BitTorrent peer wire connection engine
//!
//! This library implements the per-peer core of a swarming client: wire
//! framing and codec, the two-phase handshake, the choke/interest state
//! machine, a timeout-driven block request scheduler, and upload/download
//! arbitration against a shared piece cache and dispatchers. Everything
//! runs on a single-threaded cooperative reactor; background workers post
//! completions into the loop rather than touching connection state.
//!
//! # Modules
//!
//! - [`wire`] - Stream framing and the message codec
//! - [`peer`] - Peer state and the connection engine
//! - [`torrent`] - Per-torrent shared state and piece progress
//! - [`cache`] - Block cache interface, in-memory cache, buffer pool
//! - [`dispatch`] - Download and upload dispatchers
//! - [`timer`] - Deadline-heap timer service
//! - [`resolver`] - Background address resolution
//! - [`session`] - Connection owner and reactor loop

pub mod cache;
pub mod constants;
pub mod dispatch;
pub mod peer;
pub mod resolver;
pub mod session;
pub mod timer;
pub mod torrent;
pub mod wire;

pub use cache::{BlockCache, BufferPool, MemoryCache};
pub use dispatch::{DownloadDispatcher, PiecePicker, UploadDispatcher, UploadQueue};
pub use peer::{
    Bitfield, BlockRef, ConnEvent, ConnectionState, HandshakeState, PeerConnection, PeerData,
    PeerError, PeerId, RequestId, RequestList,
};
pub use resolver::Resolver;
pub use session::{ConnId, Post, Session, TorrentHandles};
pub use timer::{TimerEvent, TimerId, TimerKind, TimerService};
pub use torrent::{DownloadProgress, InfoHash, ProgressEvent, Torrent};
pub use wire::{Framer, Handshake, Message, MessageId, UnpackRule, WireError};
