//! The connection owner and its reactor loop.
//!
//! A [`Session`] owns every peer connection in an arena keyed by
//! [`ConnId`], the torrent registry, the timer service, and the buffer
//! pool. It runs a single-threaded event loop: socket tasks and the
//! resolver post [`Post`] events into the loop and never touch
//! connection state themselves; timer deadlines are woken exactly when
//! due. Per-socket reader/writer tasks only shuttle bytes.
//!
//! `Session` is deliberately `!Send`; run it on a current-thread runtime
//! (e.g. inside a `tokio::task::LocalSet`).

use crate::cache::{BlockCache, BufferPool, MemoryCache};
use crate::constants::{LISTEN_PORT_FIRST, LISTEN_PORT_LAST, READ_BUFFER_SIZE};
use crate::dispatch::{DownloadDispatcher, PiecePicker, UploadDispatcher, UploadQueue};
use crate::peer::{BlockRef, ConnEvent, PeerConnection, PeerId};
use crate::resolver::Resolver;
use crate::timer::TimerService;
use crate::torrent::{InfoHash, ProgressEvent, Torrent};
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stable identity of one connection in the owner's arena.
///
/// Ids are never reused within a session, so a stale id held by a timer
/// or a posted completion simply fails its lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An event posted into the reactor loop.
///
/// Everything that happens off the reactor (socket reads, connects,
/// resolver completions, cache read completions) arrives as a `Post`;
/// connection state is only ever touched while handling one.
#[derive(Debug)]
pub enum Post {
    /// Outbound TCP connect succeeded.
    Connected(ConnId),
    /// Outbound TCP connect failed.
    ConnectFailed(ConnId),
    /// Bytes read off a peer socket.
    Data(ConnId, Bytes),
    /// EOF or socket error on a peer socket.
    Closed(ConnId),
    /// The listener accepted a new socket.
    Accepted(TcpStream),
    /// Background name resolution finished.
    Resolved {
        host: String,
        port: u16,
        addrs: Vec<SocketAddr>,
    },
    /// The cache finished a block read for an upload.
    UploadRead {
        conn: ConnId,
        block: BlockRef,
        ok: bool,
        data: Bytes,
    },
    /// Stop the reactor loop.
    Shutdown,
}

/// The shared collaborators a connection needs once its torrent is
/// known: the torrent itself, the piece cache, and the two dispatchers.
pub struct TorrentHandles {
    pub torrent: Rc<RefCell<Torrent>>,
    pub cache: Rc<RefCell<dyn BlockCache>>,
    pub download: Rc<RefCell<dyn DownloadDispatcher>>,
    pub upload: Rc<RefCell<dyn UploadDispatcher>>,
}

impl Clone for TorrentHandles {
    fn clone(&self) -> Self {
        Self {
            torrent: self.torrent.clone(),
            cache: self.cache.clone(),
            download: self.download.clone(),
            upload: self.upload.clone(),
        }
    }
}

/// Owner of all peer connections and the reactor they run on.
pub struct Session {
    our_id: PeerId,
    next_conn: u64,
    connections: HashMap<ConnId, PeerConnection>,
    io_tasks: HashMap<ConnId, JoinHandle<()>>,
    torrents: HashMap<InfoHash, TorrentHandles>,
    pending_resolves: HashMap<(String, u16), InfoHash>,
    pool: Rc<RefCell<BufferPool>>,
    timers: Rc<RefCell<TimerService>>,
    post_tx: UnboundedSender<Post>,
    post_rx: UnboundedReceiver<Post>,
    resolver: Resolver,
    listen_port: Option<u16>,
}

impl Session {
    pub fn new(our_id: PeerId) -> std::io::Result<Self> {
        let (post_tx, post_rx) = mpsc::unbounded_channel();
        let resolver = Resolver::spawn(post_tx.clone())?;
        Ok(Self {
            our_id,
            next_conn: 0,
            connections: HashMap::new(),
            io_tasks: HashMap::new(),
            torrents: HashMap::new(),
            pending_resolves: HashMap::new(),
            pool: Rc::new(RefCell::new(BufferPool::new())),
            timers: Rc::new(RefCell::new(TimerService::new())),
            post_tx,
            post_rx,
            resolver,
            listen_port: None,
        })
    }

    /// A sender usable from anywhere (other threads included) to post
    /// into the reactor.
    pub fn post_handle(&self) -> UnboundedSender<Post> {
        self.post_tx.clone()
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Registers a torrent and builds its cache and dispatchers.
    pub fn add_torrent(&mut self, torrent: Torrent) -> TorrentHandles {
        let info_hash = torrent.info_hash();
        let torrent = Rc::new(RefCell::new(torrent));
        let cache: Rc<RefCell<dyn BlockCache>> = Rc::new(RefCell::new(MemoryCache::new(
            torrent.clone(),
            self.pool.clone(),
        )));
        let download: Rc<RefCell<dyn DownloadDispatcher>> =
            Rc::new(RefCell::new(PiecePicker::new(torrent.clone())));
        let upload: Rc<RefCell<dyn UploadDispatcher>> = Rc::new(RefCell::new(UploadQueue::new(
            cache.clone(),
            self.post_tx.clone(),
        )));
        let handles = TorrentHandles {
            torrent,
            cache,
            download,
            upload,
        };
        self.torrents.insert(info_hash, handles.clone());
        info!(%info_hash, "torrent registered");
        handles
    }

    /// Binds the first free listen port in 6881..=6980 and starts
    /// accepting peers. The bound port is recorded on the session.
    pub async fn bind_listener(&mut self) -> std::io::Result<u16> {
        for port in LISTEN_PORT_FIRST..=LISTEN_PORT_LAST {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    info!(port, "listening for peers");
                    self.listen_port = Some(port);
                    let post = self.post_tx.clone();
                    tokio::spawn(async move {
                        loop {
                            match listener.accept().await {
                                Ok((stream, addr)) => {
                                    debug!(%addr, "peer accepted");
                                    if post.send(Post::Accepted(stream)).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("accept failed: {e}"),
                            }
                        }
                    });
                    return Ok(port);
                }
                Err(e) => debug!(port, "bind failed: {e}"),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free listen port",
        ))
    }

    /// Opens an outbound connection to a peer of a registered torrent.
    ///
    /// Must be called from within the runtime driving [`run`](Self::run).
    pub fn connect_peer(&mut self, info_hash: InfoHash, addr: SocketAddr) -> Option<ConnId> {
        let handles = self.torrents.get(&info_hash)?.clone();
        let id = self.alloc_conn();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::outbound(id, self.our_id, handles, tx, self.timers.clone());
        self.connections.insert(id, conn);
        let task = tokio::spawn(connect_and_drive(id, addr, rx, self.post_tx.clone()));
        self.io_tasks.insert(id, task);
        debug!(conn = %id, %addr, "connecting");
        Some(id)
    }

    /// Resolves `host:port` in the background, then connects.
    pub fn connect_host(&mut self, info_hash: InfoHash, host: String, port: u16) {
        self.pending_resolves.insert((host.clone(), port), info_hash);
        self.resolver.resolve(host, port);
    }

    /// Runs the reactor loop until a [`Post::Shutdown`] arrives.
    pub async fn run(mut self) {
        loop {
            let deadline = self.timers.borrow_mut().next_deadline();
            tokio::select! {
                maybe = self.post_rx.recv() => {
                    match maybe {
                        Some(Post::Shutdown) | None => break,
                        Some(post) => {
                            self.handle_post(post);
                            self.sweep();
                        }
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    let fired = self.timers.borrow_mut().expired(Instant::now());
                    for event in fired {
                        if let Some(conn) = self.connections.get_mut(&event.conn) {
                            conn.on_timer(event.kind);
                        }
                    }
                    self.sweep();
                }
            }
        }
        debug!("session loop stopped");
    }

    fn alloc_conn(&mut self) -> ConnId {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        id
    }

    fn accept_peer(&mut self, stream: TcpStream) {
        let id = self.alloc_conn();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut conn = PeerConnection::inbound(id, self.our_id, tx, self.timers.clone());
        conn.on_accepted();
        self.connections.insert(id, conn);
        let task = tokio::spawn(drive_socket(id, stream, rx, self.post_tx.clone()));
        self.io_tasks.insert(id, task);
    }

    fn handle_post(&mut self, post: Post) {
        match post {
            Post::Connected(id) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.on_connected();
                }
            }
            Post::ConnectFailed(id) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.on_connect_failed();
                }
            }
            Post::Data(id, bytes) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.on_data(&bytes);
                }
            }
            Post::Closed(id) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.on_transport_error();
                }
            }
            Post::Accepted(stream) => self.accept_peer(stream),
            Post::Resolved { host, port, addrs } => {
                if let Some(info_hash) = self.pending_resolves.remove(&(host.clone(), port)) {
                    match addrs.first() {
                        Some(addr) => {
                            let _ = self.connect_peer(info_hash, *addr);
                        }
                        None => debug!(%host, port, "peer address did not resolve"),
                    }
                }
            }
            Post::UploadRead {
                conn,
                block,
                ok,
                data,
            } => {
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.upload_block(block, ok, data);
                }
            }
            Post::Shutdown => {}
        }
    }

    /// Drains connection lifecycle events and piece-progress events until
    /// nothing new appears. Event handlers can produce further events
    /// (accepting a handshake sends messages, completing a piece purges
    /// requests), hence the fixpoint loop.
    fn sweep(&mut self) {
        loop {
            let mut acted = false;

            let ids: Vec<ConnId> = self.connections.keys().copied().collect();
            for id in ids {
                let events = match self.connections.get_mut(&id) {
                    Some(conn) => conn.take_events(),
                    None => continue,
                };
                for event in events {
                    acted = true;
                    self.on_conn_event(id, event);
                }
            }

            let hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
            for hash in hashes {
                let Some(handles) = self.torrents.get(&hash).cloned() else {
                    continue;
                };
                let events = handles.torrent.borrow_mut().progress.take_events();
                if events.is_empty() {
                    continue;
                }
                acted = true;
                let subscribers = handles.torrent.borrow().progress.subscribers();
                for event in events {
                    match event {
                        ProgressEvent::Completed(p) => {
                            handles.download.borrow_mut().piece_completed(p)
                        }
                        ProgressEvent::Failed(p) => handles.download.borrow_mut().piece_failed(p),
                        ProgressEvent::Started(_) => {}
                    }
                    for sub in &subscribers {
                        if let Some(conn) = self.connections.get_mut(sub) {
                            match event {
                                ProgressEvent::Started(p) => conn.on_piece_started(p),
                                ProgressEvent::Completed(p) => conn.on_piece_complete(p),
                                ProgressEvent::Failed(p) => conn.on_piece_failed(p),
                            }
                        }
                    }
                }
            }

            if !acted {
                break;
            }
        }
    }

    fn on_conn_event(&mut self, id: ConnId, event: ConnEvent) {
        match event {
            ConnEvent::InfoHash(hash) => {
                let bound = self.connections.get(&id).and_then(|c| c.bound_info_hash());
                let accept = match bound {
                    // outbound: the peer must echo the hash we dialed for
                    Some(expected) => expected == hash,
                    // inbound: bind the torrent if we serve this hash
                    None => match self.torrents.get(&hash).cloned() {
                        Some(handles) => {
                            if let Some(conn) = self.connections.get_mut(&id) {
                                conn.bind_torrent(handles);
                            }
                            true
                        }
                        None => false,
                    },
                };
                if let Some(conn) = self.connections.get_mut(&id) {
                    if accept {
                        conn.accept_handshake();
                    } else {
                        warn!(conn = %id, %hash, "unknown or mismatched info hash");
                        conn.reject_handshake();
                    }
                }
            }
            ConnEvent::HandshakeOk => {
                let hash = self.connections.get(&id).and_then(|c| c.bound_info_hash());
                if let Some(handles) = hash.and_then(|h| self.torrents.get(&h)) {
                    handles.torrent.borrow_mut().progress.subscribe(id);
                }
                info!(conn = %id, "peer ready");
            }
            ConnEvent::Dropped => {
                if let Some(conn) = self.connections.remove(&id) {
                    if let Some(handles) =
                        conn.bound_info_hash().and_then(|h| self.torrents.get(&h))
                    {
                        handles.torrent.borrow_mut().progress.unsubscribe(id);
                    }
                }
                if let Some(task) = self.io_tasks.remove(&id) {
                    task.abort();
                }
                debug!(conn = %id, "connection dropped");
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

async fn connect_and_drive(
    id: ConnId,
    addr: SocketAddr,
    outbound: UnboundedReceiver<Bytes>,
    post: UnboundedSender<Post>,
) {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            let _ = post.send(Post::Connected(id));
            drive_socket(id, stream, outbound, post).await;
        }
        Err(e) => {
            debug!(conn = %id, %addr, "connect failed: {e}");
            let _ = post.send(Post::ConnectFailed(id));
        }
    }
}

// Shuttles bytes between the socket and the reactor. Never touches
// connection state; completions go through posts.
async fn drive_socket(
    id: ConnId,
    stream: TcpStream,
    mut outbound: UnboundedReceiver<Bytes>,
    post: UnboundedSender<Post>,
) {
    let (mut rd, mut wr) = stream.into_split();

    let writer_post = post.clone();
    let writer = tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if wr.write_all(&bytes).await.is_err() {
                let _ = writer_post.send(Post::Closed(id));
                break;
            }
        }
    });

    loop {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        match rd.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if post.send(Post::Data(id, buf.freeze())).is_err() {
                    break;
                }
            }
        }
    }
    let _ = post.send(Post::Closed(id));
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Handshake;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_torrent(hash: [u8; 20]) -> Torrent {
        Torrent::new(InfoHash(hash), 16384, 16384 * 4, Vec::new())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_inbound_handshake_over_loopback() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let hash = [0x11u8; 20];
                let mut session = Session::new(PeerId::generate()).unwrap();
                session.add_torrent(test_torrent(hash));
                let post = session.post_handle();

                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();

                let accept_post = post.clone();
                tokio::spawn(async move {
                    let (stream, _) = listener.accept().await.unwrap();
                    accept_post.send(Post::Accepted(stream)).unwrap();
                });

                tokio::task::spawn_local(session.run());

                let mut sock = TcpStream::connect(addr).await.unwrap();
                let ours = Handshake::new(hash, [0x22; 20]);
                sock.write_all(&ours.encode()).await.unwrap();

                let mut buf = [0u8; 68];
                tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    sock.read_exact(&mut buf),
                )
                .await
                .unwrap()
                .unwrap();
                let theirs = Handshake::decode(&buf).unwrap();
                assert_eq!(theirs.info_hash, hash);

                post.send(Post::Shutdown).unwrap();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_listener_walks_past_taken_port() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let _taken = TcpListener::bind(("0.0.0.0", LISTEN_PORT_FIRST)).await;

                let mut session = Session::new(PeerId::generate()).unwrap();
                let port = session.bind_listener().await.unwrap();
                assert!((LISTEN_PORT_FIRST..=LISTEN_PORT_LAST).contains(&port));
                assert_eq!(session.listen_port(), Some(port));
            })
            .await;
    }
}
