use super::error::PeerError;
use super::request_list::{BlockRef, RequestId, RequestList};
use super::state::{ConnectionState, PeerData};
use super::Bitfield;
use crate::constants::{
    IDLE_DISCONNECT, KEEPALIVE_INTERVAL, MAX_REQUEST_LENGTH, PIPELINE_DEPTH, REQUEST_TIMEOUT,
};
use crate::peer::PeerId;
use crate::session::{ConnId, TorrentHandles};
use crate::timer::{TimerEvent, TimerId, TimerKind, TimerService};
use crate::torrent::InfoHash;
use crate::wire::{Framer, Handshake, Message, UnpackRule};
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Where the connection is in its handshake lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Outbound transport not yet established.
    Connecting,
    /// Outbound: our handshake is on the wire, awaiting the peer's.
    SentHandshake,
    /// Inbound: waiting for the peer to open with its handshake.
    AwaitHandshake,
    /// Handshake parsed; waiting for the owner's info-hash verdict.
    Verifying,
    /// Handshake complete; normal message dispatch.
    Ready,
    /// Torn down. Terminal.
    Dead,
}

/// Lifecycle notifications surfaced to the owner.
///
/// The owner drains these after every reactor dispatch: `InfoHash` asks
/// for an accept/reject verdict, `HandshakeOk` reports the connection
/// reaching [`HandshakeState::Ready`], and `Dropped` means the owner
/// must release the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    InfoHash(InfoHash),
    HandshakeOk,
    Dropped,
}

/// One peer connection: framer, handshake state machine, choke/interest
/// flags, and the block-request scheduler with its three lists.
///
/// The engine is driven entirely by reactor callbacks (`on_data`,
/// `on_timer`, completions) and never blocks; outbound bytes go to the
/// socket writer through a channel, in send order.
pub struct PeerConnection {
    id: ConnId,
    our_id: PeerId,
    initiated: bool,
    state: HandshakeState,
    flags: ConnectionState,
    pending_peer_id: Option<PeerId>,
    peer: Option<PeerData>,
    handles: Option<TorrentHandles>,
    timers: Rc<RefCell<TimerService>>,
    framer: Framer,
    // things the peer asked us to upload
    peer_requests: RequestList,
    // blocks picked for download but not yet sent
    wait_queue: RequestList,
    // requests on the wire, awaiting piece messages
    in_flight: RequestList,
    timeouts: Vec<(RequestId, TimerId)>,
    upload_busy: bool,
    keep_alive: Option<TimerId>,
    idle: Option<TimerId>,
    outbound: UnboundedSender<Bytes>,
    events: Vec<ConnEvent>,
}

impl PeerConnection {
    /// Creates a connection we initiate; the torrent is known up front.
    pub fn outbound(
        id: ConnId,
        our_id: PeerId,
        handles: TorrentHandles,
        outbound: UnboundedSender<Bytes>,
        timers: Rc<RefCell<TimerService>>,
    ) -> Self {
        Self::new(
            id,
            our_id,
            true,
            HandshakeState::Connecting,
            Some(handles),
            outbound,
            timers,
        )
    }

    /// Creates a connection from an accepted socket; the torrent is bound
    /// once the peer's handshake names an info hash we serve.
    pub fn inbound(
        id: ConnId,
        our_id: PeerId,
        outbound: UnboundedSender<Bytes>,
        timers: Rc<RefCell<TimerService>>,
    ) -> Self {
        Self::new(
            id,
            our_id,
            false,
            HandshakeState::AwaitHandshake,
            None,
            outbound,
            timers,
        )
    }

    fn new(
        id: ConnId,
        our_id: PeerId,
        initiated: bool,
        state: HandshakeState,
        handles: Option<TorrentHandles>,
        outbound: UnboundedSender<Bytes>,
        timers: Rc<RefCell<TimerService>>,
    ) -> Self {
        Self {
            id,
            our_id,
            initiated,
            state,
            flags: ConnectionState::default(),
            pending_peer_id: None,
            peer: None,
            handles,
            timers,
            framer: Framer::new(UnpackRule::Handshake),
            peer_requests: RequestList::new(),
            wait_queue: RequestList::new(),
            in_flight: RequestList::new(),
            timeouts: Vec::new(),
            upload_busy: false,
            keep_alive: None,
            idle: None,
            outbound,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn flags(&self) -> ConnectionState {
        self.flags
    }

    pub fn peer_data(&self) -> Option<&PeerData> {
        self.peer.as_ref()
    }

    /// The info hash of the bound torrent, if one is installed.
    pub fn bound_info_hash(&self) -> Option<InfoHash> {
        self.handles
            .as_ref()
            .map(|h| h.torrent.borrow().info_hash())
    }

    /// Requests on the wire awaiting piece messages.
    pub fn outstanding_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Blocks picked but not yet requested.
    pub fn queued_requests(&self) -> usize {
        self.wait_queue.len()
    }

    /// Inbound upload requests not yet served.
    pub fn pending_peer_requests(&self) -> usize {
        self.peer_requests.len()
    }

    /// Drains lifecycle events for the owner.
    pub fn take_events(&mut self) -> Vec<ConnEvent> {
        std::mem::take(&mut self.events)
    }

    /// Installs the torrent, cache, and dispatchers on an inbound
    /// connection once the owner has matched the info hash.
    pub fn bind_torrent(&mut self, handles: TorrentHandles) {
        self.handles = Some(handles);
    }

    // ------------------------------------------------------------------
    // transport callbacks
    // ------------------------------------------------------------------

    /// Outbound transport established: open with our handshake.
    pub fn on_connected(&mut self) {
        if self.state != HandshakeState::Connecting {
            return;
        }
        self.send_handshake();
        self.state = HandshakeState::SentHandshake;
        self.reset_idle_timer();
    }

    /// Inbound socket attached: start the receive clock.
    pub fn on_accepted(&mut self) {
        if self.state == HandshakeState::AwaitHandshake {
            self.reset_idle_timer();
        }
    }

    /// Outbound connect failed before the transport came up.
    pub fn on_connect_failed(&mut self) {
        debug!(conn = %self.id, "connect failed");
        self.drop_connection();
    }

    /// Read error, write error, or EOF on the transport.
    pub fn on_transport_error(&mut self) {
        debug!(conn = %self.id, "transport error");
        self.drop_connection();
    }

    /// Raw bytes arrived from the socket.
    pub fn on_data(&mut self, data: &[u8]) {
        if self.state == HandshakeState::Dead {
            return;
        }
        self.reset_idle_timer();
        self.framer.feed(data);
        self.drain_frames();
    }

    fn drain_frames(&mut self) {
        loop {
            // in Verifying we hold buffered bytes until the owner's verdict
            if matches!(self.state, HandshakeState::Verifying | HandshakeState::Dead) {
                return;
            }
            match self.framer.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) = self.on_frame(frame) {
                        debug!(conn = %self.id, "protocol violation: {e}");
                        self.drop_connection();
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    debug!(conn = %self.id, "framing violation: {e}");
                    self.drop_connection();
                    return;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Bytes) -> Result<(), PeerError> {
        match self.state {
            HandshakeState::SentHandshake | HandshakeState::AwaitHandshake => {
                self.on_handshake_frame(&frame)
            }
            HandshakeState::Ready => self.on_message_frame(frame),
            // Connecting cannot receive; Verifying/Dead are filtered above
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // handshake
    // ------------------------------------------------------------------

    fn on_handshake_frame(&mut self, frame: &[u8]) -> Result<(), PeerError> {
        let handshake = Handshake::decode(frame)?;
        let peer_id = PeerId::from(handshake.peer_id);
        if peer_id == self.our_id {
            return Err(PeerError::OwnConnection);
        }
        self.pending_peer_id = Some(peer_id);
        self.state = HandshakeState::Verifying;
        self.events
            .push(ConnEvent::InfoHash(InfoHash(handshake.info_hash)));
        Ok(())
    }

    /// The owner accepted the handshake's info hash. For inbound
    /// connections the torrent must have been bound first.
    pub fn accept_handshake(&mut self) {
        if self.state != HandshakeState::Verifying {
            return;
        }
        let Some(peer_id) = self.pending_peer_id.take() else {
            return;
        };
        let Some(handles) = self.handles.clone() else {
            // owner accepted without binding a torrent
            self.drop_connection();
            return;
        };

        if !self.initiated {
            self.send_handshake();
        }

        let (piece_count, have_any, local_bits) = {
            let torrent = handles.torrent.borrow();
            (
                torrent.piece_count() as usize,
                torrent.have_any_piece(),
                torrent.local_bitfield().to_bytes(),
            )
        };
        self.peer = Some(PeerData::new(peer_id, piece_count));
        if have_any {
            self.send_message(Message::Bitfield(local_bits));
        }

        self.state = HandshakeState::Ready;
        self.framer.set_rule(UnpackRule::Message);
        self.reset_keep_alive_timer();
        self.events.push(ConnEvent::HandshakeOk);
        debug!(
            conn = %self.id,
            peer = %peer_id,
            client = peer_id.client_tag().unwrap_or("unknown"),
            "handshake complete"
        );

        // bytes behind the handshake may already hold complete frames
        self.drain_frames();
    }

    /// The owner rejected the handshake's info hash.
    pub fn reject_handshake(&mut self) {
        if self.state == HandshakeState::Verifying {
            debug!(conn = %self.id, "info hash rejected");
            self.drop_connection();
        }
    }

    // ------------------------------------------------------------------
    // message dispatch
    // ------------------------------------------------------------------

    fn on_message_frame(&mut self, frame: Bytes) -> Result<(), PeerError> {
        let Some(msg) = Message::decode(frame)? else {
            // unknown id: skipped for forward compatibility
            return Ok(());
        };
        trace!(conn = %self.id, ?msg, "message");
        match msg {
            // keep-alive resets the idle clock in on_data; nothing else
            Message::KeepAlive => Ok(()),
            Message::Choke => {
                self.flags.peer_choking = true;
                self.return_all_requests();
                Ok(())
            }
            Message::Unchoke => {
                self.flags.peer_choking = false;
                self.request_more_blocks();
                Ok(())
            }
            Message::Interested => {
                self.flags.peer_interested = true;
                Ok(())
            }
            Message::NotInterested => {
                self.flags.peer_interested = false;
                Ok(())
            }
            Message::Have { piece } => {
                if let Some(peer) = self.peer.as_mut() {
                    peer.record_have(piece);
                }
                self.update_interest();
                self.request_more_blocks();
                Ok(())
            }
            Message::Bitfield(bits) => self.on_bitfield(&bits),
            Message::Request {
                index,
                begin,
                length,
            } => self.on_request(BlockRef::new(index, begin, length)),
            Message::Piece { index, begin, data } => {
                self.on_piece(index, begin, data);
                Ok(())
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                self.peer_requests
                    .remove_block(&BlockRef::new(index, begin, length));
                Ok(())
            }
        }
    }

    fn on_bitfield(&mut self, bits: &[u8]) -> Result<(), PeerError> {
        let piece_count = self
            .handles
            .as_ref()
            .map(|h| h.torrent.borrow().piece_count() as usize)
            .unwrap_or(0);
        let bitfield = Bitfield::from_wire(bits, piece_count)?;
        if let Some(peer) = self.peer.as_mut() {
            peer.set_bitfield(bitfield);
        }
        self.update_interest();
        self.request_more_blocks();
        Ok(())
    }

    fn on_request(&mut self, block: BlockRef) -> Result<(), PeerError> {
        if block.length == 0 || block.length > MAX_REQUEST_LENGTH {
            return Err(PeerError::RequestLength(block.length));
        }
        if self.flags.am_choking {
            // peers are not supposed to request while choked
            return Ok(());
        }
        let have = self
            .handles
            .as_ref()
            .map(|h| {
                h.torrent
                    .borrow()
                    .local_bitfield()
                    .has_piece(block.piece as usize)
            })
            .unwrap_or(false);
        if !have {
            debug!(conn = %self.id, piece = block.piece, "request for piece we lack");
            return Ok(());
        }
        // re-sent requests that are still queued would be served twice
        if self.peer_requests.contains_block(&block) {
            return Ok(());
        }
        self.peer_requests.push(block);
        self.serve_uploads();
        Ok(())
    }

    fn on_piece(&mut self, index: u32, begin: u32, data: Bytes) {
        if let Some((rid, _)) = self.in_flight.find_block(index, begin) {
            self.cancel_request_timer(rid);
            self.in_flight.remove(rid);
        }
        // unsolicited (late or duplicate) blocks are still written; the
        // cache deduplicates
        if let Some(handles) = self.handles.clone() {
            handles.cache.borrow_mut().write_block(index, begin, data);
        }
        self.request_more_blocks();
    }

    // ------------------------------------------------------------------
    // download scheduling
    // ------------------------------------------------------------------

    /// Fill policy: while unchoked and interested, keep the pipeline at
    /// depth by asking the dispatcher for blocks the peer has.
    fn request_more_blocks(&mut self) {
        if self.state != HandshakeState::Ready {
            return;
        }
        if self.flags.peer_choking || !self.flags.am_interested {
            return;
        }
        let want = PIPELINE_DEPTH.saturating_sub(self.in_flight.len());
        if want == 0 {
            return;
        }
        let Some(handles) = self.handles.clone() else {
            return;
        };
        let Some(peer) = self.peer.as_ref() else {
            return;
        };

        let picked = handles
            .download
            .borrow_mut()
            .request_blocks(peer.bitfield(), want);
        for block in picked {
            self.wait_queue.push(block);
        }

        for (rid, block) in self.wait_queue.splice_into(&mut self.in_flight) {
            self.send_message(Message::Request {
                index: block.piece,
                begin: block.begin,
                length: block.length,
            });
            let tid = self.timers.borrow_mut().add(
                REQUEST_TIMEOUT,
                TimerEvent {
                    conn: self.id,
                    kind: TimerKind::RequestTimeout(rid),
                },
            );
            self.timeouts.push((rid, tid));
        }
    }

    fn on_request_timeout(&mut self, rid: RequestId) {
        self.timeouts.retain(|(r, _)| *r != rid);
        let Some(block) = self.in_flight.remove(rid) else {
            return;
        };
        debug!(conn = %self.id, piece = block.piece, begin = block.begin, "request timed out");
        // no cancel message: a late reply is still accepted
        if let Some(handles) = self.handles.clone() {
            handles.download.borrow_mut().return_block(block);
        }
    }

    /// Hands every queued and in-flight request back to the dispatcher
    /// and cancels their timers. Runs on peer-choke and on drop.
    fn return_all_requests(&mut self) {
        for (_, tid) in self.timeouts.drain(..) {
            self.timers.borrow_mut().cancel(tid);
        }
        let mut give_back = self.in_flight.drain();
        give_back.extend(self.wait_queue.drain());
        if let Some(handles) = self.handles.clone() {
            let mut download = handles.download.borrow_mut();
            for (_, block) in give_back {
                download.return_block(block);
            }
        }
    }

    fn cancel_request_timer(&mut self, rid: RequestId) {
        if let Some(pos) = self.timeouts.iter().position(|(r, _)| *r == rid) {
            let (_, tid) = self.timeouts.remove(pos);
            self.timers.borrow_mut().cancel(tid);
        }
    }

    // ------------------------------------------------------------------
    // upload serving
    // ------------------------------------------------------------------

    fn serve_uploads(&mut self) {
        if self.state != HandshakeState::Ready || self.flags.am_choking || self.upload_busy {
            return;
        }
        let Some((_, block)) = self.peer_requests.pop_front() else {
            return;
        };
        let Some(handles) = self.handles.clone() else {
            return;
        };
        self.upload_busy = true;
        handles.upload.borrow_mut().push_upload_request(self.id, block);
    }

    /// Completion of a block read queued through the upload dispatcher.
    ///
    /// A failed read drops that request only; the connection survives.
    pub fn upload_block(&mut self, block: BlockRef, read_ok: bool, data: Bytes) {
        self.upload_busy = false;
        if self.state != HandshakeState::Ready {
            return;
        }
        if read_ok && !self.flags.am_choking {
            self.send_message(Message::Piece {
                index: block.piece,
                begin: block.begin,
                data,
            });
        } else if !read_ok {
            debug!(conn = %self.id, piece = block.piece, "block read failed, upload dropped");
        }
        self.serve_uploads();
    }

    // ------------------------------------------------------------------
    // choke / interest
    // ------------------------------------------------------------------

    /// Choking policy hook: the owner decides when to flip this.
    pub fn set_choke(&mut self, choke: bool) {
        if self.state != HandshakeState::Ready || self.flags.am_choking == choke {
            return;
        }
        self.flags.am_choking = choke;
        if choke {
            self.peer_requests.clear();
            self.send_message(Message::Choke);
        } else {
            self.send_message(Message::Unchoke);
            self.serve_uploads();
        }
    }

    /// Recomputes `am_interested` from the peer's bitfield against ours
    /// and announces a flip.
    fn update_interest(&mut self) {
        let Some(handles) = self.handles.clone() else {
            return;
        };
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        let wants = {
            let torrent = handles.torrent.borrow();
            peer.wants_any(torrent.local_bitfield())
        };
        if wants && !self.flags.am_interested {
            self.flags.am_interested = true;
            self.send_message(Message::Interested);
        } else if !wants && self.flags.am_interested {
            self.flags.am_interested = false;
            self.send_message(Message::NotInterested);
        }
    }

    // ------------------------------------------------------------------
    // piece progress observer
    // ------------------------------------------------------------------

    /// A piece entered downloading somewhere; nothing to do per peer.
    pub fn on_piece_started(&mut self, _piece: u32) {}

    /// A piece completed locally: announce it, stop asking for it, and
    /// re-evaluate interest. Purged requests are not returned to the
    /// dispatcher because nobody needs them anymore.
    pub fn on_piece_complete(&mut self, piece: u32) {
        if self.state != HandshakeState::Ready {
            return;
        }
        self.send_message(Message::Have { piece });
        for (rid, _) in self.in_flight.remove_piece(piece) {
            self.cancel_request_timer(rid);
        }
        self.wait_queue.remove_piece(piece);
        self.update_interest();
        self.request_more_blocks();
    }

    /// A piece failed verification: drop our pending requests for it and
    /// let the dispatcher plan it again from scratch.
    pub fn on_piece_failed(&mut self, piece: u32) {
        for (rid, _) in self.in_flight.remove_piece(piece) {
            self.cancel_request_timer(rid);
        }
        self.wait_queue.remove_piece(piece);
    }

    // ------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------

    /// A timer armed for this connection fired.
    pub fn on_timer(&mut self, kind: TimerKind) {
        if self.state == HandshakeState::Dead {
            return;
        }
        match kind {
            TimerKind::KeepAlive => {
                self.keep_alive = None;
                if self.state == HandshakeState::Ready {
                    self.send_message(Message::KeepAlive);
                } else {
                    self.reset_keep_alive_timer();
                }
            }
            TimerKind::IdleDisconnect => {
                debug!(conn = %self.id, "idle disconnect");
                self.idle = None;
                self.drop_connection();
            }
            TimerKind::RequestTimeout(rid) => self.on_request_timeout(rid),
        }
    }

    fn reset_keep_alive_timer(&mut self) {
        let mut timers = self.timers.borrow_mut();
        if let Some(id) = self.keep_alive.take() {
            timers.cancel(id);
        }
        self.keep_alive = Some(timers.add(
            KEEPALIVE_INTERVAL,
            TimerEvent {
                conn: self.id,
                kind: TimerKind::KeepAlive,
            },
        ));
    }

    fn reset_idle_timer(&mut self) {
        let mut timers = self.timers.borrow_mut();
        if let Some(id) = self.idle.take() {
            timers.cancel(id);
        }
        self.idle = Some(timers.add(
            IDLE_DISCONNECT,
            TimerEvent {
                conn: self.id,
                kind: TimerKind::IdleDisconnect,
            },
        ));
    }

    // ------------------------------------------------------------------
    // sending
    // ------------------------------------------------------------------

    fn send_handshake(&mut self) {
        let Some(handles) = self.handles.as_ref() else {
            return;
        };
        let info_hash = handles.torrent.borrow().info_hash();
        let handshake = Handshake::new(*info_hash.as_bytes(), self.our_id.bytes());
        let _ = self.outbound.send(handshake.encode());
        self.reset_keep_alive_timer();
    }

    fn send_message(&mut self, msg: Message) {
        let _ = self.outbound.send(msg.encode());
        self.reset_keep_alive_timer();
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    /// Tears the connection down: cancels every timer, returns all
    /// outstanding requests, clears the framer, and queues the drop
    /// notification. Safe to call any number of times.
    pub fn drop_connection(&mut self) {
        if self.state == HandshakeState::Dead {
            return;
        }
        self.state = HandshakeState::Dead;
        {
            let mut timers = self.timers.borrow_mut();
            if let Some(id) = self.keep_alive.take() {
                timers.cancel(id);
            }
            if let Some(id) = self.idle.take() {
                timers.cancel(id);
            }
        }
        self.return_all_requests();
        self.peer_requests.clear();
        self.framer.clear();
        self.events.push(ConnEvent::Dropped);
    }
}
