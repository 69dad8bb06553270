//! A peer session drives a single connection through the BitTorrent wire
//! protocol: handshake, piece availability exchange, the request pipeline in
//! both directions, and the extension protocol messages layered on top.
//!
//! One session is one task, owned by its torrent. The torrent talks to it
//! through a command channel (choke decisions, HAVE broadcasts, PEX ticks)
//! and the session reports back on the torrent's shared event channel.

pub(crate) mod codec;

use {
    bytes::BytesMut,
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{atomic::Ordering, Arc},
        time::{Duration, Instant},
    },
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time::{interval, timeout},
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        counter::{RttEstimator, ThruputCounters},
        download::PieceDownload,
        error::*,
        metadata,
        pex::{
            ExtendedHandshake, PexMessage, EXTENDED_HANDSHAKE_ID, UT_PEX_ID,
        },
        timeout::adaptive_timeout,
        torrent::TorrentContext,
        Bitfield, BlockInfo, PeerId, PeerSource, PieceIndex, BLOCK_LEN,
    },
    codec::*,
};

/// A peer may request a block this large when it coalesces adjacent blocks
/// into one request; anything bigger is declined.
const MAX_REQUEST_LEN: u32 = 2 * BLOCK_LEN;

/// Seconds of ticks between keep-alives. Peers commonly drop a connection
/// after two minutes of silence.
const KEEP_ALIVE_INTERVAL_SECS: u64 = 90;

/// The channel on which torrent can send a command to the peer session task.
pub(crate) type Sender = UnboundedSender<SessionCommand>;
type Receiver = UnboundedReceiver<SessionCommand>;

/// The commands a peer session can receive from its torrent.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Stop allowing the peer to download from us (a choker decision).
    Choke,
    /// Allow the peer to download from us.
    Unchoke,
    /// A piece was verified; announce it to the peer.
    Have(PieceIndex),
    /// Another session received this block first (endgame); withdraw our
    /// request for it if we have one outstanding.
    Cancel(BlockInfo),
    /// Forward a PEX delta to the peer, if it supports `ut_pex`.
    Pex(PexMessage),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// What a session reports back to its torrent.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// The wire handshake completed.
    Connected { addr: SocketAddr, peer_id: PeerId },
    /// The session ended; the connection table entry can be dropped.
    Disconnected { addr: SocketAddr },
    /// Periodic per-peer statistics for the choker.
    Stats {
        addr: SocketAddr,
        stats: SessionStats,
    },
    /// A requested block arrived; in endgame the torrent cancels the other
    /// sessions' duplicates.
    BlockReceived { addr: SocketAddr, block: BlockInfo },
    /// The peer gossiped addresses over `ut_pex`.
    PexPeers {
        addr: SocketAddr,
        peers: Vec<SocketAddr>,
    },
}

/// A per-tick snapshot of session statistics, consumed by the torrent's
/// choker.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SessionStats {
    /// Payload bytes per second we are downloading from this peer.
    pub download_rate: u64,
    /// Payload bytes per second we are uploading to this peer.
    pub upload_rate: u64,
    pub downloaded_payload: u64,
    pub uploaded_payload: u64,
    pub is_peer_interested: bool,
    pub is_peer_choked: bool,
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been connected
    /// before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is optional, it is used to verify that the bitfield exchange
    /// occurrs after the handshake and not later. It is set once the handshakes
    /// are exchanged and changed as soon as we receive the bitfield or the
    /// first message that is not a bitfield. Any subsequent bitfield messages
    /// are rejected and the connection is dropped, as per the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages, apart
    /// from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we have.
    is_peer_interested: bool,
    /// The request queue size, which is the number of block requests we keep
    /// outstanding to fully saturate the link.
    ///
    /// The value is derived from the link's bandwidth-delay product: the
    /// running average of the download rate times the smoothed request round
    /// trip time, divided by the block length, clamped into the configured
    /// bounds. It is recalculated every time we receive a block, in order to
    /// always keep the link fully saturated.
    ///
    /// Only set once we start downloading.
    best_request_queue_len: Option<usize>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            best_request_queue_len: None,
        }
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// All pieces peer has, updated when it announces to us a new piece.
    pieces: Bitfield,
}

type Sink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

pub(crate) struct PeerSession {
    /// Shared information and services of the torrent.
    ctx: Arc<TorrentContext>,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Which discovery subsystem produced the peer.
    source: PeerSource,
    /// Session related information.
    status: Status,
    /// Information about a peer that is set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// Our pending requests that we sent to peer, with the time each was
    /// sent. It represents the blocks that we are expecting; a block that is
    /// not in this map is dropped as unrequested. Emptied when we're choked,
    /// as in that case we don't expect outstanding requests to be served.
    outgoing_requests: HashMap<BlockInfo, Instant>,
    /// Block requests the peer made that we have not served yet. A CANCEL
    /// removes its entry before the block is sent.
    incoming_requests: Vec<BlockInfo>,
    /// Transfer statistics, ticked once a second.
    counters: ThruputCounters,
    /// The smoothed request round trip time estimate.
    rtt: RttEstimator,
    /// Ticks in which at least one of our requests timed out, since the last
    /// served block. Reaching the snub threshold disconnects the peer.
    snub_count: u32,
    /// The peer's extended handshake, once received (BEP 10).
    peer_extensions: Option<ExtendedHandshake>,
    /// Set once a merged (larger than block sized) request went unanswered;
    /// from then on this peer only gets block sized requests.
    peer_rejects_large_requests: bool,
    /// Ticks since the session started, for keep-alive scheduling.
    tick_count: u64,
}

impl PeerSession {
    /// Creates a new session with the peer at the given address, returning
    /// the command channel with which the torrent controls it.
    pub fn new(
        ctx: Arc<TorrentContext>,
        addr: SocketAddr,
        source: PeerSource,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                cmd_port: cmd_port.fuse(),
                addr,
                source,
                status: Status::default(),
                peer_info: None,
                outgoing_requests: HashMap::new(),
                incoming_requests: Vec::new(),
                counters: ThruputCounters::default(),
                rtt: RttEstimator::default(),
                snub_count: 0,
                peer_extensions: None,
                peer_rejects_large_requests: false,
                tick_count: 0,
            },
            cmd_chan,
        )
    }

    /// Runs an outbound session to completion: connects, handshakes, then
    /// exchanges messages until an error or shutdown. All errors are local to
    /// the session: they are logged and turn into a disconnect, never
    /// propagated to the torrent.
    pub async fn start_outbound(&mut self) {
        log::info!(
            "Starting outbound peer {} session (source: {})",
            self.addr,
            self.source
        );
        if let Err(e) = self.run_outbound().await {
            log::info!("Peer {} session ended: {}", self.addr, e);
        }
        self.cleanup().await;
    }

    /// Runs a session on an incoming connection whose handshake the engine
    /// already read (to route the stream by info hash). The bytes the peer
    /// may have sent after its handshake are in `read_buf`.
    pub async fn start_inbound(
        &mut self,
        socket: TcpStream,
        peer_handshake: Handshake,
        read_buf: BytesMut,
    ) {
        log::info!("Starting inbound peer {} session", self.addr);
        if let Err(e) =
            self.run_inbound(socket, peer_handshake, read_buf).await
        {
            log::info!("Peer {} session ended: {}", self.addr, e);
        }
        self.cleanup().await;
    }

    async fn run_outbound(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let handshake_timeout = self.handshake_timeout();
        let socket =
            timeout(handshake_timeout, TcpStream::connect(self.addr))
                .await??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        log::debug!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        // receive peer's handshake
        let peer_handshake =
            match timeout(handshake_timeout, socket.next()).await? {
                Some(peer_handshake) => peer_handshake?,
                None => {
                    return Err(Error::ProtocolViolation(
                        "connection closed during handshake",
                    ))
                }
            };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        self.check_handshake(&peer_handshake)?;
        self.into_session(socket, peer_handshake).await
    }

    async fn run_inbound(
        &mut self,
        socket: TcpStream,
        peer_handshake: Handshake,
        read_buf: BytesMut,
    ) -> Result<()> {
        self.check_handshake(&peer_handshake)?;

        // reply with our handshake, carrying over whatever the peer sent
        // after its own
        let mut parts = FramedParts::new(socket, HandshakeCodec);
        parts.read_buf = read_buf;
        let mut socket = Framed::from_parts(parts);
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        socket.send(handshake).await?;

        self.into_session(socket, peer_handshake).await
    }

    fn check_handshake(&self, peer_handshake: &Handshake) -> Result<()> {
        // codec should only return a handshake if the protocol string in it
        // is valid
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.ctx.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }
        // a connection to ourselves is useless
        if peer_handshake.peer_id == self.ctx.client_id {
            return Err(Error::ProtocolViolation("connected to ourselves"));
        }
        Ok(())
    }

    /// Transitions from the handshake exchange into the peer message
    /// protocol: switches codecs, sends the extended handshake and our
    /// bitfield, then runs the message loop.
    async fn into_session(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
    ) -> Result<()> {
        let peer_supports_extensions = peer_handshake.supports_extensions();
        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            pieces: empty_bitfield(self.ctx.storage.piece_count),
        });
        self.ctx.event_chan.send(PeerEvent::Connected {
            addr: self.addr,
            peer_id: peer_handshake.peer_id,
        })?;

        // now that we have the handshake, we need to switch to the peer
        // message codec and save the socket in self (note that we need to
        // keep the buffer from the original codec as it may contain bytes
        // of any potential message the peer may have sent after the
        // handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // BEP 10: the extended handshake is sent right after the standard one
        if peer_supports_extensions {
            let ours = ExtendedHandshake::ours(self.ctx.listen_port, None);
            sink.send(Message::Extended {
                id: EXTENDED_HANDSHAKE_ID,
                payload: ours.encode()?,
            })
            .await?;
        }

        // announce the pieces we already have, if any
        let own_pieces = {
            let picker = self.ctx.piece_picker.read().await;
            picker.own_pieces().clone()
        };
        if own_pieces.count_ones() > 0 {
            log::debug!("Sending bitfield to peer {}", self.addr);
            sink.send(Message::Bitfield(own_pieces)).await?;
        }

        // enter the piece availability exchange state until peer sends a
        // bitfield or any first message in its place
        self.status.state = State::AvailabilityExchange;
        log::debug!(
            "Peer {} session state: {:?}",
            self.addr,
            self.status.state
        );

        self.run(&mut sink, &mut stream).await
    }

    /// The main session loop: exchange of messages, commands from the
    /// torrent, and the once-a-second tick driving statistics, timeouts, and
    /// keep-alives.
    async fn run(
        &mut self,
        sink: &mut Sink,
        stream: &mut Fuse<
            futures::stream::SplitStream<Framed<TcpStream, PeerCodec>>,
        >,
    ) -> Result<()> {
        let mut tick = interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => {
                            log::info!("Peer {} closed connection", self.addr);
                            return Ok(());
                        }
                    };
                    log::trace!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );

                    // handle bitfield message separately as it may only be
                    // received directly after the handshake (though the
                    // extended handshake and keep-alives may precede it)
                    if self.status.state == State::AvailabilityExchange {
                        match msg {
                            Message::Bitfield(bitfield) => {
                                self.handle_bitfield_msg(sink, bitfield)
                                    .await?;
                                self.status.state = State::Connected;
                            }
                            Message::Extended { id, payload } => {
                                self.handle_extended_msg(sink, id, payload)
                                    .await?;
                            }
                            Message::KeepAlive => {}
                            msg => {
                                // the bitfield is optional: a peer with no
                                // pieces may skip it, in which case its
                                // first real message ends the exchange
                                self.status.state = State::Connected;
                                self.handle_msg(sink, msg).await?;
                            }
                        }
                        if self.status.state == State::Connected {
                            log::debug!(
                                "Peer {} session state: {:?}",
                                self.addr,
                                self.status.state
                            );
                        }
                    } else {
                        self.handle_msg(sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_cmd(sink, cmd).await? {
                        log::info!("Shutting down peer {} session", self.addr);
                        return Ok(());
                    }
                }
                _ = tick.select_next_some() => {
                    self.tick(sink).await?;
                }
            }
        }
    }

    /// Handles the bitfield message expected in the `AvailabilityExchange`
    /// state.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut Sink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::debug!("Handling peer {} Bitfield message", self.addr);

        // The bitfield raw data that is sent over the wire may be longer than
        // the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. Anything other than that exact
        // byte length is a protocol violation.
        let expected_bits = (self.ctx.storage.piece_count + 7) / 8 * 8;
        if bitfield.len() != expected_bits {
            return Err(Error::ProtocolViolation("bitfield of wrong size"));
        }
        bitfield.resize(self.ctx.storage.piece_count, false);

        // register peer's pieces with piece picker
        let is_interested = {
            let mut piece_picker = self.ctx.piece_picker.write().await;
            piece_picker.register_availability(&bitfield)?
        };
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = bitfield;
        }

        if is_interested {
            log::debug!("Interested in peer {}", self.addr);
            self.status.is_interested = true;
            sink.send(Message::Interested).await?;
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut Sink,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(Error::ProtocolViolation(
                    "bitfield not after handshake",
                ));
            }
            Message::KeepAlive => {
                log::trace!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // since we're choked we don't expect to receive blocks
                    // for our pending requests
                    self.free_outgoing_requests().await;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, start the
                    // download pipeline if we're interested
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(sink, piece_index).await?;
            }
            Message::Request(block) => {
                self.handle_request_msg(sink, block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;

                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests(sink).await?;
            }
            Message::Cancel(block) => {
                log::trace!("Peer {} cancelled request {}", self.addr, block);
                self.incoming_requests.retain(|b| *b != block);
            }
            Message::Extended { id, payload } => {
                self.handle_extended_msg(sink, id, payload).await?;
            }
        }

        Ok(())
    }

    /// Registers a HAVE announcement and becomes interested if the piece is
    /// one we want.
    async fn handle_have_msg(
        &mut self,
        sink: &mut Sink,
        piece_index: PieceIndex,
    ) -> Result<()> {
        if piece_index >= self.ctx.storage.piece_count {
            return Err(Error::ProtocolViolation(
                "have with invalid piece index",
            ));
        }
        let newly_interesting = {
            let mut piece_picker = self.ctx.piece_picker.write().await;
            piece_picker.register_have(piece_index)?
        };
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces.set(piece_index, true);
        }
        if newly_interesting && !self.status.is_interested {
            log::debug!("Interested in peer {}", self.addr);
            self.status.is_interested = true;
            sink.send(Message::Interested).await?;
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    /// Serves a block the peer requested, if it is allowed to download and
    /// the block is valid and readable.
    async fn handle_request_msg(
        &mut self,
        sink: &mut Sink,
        block: BlockInfo,
    ) -> Result<()> {
        log::trace!("Peer {} requested {}", self.addr, block);

        if self.status.is_peer_choked {
            // a request from a choked peer is commonly a race with our choke
            // message, not an attack; quietly drop it
            log::debug!("Choked peer {} requested a block", self.addr);
            return Ok(());
        }
        if block.len == 0 || block.len > MAX_REQUEST_LEN {
            return Err(Error::ProtocolViolation("invalid request length"));
        }
        let piece_len = match self.ctx.storage.piece_len(block.piece_index) {
            Ok(len) => len,
            Err(_) => {
                return Err(Error::ProtocolViolation(
                    "request with invalid piece index",
                ))
            }
        };
        if block.offset.checked_add(block.len).map(|end| end > piece_len)
            != Some(false)
        {
            return Err(Error::ProtocolViolation(
                "request outside piece bounds",
            ));
        }

        // only verified pieces are served
        {
            let piece_picker = self.ctx.piece_picker.read().await;
            if !piece_picker.own_pieces()[block.piece_index] {
                log::debug!(
                    "Peer {} requested piece {} we don't have",
                    self.addr,
                    block.piece_index
                );
                return Ok(());
            }
        }

        self.incoming_requests.push(block);
        let data = self.ctx.disk.read_block(self.ctx.id, block).await?;

        // the peer may have cancelled the request while the disk read was in
        // flight
        let still_wanted = {
            let pos = self.incoming_requests.iter().position(|b| *b == block);
            match pos {
                Some(pos) => {
                    self.incoming_requests.remove(pos);
                    true
                }
                None => false,
            }
        };

        match data {
            Some(data) if still_wanted => {
                self.counters.up.add(data.len() as u64);
                sink.send(Message::Block {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                })
                .await?;
            }
            Some(_) => {
                log::trace!("Request {} cancelled before serve", block);
            }
            None => {
                log::warn!(
                    "Declining to serve block {}: file data unavailable",
                    block
                );
            }
        }
        Ok(())
    }

    /// Verifies block validity, registers the download (and hands the piece
    /// to the disk task if this was its last missing block) and updates
    /// statistics about the download.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Received block {} from peer {}", block_info, self.addr);

        let requested_at = match take_matching_request(
            &mut self.outgoing_requests,
            &block_info,
        ) {
            Some(requested_at) => requested_at,
            None => {
                // silently ignore blocks we didn't ask for; repeated
                // unrequested blocks only cost the waste counter
                log::debug!(
                    "Peer {} sent not requested block {}",
                    self.addr,
                    block_info,
                );
                self.counters.waste.add(data.len() as u64);
                return Ok(());
            }
        };
        self.rtt.update(requested_at.elapsed());
        self.snub_count = 0;

        // a merged request may be answered by one larger block; the shared
        // downloads and the disk task keep working at block granularity
        let sub_blocks = split_for_wire(vec![block_info]);
        let mut new_blocks = Vec::with_capacity(sub_blocks.len());
        {
            let mut downloads = self.ctx.downloads.write().await;
            for sub in &sub_blocks {
                let is_new = match downloads.get_mut(&sub.piece_index) {
                    Some(download) => {
                        let is_new = download.received_block(sub);
                        if is_new && download.count_missing_blocks() == 0 {
                            // the piece has all its blocks; its fate is
                            // decided by the disk task's hash check
                            downloads.remove(&sub.piece_index);
                        }
                        is_new
                    }
                    // the piece completed via another peer while this
                    // duplicate was in flight
                    None => false,
                };
                if is_new {
                    new_blocks.push(*sub);
                }
            }
        }

        if new_blocks.is_empty() {
            self.counters.waste.add(data.len() as u64);
            return Ok(());
        }

        // validate and save the blocks to disk by sending write commands to
        // the disk task
        for sub in &new_blocks {
            let start = (sub.offset - block_info.offset) as usize;
            let chunk = data[start..start + sub.len as usize].to_vec();
            self.counters.down.add(sub.len as u64);
            self.ctx.disk.write_block(self.ctx.id, *sub, chunk)?;
            self.ctx.event_chan.send(PeerEvent::BlockReceived {
                addr: self.addr,
                block: *sub,
            })?;
        }

        // adjust the request pipeline to the link's current
        // bandwidth-delay product
        self.update_target_request_queue_len();

        Ok(())
    }

    /// Handles extension protocol messages: the extended handshake, `ut_pex`
    /// gossip, and metadata requests (which we reject). Unknown extensions
    /// are tolerated and ignored.
    async fn handle_extended_msg(
        &mut self,
        sink: &mut Sink,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        match id {
            EXTENDED_HANDSHAKE_ID => {
                let theirs = ExtendedHandshake::decode(&payload)?;
                log::debug!(
                    "Peer {} extended handshake: {:?}",
                    self.addr,
                    theirs
                );
                self.peer_extensions = Some(theirs);
            }
            UT_PEX_ID => {
                if self.ctx.is_private || !self.ctx.conf.enable_pex {
                    log::debug!(
                        "Ignoring PEX message from peer {}",
                        self.addr
                    );
                    return Ok(());
                }
                let pex = PexMessage::decode(&payload)?;
                let peers = pex.added_peers();
                if !peers.is_empty() {
                    self.ctx.event_chan.send(PeerEvent::PexPeers {
                        addr: self.addr,
                        peers,
                    })?;
                }
            }
            crate::pex::UT_METADATA_ID => {
                // we advertise ut_metadata so magnet peers can talk to us,
                // but serving the info dict is the metadata fetcher's
                // business; a session only rejects requests
                if let Some(reject) = metadata::reject_for_request(&payload) {
                    sink.send(Message::Extended {
                        id: crate::pex::UT_METADATA_ID,
                        payload: reject,
                    })
                    .await?;
                }
            }
            other => {
                log::debug!(
                    "Peer {} sent unsupported extended message {}",
                    self.addr,
                    other
                );
            }
        }
        Ok(())
    }

    /// Handles a command from the torrent. Returns false when the session
    /// should shut down.
    async fn handle_cmd(
        &mut self,
        sink: &mut Sink,
        cmd: SessionCommand,
    ) -> Result<bool> {
        match cmd {
            SessionCommand::Choke => {
                if !self.status.is_peer_choked {
                    // update state before the wire message so a racing
                    // request is judged against the new state
                    self.status.is_peer_choked = true;
                    sink.send(Message::Choke).await?;
                }
            }
            SessionCommand::Unchoke => {
                if self.status.is_peer_choked {
                    self.status.is_peer_choked = false;
                    sink.send(Message::Unchoke).await?;
                }
            }
            SessionCommand::Have(piece_index) => {
                sink.send(Message::Have { piece_index }).await?;
                // having a new piece may end our interest in this peer
                if self.status.is_interested {
                    let still_interested = {
                        let piece_picker =
                            self.ctx.piece_picker.read().await;
                        self.peer_info
                            .as_ref()
                            .map(|info| {
                                piece_picker.is_interested_in(&info.pieces)
                            })
                            .unwrap_or(false)
                    };
                    if !still_interested {
                        self.status.is_interested = false;
                        sink.send(Message::NotInterested).await?;
                    }
                }
            }
            SessionCommand::Cancel(block) => {
                if self.outgoing_requests.remove(&block).is_some() {
                    sink.send(Message::Cancel(block)).await?;
                }
            }
            SessionCommand::Pex(msg) => {
                if let Some(pex_id) = self
                    .peer_extensions
                    .as_ref()
                    .and_then(|exts| exts.ut_pex_id())
                {
                    sink.send(Message::Extended {
                        id: pex_id,
                        payload: msg.encode()?,
                    })
                    .await?;
                }
            }
            SessionCommand::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// The once-a-second housekeeping: statistics, request timeouts,
    /// keep-alives, and pipeline refills.
    async fn tick(&mut self, sink: &mut Sink) -> Result<()> {
        self.tick_count += 1;
        self.counters.tick();

        self.ctx.event_chan.send(PeerEvent::Stats {
            addr: self.addr,
            stats: SessionStats {
                download_rate: self.counters.down.rate(),
                upload_rate: self.counters.up.rate(),
                downloaded_payload: self.counters.down.total(),
                uploaded_payload: self.counters.up.total(),
                is_peer_interested: self.status.is_peer_interested,
                is_peer_choked: self.status.is_peer_choked,
            },
        })?;

        // cancel requests that have outlived the (possibly stretched)
        // request timeout and requeue their blocks with the piece manager
        let request_timeout = adaptive_timeout(
            self.ctx.conf.request_timeout,
            self.ctx.active_peer_count.load(Ordering::Relaxed),
        );
        let now = Instant::now();
        let timed_out: Vec<BlockInfo> = self
            .outgoing_requests
            .iter()
            .filter(|(_, requested_at)| {
                now.duration_since(**requested_at) >= request_timeout
            })
            .map(|(block, _)| *block)
            .collect();
        if !timed_out.is_empty() {
            log::info!(
                "{} request(s) to peer {} timed out",
                timed_out.len(),
                self.addr
            );
            {
                let mut downloads = self.ctx.downloads.write().await;
                for block in &timed_out {
                    self.outgoing_requests.remove(block);
                    if block.len > BLOCK_LEN
                        && !self.peer_rejects_large_requests
                    {
                        // the peer never answered a merged request; stick
                        // to block sized requests from now on
                        log::debug!(
                            "Peer {} ignores merged requests",
                            self.addr
                        );
                        self.peer_rejects_large_requests = true;
                    }
                    for part in split_for_wire(vec![*block]) {
                        if let Some(download) =
                            downloads.get_mut(&part.piece_index)
                        {
                            download.cancel_request(&part);
                        }
                    }
                }
            }
            for block in &timed_out {
                sink.send(Message::Cancel(*block)).await?;
            }
            self.snub_count += 1;
            if self.snub_count >= self.ctx.conf.snub_threshold {
                log::info!("Peer {} is snubbing us", self.addr);
                return Err(Error::Timeout);
            }
        }

        if self.tick_count % KEEP_ALIVE_INTERVAL_SECS == 0 {
            sink.send(Message::KeepAlive).await?;
        }

        // the pipeline may have room again (timeouts above, or blocks other
        // sessions freed)
        self.make_requests(sink).await?;

        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests.
    async fn make_requests(&mut self, sink: &mut Sink) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }
        let peer_pieces = match &self.peer_info {
            Some(info) => info.pieces.clone(),
            None => return Ok(()),
        };

        let target = self
            .status
            .best_request_queue_len
            .unwrap_or(self.initial_request_queue_len());
        if self.outgoing_requests.len() >= target {
            return Ok(());
        }
        let to_request = target - self.outgoing_requests.len();

        let mut blocks = Vec::with_capacity(to_request);
        {
            let mut downloads = self.ctx.downloads.write().await;

            // If there are active downloads the peer can contribute to,
            // prefer to continue those. This results in fewer in-progress
            // pieces.
            for (piece_index, download) in downloads.iter_mut() {
                if blocks.len() >= to_request {
                    break;
                }
                if peer_pieces[*piece_index] {
                    download
                        .pick_blocks(to_request - blocks.len(), &mut blocks);
                }
            }

            // while we can make more requests we start new download(s)
            let mut piece_picker = self.ctx.piece_picker.write().await;
            while blocks.len() < to_request {
                match piece_picker.pick_piece(&peer_pieces) {
                    Some(index) => {
                        log::debug!(
                            "Session {} started piece {} download",
                            self.addr,
                            index
                        );
                        let mut download = PieceDownload::new(
                            index,
                            self.ctx.storage.piece_len(index)?,
                        );
                        download.pick_blocks(
                            to_request - blocks.len(),
                            &mut blocks,
                        );
                        downloads.insert(index, download);
                    }
                    None => break,
                }
            }

            // in endgame, request every remaining block from this peer too,
            // so the download doesn't stall on the slowest peer
            if blocks.len() < to_request && piece_picker.is_endgame() {
                let outgoing: Vec<BlockInfo> =
                    self.outgoing_requests.keys().copied().collect();
                for index in
                    piece_picker.downloading_pieces_of(&peer_pieces)
                {
                    if blocks.len() >= to_request {
                        break;
                    }
                    if let Some(download) = downloads.get_mut(&index) {
                        download.pick_blocks_endgame(
                            to_request - blocks.len(),
                            &mut blocks,
                            &outgoing,
                        );
                    }
                }
            }
        }

        if blocks.is_empty() {
            return Ok(());
        }

        // Adjacent blocks are merged into larger requests when the peer can
        // be expected to honor them; the piece manager keeps seeing block
        // sized state either way. A peer that lets a merged request time
        // out falls back to block sized requests for good.
        let requests = if self.can_coalesce() {
            coalesce_requests(blocks)
        } else {
            blocks.sort();
            blocks
        };
        let now = Instant::now();
        for block in &requests {
            self.outgoing_requests.insert(*block, now);
        }
        for block in requests {
            log::trace!("Requesting {} from peer {}", block, self.addr);
            sink.send(Message::Request(block)).await?;
        }

        Ok(())
    }

    /// The pipeline depth used before any block has arrived.
    fn initial_request_queue_len(&self) -> usize {
        if self.ctx.conf.adaptive_pipeline {
            // start optimistically at 4 until we have rate and RTT samples
            4usize
                .max(self.ctx.conf.pipeline_min_depth)
                .min(self.ctx.conf.pipeline_max_depth)
        } else {
            self.ctx.conf.pipeline_depth
        }
    }

    /// Recomputes the best request queue length from the link's
    /// bandwidth-delay product.
    fn update_target_request_queue_len(&mut self) {
        if !self.ctx.conf.adaptive_pipeline {
            self.status.best_request_queue_len =
                Some(self.ctx.conf.pipeline_depth);
            return;
        }
        let rtt = match self.rtt.get() {
            Some(rtt) => rtt,
            None => return,
        };
        let rate = self.counters.down.rate();
        let bdp = rate as f64 * rtt.as_secs_f64();
        let depth = (bdp / BLOCK_LEN as f64).round() as usize;
        self.status.best_request_queue_len = Some(
            depth
                .max(self.ctx.conf.pipeline_min_depth)
                .min(self.ctx.conf.pipeline_max_depth),
        );
    }

    /// Whether requests to this peer may be merged into larger ones: the
    /// peer speaks the extension protocol (a reasonable modernity signal)
    /// and has not ignored a merged request yet.
    fn can_coalesce(&self) -> bool {
        self.peer_extensions.is_some() && !self.peer_rejects_large_requests
    }

    /// Returns our outstanding requests to the shared piece downloads so
    /// other sessions can pick them up.
    async fn free_outgoing_requests(&mut self) {
        if self.outgoing_requests.is_empty() {
            return;
        }
        let mut downloads = self.ctx.downloads.write().await;
        for block in self.outgoing_requests.keys() {
            for part in split_for_wire(vec![*block]) {
                if let Some(download) =
                    downloads.get_mut(&part.piece_index)
                {
                    download.cancel_request(&part);
                }
            }
        }
        self.outgoing_requests.clear();
    }

    fn handshake_timeout(&self) -> Duration {
        adaptive_timeout(
            self.ctx.conf.handshake_timeout,
            self.ctx.active_peer_count.load(Ordering::Relaxed),
        )
    }

    /// Releases everything the session holds in the torrent's shared state:
    /// outstanding requests, downloads nobody else is working on, and the
    /// peer's contribution to the availability counters.
    async fn cleanup(&mut self) {
        self.status.state = State::Disconnected;

        // requeue our outstanding requests and drop downloads that have no
        // other contributor
        {
            let mut downloads = self.ctx.downloads.write().await;
            let mut piece_picker = self.ctx.piece_picker.write().await;
            for block in self.outgoing_requests.keys() {
                for part in split_for_wire(vec![*block]) {
                    if let Some(download) =
                        downloads.get_mut(&part.piece_index)
                    {
                        download.cancel_request(&part);
                    }
                }
            }
            self.outgoing_requests.clear();
            let abandoned: Vec<PieceIndex> = downloads
                .iter()
                .filter(|(_, download)| download.all_free())
                .map(|(index, _)| *index)
                .collect();
            for index in abandoned {
                downloads.remove(&index);
                if let Err(e) = piece_picker.abandon_piece(index) {
                    log::warn!("Failed to abandon piece {}: {}", index, e);
                }
            }

            // remove the peer's pieces from the availability counters
            if let Some(peer_info) = &self.peer_info {
                if let Err(e) =
                    piece_picker.unregister_availability(&peer_info.pieces)
                {
                    log::warn!(
                        "Failed to unregister peer {} availability: {}",
                        self.addr,
                        e
                    );
                }
            }
        }

        // the torrent may be gone during engine shutdown
        let _ = self.ctx.event_chan.send(PeerEvent::Disconnected {
            addr: self.addr,
        });
    }
}

fn empty_bitfield(piece_count: usize) -> Bitfield {
    let mut bitfield = Bitfield::new();
    bitfield.resize(piece_count, false);
    bitfield
}

/// Merges adjacent block requests of the same piece into larger requests,
/// up to [`MAX_REQUEST_LEN`], which are sent on the wire as is. The shared
/// piece downloads still track block sized state; [`split_for_wire`] maps a
/// merged request back to its block sized parts.
fn coalesce_requests(mut blocks: Vec<BlockInfo>) -> Vec<BlockInfo> {
    blocks.sort();
    let mut coalesced: Vec<BlockInfo> = Vec::with_capacity(blocks.len());
    for block in blocks {
        match coalesced.last_mut() {
            Some(prev)
                if prev.piece_index == block.piece_index
                    && prev.offset + prev.len == block.offset
                    && prev.len + block.len <= MAX_REQUEST_LEN =>
            {
                prev.len += block.len;
            }
            _ => coalesced.push(block),
        }
    }
    coalesced
}

/// Expands requests into their block sized parts: the granularity at which
/// the piece downloads, the disk task, and HAVE accounting operate. Block
/// sized input passes through unchanged.
fn split_for_wire(blocks: Vec<BlockInfo>) -> Vec<BlockInfo> {
    let mut wire = Vec::with_capacity(blocks.len());
    for block in blocks {
        let mut offset = block.offset;
        let mut remaining = block.len;
        while remaining > 0 {
            let len = remaining.min(BLOCK_LEN);
            wire.push(BlockInfo {
                piece_index: block.piece_index,
                offset,
                len,
            });
            offset += len;
            remaining -= len;
        }
    }
    wire
}

/// Removes the outstanding request that a received block answers: an exact
/// match, or a block sized part of a merged request. In the latter case the
/// remaining parts stay outstanding under the original timestamp, since
/// peers are free to answer a merged request in block sized pieces.
fn take_matching_request(
    requests: &mut HashMap<BlockInfo, Instant>,
    block: &BlockInfo,
) -> Option<Instant> {
    if let Some(requested_at) = requests.remove(block) {
        return Some(requested_at);
    }
    let covering = requests
        .keys()
        .copied()
        .find(|r| r.len > block.len && split_for_wire(vec![*r]).contains(block))?;
    let requested_at = requests.remove(&covering)?;
    for part in split_for_wire(vec![covering]) {
        if part != *block {
            requests.insert(part, requested_at);
        }
    }
    Some(requested_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(piece_index: PieceIndex, offset: u32, len: u32) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset,
            len,
        }
    }

    #[test]
    fn test_coalesce_adjacent_blocks() {
        let blocks = vec![
            block(0, BLOCK_LEN, BLOCK_LEN),
            block(0, 0, BLOCK_LEN),
            block(1, 0, BLOCK_LEN),
        ];
        let coalesced = coalesce_requests(blocks);
        assert_eq!(
            coalesced,
            vec![block(0, 0, 2 * BLOCK_LEN), block(1, 0, BLOCK_LEN)]
        );
    }

    #[test]
    fn test_coalesce_respects_max_request_len() {
        let blocks = vec![
            block(0, 0, BLOCK_LEN),
            block(0, BLOCK_LEN, BLOCK_LEN),
            block(0, 2 * BLOCK_LEN, BLOCK_LEN),
        ];
        let coalesced = coalesce_requests(blocks);
        assert_eq!(
            coalesced,
            vec![block(0, 0, 2 * BLOCK_LEN), block(0, 2 * BLOCK_LEN, BLOCK_LEN)]
        );
    }

    #[test]
    fn test_noncontiguous_blocks_not_coalesced() {
        let blocks = vec![
            block(0, 0, BLOCK_LEN),
            block(0, 2 * BLOCK_LEN, BLOCK_LEN),
        ];
        let coalesced = coalesce_requests(blocks.clone());
        assert_eq!(coalesced, blocks);
    }

    #[test]
    fn test_split_restores_block_granularity() {
        // a merged request covering a whole block and a short tail
        let split = split_for_wire(vec![block(3, 0, BLOCK_LEN + 100)]);
        assert_eq!(
            split,
            vec![block(3, 0, BLOCK_LEN), block(3, BLOCK_LEN, 100)]
        );
        // block sized requests pass through unchanged
        assert_eq!(
            split_for_wire(vec![block(3, 0, BLOCK_LEN)]),
            vec![block(3, 0, BLOCK_LEN)]
        );
    }

    #[test]
    fn test_take_matching_request_exact() {
        let mut requests = HashMap::new();
        let at = Instant::now();
        requests.insert(block(0, 0, BLOCK_LEN), at);
        assert_eq!(
            take_matching_request(&mut requests, &block(0, 0, BLOCK_LEN)),
            Some(at)
        );
        assert!(requests.is_empty());
    }

    #[test]
    fn test_take_matching_request_carves_merged() {
        let mut requests = HashMap::new();
        let at = Instant::now();
        requests.insert(block(0, 0, 2 * BLOCK_LEN), at);

        // the peer answered the first half of a merged request; the second
        // half stays outstanding under the original timestamp
        assert_eq!(
            take_matching_request(&mut requests, &block(0, 0, BLOCK_LEN)),
            Some(at)
        );
        assert_eq!(
            requests.get(&block(0, BLOCK_LEN, BLOCK_LEN)),
            Some(&at)
        );

        assert_eq!(
            take_matching_request(
                &mut requests,
                &block(0, BLOCK_LEN, BLOCK_LEN)
            ),
            Some(at)
        );
        assert!(requests.is_empty());
    }

    #[test]
    fn test_take_matching_request_rejects_unrelated() {
        let mut requests = HashMap::new();
        requests.insert(block(0, 0, 2 * BLOCK_LEN), Instant::now());
        // a different piece, and an offset that is no block sized part of
        // the merged request
        assert!(take_matching_request(
            &mut requests,
            &block(1, 0, BLOCK_LEN)
        )
        .is_none());
        assert!(take_matching_request(&mut requests, &block(0, 100, 50))
            .is_none());
        assert_eq!(requests.len(), 1);
    }
}
