//! A torrent: the per-info-hash session that owns the piece picker, the
//! connection table of peer sessions, the choker, the announce schedule, and
//! the checkpoint loop.
//!
//! The torrent runs as one task and communicates exclusively over channels:
//! commands come from the engine, events from its peer sessions, and alerts
//! from the disk task. Peer sessions do the wire IO in their own tasks; the
//! torrent makes the swarm level decisions.

use {
    bytes::BytesMut,
    futures::{select, stream::Fuse, StreamExt},
    rand::Rng,
    std::{
        collections::{HashMap, HashSet},
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            oneshot, RwLock,
        },
        time::{interval, timeout},
    },
};

use {
    crate::{
        checkpoint::{self, Checkpoint, CheckpointSource, CheckpointStore},
        conf::{RateLimits, TorrentConf, TorrentOptions},
        disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
        download::PieceDownload,
        error::*,
        metainfo::Metainfo,
        peer::{
            self, codec::Handshake, PeerEvent, PeerSession, SessionCommand,
            SessionStats,
        },
        pex::PexState,
        piece_picker::{PiecePicker, PieceState},
        security::IpFilter,
        storage_info::StorageInfo,
        tracker::{
            AnnounceParams, Event, ScrapeStats, TrackerClient, TrackerList,
        },
        Bitfield, CandidatePeer, FileIndex, PeerId, PeerSource, PieceIndex,
        Sha1Hash, TorrentId,
    },
    crate::dht::DhtHandle,
};

/// How long a tracker announce may take before the attempt is abandoned.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the DHT is asked for fresh peers (and our announce refreshed).
const DHT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A peer that failed this many times within the breaker window is not
/// reconnected until the window passes.
const BREAKER_FAILURE_LIMIT: u32 = 3;
const BREAKER_WINDOW: Duration = Duration::from_secs(60);

/// After this many hash failures of one piece its contributing peers are
/// disconnected and banned for the breaker window.
const PIECE_FAILURE_LIMIT: u8 = 3;

/// The lifecycle state of a torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentState {
    /// The torrent is allocating storage and validating resume data.
    Starting,
    /// The torrent is incomplete and downloading.
    Downloading,
    /// Every wanted piece is verified; the torrent only serves uploads.
    Seeding,
    /// The torrent is paused: no task is running, a checkpoint exists.
    Paused,
    /// The torrent is stopped and will only come back through its
    /// checkpoint.
    Stopped,
    /// The torrent failed to start.
    Error,
}

/// A point-in-time status snapshot of a torrent, as reported to the API.
#[derive(Clone, Debug)]
pub struct TorrentStatus {
    pub info_hash: Sha1Hash,
    pub name: String,
    pub state: TorrentState,
    pub piece_count: usize,
    pub verified_piece_count: usize,
    pub total_len: u64,
    pub downloaded_payload: u64,
    pub uploaded_payload: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peer_count: usize,
    pub is_complete: bool,
    pub rate_limits: RateLimits,
}

/// Everything peer sessions share with (and through) their torrent.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    /// The engine's TCP listen port, advertised in extended handshakes.
    pub listen_port: u16,
    pub is_private: bool,
    /// The torrent's effective configuration (global defaults with the
    /// per-torrent overrides applied at creation).
    pub conf: TorrentConf,
    pub storage: StorageInfo,
    pub piece_picker: RwLock<PiecePicker>,
    /// The in-progress piece downloads, shared by all sessions so blocks
    /// can be re-dispatched across peers and duplicated in endgame.
    pub downloads: RwLock<HashMap<PieceIndex, PieceDownload>>,
    pub disk: DiskHandle,
    /// The channel peer sessions report their events on.
    pub event_chan: UnboundedSender<PeerEvent>,
    /// The number of connected (handshaken) peers, feeding the adaptive
    /// timeouts.
    pub active_peer_count: AtomicUsize,
}

/// What to do with the torrent's persistent state when its task stops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// Checkpoint and keep the entry; the torrent can be resumed in this
    /// process.
    Pause,
    /// Checkpoint; the torrent only comes back through its checkpoint.
    Stop,
    /// Delete the checkpoint and the disk task entry.
    Remove,
}

/// The commands the engine can send a running torrent.
pub(crate) enum TorrentCommand {
    /// Candidate peers from any discovery source.
    AddPeers { peers: Vec<CandidatePeer> },
    /// An accepted connection whose handshake matched our info hash. The
    /// command channel doubles as the buffer for connections that arrive
    /// while the torrent is still starting.
    IncomingPeer {
        socket: TcpStream,
        handshake: Handshake,
        read_buf: BytesMut,
    },
    /// Announce to the trackers now, outside the regular schedule.
    ForceAnnounce,
    /// Scrape the trackers and report the swarm statistics.
    ForceScrape {
        resp: oneshot::Sender<Result<ScrapeStats>>,
    },
    /// Re-hash every piece from disk, promoting valid data and demoting
    /// mismatches. Responds with the verified piece count.
    Rehash { resp: oneshot::Sender<Result<usize>> },
    /// Change which files of the torrent are downloaded.
    SetFileSelection {
        file_indices: Vec<FileIndex>,
        wanted: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    /// Update the stored (not enforced) rate limits.
    SetRateLimits { limits: RateLimits },
    /// Move the streaming strategy's window.
    SetPlaybackHint { piece_index: PieceIndex },
    /// Report a status snapshot.
    Status {
        resp: oneshot::Sender<TorrentStatus>,
    },
    /// Stop the torrent task.
    Shutdown {
        mode: StopMode,
        resp: oneshot::Sender<()>,
    },
}

/// The constructor arguments of a torrent; the engine assembles this from
/// its singletons.
pub(crate) struct TorrentParams {
    pub id: TorrentId,
    pub metainfo: Metainfo,
    pub conf: TorrentConf,
    pub client_id: PeerId,
    pub listen_port: u16,
    pub disk: DiskHandle,
    pub tracker_client: TrackerClient,
    pub dht: Option<DhtHandle>,
    pub checkpoint_store: CheckpointStore,
    pub source: CheckpointSource,
    pub options: TorrentOptions,
    pub rate_limits: RateLimits,
    pub ip_filter: Arc<IpFilter>,
    /// A checkpoint already validated by the engine, when resuming.
    pub resume: Option<Checkpoint>,
    pub global_peer_count: Arc<AtomicUsize>,
    pub max_global_peers: usize,
}

/// Per connection bookkeeping in the torrent's connection table. The table
/// is the single owner of a connection's identity; sessions themselves live
/// in their own tasks.
struct PeerHandle {
    cmd_chan: peer::Sender,
    source: PeerSource,
    peer_id: Option<PeerId>,
    /// Set once the wire handshake completes.
    connected: bool,
    stats: SessionStats,
    /// Whether our choker currently chokes this peer.
    am_choking: bool,
    /// Per peer PEX delta state.
    pex: PexState,
}

/// What woke the torrent's main loop up.
enum Wake {
    Cmd(TorrentCommand),
    Event(PeerEvent),
    Alert(TorrentAlert),
    Tick,
}

/// Reconnect damping for addresses that keep failing.
#[derive(Default)]
struct BreakerEntry {
    failures: u32,
    window_start: Option<Instant>,
}

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    metainfo: Metainfo,
    state: TorrentState,
    peers: HashMap<SocketAddr, PeerHandle>,
    cmd_port: Fuse<UnboundedReceiver<TorrentCommand>>,
    /// A clone of our own command sender, handed to spawned discovery tasks
    /// so their results come back through the normal command path.
    cmd_chan: UnboundedSender<TorrentCommand>,
    event_port: Fuse<UnboundedReceiver<PeerEvent>>,
    disk_alert_port: Option<Fuse<TorrentAlertReceiver>>,
    trackers: TrackerList,
    tracker_client: TrackerClient,
    dht: Option<DhtHandle>,
    checkpoint_store: CheckpointStore,
    source: CheckpointSource,
    options: TorrentOptions,
    rate_limits: RateLimits,
    ip_filter: Arc<IpFilter>,
    global_peer_count: Arc<AtomicUsize>,
    max_global_peers: usize,
    /// Which files the user wants; drives the picker's wanted-piece mask.
    wanted_files: Vec<bool>,
    breaker: HashMap<SocketAddr, BreakerEntry>,
    /// The peers that contributed blocks to each in-flight piece, for
    /// penalizing contributors of pieces that repeatedly fail their hash.
    piece_contributors: HashMap<PieceIndex, HashSet<SocketAddr>>,
    /// The address currently holding the optimistic unchoke slot.
    optimistic_slot: Option<SocketAddr>,
    /// Payload totals of sessions that have already disconnected.
    downloaded_base: u64,
    uploaded_base: u64,
    /// Countdown seconds until the next periodic action.
    unchoke_in: u64,
    optimistic_in: u64,
    announce_in: u64,
    checkpoint_in: u64,
    pex_in: u64,
    dht_in: u64,
    completed_announced: bool,
    created_at: i64,
    /// The validated checkpoint to restore from, consumed during startup.
    resume_checkpoint: Option<Checkpoint>,
}

impl Torrent {
    /// Creates the torrent and the command channel the engine controls it
    /// with. Nothing is started yet.
    pub fn new(params: TorrentParams) -> (Self, UnboundedSender<TorrentCommand>) {
        let TorrentParams {
            id,
            metainfo,
            conf,
            client_id,
            listen_port,
            disk,
            tracker_client,
            dht,
            checkpoint_store,
            source,
            options,
            rate_limits,
            ip_filter,
            resume,
            global_peer_count,
            max_global_peers,
        } = params;

        let storage = StorageInfo::new(&metainfo, conf.download_dir.clone());
        let piece_picker = PiecePicker::new(
            storage.piece_count,
            conf.strategy,
            conf.sequential_window_size,
            conf.endgame_threshold,
        );
        let (event_chan, event_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();

        let trackers = TrackerList::new(metainfo.trackers.clone());
        let file_count = match &metainfo.structure {
            crate::storage_info::FsStructure::File(_) => 1,
            crate::storage_info::FsStructure::Archive { files } => files.len(),
        };
        let created_at = resume
            .as_ref()
            .map(|checkpoint| checkpoint.created_at)
            .unwrap_or_else(checkpoint::unix_now);

        let ctx = Arc::new(TorrentContext {
            id,
            info_hash: metainfo.info_hash,
            client_id,
            listen_port,
            is_private: metainfo.is_private,
            conf,
            storage,
            piece_picker: RwLock::new(piece_picker),
            downloads: RwLock::new(HashMap::new()),
            disk,
            event_chan,
            active_peer_count: AtomicUsize::new(0),
        });

        let torrent = Self {
            ctx,
            metainfo,
            state: TorrentState::Starting,
            peers: HashMap::new(),
            cmd_port: cmd_port.fuse(),
            cmd_chan: cmd_chan.clone(),
            event_port: event_port.fuse(),
            disk_alert_port: None,
            trackers,
            tracker_client,
            dht,
            checkpoint_store,
            source,
            options,
            rate_limits,
            ip_filter,
            global_peer_count,
            max_global_peers,
            wanted_files: vec![true; file_count],
            breaker: HashMap::new(),
            piece_contributors: HashMap::new(),
            optimistic_slot: None,
            downloaded_base: 0,
            uploaded_base: 0,
            unchoke_in: 1,
            optimistic_in: 1,
            announce_in: 0,
            checkpoint_in: 0,
            pex_in: 0,
            dht_in: 0,
            completed_announced: false,
            created_at,
            // consumed in start()
            resume_checkpoint: resume,
        };
        (torrent, cmd_chan)
    }

    /// Starts the torrent and runs it to completion of its task: allocates
    /// storage, restores and re-verifies resume data, announces, and enters
    /// the session loop.
    pub async fn start(&mut self) {
        log::info!("Starting torrent {}", self.metainfo.name);
        if let Err(e) = self.setup().await {
            log::error!(
                "Torrent {} failed to start: {}",
                self.metainfo.name,
                e
            );
            self.state = TorrentState::Error;
            // stay alive to answer status queries and the shutdown command
        }
        self.run().await;
    }

    /// The fallible part of startup.
    async fn setup(&mut self) -> Result<()> {
        let alert_port = self
            .ctx
            .disk
            .allocate_torrent(
                self.ctx.id,
                self.ctx.storage.clone(),
                self.metainfo.pieces.clone(),
                self.ctx.conf.read_cache_size,
            )
            .await?;
        self.disk_alert_port = Some(alert_port.fuse());

        // Restore the checkpoint: every piece it lists as verified is read
        // back and re-hashed before it is trusted; mismatches (and missing
        // files) demote the piece to missing.
        if let Some(checkpoint) = self.resume_checkpoint.take() {
            let claimed = checkpoint.verified_piece_indices();
            let valid = self
                .ctx
                .disk
                .validate_pieces(self.ctx.id, claimed.clone())
                .await?;
            if valid.len() < claimed.len() {
                log::warn!(
                    "{} of {} checkpointed pieces failed re-verification",
                    claimed.len() - valid.len(),
                    claimed.len()
                );
            }
            let mut picker = self.ctx.piece_picker.write().await;
            picker.restore_verified(&valid)?;
            log::info!(
                "Resumed {} with {} verified pieces",
                self.metainfo.name,
                valid.len()
            );
        }

        let is_complete =
            self.ctx.piece_picker.read().await.is_complete();
        self.state = if is_complete {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        };

        // the first announce carries event=started
        self.announce(Event::Started).await;
        self.dht_in = 1;
        self.checkpoint_in = self.ctx.conf.checkpoint_interval.as_secs();
        self.pex_in = self.ctx.conf.pex_interval.as_secs();
        Ok(())
    }

    /// The torrent's main loop.
    async fn run(&mut self) {
        let mut tick = interval(Duration::from_secs(1)).fuse();
        // the alert port only exists after a successful setup; a torrent in
        // the error state keeps serving commands so it can be shut down
        let mut disk_alert_port = self.disk_alert_port.take();
        loop {
            let wake = match &mut disk_alert_port {
                Some(alert_port) => select! {
                    cmd = self.cmd_port.select_next_some() => Wake::Cmd(cmd),
                    event = self.event_port.select_next_some() => {
                        Wake::Event(event)
                    }
                    alert = alert_port.select_next_some() => {
                        Wake::Alert(alert)
                    }
                    _ = tick.select_next_some() => Wake::Tick,
                },
                None => select! {
                    cmd = self.cmd_port.select_next_some() => Wake::Cmd(cmd),
                    event = self.event_port.select_next_some() => {
                        Wake::Event(event)
                    }
                    _ = tick.select_next_some() => Wake::Tick,
                },
            };
            match wake {
                Wake::Cmd(cmd) => {
                    if let Some(mode) = self.handle_cmd(cmd).await {
                        self.shutdown(mode).await;
                        return;
                    }
                }
                Wake::Event(event) => self.handle_peer_event(event).await,
                Wake::Alert(alert) => self.handle_disk_alert(alert).await,
                Wake::Tick => {
                    if self.state != TorrentState::Error {
                        self.second_tick().await;
                    }
                }
            }
        }
    }

    /// Handles an engine command; returns `Some(mode)` when the torrent
    /// should shut down.
    async fn handle_cmd(&mut self, cmd: TorrentCommand) -> Option<StopMode> {
        match cmd {
            TorrentCommand::AddPeers { peers } => {
                self.add_candidate_peers(peers);
            }
            TorrentCommand::IncomingPeer {
                socket,
                handshake,
                read_buf,
            } => {
                self.accept_incoming(socket, handshake, read_buf);
            }
            TorrentCommand::ForceAnnounce => {
                self.announce(Event::None).await;
            }
            TorrentCommand::ForceScrape { resp } => {
                let result = match timeout(
                    ANNOUNCE_TIMEOUT,
                    self.trackers
                        .scrape(&self.tracker_client, self.ctx.info_hash),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                };
                let _ = resp.send(result);
            }
            TorrentCommand::Rehash { resp } => {
                let _ = resp.send(self.rehash().await);
            }
            TorrentCommand::SetFileSelection {
                file_indices,
                wanted,
                resp,
            } => {
                let _ =
                    resp.send(self.set_file_selection(&file_indices, wanted).await);
            }
            TorrentCommand::SetRateLimits { limits } => {
                self.rate_limits = limits;
            }
            TorrentCommand::SetPlaybackHint { piece_index } => {
                let mut picker = self.ctx.piece_picker.write().await;
                picker.set_playback_hint(piece_index);
            }
            TorrentCommand::Status { resp } => {
                let _ = resp.send(self.status().await);
            }
            TorrentCommand::Shutdown { mode, resp } => {
                let _ = resp.send(());
                return Some(mode);
            }
        }
        None
    }

    /// Filters candidate peers (private torrent sources, the IP filter, the
    /// circuit breaker, connection caps, duplicates) and spawns outbound
    /// sessions for the survivors.
    fn add_candidate_peers(&mut self, peers: Vec<CandidatePeer>) {
        for candidate in peers {
            if self.ctx.is_private
                && !candidate.source.allowed_for_private()
            {
                // a typed error naming the source, per BEP 27
                let e = Error::PrivateTorrentPeerSource {
                    source: candidate.source,
                };
                log::warn!(
                    "Rejecting peer {} for private torrent: {}",
                    candidate.addr,
                    e
                );
                continue;
            }
            if !self.ip_filter.is_allowed(&candidate.addr.ip()) {
                log::debug!("Peer {} blocked by IP filter", candidate.addr);
                continue;
            }
            // duplicates are silently ignored
            if self.peers.contains_key(&candidate.addr) {
                continue;
            }
            if self.is_breaker_open(&candidate.addr) {
                log::debug!(
                    "Peer {} skipped by reconnect breaker",
                    candidate.addr
                );
                continue;
            }
            if !self.has_peer_capacity() {
                log::debug!("Peer limit reached, deferring candidates");
                break;
            }

            let (mut session, cmd_chan) = PeerSession::new(
                Arc::clone(&self.ctx),
                candidate.addr,
                candidate.source,
            );
            self.peers.insert(
                candidate.addr,
                PeerHandle {
                    cmd_chan,
                    source: candidate.source,
                    peer_id: None,
                    connected: false,
                    stats: SessionStats::default(),
                    am_choking: true,
                    pex: PexState::default(),
                },
            );
            tokio::task::spawn(async move {
                session.start_outbound().await;
            });
        }
    }

    /// Takes over an accepted connection whose handshake named our info
    /// hash.
    fn accept_incoming(
        &mut self,
        socket: TcpStream,
        handshake: Handshake,
        read_buf: BytesMut,
    ) {
        let addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("Incoming peer with no address: {}", e);
                return;
            }
        };
        if !self.ip_filter.is_allowed(&addr.ip()) {
            log::debug!("Incoming peer {} blocked by IP filter", addr);
            return;
        }
        if self.peers.contains_key(&addr) {
            log::debug!("Incoming peer {} already connected", addr);
            return;
        }
        if !self.has_peer_capacity() {
            log::info!("Rejecting incoming peer {}: peer limit", addr);
            return;
        }

        let (mut session, cmd_chan) = PeerSession::new(
            Arc::clone(&self.ctx),
            addr,
            PeerSource::Incoming,
        );
        self.peers.insert(
            addr,
            PeerHandle {
                cmd_chan,
                source: PeerSource::Incoming,
                peer_id: None,
                connected: false,
                stats: SessionStats::default(),
                am_choking: true,
                pex: PexState::default(),
            },
        );
        tokio::task::spawn(async move {
            session.start_inbound(socket, handshake, read_buf).await;
        });
    }

    fn has_peer_capacity(&self) -> bool {
        self.peers.len() < self.ctx.conf.max_connected_peer_count
            && self.global_peer_count.load(Ordering::Relaxed)
                < self.max_global_peers
    }

    fn is_breaker_open(&self, addr: &SocketAddr) -> bool {
        match self.breaker.get(addr) {
            Some(entry) => {
                entry.failures >= BREAKER_FAILURE_LIMIT
                    && entry
                        .window_start
                        .map(|start| start.elapsed() < BREAKER_WINDOW)
                        .unwrap_or(false)
            }
            None => false,
        }
    }

    fn record_breaker_failure(&mut self, addr: SocketAddr) {
        let entry = self.breaker.entry(addr).or_default();
        let window_expired = entry
            .window_start
            .map(|start| start.elapsed() >= BREAKER_WINDOW)
            .unwrap_or(true);
        if window_expired {
            entry.window_start = Some(Instant::now());
            entry.failures = 0;
        }
        entry.failures += 1;
    }

    /// Drops breaker entries whose window has long passed; called from the
    /// engine's cleanup schedule via the once-a-second tick.
    fn sweep_breaker(&mut self) {
        self.breaker.retain(|_, entry| {
            entry
                .window_start
                .map(|start| start.elapsed() < 2 * BREAKER_WINDOW)
                .unwrap_or(false)
        });
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr, peer_id } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.connected = true;
                    handle.peer_id = Some(peer_id);
                    self.ctx
                        .active_peer_count
                        .fetch_add(1, Ordering::Relaxed);
                    self.global_peer_count.fetch_add(1, Ordering::Relaxed);
                }
            }
            PeerEvent::Disconnected { addr } => {
                if let Some(handle) = self.peers.remove(&addr) {
                    if handle.connected {
                        self.ctx
                            .active_peer_count
                            .fetch_sub(1, Ordering::Relaxed);
                        self.global_peer_count
                            .fetch_sub(1, Ordering::Relaxed);
                        self.downloaded_base +=
                            handle.stats.downloaded_payload;
                        self.uploaded_base += handle.stats.uploaded_payload;
                    } else {
                        // never finished the handshake: feed the breaker
                        self.record_breaker_failure(addr);
                    }
                    if self.optimistic_slot == Some(addr) {
                        self.optimistic_slot = None;
                    }
                }
            }
            PeerEvent::Stats { addr, stats } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.stats = stats;
                }
            }
            PeerEvent::BlockReceived { addr, block } => {
                self.piece_contributors
                    .entry(block.piece_index)
                    .or_default()
                    .insert(addr);
                // in endgame the same block is requested from several
                // peers; the first arrival cancels the rest
                let endgame =
                    self.ctx.piece_picker.read().await.is_endgame();
                if endgame {
                    for (peer_addr, handle) in self.peers.iter() {
                        if *peer_addr != addr {
                            let _ = handle
                                .cmd_chan
                                .send(SessionCommand::Cancel(block));
                        }
                    }
                }
            }
            PeerEvent::PexPeers { addr, peers } => {
                log::debug!(
                    "Peer {} sent {} PEX peers",
                    addr,
                    peers.len()
                );
                let candidates = peers
                    .into_iter()
                    .map(|addr| CandidatePeer::new(addr, PeerSource::Pex))
                    .collect();
                self.add_candidate_peers(candidates);
            }
        }
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) {
        match alert {
            TorrentAlert::PieceCompleted { index, is_valid } => {
                if is_valid {
                    self.on_piece_verified(index).await;
                } else {
                    self.on_piece_failed(index).await;
                }
            }
            TorrentAlert::WriteFailure { index, error } => {
                log::error!(
                    "Disk write of piece {} failed: {}",
                    index,
                    error
                );
                // the piece's blocks are gone from the write buffer, give
                // the piece back to the picker for a retry
                self.ctx.downloads.write().await.remove(&index);
                let mut picker = self.ctx.piece_picker.write().await;
                let _ = picker.abandon_piece(index);
            }
        }
    }

    /// A piece passed its hash check and is on disk: flip the picker state,
    /// announce it to the swarm, and handle completion.
    async fn on_piece_verified(&mut self, index: PieceIndex) {
        log::info!(
            "Piece {} of {} verified",
            index,
            self.metainfo.name
        );
        self.piece_contributors.remove(&index);
        {
            let mut picker = self.ctx.piece_picker.write().await;
            if let Err(e) = picker.received_piece(index) {
                log::warn!("Failed to record verified piece: {}", e);
                return;
            }
        }
        self.ctx.downloads.write().await.remove(&index);

        // HAVE goes out strictly after the piece reached verified state
        for handle in self.peers.values() {
            let _ = handle.cmd_chan.send(SessionCommand::Have(index));
        }

        if self.ctx.conf.checkpoint_on_piece {
            self.save_checkpoint().await;
        }

        let is_complete =
            self.ctx.piece_picker.read().await.is_complete();
        if is_complete && self.state == TorrentState::Downloading {
            self.on_download_complete().await;
        }
    }

    async fn on_piece_failed(&mut self, index: PieceIndex) {
        let failure_count = {
            let mut picker = self.ctx.piece_picker.write().await;
            picker.piece_failed(index).unwrap_or(0)
        };
        self.ctx.downloads.write().await.remove(&index);
        let contributors = self
            .piece_contributors
            .remove(&index)
            .unwrap_or_default();
        log::warn!(
            "Piece {} failed hash check (failure {}, {} contributors)",
            index,
            failure_count,
            contributors.len()
        );

        // a piece that keeps failing marks its contributors as suspect:
        // disconnect them and let the breaker keep them away for a while
        if failure_count >= PIECE_FAILURE_LIMIT {
            for addr in contributors {
                log::warn!(
                    "Banning suspect peer {} after repeated bad piece",
                    addr
                );
                self.record_breaker_failure(addr);
                if let Some(entry) = self.breaker.get_mut(&addr) {
                    entry.failures = entry.failures.max(BREAKER_FAILURE_LIMIT);
                }
                if let Some(handle) = self.peers.get(&addr) {
                    let _ = handle.cmd_chan.send(SessionCommand::Shutdown);
                }
            }
        }
    }

    async fn on_download_complete(&mut self) {
        log::info!("Torrent {} complete, seeding", self.metainfo.name);
        self.state = TorrentState::Seeding;
        self.save_checkpoint().await;
        // completed is announced exactly once per completion
        if !self.completed_announced {
            self.completed_announced = true;
            self.announce(Event::Completed).await;
        }
    }

    /// The once-a-second scheduling tick: choke rounds, announces,
    /// checkpoints, PEX, DHT, and peer top-up all hang off this.
    async fn second_tick(&mut self) {
        self.sweep_breaker();

        if self.unchoke_in == 0 {
            self.unchoke_in = self.ctx.conf.unchoke_interval.as_secs();
            self.run_choke_round();
        }
        self.unchoke_in = self.unchoke_in.saturating_sub(1);

        if self.optimistic_in == 0 {
            self.optimistic_in =
                self.ctx.conf.optimistic_unchoke_interval.as_secs();
            self.rotate_optimistic_unchoke();
        }
        self.optimistic_in = self.optimistic_in.saturating_sub(1);

        if self.announce_in == 0 {
            // re-armed from the tracker's reported interval
            self.announce(Event::None).await;
        } else {
            self.announce_in -= 1;
        }

        if self.checkpoint_in == 0 {
            self.checkpoint_in =
                self.ctx.conf.checkpoint_interval.as_secs().max(1);
            self.save_checkpoint().await;
        }
        self.checkpoint_in = self.checkpoint_in.saturating_sub(1);

        if self.ctx.conf.enable_pex && !self.ctx.is_private {
            if self.pex_in == 0 {
                self.pex_in = self.ctx.conf.pex_interval.as_secs().max(1);
                self.send_pex_deltas();
            }
            self.pex_in = self.pex_in.saturating_sub(1);
        }

        if self.dht.is_some() && !self.ctx.is_private {
            if self.dht_in == 0 {
                self.dht_in = DHT_ANNOUNCE_INTERVAL.as_secs();
                self.spawn_dht_round();
            }
            self.dht_in = self.dht_in.saturating_sub(1);
        }
    }

    /// The regular choke round (tit-for-tat): rank interested peers by the
    /// rate they give us (or, when seeding, by the rate they take from us)
    /// and unchoke the top slots; everyone else is choked, except the
    /// optimistic slot.
    fn run_choke_round(&mut self) {
        let seeding = self.state == TorrentState::Seeding;
        let mut ranked: Vec<(SocketAddr, u64)> = self
            .peers
            .iter()
            .filter(|(_, handle)| {
                handle.connected && handle.stats.is_peer_interested
            })
            .map(|(addr, handle)| {
                let rate = if seeding {
                    handle.stats.upload_rate
                } else {
                    handle.stats.download_rate
                };
                (*addr, rate)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let unchoked: HashSet<SocketAddr> = ranked
            .iter()
            .take(self.ctx.conf.max_upload_slots)
            .map(|(addr, _)| *addr)
            .collect();

        for (addr, handle) in self.peers.iter_mut() {
            let should_unchoke = unchoked.contains(addr)
                || self.optimistic_slot == Some(*addr);
            if should_unchoke && handle.am_choking {
                handle.am_choking = false;
                let _ = handle.cmd_chan.send(SessionCommand::Unchoke);
            } else if !should_unchoke && !handle.am_choking {
                handle.am_choking = true;
                let _ = handle.cmd_chan.send(SessionCommand::Choke);
            }
        }
    }

    /// Moves the optimistic unchoke slot to a random interested, currently
    /// choked peer. Rotates on every optimistic interval regardless of who
    /// held it before.
    fn rotate_optimistic_unchoke(&mut self) {
        let candidates: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(addr, handle)| {
                handle.connected
                    && handle.stats.is_peer_interested
                    && handle.am_choking
                    && self.optimistic_slot != Some(**addr)
            })
            .map(|(addr, _)| *addr)
            .collect();
        if candidates.is_empty() {
            return;
        }
        let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        log::debug!("Optimistic unchoke slot moves to {}", pick);
        self.optimistic_slot = Some(pick);
        if let Some(handle) = self.peers.get_mut(&pick) {
            handle.am_choking = false;
            let _ = handle.cmd_chan.send(SessionCommand::Unchoke);
        }
        // the slot holder keeps its unchoke until the next regular round
        // re-evaluates it
    }

    /// Sends each connected, PEX capable peer its delta of gained and lost
    /// peers since the last round.
    fn send_pex_deltas(&mut self) {
        let connected: HashSet<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, handle)| handle.connected)
            .map(|(addr, _)| *addr)
            .collect();
        for (addr, handle) in self.peers.iter_mut() {
            if !handle.connected {
                continue;
            }
            // a peer is not told about itself
            let mut view = connected.clone();
            view.remove(addr);
            if let Some(msg) = handle.pex.delta(&view) {
                let _ = handle.cmd_chan.send(SessionCommand::Pex(msg));
            }
        }
    }

    /// One DHT round: look up fresh peers for this torrent and refresh our
    /// announce. Runs in its own task; results come back as an `AddPeers`
    /// command.
    fn spawn_dht_round(&mut self) {
        let dht = match &self.dht {
            Some(dht) => dht.clone(),
            None => return,
        };
        let info_hash = self.ctx.info_hash;
        let listen_port = self.ctx.listen_port;
        let cmd_chan = self.cmd_chan.clone();
        tokio::task::spawn(async move {
            match dht.get_peers(info_hash).await {
                Ok(addrs) if !addrs.is_empty() => {
                    let peers = addrs
                        .into_iter()
                        .map(|addr| {
                            CandidatePeer::new(addr, PeerSource::Dht)
                        })
                        .collect();
                    let _ = cmd_chan.send(TorrentCommand::AddPeers { peers });
                }
                Ok(_) => {}
                Err(e) => log::debug!("DHT lookup failed: {}", e),
            }
            match dht.announce(info_hash, listen_port).await {
                Ok(count) => {
                    log::debug!("DHT announce stored on {} nodes", count)
                }
                Err(e) => log::debug!("DHT announce failed: {}", e),
            }
        });
    }

    /// Announces to the torrent's trackers (tier order, stop after first
    /// success) and feeds the returned peers into the connection table. The
    /// next regular announce is scheduled from the tracker's interval,
    /// clamped into the configured bounds.
    async fn announce(&mut self, event: Event) {
        // re-arm with the default first so failure paths keep a schedule
        self.announce_in = self.ctx.conf.announce_interval.as_secs();
        if self.trackers.is_empty() {
            return;
        }
        let params = self.announce_params(event).await;
        match timeout(
            ANNOUNCE_TIMEOUT,
            self.trackers.announce(&self.tracker_client, &params),
        )
        .await
        {
            Ok(Ok(response)) => {
                if let Some(warning) = &response.warning {
                    log::warn!("Tracker warning: {}", warning);
                }
                if let Some(interval) = response.interval {
                    let clamped = interval
                        .max(self.ctx.conf.min_announce_interval)
                        .min(self.ctx.conf.max_announce_interval);
                    self.announce_in = clamped.as_secs();
                }
                log::info!(
                    "Announce returned {} peers (seeders: {:?}, leechers: {:?})",
                    response.peers.len(),
                    response.seeder_count,
                    response.leecher_count,
                );
                let candidates = response
                    .peers
                    .into_iter()
                    .map(|addr| {
                        CandidatePeer::new(addr, PeerSource::Tracker)
                    })
                    .collect();
                self.add_candidate_peers(candidates);
            }
            Ok(Err(e)) => {
                log::warn!("Announce failed: {}", e);
            }
            Err(_) => {
                log::warn!("Announce timed out");
            }
        }
    }

    async fn announce_params(&self, event: Event) -> AnnounceParams {
        let downloaded = self.downloaded_payload();
        let uploaded = self.uploaded_payload();
        let left = {
            let picker = self.ctx.piece_picker.read().await;
            self.remaining_bytes(&picker)
        };
        AnnounceParams {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.ctx.listen_port,
            uploaded,
            downloaded,
            left,
            event,
            num_want: Some(
                self.ctx.conf.min_requested_peer_count.max(25) as u32
            ),
        }
    }

    fn downloaded_payload(&self) -> u64 {
        self.downloaded_base
            + self
                .peers
                .values()
                .map(|handle| handle.stats.downloaded_payload)
                .sum::<u64>()
    }

    fn uploaded_payload(&self) -> u64 {
        self.uploaded_base
            + self
                .peers
                .values()
                .map(|handle| handle.stats.uploaded_payload)
                .sum::<u64>()
    }

    /// The bytes still missing, by piece state.
    fn remaining_bytes(&self, picker: &PiecePicker) -> u64 {
        let mut remaining = 0;
        for index in 0..self.ctx.storage.piece_count {
            if !picker.own_pieces()[index] {
                remaining += self
                    .ctx
                    .storage
                    .piece_len(index)
                    .unwrap_or(0) as u64;
            }
        }
        remaining
    }

    /// Builds and saves the current checkpoint.
    async fn save_checkpoint(&mut self) {
        let checkpoint = self.build_checkpoint().await;
        if let Err(e) = self.checkpoint_store.save(&checkpoint) {
            log::warn!(
                "Failed to save checkpoint for {}: {}",
                self.metainfo.name,
                e
            );
        }
    }

    async fn build_checkpoint(&self) -> Checkpoint {
        let picker = self.ctx.piece_picker.read().await;
        let piece_count = self.ctx.storage.piece_count;
        let mut verified_pieces = Vec::new();
        let mut piece_states = Vec::with_capacity(piece_count);
        for index in 0..piece_count {
            let state = picker
                .piece_state(index)
                .unwrap_or(PieceState::Missing);
            piece_states.push(state);
            if state == PieceState::Verified {
                verified_pieces.push(index as u32);
            }
        }
        Checkpoint {
            info_hash: self.ctx.info_hash,
            name: self.metainfo.name.clone(),
            total_pieces: piece_count as u32,
            piece_len: self.ctx.storage.piece_len,
            total_len: self.ctx.storage.download_len,
            verified_pieces,
            piece_states,
            created_at: self.created_at,
            updated_at: checkpoint::unix_now(),
            output_dir: self.ctx.conf.download_dir.clone(),
            source: self.source.clone(),
            announce_urls: self.trackers.urls(),
            display_name: Some(self.metainfo.name.clone()),
            options: self.options.clone(),
            rate_limits: self.rate_limits,
        }
    }

    /// Re-hashes every piece against the data on disk: pieces whose data
    /// turns out valid are promoted to verified, verified pieces that no
    /// longer match are demoted. Returns the number of verified pieces
    /// afterwards.
    async fn rehash(&mut self) -> Result<usize> {
        let all: Vec<PieceIndex> =
            (0..self.ctx.storage.piece_count).collect();
        let valid = self
            .ctx
            .disk
            .validate_pieces(self.ctx.id, all.clone())
            .await?;
        let valid_set: HashSet<PieceIndex> = valid.iter().copied().collect();

        let newly_verified = {
            let mut picker = self.ctx.piece_picker.write().await;
            let mut newly_verified = Vec::new();
            for index in all {
                let was_verified = picker.own_pieces()[index];
                if valid_set.contains(&index) {
                    if !was_verified {
                        picker.received_piece(index)?;
                        newly_verified.push(index);
                    }
                } else if was_verified {
                    log::warn!("Rehash demoted piece {}", index);
                    picker.demote(index)?;
                }
            }
            newly_verified
        };
        for index in newly_verified {
            for handle in self.peers.values() {
                let _ = handle.cmd_chan.send(SessionCommand::Have(index));
            }
        }

        let is_complete = self.ctx.piece_picker.read().await.is_complete();
        if is_complete && self.state == TorrentState::Downloading {
            self.on_download_complete().await;
        } else if !is_complete && self.state == TorrentState::Seeding {
            self.state = TorrentState::Downloading;
        }
        self.save_checkpoint().await;
        Ok(valid_set.len())
    }

    /// Applies a file selection change: pieces that only overlap deselected
    /// files are excluded from piece selection.
    async fn set_file_selection(
        &mut self,
        file_indices: &[FileIndex],
        wanted: bool,
    ) -> Result<()> {
        for &file_index in file_indices {
            if file_index >= self.wanted_files.len() {
                return Err(Error::InvalidPieceIndex);
            }
        }
        for &file_index in file_indices {
            self.wanted_files[file_index] = wanted;
        }

        let mut wanted_pieces = Bitfield::new();
        wanted_pieces.resize(self.ctx.storage.piece_count, false);
        for index in 0..self.ctx.storage.piece_count {
            // a piece stays wanted while any selected (non padding) file
            // overlaps it
            let piece_wanted = self
                .ctx
                .storage
                .piece_slices(index)?
                .iter()
                .any(|slice| {
                    !slice.is_pad && self.wanted_files[slice.file_index]
                });
            wanted_pieces.set(index, piece_wanted);
        }
        let mut picker = self.ctx.piece_picker.write().await;
        picker.set_wanted_pieces(wanted_pieces)?;
        Ok(())
    }

    async fn status(&self) -> TorrentStatus {
        let (verified_piece_count, is_complete) = {
            let picker = self.ctx.piece_picker.read().await;
            (picker.verified_count(), picker.is_complete())
        };
        let download_rate = self
            .peers
            .values()
            .map(|handle| handle.stats.download_rate)
            .sum();
        let upload_rate = self
            .peers
            .values()
            .map(|handle| handle.stats.upload_rate)
            .sum();
        TorrentStatus {
            info_hash: self.ctx.info_hash,
            name: self.metainfo.name.clone(),
            state: self.state,
            piece_count: self.ctx.storage.piece_count,
            verified_piece_count,
            total_len: self.ctx.storage.download_len,
            downloaded_payload: self.downloaded_payload(),
            uploaded_payload: self.uploaded_payload(),
            download_rate,
            upload_rate,
            peer_count: self
                .peers
                .values()
                .filter(|handle| handle.connected)
                .count(),
            is_complete,
            rate_limits: self.rate_limits,
        }
    }

    /// The orderly teardown: checkpoint (or delete), best effort stopped
    /// announce, and cancellation of every peer session.
    async fn shutdown(&mut self, mode: StopMode) {
        log::info!(
            "Shutting down torrent {} ({:?})",
            self.metainfo.name,
            mode
        );

        match mode {
            StopMode::Pause | StopMode::Stop => {
                if self.state != TorrentState::Error {
                    self.save_checkpoint().await;
                }
            }
            StopMode::Remove => {
                if let Err(e) =
                    self.checkpoint_store.delete(&self.ctx.info_hash)
                {
                    log::warn!("Failed to delete checkpoint: {}", e);
                }
            }
        }

        // event=stopped is best effort
        self.announce(Event::Stopped).await;

        for (addr, handle) in self.peers.iter() {
            log::debug!("Stopping peer {} session", addr);
            let _ = handle.cmd_chan.send(SessionCommand::Shutdown);
        }
        // sessions decrement the shared counters through their cleanup
        // events, but this task is going away: settle our share directly
        let connected = self
            .peers
            .values()
            .filter(|handle| handle.connected)
            .count();
        self.global_peer_count
            .fetch_sub(connected, Ordering::Relaxed);
        self.peers.clear();

        if mode == StopMode::Remove {
            if let Err(e) = self.ctx.disk.remove_torrent(self.ctx.id) {
                log::warn!("Failed to remove torrent from disk task: {}", e);
            }
        }

        self.state = match mode {
            StopMode::Pause => TorrentState::Paused,
            StopMode::Stop | StopMode::Remove => TorrentState::Stopped,
        };
    }
}
