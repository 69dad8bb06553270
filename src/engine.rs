//! The engine: the process wide session manager that owns the singletons
//! (disk task, TCP listener, the shared UDP tracker socket, the DHT node,
//! NAT mappings, the IP filter) and the registry of torrents.
//!
//! Startup is staged leaves-first and must not be reordered: NAT mappings,
//! then the TCP listener, then the UDP tracker client, then the DHT
//! bootstrap, then the IP filter and the background loops. Failure of a
//! required step (a TCP or UDP bind) is fatal; optional steps log and
//! proceed.

use {
    futures::{select, FutureExt, StreamExt},
    std::{
        collections::{HashMap, HashSet},
        path::Path,
        sync::{
            atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        net::{TcpListener, TcpStream},
        sync::{mpsc::UnboundedSender, oneshot, Mutex},
        time::{interval, timeout},
    },
    tokio_util::codec::Framed,
};

use crate::{
    checkpoint::{Checkpoint, CheckpointSource, CheckpointStore},
    conf::{Conf, RateLimits, TorrentOptions},
    dht::{self, DhtHandle},
    disk::{self, DiskHandle},
    error::*,
    magnet::MagnetUri,
    metadata,
    metainfo::Metainfo,
    nat::{self, NatManager},
    peer::codec::{Handshake, HandshakeCodec},
    security::IpFilter,
    torrent::{
        StopMode, Torrent, TorrentCommand, TorrentParams, TorrentState,
        TorrentStatus,
    },
    tracker::{udp, AnnounceParams, Event, ScrapeStats, TrackerClient},
    CandidatePeer, FileIndex, PeerSource, PieceIndex, Sha1Hash, TorrentId,
};

/// How long an incoming connection gets to present its handshake.
const INCOMING_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Parses a 40 character hex info hash, as accepted on every administrative
/// surface. Anything else is rejected at this boundary.
pub fn parse_info_hash_hex(s: &str) -> Result<Sha1Hash> {
    let s = s.trim();
    if s.len() != 40 {
        return Err(Error::InvalidInfoHashLength(s.len() / 2));
    }
    let mut hash = [0; 20];
    hex::decode_to_slice(s, &mut hash)
        .map_err(|_| Error::InvalidInfoHashLength(s.len() / 2))?;
    Ok(hash)
}

/// What to register a new torrent with.
#[derive(Clone, Debug)]
pub struct AddTorrent {
    pub metainfo: Metainfo,
    /// Where the torrent came from, recorded in its checkpoints.
    pub source: CheckpointSource,
    pub options: TorrentOptions,
    pub rate_limits: RateLimits,
    /// Whether to restore an existing checkpoint. An invalid checkpoint is
    /// rejected and the torrent starts fresh.
    pub resume: bool,
}

/// One registered torrent. Paused torrents have no task; everything needed
/// to start them again is kept here.
enum TorrentEntry {
    Running {
        cmd_chan: UnboundedSender<TorrentCommand>,
        metainfo: Metainfo,
        options: TorrentOptions,
        rate_limits: RateLimits,
        source: CheckpointSource,
    },
    Paused {
        metainfo: Metainfo,
        options: TorrentOptions,
        rate_limits: RateLimits,
        source: CheckpointSource,
    },
}

/// The registry guarded by the engine's lock. The lock is held for map
/// operations only, never across IO.
#[derive(Default)]
struct Registry {
    torrents: HashMap<Sha1Hash, TorrentEntry>,
    /// Torrents whose metainfo set the private flag; every discovery
    /// subsystem consults this set before acting (BEP 27).
    private_torrents: HashSet<Sha1Hash>,
}

pub struct Engine {
    conf: Conf,
    /// The actually bound TCP listen port (relevant when the configured
    /// port was 0).
    listen_port: u16,
    disk: DiskHandle,
    tracker_client: TrackerClient,
    dht: Option<DhtHandle>,
    checkpoint_store: CheckpointStore,
    ip_filter: Arc<IpFilter>,
    registry: Arc<Mutex<Registry>>,
    global_peer_count: Arc<AtomicUsize>,
    next_torrent_id: AtomicU32,
    nat: Option<Arc<Mutex<NatManager>>>,
    /// Set when the engine shuts down; the background loops exit on their
    /// next tick.
    stopping: Arc<AtomicBool>,
    accept_shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl Engine {
    /// Boots the engine in dependency order and returns it ready to accept
    /// torrents.
    pub async fn start(conf: Conf) -> Result<Engine> {
        let http = reqwest::Client::new();

        // 1. NAT port mappings (optional, best effort)
        let nat = if conf.engine.enable_nat {
            match NatManager::discover(conf.engine.nat_gateway, http.clone())
                .await
            {
                Ok(mut manager) => {
                    let tcp_port = conf.engine.listen_addr.port();
                    if tcp_port != 0 {
                        if let Err(e) = manager
                            .map_port(
                                nat::Protocol::Tcp,
                                tcp_port,
                                nat::DEFAULT_LEASE,
                            )
                            .await
                        {
                            log::warn!("TCP port mapping failed: {}", e);
                        }
                    }
                    for udp_port in
                        [conf.engine.dht_port, conf.engine.udp_tracker_port]
                            .iter()
                    {
                        if *udp_port != 0 {
                            if let Err(e) = manager
                                .map_port(
                                    nat::Protocol::Udp,
                                    *udp_port,
                                    nat::DEFAULT_LEASE,
                                )
                                .await
                            {
                                log::warn!(
                                    "UDP port mapping failed: {}",
                                    e
                                );
                            }
                        }
                    }
                    Some(Arc::new(Mutex::new(manager)))
                }
                Err(e) => {
                    log::warn!("No NAT gateway found: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // 2. the TCP listener (required)
        let mut listener = TcpListener::bind(conf.engine.listen_addr)
            .await
            .map_err(|e| Error::PortBind {
                port: conf.engine.listen_addr.port(),
                source: e,
            })?;
        let listen_port = listener.local_addr()?.port();
        log::info!("Accepting peer connections on port {}", listen_port);

        // 3. the single shared UDP tracker socket (required)
        let udp_tracker =
            udp::spawn(conf.engine.udp_tracker_port).await?;
        let tracker_client = TrackerClient {
            http: http.clone(),
            udp: udp_tracker,
        };

        // 4. the DHT node, bootstrapped before serving lookups (optional)
        let dht = if conf.engine.enable_dht {
            match dht::spawn(
                conf.engine.dht_port,
                &conf.engine.dht_routers,
                &conf.engine.state_dir,
            )
            .await
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::warn!("DHT unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // 5. the IP filter; a malformed filter must not silently open up
        let ip_filter = Arc::new(IpFilter::new(
            &conf.engine.ip_allow_list,
            &conf.engine.ip_deny_list,
        )?);

        // 6. shared peer bookkeeping and the disk task
        let global_peer_count = Arc::new(AtomicUsize::new(0));
        let disk = disk::spawn();
        let checkpoint_store =
            CheckpointStore::new(conf.engine.state_dir.clone())?;

        let engine = Engine {
            conf,
            listen_port,
            disk,
            tracker_client,
            dht,
            checkpoint_store,
            ip_filter,
            registry: Arc::new(Mutex::new(Registry::default())),
            global_peer_count,
            next_torrent_id: AtomicU32::new(1),
            nat,
            stopping: Arc::new(AtomicBool::new(false)),
            accept_shutdown: std::sync::Mutex::new(None),
        };

        // 7. background loops: the accept loop, NAT renewal, metrics, and
        // tracker auto-scrape
        let (accept_shutdown_chan, accept_shutdown_port) = oneshot::channel();
        if let Ok(mut slot) = engine.accept_shutdown.lock() {
            *slot = Some(accept_shutdown_chan);
        }
        {
            let registry = Arc::clone(&engine.registry);
            tokio::task::spawn(async move {
                run_accept_loop(listener, registry, accept_shutdown_port)
                    .await;
            });
        }
        {
            let nat = engine.nat.clone();
            let stopping = Arc::clone(&engine.stopping);
            let cleanup_interval = engine.conf.engine.cleanup_interval;
            tokio::task::spawn(async move {
                run_cleanup_loop(nat, stopping, cleanup_interval).await;
            });
        }
        {
            let registry = Arc::clone(&engine.registry);
            let stopping = Arc::clone(&engine.stopping);
            let global_peer_count = Arc::clone(&engine.global_peer_count);
            let metrics_interval = engine.conf.engine.metrics_interval;
            tokio::task::spawn(async move {
                run_metrics_loop(
                    registry,
                    stopping,
                    global_peer_count,
                    metrics_interval,
                )
                .await;
            });
        }
        if let Some(scrape_interval) = engine.conf.engine.auto_scrape_interval
        {
            let registry = Arc::clone(&engine.registry);
            let stopping = Arc::clone(&engine.stopping);
            tokio::task::spawn(async move {
                run_auto_scrape_loop(registry, stopping, scrape_interval)
                    .await;
            });
        }

        Ok(engine)
    }

    /// The port peers should connect to (the bound port, which may differ
    /// from the configured one when that was 0).
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Registers and starts a torrent. Rejects duplicate info hashes.
    pub async fn add_torrent(&self, params: AddTorrent) -> Result<Sha1Hash> {
        let AddTorrent {
            metainfo,
            source,
            options,
            rate_limits,
            resume,
        } = params;
        let info_hash = metainfo.info_hash;

        // checkpoint loading is IO and happens outside the registry lock;
        // an invalid checkpoint is rejected and the torrent starts fresh
        let checkpoint = if resume {
            match self.checkpoint_store.load(&info_hash) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    log::warn!(
                        "Ignoring invalid checkpoint for {}: {}",
                        hex::encode(info_hash),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut registry = self.registry.lock().await;
        if registry.torrents.contains_key(&info_hash) {
            return Err(Error::AlreadyExists);
        }

        let cmd_chan = self.spawn_torrent(
            metainfo.clone(),
            &options,
            rate_limits,
            source.clone(),
            checkpoint,
        );
        if metainfo.is_private {
            registry.private_torrents.insert(info_hash);
        }
        registry.torrents.insert(
            info_hash,
            TorrentEntry::Running {
                cmd_chan,
                metainfo,
                options,
                rate_limits,
                source,
            },
        );
        Ok(info_hash)
    }

    /// Starts a magnet download: discovers peers through the magnet's
    /// trackers and the DHT, fetches the metadata from them (BEP 9), and
    /// then registers a regular torrent.
    pub async fn add_magnet(
        &self,
        magnet: &MagnetUri,
        options: TorrentOptions,
        rate_limits: RateLimits,
        resume: bool,
    ) -> Result<Sha1Hash> {
        {
            let registry = self.registry.lock().await;
            if registry.torrents.contains_key(&magnet.info_hash) {
                return Err(Error::AlreadyExists);
            }
        }

        let mut candidates: Vec<std::net::SocketAddr> = Vec::new();
        if let Some(dht) = &self.dht {
            match dht.get_peers(magnet.info_hash).await {
                Ok(peers) => candidates.extend(peers),
                Err(e) => log::debug!("DHT magnet lookup failed: {}", e),
            }
        }
        for tracker in &magnet.trackers {
            let params = AnnounceParams {
                info_hash: magnet.info_hash,
                peer_id: self.conf.engine.client_id,
                port: self.listen_port,
                uploaded: 0,
                downloaded: 0,
                // the true size is unknown until the metadata is fetched
                left: 1,
                event: Event::Started,
                num_want: Some(50),
            };
            match self.tracker_client.announce(tracker, &params).await {
                Ok(response) => candidates.extend(response.peers),
                Err(e) => {
                    log::debug!("Magnet tracker {} failed: {}", tracker, e)
                }
            }
        }
        candidates.sort();
        candidates.dedup();
        if candidates.is_empty() {
            return Err(Error::MetadataFetch("no peers to fetch from"));
        }

        let trackers = magnet
            .trackers
            .iter()
            .map(|tracker| vec![tracker.clone()])
            .collect();
        let metainfo = metadata::fetch(
            magnet.info_hash,
            self.conf.engine.client_id,
            &candidates,
            trackers,
        )
        .await?;

        let info_hash = self
            .add_torrent(AddTorrent {
                metainfo,
                source: CheckpointSource::Magnet(magnet.to_uri()),
                options,
                rate_limits,
                resume,
            })
            .await?;
        // the metadata peers are known good, seed the connection table
        self.add_peers(
            info_hash,
            candidates
                .into_iter()
                .map(|addr| CandidatePeer::new(addr, PeerSource::Tracker))
                .collect(),
        )
        .await?;
        Ok(info_hash)
    }

    /// Stops and deregisters a torrent, deleting its checkpoint. After this
    /// the info hash is absent from both the torrent registry and the
    /// private torrent set.
    pub async fn remove(&self, info_hash: Sha1Hash) -> Result<()> {
        let entry = {
            let mut registry = self.registry.lock().await;
            registry.private_torrents.remove(&info_hash);
            registry
                .torrents
                .remove(&info_hash)
                .ok_or(Error::TorrentNotFound)?
        };
        match entry {
            TorrentEntry::Running { cmd_chan, .. } => {
                let (resp, port) = oneshot::channel();
                cmd_chan.send(TorrentCommand::Shutdown {
                    mode: StopMode::Remove,
                    resp,
                })?;
                let _ = port.await;
            }
            TorrentEntry::Paused { .. } => {
                let _ = self.checkpoint_store.delete(&info_hash);
            }
        }
        Ok(())
    }

    /// Checkpoints and stops a running torrent, keeping its registry entry
    /// for a later resume.
    pub async fn pause(&self, info_hash: Sha1Hash) -> Result<()> {
        let cmd_chan = {
            let registry = self.registry.lock().await;
            match registry.torrents.get(&info_hash) {
                Some(TorrentEntry::Running { cmd_chan, .. }) => {
                    cmd_chan.clone()
                }
                Some(TorrentEntry::Paused { .. }) => return Ok(()),
                None => return Err(Error::TorrentNotFound),
            }
        };
        let (resp, port) = oneshot::channel();
        cmd_chan.send(TorrentCommand::Shutdown {
            mode: StopMode::Pause,
            resp,
        })?;
        let _ = port.await;

        let mut registry = self.registry.lock().await;
        if let Some(TorrentEntry::Running {
            metainfo,
            options,
            rate_limits,
            source,
            ..
        }) = registry.torrents.remove(&info_hash)
        {
            registry.torrents.insert(
                info_hash,
                TorrentEntry::Paused {
                    metainfo,
                    options,
                    rate_limits,
                    source,
                },
            );
        }
        Ok(())
    }

    /// Restarts a paused torrent from its checkpoint.
    pub async fn resume(&self, info_hash: Sha1Hash) -> Result<()> {
        let checkpoint = match self.checkpoint_store.load(&info_hash) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                log::warn!("Ignoring invalid checkpoint on resume: {}", e);
                None
            }
        };

        let mut registry = self.registry.lock().await;
        let entry = registry
            .torrents
            .remove(&info_hash)
            .ok_or(Error::TorrentNotFound)?;
        match entry {
            TorrentEntry::Running { .. } => {
                // already running, put it back untouched
                registry.torrents.insert(info_hash, entry);
                Ok(())
            }
            TorrentEntry::Paused {
                metainfo,
                options,
                rate_limits,
                source,
            } => {
                let cmd_chan = self.spawn_torrent(
                    metainfo.clone(),
                    &options,
                    rate_limits,
                    source.clone(),
                    checkpoint,
                );
                registry.torrents.insert(
                    info_hash,
                    TorrentEntry::Running {
                        cmd_chan,
                        metainfo,
                        options,
                        rate_limits,
                        source,
                    },
                );
                Ok(())
            }
        }
    }

    /// Hands candidate peers to a running torrent; the torrent applies the
    /// private-torrent and IP filter policies.
    pub async fn add_peers(
        &self,
        info_hash: Sha1Hash,
        peers: Vec<CandidatePeer>,
    ) -> Result<()> {
        let cmd_chan = self.running_cmd_chan(info_hash).await?;
        cmd_chan.send(TorrentCommand::AddPeers { peers })?;
        Ok(())
    }

    /// Adds a single manually supplied peer.
    pub async fn add_peer(
        &self,
        info_hash: Sha1Hash,
        addr: std::net::SocketAddr,
    ) -> Result<()> {
        self.add_peers(
            info_hash,
            vec![CandidatePeer::new(addr, PeerSource::Manual)],
        )
        .await
    }

    /// The status of every registered torrent.
    pub async fn list(&self) -> Vec<TorrentStatus> {
        let entries: Vec<(Sha1Hash, Option<UnboundedSender<TorrentCommand>>)> = {
            let registry = self.registry.lock().await;
            registry
                .torrents
                .iter()
                .map(|(info_hash, entry)| match entry {
                    TorrentEntry::Running { cmd_chan, .. } => {
                        (*info_hash, Some(cmd_chan.clone()))
                    }
                    TorrentEntry::Paused { .. } => (*info_hash, None),
                })
                .collect()
        };

        let mut statuses = Vec::with_capacity(entries.len());
        for (info_hash, cmd_chan) in entries {
            match cmd_chan {
                Some(cmd_chan) => {
                    if let Ok(status) =
                        Self::query_status(&cmd_chan).await
                    {
                        statuses.push(status);
                    }
                }
                None => {
                    if let Some(status) =
                        self.paused_status(info_hash).await
                    {
                        statuses.push(status);
                    }
                }
            }
        }
        statuses
    }

    /// The status snapshot of one torrent.
    pub async fn torrent_status(
        &self,
        info_hash: Sha1Hash,
    ) -> Result<TorrentStatus> {
        let cmd_chan = {
            let registry = self.registry.lock().await;
            match registry.torrents.get(&info_hash) {
                Some(TorrentEntry::Running { cmd_chan, .. }) => {
                    Some(cmd_chan.clone())
                }
                Some(TorrentEntry::Paused { .. }) => None,
                None => return Err(Error::TorrentNotFound),
            }
        };
        match cmd_chan {
            Some(cmd_chan) => Self::query_status(&cmd_chan).await,
            None => self
                .paused_status(info_hash)
                .await
                .ok_or(Error::TorrentNotFound),
        }
    }

    /// Announces a running torrent to its trackers immediately.
    pub async fn force_announce(&self, info_hash: Sha1Hash) -> Result<()> {
        let cmd_chan = self.running_cmd_chan(info_hash).await?;
        cmd_chan.send(TorrentCommand::ForceAnnounce)?;
        Ok(())
    }

    /// Scrapes a running torrent's trackers for swarm statistics.
    pub async fn force_scrape(
        &self,
        info_hash: Sha1Hash,
    ) -> Result<ScrapeStats> {
        let cmd_chan = self.running_cmd_chan(info_hash).await?;
        let (resp, port) = oneshot::channel();
        cmd_chan.send(TorrentCommand::ForceScrape { resp })?;
        port.await?
    }

    /// Re-hashes a torrent's data on disk, promoting valid pieces and
    /// demoting corrupt ones. Returns the verified piece count.
    pub async fn rehash(&self, info_hash: Sha1Hash) -> Result<usize> {
        let cmd_chan = self.running_cmd_chan(info_hash).await?;
        let (resp, port) = oneshot::channel();
        cmd_chan.send(TorrentCommand::Rehash { resp })?;
        port.await?
    }

    /// Stores new rate limits for the torrent (carried in checkpoints and
    /// status; not enforced at the IO layer).
    pub async fn set_rate_limits(
        &self,
        info_hash: Sha1Hash,
        limits: RateLimits,
    ) -> Result<()> {
        {
            let mut registry = self.registry.lock().await;
            match registry.torrents.get_mut(&info_hash) {
                Some(TorrentEntry::Running { rate_limits, .. })
                | Some(TorrentEntry::Paused { rate_limits, .. }) => {
                    *rate_limits = limits;
                }
                None => return Err(Error::TorrentNotFound),
            }
        }
        if let Ok(cmd_chan) = self.running_cmd_chan(info_hash).await {
            cmd_chan.send(TorrentCommand::SetRateLimits { limits })?;
        }
        Ok(())
    }

    /// Selects or deselects files of a torrent for download.
    pub async fn select_files(
        &self,
        info_hash: Sha1Hash,
        file_indices: Vec<FileIndex>,
        wanted: bool,
    ) -> Result<()> {
        let cmd_chan = self.running_cmd_chan(info_hash).await?;
        let (resp, port) = oneshot::channel();
        cmd_chan.send(TorrentCommand::SetFileSelection {
            file_indices,
            wanted,
            resp,
        })?;
        port.await?
    }

    /// Moves the streaming window of a torrent using the streaming
    /// strategy.
    pub async fn set_playback_hint(
        &self,
        info_hash: Sha1Hash,
        piece_index: PieceIndex,
    ) -> Result<()> {
        let cmd_chan = self.running_cmd_chan(info_hash).await?;
        cmd_chan.send(TorrentCommand::SetPlaybackHint { piece_index })?;
        Ok(())
    }

    /// Writes a bencoded description of the registered torrents, for
    /// re-importing into a later engine instance.
    pub async fn export_session_state(&self, path: &Path) -> Result<()> {
        let entries: Vec<SessionExportEntry> = {
            let registry = self.registry.lock().await;
            registry
                .torrents
                .iter()
                .map(|(info_hash, entry)| {
                    let (source, paused) = match entry {
                        TorrentEntry::Running { source, .. } => {
                            (source, false)
                        }
                        TorrentEntry::Paused { source, .. } => (source, true),
                    };
                    let (kind, value) = match source {
                        CheckpointSource::File(path) => (
                            "file".to_string(),
                            path.to_string_lossy().into_owned(),
                        ),
                        CheckpointSource::Magnet(uri) => {
                            ("magnet".to_string(), uri.clone())
                        }
                    };
                    SessionExportEntry {
                        info_hash: serde_bytes::ByteBuf::from(
                            info_hash.to_vec(),
                        ),
                        kind,
                        value,
                        paused: paused as u8,
                    }
                })
                .collect()
        };
        let buf = serde_bencode::to_bytes(&SessionExport { entries })?;
        std::fs::write(path, buf)?;
        Ok(())
    }

    /// Re-adds every torrent recorded by [`export_session_state`], resuming
    /// from checkpoints. Returns the info hashes that were added.
    pub async fn import_session_state(
        &self,
        path: &Path,
    ) -> Result<Vec<Sha1Hash>> {
        let buf = std::fs::read(path)?;
        let export: SessionExport = serde_bencode::from_bytes(&buf)?;
        let mut added = Vec::new();
        for entry in export.entries {
            let result = match entry.kind.as_str() {
                "file" => {
                    let buf = std::fs::read(&entry.value)?;
                    let metainfo = Metainfo::from_bytes(&buf)?;
                    self.add_torrent(AddTorrent {
                        metainfo,
                        source: CheckpointSource::File(entry.value.into()),
                        options: TorrentOptions::default(),
                        rate_limits: RateLimits::default(),
                        resume: true,
                    })
                    .await
                }
                "magnet" => {
                    let magnet = MagnetUri::parse(&entry.value)?;
                    self.add_magnet(
                        &magnet,
                        TorrentOptions::default(),
                        RateLimits::default(),
                        true,
                    )
                    .await
                }
                _ => Err(Error::InvalidCheckpoint(
                    "unknown torrent source kind",
                )),
            };
            match result {
                Ok(info_hash) => {
                    added.push(info_hash);
                    if entry.paused != 0 {
                        let _ = self.pause(info_hash).await;
                    }
                }
                Err(Error::AlreadyExists) => {}
                Err(e) => {
                    log::warn!("Failed to import a session entry: {}", e)
                }
            }
        }
        Ok(added)
    }

    /// Stops every torrent (checkpointing them), the background loops, the
    /// DHT, and the disk task.
    pub async fn shutdown(&self) -> Result<()> {
        self.stopping.store(true, Ordering::Relaxed);
        if let Ok(mut slot) = self.accept_shutdown.lock() {
            if let Some(chan) = slot.take() {
                let _ = chan.send(());
            }
        }

        let cmd_chans: Vec<UnboundedSender<TorrentCommand>> = {
            let registry = self.registry.lock().await;
            registry
                .torrents
                .values()
                .filter_map(|entry| match entry {
                    TorrentEntry::Running { cmd_chan, .. } => {
                        Some(cmd_chan.clone())
                    }
                    TorrentEntry::Paused { .. } => None,
                })
                .collect()
        };
        for cmd_chan in cmd_chans {
            let (resp, port) = oneshot::channel();
            if cmd_chan
                .send(TorrentCommand::Shutdown {
                    mode: StopMode::Stop,
                    resp,
                })
                .is_ok()
            {
                let _ = port.await;
            }
        }

        if let Some(dht) = &self.dht {
            dht.shutdown();
        }
        self.disk.shutdown()?;
        Ok(())
    }

    fn spawn_torrent(
        &self,
        metainfo: Metainfo,
        options: &TorrentOptions,
        rate_limits: RateLimits,
        source: CheckpointSource,
        checkpoint: Option<Checkpoint>,
    ) -> UnboundedSender<TorrentCommand> {
        let id: TorrentId =
            self.next_torrent_id.fetch_add(1, Ordering::Relaxed);
        let mut conf = self.conf.torrent.with_options(options);
        // private torrents never gossip peers
        if metainfo.is_private {
            conf.enable_pex = false;
        }
        let dht = if metainfo.is_private {
            None
        } else {
            self.dht.clone()
        };
        let (mut torrent, cmd_chan) = Torrent::new(TorrentParams {
            id,
            metainfo,
            conf,
            client_id: self.conf.engine.client_id,
            listen_port: self.listen_port,
            disk: self.disk.clone(),
            tracker_client: self.tracker_client.clone(),
            dht,
            checkpoint_store: self.checkpoint_store.clone(),
            source,
            options: options.clone(),
            rate_limits,
            ip_filter: Arc::clone(&self.ip_filter),
            resume: checkpoint,
            global_peer_count: Arc::clone(&self.global_peer_count),
            max_global_peers: self.conf.engine.max_global_peers,
        });
        tokio::task::spawn(async move {
            torrent.start().await;
        });
        cmd_chan
    }

    async fn running_cmd_chan(
        &self,
        info_hash: Sha1Hash,
    ) -> Result<UnboundedSender<TorrentCommand>> {
        let registry = self.registry.lock().await;
        match registry.torrents.get(&info_hash) {
            Some(TorrentEntry::Running { cmd_chan, .. }) => {
                Ok(cmd_chan.clone())
            }
            Some(TorrentEntry::Paused { .. }) => {
                Err(Error::TorrentNotFound)
            }
            None => Err(Error::TorrentNotFound),
        }
    }

    async fn query_status(
        cmd_chan: &UnboundedSender<TorrentCommand>,
    ) -> Result<TorrentStatus> {
        let (resp, port) = oneshot::channel();
        cmd_chan.send(TorrentCommand::Status { resp })?;
        Ok(port.await?)
    }

    /// Synthesizes the status of a paused torrent from its registry entry
    /// and checkpoint.
    async fn paused_status(
        &self,
        info_hash: Sha1Hash,
    ) -> Option<TorrentStatus> {
        let (name, rate_limits, piece_count, total_len) = {
            let registry = self.registry.lock().await;
            match registry.torrents.get(&info_hash)? {
                TorrentEntry::Paused {
                    metainfo,
                    rate_limits,
                    ..
                } => (
                    metainfo.name.clone(),
                    *rate_limits,
                    metainfo.piece_count(),
                    metainfo.download_len(),
                ),
                TorrentEntry::Running { .. } => return None,
            }
        };
        let verified_piece_count = self
            .checkpoint_store
            .load(&info_hash)
            .ok()
            .flatten()
            .map(|checkpoint| checkpoint.verified_pieces.len())
            .unwrap_or(0);
        Some(TorrentStatus {
            info_hash,
            name,
            state: TorrentState::Paused,
            piece_count,
            verified_piece_count,
            total_len,
            downloaded_payload: 0,
            uploaded_payload: 0,
            download_rate: 0,
            upload_rate: 0,
            peer_count: 0,
            is_complete: verified_piece_count == piece_count,
            rate_limits,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct SessionExport {
    entries: Vec<SessionExportEntry>,
}

#[derive(Serialize, Deserialize)]
struct SessionExportEntry {
    info_hash: serde_bytes::ByteBuf,
    kind: String,
    value: String,
    paused: u8,
}

/// The accept loop: every accepted stream gets a task that reads the
/// handshake and dispatches the connection to the torrent it names.
async fn run_accept_loop(
    mut listener: TcpListener,
    registry: Arc<Mutex<Registry>>,
    shutdown_port: oneshot::Receiver<()>,
) {
    let mut shutdown_port = shutdown_port.fuse();
    loop {
        select! {
            result = listener.accept().fuse() => {
                match result {
                    Ok((socket, addr)) => {
                        log::debug!("Incoming connection from {}", addr);
                        let registry = Arc::clone(&registry);
                        tokio::task::spawn(async move {
                            if let Err(e) =
                                dispatch_incoming(socket, registry).await
                            {
                                log::debug!(
                                    "Incoming peer {} rejected: {}",
                                    addr,
                                    e
                                );
                            }
                        });
                    }
                    Err(e) => {
                        // per-connection accept errors are transient
                        log::warn!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_port => {
                log::info!("Shutting down accept loop");
                break;
            }
        }
    }
}

/// Reads the handshake off an accepted stream and routes the connection to
/// the torrent with the matching info hash. Unknown info hashes drop the
/// connection.
async fn dispatch_incoming(
    socket: TcpStream,
    registry: Arc<Mutex<Registry>>,
) -> Result<()> {
    let mut framed = Framed::new(socket, HandshakeCodec);
    let handshake: Handshake =
        match timeout(INCOMING_HANDSHAKE_TIMEOUT, framed.next()).await? {
            Some(handshake) => handshake?,
            None => {
                return Err(Error::ProtocolViolation(
                    "connection closed before handshake",
                ))
            }
        };

    let cmd_chan = {
        let registry = registry.lock().await;
        match registry.torrents.get(&handshake.info_hash) {
            Some(TorrentEntry::Running { cmd_chan, .. }) => cmd_chan.clone(),
            _ => return Err(Error::TorrentNotFound),
        }
    };

    let parts = framed.into_parts();
    cmd_chan.send(TorrentCommand::IncomingPeer {
        socket: parts.io,
        handshake,
        read_buf: parts.read_buf,
    })?;
    Ok(())
}

/// Renews NAT mappings that are due.
async fn run_cleanup_loop(
    nat: Option<Arc<Mutex<NatManager>>>,
    stopping: Arc<AtomicBool>,
    cleanup_interval: Duration,
) {
    let mut tick = interval(cleanup_interval);
    loop {
        tick.next().await;
        if stopping.load(Ordering::Relaxed) {
            break;
        }
        if let Some(nat) = &nat {
            nat.lock().await.refresh_due().await;
        }
    }
}

/// Logs aggregated engine metrics.
async fn run_metrics_loop(
    registry: Arc<Mutex<Registry>>,
    stopping: Arc<AtomicBool>,
    global_peer_count: Arc<AtomicUsize>,
    metrics_interval: Duration,
) {
    let mut tick = interval(metrics_interval);
    loop {
        tick.next().await;
        if stopping.load(Ordering::Relaxed) {
            break;
        }
        let (torrent_count, paused_count) = {
            let registry = registry.lock().await;
            let paused = registry
                .torrents
                .values()
                .filter(|entry| {
                    matches!(entry, TorrentEntry::Paused { .. })
                })
                .count();
            (registry.torrents.len(), paused)
        };
        log::info!(
            "engine metrics: {} torrents ({} paused), {} peers",
            torrent_count,
            paused_count,
            global_peer_count.load(Ordering::Relaxed),
        );
    }
}

/// Periodically scrapes every running torrent's trackers so swarm counts in
/// status output stay fresh.
async fn run_auto_scrape_loop(
    registry: Arc<Mutex<Registry>>,
    stopping: Arc<AtomicBool>,
    scrape_interval: Duration,
) {
    let mut tick = interval(scrape_interval);
    loop {
        tick.next().await;
        if stopping.load(Ordering::Relaxed) {
            break;
        }
        let cmd_chans: Vec<UnboundedSender<TorrentCommand>> = {
            let registry = registry.lock().await;
            registry
                .torrents
                .values()
                .filter_map(|entry| match entry {
                    TorrentEntry::Running { cmd_chan, .. } => {
                        Some(cmd_chan.clone())
                    }
                    TorrentEntry::Paused { .. } => None,
                })
                .collect()
        };
        for cmd_chan in cmd_chans {
            let (resp, port) = oneshot::channel();
            if cmd_chan
                .send(TorrentCommand::ForceScrape { resp })
                .is_err()
            {
                continue;
            }
            match port.await {
                Ok(Ok(stats)) => {
                    log::debug!(
                        "auto-scrape: {} seeders, {} leechers",
                        stats.seeders,
                        stats.leechers
                    );
                }
                Ok(Err(e)) => log::debug!("auto-scrape failed: {}", e),
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info_hash_hex() {
        let hex_str = "aa".repeat(20);
        assert_eq!(parse_info_hash_hex(&hex_str).unwrap(), [0xaa; 20]);
        assert_eq!(
            parse_info_hash_hex(&format!("  {}  ", hex_str)).unwrap(),
            [0xaa; 20]
        );

        // short, long, and non-hex inputs are rejected at the boundary, not
        // padded
        assert!(matches!(
            parse_info_hash_hex("abcd"),
            Err(Error::InvalidInfoHashLength(2))
        ));
        assert!(parse_info_hash_hex(&"aa".repeat(21)).is_err());
        assert!(parse_info_hash_hex(&"zz".repeat(20)).is_err());
    }
}
