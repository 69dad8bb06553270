//! This module defines types used to configure the engine and its parts.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::{piece_picker::Strategy, PeerId};

/// The fixed client id prefix announced to trackers and peers, per the azureus
/// style convention (BEP 20). The remaining 12 bytes are random.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-CC0101-";

/// Generates a new peer id: the client prefix followed by 12 random bytes.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    for b in id[8..].iter_mut() {
        *b = rand::random();
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        Self {
            engine: EngineConf::new(&download_dir),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The address on which the TCP listener accepts incoming peer
    /// connections. Binding this port is required; failure is fatal.
    pub listen_addr: SocketAddr,
    /// The local port of the single UDP socket shared by all UDP tracker
    /// exchanges. Port 0 lets the OS pick one.
    pub udp_tracker_port: u16,
    /// Whether to run the mainline DHT node.
    pub enable_dht: bool,
    /// The UDP port on which the DHT node listens.
    pub dht_port: u16,
    /// Well known nodes contacted to fill the routing table on startup.
    pub dht_routers: Vec<String>,
    /// Whether to request NAT port mappings (NAT-PMP first, then UPnP) for
    /// the listen, DHT, and UDP tracker ports. Best effort.
    pub enable_nat: bool,
    /// An explicit gateway address for NAT-PMP, when the default probes are
    /// not appropriate.
    pub nat_gateway: Option<Ipv4Addr>,
    /// The directory in which checkpoints and the persisted DHT node id are
    /// kept.
    pub state_dir: PathBuf,
    /// The number of peer connections allowed across all torrents.
    pub max_global_peers: usize,
    /// CIDR ranges (or bare addresses) peers must match to be allowed. An
    /// empty list allows everything not denied.
    pub ip_allow_list: Vec<String>,
    /// CIDR ranges (or bare addresses) that are never connected or accepted.
    /// Deny wins over allow.
    pub ip_deny_list: Vec<String>,
    /// How often the engine scrapes the trackers of running torrents for
    /// swarm statistics. `None` disables auto-scraping.
    pub auto_scrape_interval: Option<Duration>,
    /// How often the engine sweeps its bookkeeping (circuit breaker entries,
    /// finished checkpoint backups).
    pub cleanup_interval: Duration,
    /// How often aggregated engine metrics are logged.
    pub metrics_interval: Duration,
}

impl EngineConf {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id: generate_peer_id(),
            listen_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                51413,
            ),
            udp_tracker_port: 0,
            enable_dht: true,
            dht_port: 6881,
            dht_routers: vec![
                "router.bittorrent.com:6881".into(),
                "dht.transmissionbt.com:6881".into(),
                "router.utorrent.com:6881".into(),
            ],
            enable_nat: true,
            nat_gateway: None,
            state_dir: state_dir.into(),
            max_global_peers: 500,
            ip_allow_list: Vec::new(),
            ip_deny_list: Vec::new(),
            auto_scrape_interval: Some(Duration::from_secs(30 * 60)),
            cleanup_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override fields via [`TorrentOptions`]. Overrides
/// are applied to a copy at torrent creation; the shared configuration is
/// never mutated.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide an announce interval, we default to
    /// announcing this often.
    pub announce_interval: Duration,

    /// Tracker-provided intervals are clamped into this range.
    pub min_announce_interval: Duration,
    pub max_announce_interval: Duration,

    /// After this many attempts, a tracker entry within a tier is demoted.
    pub tracker_error_threshold: usize,

    /// The number of upload slots filled by the regular tit-for-tat choke
    /// round.
    pub max_upload_slots: usize,

    /// How often the choke round ranks interested peers and rotates the
    /// upload slots.
    pub unchoke_interval: Duration,

    /// How often the additional optimistic slot is rotated to a random
    /// interested peer.
    pub optimistic_unchoke_interval: Duration,

    /// Whether the request pipeline depth follows the link's
    /// bandwidth-delay product. When false, `pipeline_depth` is used as is.
    pub adaptive_pipeline: bool,
    /// The fixed request queue size used when the adaptive pipeline is off.
    pub pipeline_depth: usize,
    /// Bounds for the adaptive request queue size.
    pub pipeline_min_depth: usize,
    pub pipeline_max_depth: usize,

    /// The base timeout for establishing a connection and exchanging
    /// handshakes with a peer. Scaled up by the adaptive timeout when the
    /// torrent has few active peers.
    pub handshake_timeout: Duration,

    /// The base timeout after which an unanswered block request is cancelled
    /// and requeued. Scaled up by the adaptive timeout when the torrent has
    /// few active peers.
    pub request_timeout: Duration,

    /// After this many timed out requests in a row, a peer counts as snubbing
    /// us and is disconnected.
    pub snub_threshold: u32,

    /// When fewer than this many pieces are still missing or downloading, the
    /// torrent enters endgame mode and duplicates outstanding requests across
    /// peers.
    pub endgame_threshold: usize,

    /// The piece selection strategy the torrent starts with.
    pub strategy: Strategy,

    /// The size of the sliding window used by the streaming strategy.
    pub sequential_window_size: usize,

    /// How often each peer is sent a `ut_pex` delta of peers we gained and
    /// lost.
    pub pex_interval: Duration,
    /// Whether PEX runs at all. Forced off for private torrents.
    pub enable_pex: bool,

    /// How often a checkpoint of the torrent's progress is written.
    pub checkpoint_interval: Duration,
    /// Whether a checkpoint is additionally written after every verified
    /// piece.
    pub checkpoint_on_piece: bool,

    /// How many verified pieces are kept decoded in the disk task's read
    /// cache for serving uploads.
    pub read_cache_size: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(30 * 60),
            min_announce_interval: Duration::from_secs(60),
            max_announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
            max_upload_slots: 4,
            unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(20),
            adaptive_pipeline: true,
            pipeline_depth: 4,
            pipeline_min_depth: 2,
            pipeline_max_depth: 50,
            request_timeout: Duration::from_secs(20),
            snub_threshold: 3,
            endgame_threshold: 3,
            strategy: Strategy::RarestFirst,
            sequential_window_size: 8,
            pex_interval: Duration::from_secs(60),
            enable_pex: true,
            checkpoint_interval: Duration::from_secs(60),
            checkpoint_on_piece: false,
            read_cache_size: 64,
        }
    }

    /// Returns a copy of this configuration with the given per-torrent
    /// overrides applied.
    pub fn with_options(&self, options: &TorrentOptions) -> Self {
        let mut conf = self.clone();
        if let Some(dir) = &options.download_dir {
            conf.download_dir = dir.clone();
        }
        if let Some(count) = options.max_connected_peer_count {
            conf.max_connected_peer_count = count;
        }
        if let Some(strategy) = options.strategy {
            conf.strategy = strategy;
        }
        if let Some(enable) = options.enable_pex {
            conf.enable_pex = enable;
        }
        if let Some(interval) = options.checkpoint_interval {
            conf.checkpoint_interval = interval;
        }
        conf
    }
}

/// Per-torrent overrides of [`TorrentConf`] fields, applied to a copy of the
/// global configuration when the torrent is created.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TorrentOptions {
    pub download_dir: Option<PathBuf>,
    pub max_connected_peer_count: Option<usize>,
    pub strategy: Option<Strategy>,
    pub enable_pex: Option<bool>,
    pub checkpoint_interval: Option<Duration>,
}

/// Download and upload caps in KiB/s. Carried in options and checkpoints and
/// surfaced in status; enforcement at the IO layer is a future feature.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RateLimits {
    pub down_kib: Option<u64>,
    pub up_kib: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn test_options_override_copy_not_shared_conf() {
        let conf = TorrentConf::new("/tmp/downloads");
        let options = TorrentOptions {
            max_connected_peer_count: Some(5),
            enable_pex: Some(false),
            ..Default::default()
        };
        let effective = conf.with_options(&options);
        assert_eq!(effective.max_connected_peer_count, 5);
        assert!(!effective.enable_pex);
        // the shared configuration is untouched
        assert_eq!(conf.max_connected_peer_count, 50);
        assert!(conf.enable_pex);
    }
}
