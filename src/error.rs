//! The error type used by all parts of the engine.

use std::fmt;

use crate::PeerSource;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by the engine's fallible operations.
///
/// Errors originating inside a peer session or a tracker request are caught at
/// that task's boundary and turned into state transitions; only errors from
/// administrative calls (`add_torrent` and friends) surface to the caller.
#[derive(Debug)]
pub enum Error {
    /// A bencode encode or decode failure.
    Bencode(serde_bencode::Error),
    /// The mpsc channel on which some component was listening or sending died.
    ChannelClosed,
    /// A torrent with the same info hash is already managed by the engine.
    AlreadyExists,
    /// The torrent is not registered in the engine.
    TorrentNotFound,
    /// An info hash presented at an API boundary did not have 20 bytes. The
    /// offending length is carried for the diagnostic.
    InvalidInfoHashLength(usize),
    /// The torrent metainfo is not valid.
    InvalidMetainfo(&'static str),
    /// The magnet URI could not be parsed.
    InvalidMagnet(&'static str),
    /// The checkpoint failed boundary validation and was rejected.
    InvalidCheckpoint(&'static str),
    /// An IP filter entry could not be parsed.
    InvalidIpFilter(&'static str),
    /// The peer's handshake advertised a different info hash than the
    /// torrent's.
    InvalidPeerInfoHash,
    /// An operation was given an out of bounds piece index.
    InvalidPieceIndex,
    /// An operation was given a block whose offset or length does not fit its
    /// piece.
    InvalidBlockInfo,
    /// The peer violated the wire protocol (malformed message, wrong size
    /// bitfield, bitfield not directly after the handshake, etc). The peer is
    /// disconnected.
    ProtocolViolation(&'static str),
    /// A discovery subsystem handed a peer to a private torrent from a source
    /// that BEP 27 forbids.
    PrivateTorrentPeerSource {
        source: PeerSource,
    },
    /// The per-torrent or global peer cap is reached, the connection is not
    /// accepted.
    PeerLimitReached,
    /// A network operation did not complete within its (possibly adaptive)
    /// timeout.
    Timeout,
    /// Binding a required listening socket failed at startup. Fatal.
    PortBind {
        port: u16,
        source: std::io::Error,
    },
    /// The tracker returned a failure reason in its response.
    Tracker(String),
    /// The tracker's announce URL does not support scraping (its last path
    /// segment does not begin with `/announce`).
    ScrapeUnsupported,
    /// An HTTP request to a tracker failed at the transport level.
    Http(reqwest::Error),
    /// The DHT is disabled or has not been bootstrapped.
    DhtUnavailable,
    /// Fetching the metadata of a magnet download failed.
    MetadataFetch(&'static str),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
            Self::ChannelClosed => write!(f, "internal channel closed"),
            Self::AlreadyExists => {
                write!(f, "torrent with this info hash already exists")
            }
            Self::TorrentNotFound => write!(f, "torrent not found"),
            Self::InvalidInfoHashLength(len) => {
                write!(f, "info hash must be 20 bytes, got {}", len)
            }
            Self::InvalidMetainfo(reason) => {
                write!(f, "invalid metainfo: {}", reason)
            }
            Self::InvalidMagnet(reason) => {
                write!(f, "invalid magnet URI: {}", reason)
            }
            Self::InvalidCheckpoint(reason) => {
                write!(f, "invalid checkpoint: {}", reason)
            }
            Self::InvalidIpFilter(reason) => {
                write!(f, "invalid IP filter entry: {}", reason)
            }
            Self::InvalidPeerInfoHash => {
                write!(f, "peer handshake contained wrong info hash")
            }
            Self::InvalidPieceIndex => write!(f, "piece index out of bounds"),
            Self::InvalidBlockInfo => write!(f, "block does not fit piece"),
            Self::ProtocolViolation(reason) => {
                write!(f, "peer protocol violation: {}", reason)
            }
            Self::PrivateTorrentPeerSource { source } => write!(
                f,
                "peer source {} is not allowed for a private torrent",
                source
            ),
            Self::PeerLimitReached => write!(f, "peer limit reached"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::PortBind { port, source } => {
                write!(f, "failed to bind port {}: {}", port, source)
            }
            Self::Tracker(reason) => write!(f, "tracker failure: {}", reason),
            Self::ScrapeUnsupported => {
                write!(f, "tracker does not support scraping")
            }
            Self::Http(e) => write!(f, "http error: {}", e),
            Self::DhtUnavailable => write!(f, "DHT is not available"),
            Self::MetadataFetch(reason) => {
                write!(f, "metadata fetch failed: {}", reason)
            }
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Self::Timeout
    }
}
