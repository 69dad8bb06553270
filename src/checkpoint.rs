//! Checkpoints: the bencoded resume snapshots of a torrent's progress.
//!
//! A checkpoint is written periodically, on pause/stop, and (optionally)
//! after every verified piece. Writes are atomic (temp file then rename).
//! On resume a checkpoint is validated at the boundary before any of it
//! reaches engine state, and the pieces it claims verified are re-hashed
//! from disk.

use std::{
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use serde_bytes::ByteBuf;

use crate::{
    conf::{RateLimits, TorrentOptions},
    error::*,
    piece_picker::{PieceState, Strategy},
    PieceIndex, Sha1Hash,
};

/// Bumped whenever the checkpoint format changes incompatibly; older
/// versions are rejected at the boundary.
const CHECKPOINT_VERSION: i64 = 1;

const FILE_EXTENSION: &str = "resume";

/// What a torrent was created from. Exactly one of the two; checkpoints
/// carrying neither (or an unknown kind) are rejected.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckpointSource {
    /// The path of the `.torrent` file.
    File(PathBuf),
    /// The magnet URI.
    Magnet(String),
}

/// A validated, serializable snapshot of a torrent session.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub info_hash: Sha1Hash,
    pub name: String,
    pub total_pieces: u32,
    pub piece_len: u32,
    pub total_len: u64,
    /// The indices of verified pieces, sorted ascending.
    pub verified_pieces: Vec<u32>,
    /// One state per piece. In-flight downloads are recorded as missing, so
    /// a resumed session re-requests them.
    pub piece_states: Vec<PieceState>,
    /// Unix timestamps, seconds.
    pub created_at: i64,
    pub updated_at: i64,
    pub output_dir: PathBuf,
    pub source: CheckpointSource,
    pub announce_urls: Vec<String>,
    pub display_name: Option<String>,
    pub options: TorrentOptions,
    pub rate_limits: RateLimits,
}

impl Checkpoint {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw = RawCheckpoint::from(self);
        Ok(serde_bencode::to_bytes(&raw)?)
    }

    /// Decodes and validates a checkpoint. Nothing invalid makes it past
    /// this boundary.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let raw: RawCheckpoint = serde_bencode::from_bytes(buf)?;
        Checkpoint::try_from_raw(raw)
    }

    fn try_from_raw(raw: RawCheckpoint) -> Result<Self> {
        if raw.version != CHECKPOINT_VERSION {
            return Err(Error::InvalidCheckpoint("unsupported version"));
        }
        if raw.info_hash.len() != 20 {
            return Err(Error::InvalidCheckpoint(
                "info hash is not 20 bytes",
            ));
        }
        if raw.piece_len == 0 {
            return Err(Error::InvalidCheckpoint("zero piece length"));
        }
        if raw.piece_states.len() != raw.total_pieces as usize {
            return Err(Error::InvalidCheckpoint(
                "piece state map does not cover all pieces",
            ));
        }
        if raw.verified_pieces.len() > raw.total_pieces as usize {
            return Err(Error::InvalidCheckpoint(
                "more verified pieces than pieces",
            ));
        }
        if raw
            .verified_pieces
            .iter()
            .any(|&index| index >= raw.total_pieces)
        {
            return Err(Error::InvalidCheckpoint(
                "verified piece index out of range",
            ));
        }

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&raw.info_hash);

        let piece_states = raw
            .piece_states
            .iter()
            .map(|&state| decode_piece_state(state))
            .collect::<Result<Vec<_>>>()?;

        let source = match raw.source.kind.as_str() {
            "file" => CheckpointSource::File(PathBuf::from(&raw.source.value)),
            "magnet" => CheckpointSource::Magnet(raw.source.value),
            _ => {
                return Err(Error::InvalidCheckpoint(
                    "unknown torrent source kind",
                ))
            }
        };

        let mut verified_pieces = raw.verified_pieces;
        verified_pieces.sort_unstable();

        Ok(Self {
            info_hash,
            name: raw.name,
            total_pieces: raw.total_pieces,
            piece_len: raw.piece_len,
            total_len: raw.total_len,
            verified_pieces,
            piece_states,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            output_dir: PathBuf::from(raw.output_dir),
            source,
            announce_urls: raw.announce_urls,
            display_name: raw.display_name,
            options: TorrentOptions {
                download_dir: raw.options.download_dir.map(PathBuf::from),
                max_connected_peer_count: raw
                    .options
                    .max_connected_peer_count
                    .map(|count| count as usize),
                strategy: raw
                    .options
                    .strategy
                    .as_deref()
                    .and_then(Strategy::from_name),
                enable_pex: raw.options.enable_pex.map(|flag| flag != 0),
                checkpoint_interval: raw
                    .options
                    .checkpoint_interval_secs
                    .map(std::time::Duration::from_secs),
            },
            rate_limits: RateLimits {
                down_kib: raw.rate_limits.down_kib,
                up_kib: raw.rate_limits.up_kib,
            },
        })
    }

    /// The verified piece indices as `usize`, for the piece picker.
    pub fn verified_piece_indices(&self) -> Vec<PieceIndex> {
        self.verified_pieces
            .iter()
            .map(|&index| index as PieceIndex)
            .collect()
    }
}

fn decode_piece_state(state: u8) -> Result<PieceState> {
    match state {
        0 => Ok(PieceState::Missing),
        1 => Ok(PieceState::Downloading),
        2 => Ok(PieceState::Verified),
        3 => Ok(PieceState::Failed),
        _ => Err(Error::InvalidCheckpoint("invalid piece state")),
    }
}

fn encode_piece_state(state: PieceState) -> u8 {
    match state {
        PieceState::Missing => 0,
        PieceState::Downloading => 1,
        PieceState::Verified => 2,
        PieceState::Failed => 3,
    }
}

/// The current unix time in seconds, for checkpoint timestamps.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// The on-disk store of checkpoints: one `<info-hash-hex>.resume` file per
/// torrent in the engine's state directory.
#[derive(Clone, Debug)]
pub(crate) struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, info_hash: &Sha1Hash) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hex::encode(info_hash), FILE_EXTENSION))
    }

    /// Atomically writes the checkpoint: the bytes land in a temp file that
    /// is renamed over the final path, so a crash never leaves a truncated
    /// checkpoint behind.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let buf = checkpoint.encode()?;
        let path = self.path_for(&checkpoint.info_hash);
        let tmp_path = path.with_extension("resume.tmp");
        fs::write(&tmp_path, &buf)?;
        fs::rename(&tmp_path, &path)?;
        log::debug!(
            "Saved checkpoint for {} ({} verified pieces)",
            checkpoint.name,
            checkpoint.verified_pieces.len()
        );
        Ok(())
    }

    /// Loads the checkpoint for the info hash, or `None` when there is no
    /// checkpoint. Invalid checkpoints are an error, not silently ignored.
    pub fn load(&self, info_hash: &Sha1Hash) -> Result<Option<Checkpoint>> {
        let path = self.path_for(info_hash);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let checkpoint = Checkpoint::decode(&buf)?;
        if checkpoint.info_hash != *info_hash {
            return Err(Error::InvalidCheckpoint(
                "checkpoint file holds a different torrent",
            ));
        }
        Ok(Some(checkpoint))
    }

    pub fn delete(&self, info_hash: &Sha1Hash) -> Result<bool> {
        match fs::remove_file(self.path_for(info_hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Every decodable checkpoint in the store; corrupt files are logged and
    /// skipped so one bad checkpoint doesn't hide the rest.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str())
                != Some(FILE_EXTENSION)
            {
                continue;
            }
            match fs::read(&path).map_err(Error::Io).and_then(|buf| {
                Checkpoint::decode(&buf)
            }) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => {
                    log::warn!(
                        "Skipping unreadable checkpoint {:?}: {}",
                        path,
                        e
                    );
                }
            }
        }
        Ok(checkpoints)
    }

    /// The first checkpoint whose torrent name matches.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|checkpoint| checkpoint.name == name))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawCheckpoint {
    version: i64,
    info_hash: ByteBuf,
    name: String,
    total_pieces: u32,
    piece_len: u32,
    total_len: u64,
    verified_pieces: Vec<u32>,
    piece_states: ByteBuf,
    created_at: i64,
    updated_at: i64,
    output_dir: String,
    source: RawSource,
    announce_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    options: RawOptions,
    rate_limits: RawRateLimits,
}

impl From<&Checkpoint> for RawCheckpoint {
    fn from(checkpoint: &Checkpoint) -> Self {
        let mut verified_pieces = checkpoint.verified_pieces.clone();
        verified_pieces.sort_unstable();
        let (kind, value) = match &checkpoint.source {
            CheckpointSource::File(path) => {
                ("file", path.to_string_lossy().into_owned())
            }
            CheckpointSource::Magnet(uri) => ("magnet", uri.clone()),
        };
        Self {
            version: CHECKPOINT_VERSION,
            info_hash: ByteBuf::from(checkpoint.info_hash.to_vec()),
            name: checkpoint.name.clone(),
            total_pieces: checkpoint.total_pieces,
            piece_len: checkpoint.piece_len,
            total_len: checkpoint.total_len,
            verified_pieces,
            piece_states: ByteBuf::from(
                checkpoint
                    .piece_states
                    .iter()
                    .map(|&state| encode_piece_state(state))
                    .collect::<Vec<u8>>(),
            ),
            created_at: checkpoint.created_at,
            updated_at: checkpoint.updated_at,
            output_dir: checkpoint
                .output_dir
                .to_string_lossy()
                .into_owned(),
            source: RawSource {
                kind: kind.into(),
                value,
            },
            announce_urls: checkpoint.announce_urls.clone(),
            display_name: checkpoint.display_name.clone(),
            options: RawOptions {
                download_dir: checkpoint
                    .options
                    .download_dir
                    .as_ref()
                    .map(|dir| dir.to_string_lossy().into_owned()),
                max_connected_peer_count: checkpoint
                    .options
                    .max_connected_peer_count
                    .map(|count| count as u64),
                strategy: checkpoint
                    .options
                    .strategy
                    .map(|strategy| strategy.name().to_string()),
                enable_pex: checkpoint
                    .options
                    .enable_pex
                    .map(|flag| flag as u8),
                checkpoint_interval_secs: checkpoint
                    .options
                    .checkpoint_interval
                    .map(|interval| interval.as_secs()),
            },
            rate_limits: RawRateLimits {
                down_kib: checkpoint.rate_limits.down_kib,
                up_kib: checkpoint.rate_limits.up_kib,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawSource {
    kind: String,
    value: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    download_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_connected_peer_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_pex: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checkpoint_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawRateLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    down_kib: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    up_kib: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            info_hash: [0xab; 20],
            name: "test torrent".into(),
            total_pieces: 8,
            piece_len: 0x4000,
            total_len: 8 * 0x4000,
            verified_pieces: vec![0, 2, 5],
            piece_states: vec![
                PieceState::Verified,
                PieceState::Missing,
                PieceState::Verified,
                PieceState::Missing,
                PieceState::Missing,
                PieceState::Verified,
                PieceState::Failed,
                PieceState::Missing,
            ],
            created_at: 1_600_000_000,
            updated_at: 1_600_000_060,
            output_dir: PathBuf::from("/downloads"),
            source: CheckpointSource::File(PathBuf::from("/torrents/a.torrent")),
            announce_urls: vec!["http://t.test/announce".into()],
            display_name: Some("display".into()),
            options: TorrentOptions {
                max_connected_peer_count: Some(25),
                strategy: Some(Strategy::Sequential),
                enable_pex: Some(false),
                ..Default::default()
            },
            rate_limits: RateLimits {
                down_kib: Some(512),
                up_kib: None,
            },
        }
    }

    fn test_store() -> CheckpointStore {
        let dir = std::env::temp_dir()
            .join("crabtorrent-test")
            .join(format!("checkpoints-{}", rand::random::<u32>()));
        CheckpointStore::new(dir).unwrap()
    }

    #[test]
    fn test_roundtrip_identity() {
        let original = checkpoint();
        let decoded = Checkpoint::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_magnet_source_roundtrip() {
        let mut original = checkpoint();
        original.source =
            CheckpointSource::Magnet("magnet:?xt=urn:btih:abc".into());
        let decoded = Checkpoint::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded.source, original.source);
    }

    #[test]
    fn test_rejects_out_of_range_verified_index() {
        let mut bad = checkpoint();
        bad.verified_pieces = vec![0, 99];
        let buf = bad.encode().unwrap();
        assert!(matches!(
            Checkpoint::decode(&buf),
            Err(Error::InvalidCheckpoint(_))
        ));
    }

    #[test]
    fn test_rejects_zero_piece_len() {
        let mut bad = checkpoint();
        bad.piece_len = 0;
        let buf = bad.encode().unwrap();
        assert!(matches!(
            Checkpoint::decode(&buf),
            Err(Error::InvalidCheckpoint(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_info_hash_length() {
        let mut raw = RawCheckpoint::from(&checkpoint());
        raw.info_hash = ByteBuf::from(vec![1, 2, 3]);
        let buf = serde_bencode::to_bytes(&raw).unwrap();
        assert!(matches!(
            Checkpoint::decode(&buf),
            Err(Error::InvalidCheckpoint(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_source_kind() {
        let mut raw = RawCheckpoint::from(&checkpoint());
        raw.source = RawSource {
            kind: "legacy".into(),
            value: "".into(),
        };
        let buf = serde_bencode::to_bytes(&raw).unwrap();
        assert!(matches!(
            Checkpoint::decode(&buf),
            Err(Error::InvalidCheckpoint(_))
        ));
    }

    #[test]
    fn test_store_save_load_delete() {
        let store = test_store();
        let original = checkpoint();

        assert!(store.load(&original.info_hash).unwrap().is_none());
        store.save(&original).unwrap();
        let loaded = store.load(&original.info_hash).unwrap().unwrap();
        assert_eq!(loaded, original);

        // a second save overwrites atomically
        let mut updated = original.clone();
        updated.updated_at += 60;
        updated.verified_pieces.push(7);
        updated.piece_states[7] = PieceState::Verified;
        store.save(&updated).unwrap();
        let loaded = store.load(&original.info_hash).unwrap().unwrap();
        assert_eq!(loaded.updated_at, updated.updated_at);

        assert!(store.delete(&original.info_hash).unwrap());
        assert!(!store.delete(&original.info_hash).unwrap());
        assert!(store.load(&original.info_hash).unwrap().is_none());
    }

    #[test]
    fn test_store_list_and_find() {
        let store = test_store();
        let mut first = checkpoint();
        first.info_hash = [1; 20];
        first.name = "first".into();
        let mut second = checkpoint();
        second.info_hash = [2; 20];
        second.name = "second".into();
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        let mut names: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|checkpoint| checkpoint.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);

        assert_eq!(
            store.find_by_name("second").unwrap().unwrap().info_hash,
            [2; 20]
        );
        assert!(store.find_by_name("third").unwrap().is_none());
    }
}
