//! Parsing and validation of bencoded `.torrent` metainfo (BEP 3), including
//! the tiered announce list (BEP 12) and the private flag (BEP 27).

use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use url::Url;

use crate::{
    error::*,
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// The parsed and validated form of a torrent's metainfo. Created at parse
/// time and immutable for the lifetime of the torrent.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent: the file name for single file torrents, the
    /// root directory name for archives.
    pub name: String,
    /// The SHA-1 hash of the raw info dictionary, identifying the torrent in
    /// every subsystem.
    pub info_hash: Sha1Hash,
    /// The concatenation of each piece's expected 20 byte SHA-1 hash.
    pub pieces: Vec<u8>,
    /// The nominal length of a piece. The last piece may be shorter.
    pub piece_len: u32,
    /// If set, the torrent must not use the DHT, PEX, or local service
    /// discovery (BEP 27).
    pub is_private: bool,
    /// The file system structure of the download.
    pub structure: FsStructure,
    /// Tracker URL tiers in announce order (BEP 12). May be empty for
    /// trackerless (DHT only) torrents.
    pub trackers: Vec<Vec<Url>>,
}

impl Metainfo {
    /// Parses a torrent metainfo file's raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        let trackers = collect_trackers(&raw);
        // The info hash covers the info dictionary's bytes exactly as they
        // appear in the file. Re-encoding the parsed form would drop keys
        // we don't model (md5sum, vendor extensions) and derive a hash no
        // other client, tracker, or DHT node would agree with.
        let info_hash = sha1_digest(raw_info_slice(buf)?);
        Self::build(raw.info, info_hash, trackers)
    }

    /// Builds a metainfo from the raw bytes of an info dictionary alone, as
    /// obtained through the metadata exchange of a magnet download (BEP 9).
    pub fn from_info_bytes(
        info: &[u8],
        trackers: Vec<Vec<Url>>,
    ) -> Result<Self> {
        let raw: RawInfo = serde_bencode::from_bytes(info)?;
        let info_hash = sha1_digest(info);
        Self::build(raw, info_hash, trackers)
    }

    fn build(
        info: RawInfo,
        info_hash: Sha1Hash,
        trackers: Vec<Vec<Url>>,
    ) -> Result<Self> {
        if info.name.is_empty() {
            return Err(Error::InvalidMetainfo("empty name"));
        }
        if info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("zero piece length"));
        }
        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces is not a multiple of 20 bytes",
            ));
        }

        let structure = match (info.length, &info.files) {
            (Some(len), None) => FsStructure::File(FileInfo {
                path: PathBuf::from(&info.name),
                len,
                torrent_offset: 0,
                is_pad: false,
            }),
            (None, Some(files)) if !files.is_empty() => {
                let mut entries = Vec::with_capacity(files.len());
                let mut torrent_offset = 0;
                for file in files {
                    let path = sanitize_path(&file.path)?;
                    let is_pad = file
                        .attr
                        .as_ref()
                        .map(|attr| attr.contains('p'))
                        .unwrap_or(false)
                        || path.starts_with(".pad");
                    entries.push(FileInfo {
                        path,
                        len: file.length,
                        torrent_offset,
                        is_pad,
                    });
                    torrent_offset += file.length;
                }
                FsStructure::Archive { files: entries }
            }
            (Some(_), Some(_)) => {
                return Err(Error::InvalidMetainfo(
                    "both length and files present",
                ));
            }
            _ => {
                return Err(Error::InvalidMetainfo(
                    "neither length nor files present",
                ));
            }
        };

        // the piece hashes must cover the download exactly
        let piece_count = info.pieces.len() / 20;
        let total_len = structure.download_len();
        let covered = info.piece_length as u64 * piece_count as u64;
        if covered < total_len
            || covered >= total_len + info.piece_length as u64
        {
            return Err(Error::InvalidMetainfo(
                "piece count does not cover download length",
            ));
        }

        Ok(Self {
            name: info.name,
            info_hash,
            pieces: info.pieces.into_vec(),
            piece_len: info.piece_length,
            is_private: info.private == Some(1),
            structure,
            trackers,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Returns the expected SHA-1 hash of the piece at the given index.
    pub fn piece_hash(&self, index: usize) -> Result<Sha1Hash> {
        let pos = index * 20;
        if pos + 20 > self.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.pieces[pos..pos + 20]);
        Ok(hash)
    }

    /// The sum of the length of all files in the torrent.
    pub fn download_len(&self) -> u64 {
        self.structure.download_len()
    }

    /// Returns true if the download is for multiple files.
    pub fn is_archive(&self) -> bool {
        self.structure.is_archive()
    }
}

fn sha1_digest(buf: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(buf);
    let mut hash = [0; 20];
    hash.copy_from_slice(&digest);
    hash
}

/// Locates the raw byte span of the top level `info` value within a
/// bencoded torrent file, by walking the outer dictionary's keys without
/// interpreting the values.
fn raw_info_slice(buf: &[u8]) -> Result<&[u8]> {
    if buf.first() != Some(&b'd') {
        return Err(Error::InvalidMetainfo("not a bencoded dictionary"));
    }
    let mut pos = 1;
    while buf.get(pos).map(|b| *b != b'e').unwrap_or(false) {
        // keys are byte strings; compare the key in its encoded form
        let key_len = crate::metadata::bencoded_prefix_len(&buf[pos..])
            .ok_or(Error::InvalidMetainfo("malformed dictionary key"))?;
        let key = &buf[pos..pos + key_len];
        pos += key_len;
        let value_len = crate::metadata::bencoded_prefix_len(&buf[pos..])
            .ok_or(Error::InvalidMetainfo("malformed dictionary value"))?;
        if key == b"4:info" {
            return Ok(&buf[pos..pos + value_len]);
        }
        pos += value_len;
    }
    Err(Error::InvalidMetainfo("no info dictionary"))
}

/// Joins the path components of a file entry, refusing entries that would
/// escape the download directory.
fn sanitize_path(components: &[String]) -> Result<PathBuf> {
    if components.is_empty() {
        return Err(Error::InvalidMetainfo("file with empty path"));
    }
    let mut path = PathBuf::new();
    for component in components {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
        {
            return Err(Error::InvalidMetainfo("unsafe file path component"));
        }
        path.push(component);
    }
    Ok(path)
}

/// Collects the announce URL tiers: the `announce-list` (BEP 12) takes
/// precedence, falling back to the single `announce` key. URLs that fail to
/// parse are skipped with a warning rather than failing the whole torrent.
fn collect_trackers(raw: &RawMetainfo) -> Vec<Vec<Url>> {
    let mut tiers: Vec<Vec<Url>> = Vec::new();
    if let Some(announce_list) = &raw.announce_list {
        for raw_tier in announce_list {
            let tier: Vec<Url> = raw_tier
                .iter()
                .filter_map(|s| match Url::parse(s) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        log::warn!("Skipping invalid tracker URL {}: {}", s, e);
                        None
                    }
                })
                .collect();
            if !tier.is_empty() {
                tiers.push(tier);
            }
        }
    }
    if tiers.is_empty() {
        if let Some(announce) = &raw.announce {
            match Url::parse(announce) {
                Ok(url) => tiers.push(vec![url]),
                Err(e) => {
                    log::warn!(
                        "Skipping invalid tracker URL {}: {}",
                        announce,
                        e
                    );
                }
            }
        }
    }
    tiers
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<RawFile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attr: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // A minimal single file torrent: 2 pieces of 16 KiB covering a 20000
    // byte file.
    fn single_file_torrent() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce28:http://tracker.test/announce4:infod");
        buf.extend_from_slice(b"6:lengthi20000e4:name8:test.bin12:piece lengthi16384e6:pieces40:");
        buf.extend_from_slice(&[0xab; 40]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_single_file() {
        let metainfo = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(metainfo.name, "test.bin");
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_len, 16384);
        assert_eq!(metainfo.download_len(), 20000);
        assert!(!metainfo.is_private);
        assert!(!metainfo.is_archive());
        assert_eq!(metainfo.trackers.len(), 1);
        assert_eq!(
            metainfo.trackers[0][0].as_str(),
            "http://tracker.test/announce"
        );
    }

    #[test]
    fn test_info_hash_covers_info_dict_only() {
        let with_tracker = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        // the same info dict without the outer announce key hashes the same
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(b"6:lengthi20000e4:name8:test.bin12:piece lengthi16384e6:pieces40:");
        buf.extend_from_slice(&[0xab; 40]);
        buf.extend_from_slice(b"ee");
        let without_tracker = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(with_tracker.info_hash, without_tracker.info_hash);
    }

    #[test]
    fn test_info_hash_preserves_unmodeled_keys() {
        // an info dict carrying an md5sum key our model doesn't capture
        let mut info = Vec::new();
        info.extend_from_slice(b"d6:lengthi16384e6:md5sum32:");
        info.extend_from_slice(&[b'a'; 32]);
        info.extend_from_slice(
            b"4:name8:test.bin12:piece lengthi16384e6:pieces20:",
        );
        info.extend_from_slice(&[0xab; 20]);
        info.extend_from_slice(b"e");
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d7:comment4:test4:info");
        buf.extend_from_slice(&info);
        buf.extend_from_slice(b"e");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        // the hash covers the literal info bytes, md5sum included, exactly
        // as every other client computes it
        assert_eq!(metainfo.info_hash, sha1_digest(&info));

        // the same torrent without the extra key hashes differently
        let mut bare = Vec::new();
        bare.extend_from_slice(b"d4:infod6:lengthi16384e4:name8:test.bin12:piece lengthi16384e6:pieces20:");
        bare.extend_from_slice(&[0xab; 20]);
        bare.extend_from_slice(b"ee");
        let bare = Metainfo::from_bytes(&bare).unwrap();
        assert_ne!(metainfo.info_hash, bare.info_hash);
    }

    #[test]
    fn test_piece_hash_lookup() {
        let metainfo = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(metainfo.piece_hash(0).unwrap(), [0xab; 20]);
        assert_eq!(metainfo.piece_hash(1).unwrap(), [0xab; 20]);
        assert!(metainfo.piece_hash(2).is_err());
    }

    #[test]
    fn test_multi_file_offsets_and_private() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(b"5:filesl");
        buf.extend_from_slice(b"d6:lengthi16000e4:pathl5:a.bineed");
        buf.extend_from_slice(b"6:lengthi4000e4:pathl3:sub5:b.bineee");
        buf.extend_from_slice(b"4:name4:dist12:piece lengthi16384e6:pieces40:");
        buf.extend_from_slice(&[0xcd; 40]);
        buf.extend_from_slice(b"7:privatei1e");
        buf.extend_from_slice(b"ee");
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.is_private);
        assert!(metainfo.is_archive());
        match &metainfo.structure {
            FsStructure::Archive { files } => {
                assert_eq!(files.len(), 2);
                assert_eq!(files[0].torrent_offset, 0);
                assert_eq!(files[1].torrent_offset, 16000);
                assert_eq!(files[1].path, PathBuf::from("sub").join("b.bin"));
            }
            _ => panic!("expected archive structure"),
        }
    }

    #[test]
    fn test_rejects_traversal_path() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(b"5:filesl");
        buf.extend_from_slice(b"d6:lengthi16000e4:pathl2:..5:a.bineee");
        buf.extend_from_slice(b"4:name4:dist12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0xcd; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_piece_count() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        // one 16 KiB piece cannot cover 20000 bytes
        buf.extend_from_slice(b"6:lengthi20000e4:name8:test.bin12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0xab; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn test_announce_list_tiers_take_precedence() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce27:http://single.test/announce13:announce-listll27:http://tier1a.test/announce27:http://tier1b.test/announceel27:http://tier2a.test/announceee4:infod");
        buf.extend_from_slice(b"6:lengthi16384e4:name8:test.bin12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0xab; 20]);
        buf.extend_from_slice(b"ee");
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.trackers.len(), 2);
        assert_eq!(metainfo.trackers[0].len(), 2);
        assert_eq!(metainfo.trackers[1].len(), 1);
    }
}
