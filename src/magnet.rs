//! Magnet URI (BEP 9) parsing and construction.
//!
//! Only the BitTorrent info hash form is accepted:
//! `magnet:?xt=urn:btih:<hex-or-base32>[&dn=<name>][&tr=<url>]*`.

use url::Url;

use crate::{error::*, Sha1Hash};

const XT_PREFIX: &str = "urn:btih:";

/// The normalized contents of a magnet link.
#[derive(Clone, Debug, PartialEq)]
pub struct MagnetUri {
    /// The 20 byte info hash the link names.
    pub info_hash: Sha1Hash,
    /// The display name (`dn`), used until the real metadata is fetched.
    pub display_name: Option<String>,
    /// Tracker URLs (`tr`), each forming its own tier.
    pub trackers: Vec<Url>,
}

impl MagnetUri {
    /// Parses a magnet URI string.
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s.trim())
            .map_err(|_| Error::InvalidMagnet("not a valid URI"))?;
        if url.scheme() != "magnet" {
            return Err(Error::InvalidMagnet("scheme is not magnet"));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let encoded = value
                        .strip_prefix(XT_PREFIX)
                        .ok_or(Error::InvalidMagnet("xt is not urn:btih"))?;
                    // a second xt with a different hash is ambiguous
                    let hash = decode_info_hash(encoded)?;
                    if let Some(prev) = info_hash {
                        if prev != hash {
                            return Err(Error::InvalidMagnet(
                                "conflicting xt parameters",
                            ));
                        }
                    }
                    info_hash = Some(hash);
                }
                "dn" => {
                    if !value.is_empty() {
                        display_name = Some(value.into_owned());
                    }
                }
                "tr" => match Url::parse(&value) {
                    Ok(tracker) => trackers.push(tracker),
                    Err(e) => {
                        log::warn!(
                            "Skipping invalid magnet tracker {}: {}",
                            value,
                            e
                        );
                    }
                },
                // x.pe, ws, xs and friends are not supported, skip silently
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash
                .ok_or(Error::InvalidMagnet("missing xt parameter"))?,
            display_name,
            trackers,
        })
    }

    /// Builds the normalized URI form: hex info hash, percent-encoded name
    /// and trackers.
    pub fn to_uri(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair(
            "xt",
            &format!("{}{}", XT_PREFIX, hex::encode(self.info_hash)),
        );
        if let Some(name) = &self.display_name {
            query.append_pair("dn", name);
        }
        for tracker in &self.trackers {
            query.append_pair("tr", tracker.as_str());
        }
        format!("magnet:?{}", query.finish())
    }
}

/// Decodes the info hash component of the `xt` parameter, which is either 40
/// hex characters or 32 base32 characters.
fn decode_info_hash(encoded: &str) -> Result<Sha1Hash> {
    let mut hash = [0; 20];
    match encoded.len() {
        40 => {
            hex::decode_to_slice(encoded, &mut hash)
                .map_err(|_| Error::InvalidMagnet("invalid hex info hash"))?;
        }
        32 => {
            let bytes = base32_decode(encoded)
                .ok_or(Error::InvalidMagnet("invalid base32 info hash"))?;
            hash.copy_from_slice(&bytes);
        }
        _ => return Err(Error::InvalidMagnet("info hash length is not 40 or 32")),
    }
    Ok(hash)
}

/// RFC 4648 base32 decoding without padding; 32 characters decode to exactly
/// 20 bytes. Lowercase input is accepted.
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits = 0u32;
    let mut bit_count = 0;
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    for c in s.bytes() {
        let c = c.to_ascii_uppercase();
        let value = ALPHABET.iter().position(|&a| a == c)? as u32;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HASH: Sha1Hash = [
        0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x12, 0x34, 0x56,
        0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x12, 0x34, 0x56, 0x78,
    ];

    #[test]
    fn test_parse_hex() {
        let uri = format!("magnet:?xt=urn:btih:{}", hex::encode(HASH));
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, HASH);
        assert_eq!(magnet.display_name, None);
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn test_parse_base32() {
        // base32 of the 20 byte hash above
        let encoded = "CI2FM6E2XTPPAERUKZ4JVPG66AJDIVTY";
        let uri = format!("magnet:?xt=urn:btih:{}", encoded);
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, HASH);
        // lowercase is accepted too
        let uri = format!("magnet:?xt=urn:btih:{}", encoded.to_lowercase());
        assert_eq!(MagnetUri::parse(&uri).unwrap().info_hash, HASH);
    }

    #[test]
    fn test_parse_name_and_trackers() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=test%20file&tr=http%3A%2F%2Ft.test%2Fannounce&tr=udp%3A%2F%2Fu.test%3A6969",
            hex::encode(HASH)
        );
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(magnet.display_name.as_deref(), Some("test file"));
        assert_eq!(magnet.trackers.len(), 2);
        assert_eq!(magnet.trackers[0].as_str(), "http://t.test/announce");
    }

    #[test]
    fn test_normalized_roundtrip() {
        let magnet = MagnetUri {
            info_hash: HASH,
            display_name: Some("test file".into()),
            trackers: vec![
                Url::parse("http://t.test/announce").unwrap(),
                Url::parse("udp://u.test:6969/").unwrap(),
            ],
        };
        let reparsed = MagnetUri::parse(&magnet.to_uri()).unwrap();
        assert_eq!(reparsed, magnet);
    }

    #[test]
    fn test_rejects_missing_or_bad_xt() {
        assert!(MagnetUri::parse("magnet:?dn=test").is_err());
        assert!(MagnetUri::parse("magnet:?xt=urn:btih:abcd").is_err());
        assert!(MagnetUri::parse("http://example.test/").is_err());
    }
}
