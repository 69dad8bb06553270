//! Peer exchange (BEP 11) and the extension protocol handshake it rides on
//! (BEP 10).
//!
//! Once two peers advertise `ut_pex` in their extended handshakes, each side
//! periodically sends the delta of peers it gained and lost since the last
//! message, as compact peer lists capped at 50 entries per direction.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;

use serde_bytes::ByteBuf;

use crate::{compact, error::*};

/// The extended message id of the extended handshake itself.
pub(crate) const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// The local message id we assign to `ut_pex` in our extended handshake.
pub(crate) const UT_PEX_ID: u8 = 1;

/// The local message id we assign to `ut_metadata` (BEP 9) in our extended
/// handshake.
pub(crate) const UT_METADATA_ID: u8 = 2;

/// At most this many added and this many dropped peers go into a single PEX
/// message.
pub(crate) const MAX_PEX_PEERS: usize = 50;

/// The bencoded payload of the extended handshake (BEP 10).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// Maps extension names to the message ids the sending side chose for
    /// them. A zero id means the extension is disabled.
    #[serde(default)]
    pub m: BTreeMap<String, i64>,
    /// The client name and version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// The sender's listen port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<i64>,
    /// The size of the info dictionary, announced by peers that support
    /// `ut_metadata` and have the metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
}

impl ExtendedHandshake {
    /// The handshake we send: advertises `ut_pex` and `ut_metadata` under
    /// our local ids.
    pub fn ours(listen_port: u16, metadata_size: Option<i64>) -> Self {
        let mut m = BTreeMap::new();
        m.insert("ut_pex".into(), UT_PEX_ID as i64);
        m.insert("ut_metadata".into(), UT_METADATA_ID as i64);
        Self {
            m,
            v: Some(format!("crabtorrent {}", env!("CARGO_PKG_VERSION"))),
            p: Some(listen_port as i64),
            metadata_size,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(payload)?)
    }

    /// The message id the peer chose for `ut_pex`, if it supports it.
    pub fn ut_pex_id(&self) -> Option<u8> {
        self.extension_id("ut_pex")
    }

    /// The message id the peer chose for `ut_metadata`, if it supports it.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extension_id("ut_metadata")
    }

    fn extension_id(&self, name: &str) -> Option<u8> {
        match self.m.get(name) {
            Some(&id) if id > 0 && id <= u8::MAX as i64 => Some(id as u8),
            _ => None,
        }
    }
}

/// The bencoded payload of a `ut_pex` message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct PexMessage {
    /// Compact IPv4 peers gained since the last message.
    #[serde(default)]
    pub added: ByteBuf,
    /// One flag byte per added peer; we send zeroes and ignore received
    /// flags.
    #[serde(rename = "added.f", default)]
    pub added_f: ByteBuf,
    /// Compact IPv4 peers lost since the last message.
    #[serde(default)]
    pub dropped: ByteBuf,
    /// Compact IPv6 peers gained since the last message.
    #[serde(default)]
    pub added6: ByteBuf,
    /// Compact IPv6 peers lost since the last message.
    #[serde(default)]
    pub dropped6: ByteBuf,
}

impl PexMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(payload)?)
    }

    /// All peers announced as added, across both address families.
    pub fn added_peers(&self) -> Vec<SocketAddr> {
        let mut peers = compact::decode_peers_v4(&self.added);
        peers.extend(compact::decode_peers_v6(&self.added6));
        peers
    }
}

/// Per-peer PEX bookkeeping: remembers what we already told the peer so that
/// each tick only sends deltas.
#[derive(Debug, Default)]
pub(crate) struct PexState {
    /// The connected-peer set as of the last message we sent.
    last_sent: HashSet<SocketAddr>,
}

impl PexState {
    /// Computes the next PEX message from the currently connected peer set,
    /// or `None` when there is nothing new to report. At most
    /// [`MAX_PEX_PEERS`] added and dropped entries are reported per call; the
    /// rest is picked up by subsequent ticks.
    pub fn delta(&mut self, connected: &HashSet<SocketAddr>) -> Option<PexMessage> {
        let mut added: Vec<SocketAddr> =
            connected.difference(&self.last_sent).copied().collect();
        added.sort();
        added.truncate(MAX_PEX_PEERS);

        let mut dropped: Vec<SocketAddr> =
            self.last_sent.difference(connected).copied().collect();
        dropped.sort();
        dropped.truncate(MAX_PEX_PEERS);

        if added.is_empty() && dropped.is_empty() {
            return None;
        }

        for peer in &added {
            self.last_sent.insert(*peer);
        }
        for peer in &dropped {
            self.last_sent.remove(peer);
        }

        let (added_v4, added_v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
            added.iter().copied().partition(|addr| addr.is_ipv4());
        let (dropped_v4, dropped_v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
            dropped.iter().copied().partition(|addr| addr.is_ipv4());

        Some(PexMessage {
            added: ByteBuf::from(compact::encode_peers(&added_v4)),
            added_f: ByteBuf::from(vec![0u8; added_v4.len()]),
            dropped: ByteBuf::from(compact::encode_peers(&dropped_v4)),
            added6: ByteBuf::from(compact::encode_peers(&added_v6)),
            dropped6: ByteBuf::from(compact::encode_peers(&dropped_v6)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(last_octet: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", last_octet).parse().unwrap()
    }

    #[test]
    fn test_extended_handshake_roundtrip() {
        let ours = ExtendedHandshake::ours(6881, None);
        let decoded = ExtendedHandshake::decode(&ours.encode().unwrap()).unwrap();
        assert_eq!(decoded.ut_pex_id(), Some(UT_PEX_ID));
        assert_eq!(decoded.ut_metadata_id(), Some(UT_METADATA_ID));
        assert_eq!(decoded.p, Some(6881));
    }

    #[test]
    fn test_extended_handshake_zero_id_means_disabled() {
        let mut handshake = ExtendedHandshake::default();
        handshake.m.insert("ut_pex".into(), 0);
        assert_eq!(handshake.ut_pex_id(), None);
    }

    #[test]
    fn test_pex_delta_reports_added_then_dropped() {
        let mut state = PexState::default();
        let mut connected: HashSet<SocketAddr> =
            [addr(1), addr(2)].iter().copied().collect();

        let msg = state.delta(&connected).unwrap();
        assert_eq!(msg.added_peers().len(), 2);
        assert!(msg.dropped.is_empty());

        // no change, nothing to send
        assert!(state.delta(&connected).is_none());

        // one leaves, one arrives
        connected.remove(&addr(1));
        connected.insert(addr(3));
        let msg = state.delta(&connected).unwrap();
        assert_eq!(msg.added_peers(), vec![addr(3)]);
        assert_eq!(compact::decode_peers_v4(&msg.dropped), vec![addr(1)]);
    }

    #[test]
    fn test_pex_caps_at_fifty_entries() {
        let mut state = PexState::default();
        let connected: HashSet<SocketAddr> = (0..70)
            .map(|i| {
                format!("10.0.{}.{}:6881", i / 256, i % 256)
                    .parse()
                    .unwrap()
            })
            .collect();
        let msg = state.delta(&connected).unwrap();
        assert_eq!(msg.added.len() / 6, MAX_PEX_PEERS);
        // the spillover arrives with the next tick
        let msg = state.delta(&connected).unwrap();
        assert_eq!(msg.added.len() / 6, 20);
        assert!(state.delta(&connected).is_none());
    }

    #[test]
    fn test_pex_message_bencode_roundtrip() {
        let mut state = PexState::default();
        let connected: HashSet<SocketAddr> =
            [addr(1), addr(9)].iter().copied().collect();
        let msg = state.delta(&connected).unwrap();
        let decoded = PexMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.added, msg.added);
        assert_eq!(decoded.added_f.len(), 2);
    }
}
