//! KRPC: the bencoded query/response messages of the mainline DHT (BEP 5),
//! and the compact node encoding they carry.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde_bytes::ByteBuf;

use super::routing::NodeId;
use crate::{compact, error::*};

/// A compact IPv4 node entry is the 20 byte node id followed by a 6 byte
/// compact peer address.
const COMPACT_NODE_LEN: usize = 26;

/// A KRPC message: a query (`y` = "q"), a response (`y` = "r"), or an error
/// (`y` = "e").
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Message {
    /// The transaction id, echoed by the responding side.
    pub t: ByteBuf,
    pub y: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a: Option<Args>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<Response>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<(i64, String)>,
}

/// The arguments of a query. One flat struct covers all four query types;
/// unused fields stay `None` and are omitted from the wire.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Args {
    /// The querying node's id.
    pub id: ByteBuf,
    /// `find_node`: the id whose neighborhood is sought.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,
    /// `get_peers` / `announce_peer`: the torrent in question.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<ByteBuf>,
    /// `announce_peer`: the announced listen port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// `announce_peer`: the token received from a previous `get_peers`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
    /// `announce_peer`: when set, the port is taken from the UDP datagram's
    /// source instead of the `port` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<u8>,
}

/// The return values of a response.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Response {
    /// The responding node's id.
    pub id: ByteBuf,
    /// Compact node entries closest to the target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,
    /// Compact peer addresses for the requested info hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,
    /// The write token for a subsequent `announce_peer`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
}

impl Message {
    pub fn query(t: Vec<u8>, name: &str, args: Args) -> Self {
        Self {
            t: ByteBuf::from(t),
            y: "q".into(),
            q: Some(name.into()),
            a: Some(args),
            r: None,
            e: None,
        }
    }

    pub fn response(t: ByteBuf, response: Response) -> Self {
        Self {
            t,
            y: "r".into(),
            q: None,
            a: None,
            r: Some(response),
            e: None,
        }
    }

    pub fn error(t: ByteBuf, code: i64, message: &str) -> Self {
        Self {
            t,
            y: "e".into(),
            q: None,
            a: None,
            r: None,
            e: Some((code, message.into())),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }
}

/// Encodes nodes into the compact `nodes` format: 26 bytes each, IPv4 only
/// (the mainline DHT's `nodes` key carries IPv4 entries).
pub(crate) fn encode_nodes(nodes: &[(NodeId, SocketAddr)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for (id, addr) in nodes {
        if let IpAddr::V4(ip) = addr.ip() {
            buf.extend_from_slice(&id.0);
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    buf
}

/// Decodes a compact `nodes` byte string; incomplete trailing entries are
/// ignored.
pub(crate) fn decode_nodes(buf: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    buf.chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|chunk| {
            let id = NodeId::from_slice(&chunk[..20])?;
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            Some((id, SocketAddr::new(IpAddr::V4(ip), port)))
        })
        .collect()
}

/// Decodes the `values` list of a `get_peers` response into peer addresses.
pub(crate) fn decode_values(values: &[ByteBuf]) -> Vec<SocketAddr> {
    values
        .iter()
        .flat_map(|value| compact::decode_peers_v4(value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ping_query_wire_format() {
        let args = Args {
            id: ByteBuf::from(vec![b'a'; 20]),
            ..Default::default()
        };
        let msg = Message::query(b"aa".to_vec(), "ping", args);
        let encoded = msg.encode().unwrap();
        // the canonical example from BEP 5
        assert_eq!(
            encoded,
            b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:aa1:y1:qe"
                .to_vec()
        );
    }

    #[test]
    fn test_error_message_roundtrip() {
        let msg = Message::error(ByteBuf::from(b"xy".to_vec()), 201, "Generic Error");
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.y, "e");
        assert_eq!(decoded.e, Some((201, "Generic Error".into())));
    }

    #[test]
    fn test_get_peers_response_roundtrip() {
        let response = Response {
            id: ByteBuf::from(vec![1; 20]),
            nodes: None,
            values: Some(vec![ByteBuf::from(
                b"\xC0\xA8\x01\x01\x1A\xE1".to_vec(),
            )]),
            token: Some(ByteBuf::from(b"tok".to_vec())),
        };
        let msg = Message::response(ByteBuf::from(b"01".to_vec()), response);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        let response = decoded.r.unwrap();
        assert_eq!(
            decode_values(response.values.as_ref().unwrap()),
            vec!["192.168.1.1:6881".parse().unwrap()]
        );
        assert_eq!(&response.token.unwrap()[..], &b"tok"[..]);
    }

    #[test]
    fn test_compact_nodes_roundtrip() {
        let nodes = vec![
            (NodeId([1; 20]), "10.0.0.1:6881".parse().unwrap()),
            (NodeId([2; 20]), "10.0.0.2:6882".parse().unwrap()),
        ];
        let encoded = encode_nodes(&nodes);
        assert_eq!(encoded.len(), 2 * COMPACT_NODE_LEN);
        assert_eq!(decode_nodes(&encoded), nodes);
    }

    #[test]
    fn test_ipv6_nodes_skipped_on_encode() {
        let nodes = vec![(
            NodeId([1; 20]),
            "[2001:db8::1]:6881".parse().unwrap(),
        )];
        assert!(encode_nodes(&nodes).is_empty());
    }
}
