//! Compact peer list encoding shared by tracker responses, DHT values, and
//! PEX messages (BEP 23).
//!
//! An IPv4 peer is 6 bytes (4 address + 2 port), an IPv6 peer is 18 bytes
//! (16 address + 2 port), both in network byte order. Encoding and decoding
//! are involutive for well formed input.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub(crate) const COMPACT_IPV4_LEN: usize = 6;
pub(crate) const COMPACT_IPV6_LEN: usize = 18;

/// Appends the peer's compact form to `buf`. IPv4 peers take 6 bytes, IPv6
/// peers 18.
pub(crate) fn encode_peer(addr: &SocketAddr, buf: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Encodes a homogeneous list of peers into one compact byte string. The
/// caller must not mix address families in one list; the wire format keeps
/// IPv4 (`peers`) and IPv6 (`peers6`) lists separate.
pub(crate) fn encode_peers(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(addrs.len() * COMPACT_IPV4_LEN);
    for addr in addrs {
        encode_peer(addr, &mut buf);
    }
    buf
}

/// Decodes a compact IPv4 peer list. Trailing bytes that do not make up a
/// whole entry are ignored, as is common tracker behavior.
pub(crate) fn decode_peers_v4(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(COMPACT_IPV4_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Decodes a compact IPv6 peer list.
pub(crate) fn decode_peers_v6(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(COMPACT_IPV6_LEN)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(ip), port)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_ipv4_entry() {
        // 192.168.1.1:6881
        let buf = b"\xC0\xA8\x01\x01\x1A\xE1";
        let peers = decode_peers_v4(buf);
        assert_eq!(peers, vec!["192.168.1.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_ipv4_roundtrip() {
        let addrs: Vec<SocketAddr> = vec![
            "1.2.3.4:6881".parse().unwrap(),
            "255.255.255.255:65535".parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
        ];
        let encoded = encode_peers(&addrs);
        assert_eq!(encoded.len(), addrs.len() * COMPACT_IPV4_LEN);
        assert_eq!(decode_peers_v4(&encoded), addrs);
    }

    #[test]
    fn test_ipv6_roundtrip() {
        let addrs: Vec<SocketAddr> = vec![
            "[2001:db8::1]:6881".parse().unwrap(),
            "[::1]:51413".parse().unwrap(),
        ];
        let encoded = encode_peers(&addrs);
        assert_eq!(encoded.len(), addrs.len() * COMPACT_IPV6_LEN);
        assert_eq!(decode_peers_v6(&encoded), addrs);
    }

    #[test]
    fn test_trailing_garbage_ignored() {
        let mut buf = encode_peers(&["1.2.3.4:80".parse().unwrap()]);
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode_peers_v4(&buf).len(), 1);
    }

    #[test]
    fn test_empty_input() {
        assert!(decode_peers_v4(&[]).is_empty());
        assert!(decode_peers_v6(&[]).is_empty());
    }
}
