//! The metadata exchange (BEP 9): fetching the info dictionary of a magnet
//! download from peers that advertise `ut_metadata`, 16 KiB piece by piece,
//! and validating it against the magnet's info hash.

use std::{convert::TryInto, net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};
use url::Url;

use crate::{
    error::*,
    metainfo::Metainfo,
    peer::codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    pex::{ExtendedHandshake, EXTENDED_HANDSHAKE_ID, UT_METADATA_ID},
    PeerId, Sha1Hash,
};

/// Metadata is transferred in pieces of this size; only the last piece may
/// be smaller.
const METADATA_PIECE_LEN: usize = 0x4000;

/// How long a single candidate peer gets for the whole exchange.
const PER_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// An info dictionary larger than this is rejected outright.
const MAX_METADATA_SIZE: i64 = 8 * 1024 * 1024;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

/// The bencoded header of a `ut_metadata` message. Data messages append the
/// raw metadata chunk directly after the bencoded dictionary.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MetadataMessage {
    pub msg_type: i64,
    pub piece: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<i64>,
}

impl MetadataMessage {
    fn request(piece: i64) -> Self {
        Self {
            msg_type: MSG_REQUEST,
            piece,
            total_size: None,
        }
    }

    fn reject(piece: i64) -> Self {
        Self {
            msg_type: MSG_REJECT,
            piece,
            total_size: None,
        }
    }
}

/// Splits a `ut_metadata` payload into its bencoded header and the trailing
/// raw chunk (present for data messages).
pub(crate) fn split_message(
    payload: &[u8],
) -> Result<(MetadataMessage, &[u8])> {
    let header_len = bencoded_prefix_len(payload)
        .ok_or(Error::ProtocolViolation("malformed metadata message"))?;
    let header: MetadataMessage =
        serde_bencode::from_bytes(&payload[..header_len])?;
    Ok((header, &payload[header_len..]))
}

/// If the payload is a metadata request, returns the encoded reject reply
/// for it; `None` for anything else. Peer sessions use this because only the
/// metadata fetcher deals in actual metadata.
pub(crate) fn reject_for_request(payload: &[u8]) -> Option<Vec<u8>> {
    let (header, _) = split_message(payload).ok()?;
    if header.msg_type != MSG_REQUEST {
        return None;
    }
    serde_bencode::to_bytes(&MetadataMessage::reject(header.piece)).ok()
}

/// Returns the byte length of the single complete bencoded value at the
/// start of `buf`, or `None` if it is malformed or truncated. Also used by
/// the metainfo parser to locate the raw `info` dictionary span.
pub(crate) fn bencoded_prefix_len(buf: &[u8]) -> Option<usize> {
    fn value_end(buf: &[u8], pos: usize) -> Option<usize> {
        match buf.get(pos)? {
            b'i' => {
                let end = buf[pos..].iter().position(|&b| b == b'e')?;
                Some(pos + end + 1)
            }
            b'l' | b'd' => {
                let mut pos = pos + 1;
                while *buf.get(pos)? != b'e' {
                    pos = value_end(buf, pos)?;
                }
                Some(pos + 1)
            }
            b'0'..=b'9' => {
                let colon =
                    buf[pos..].iter().position(|&b| b == b':')? + pos;
                let len: usize =
                    std::str::from_utf8(&buf[pos..colon]).ok()?.parse().ok()?;
                let end = colon + 1 + len;
                if end > buf.len() {
                    None
                } else {
                    Some(end)
                }
            }
            _ => None,
        }
    }
    value_end(buf, 0)
}

/// Fetches the metadata (info dictionary) identified by the info hash from
/// the candidate peers, trying them in order until one completes the
/// exchange. The assembled dictionary is validated by hashing it against the
/// info hash before being parsed.
pub(crate) async fn fetch(
    info_hash: Sha1Hash,
    client_id: PeerId,
    candidates: &[SocketAddr],
    trackers: Vec<Vec<Url>>,
) -> Result<Metainfo> {
    for addr in candidates {
        log::info!("Fetching metadata of {} from {}", hex::encode(info_hash), addr);
        match timeout(
            PER_PEER_TIMEOUT,
            fetch_from_peer(info_hash, client_id, *addr),
        )
        .await
        {
            Ok(Ok(info_bytes)) => {
                return Metainfo::from_info_bytes(&info_bytes, trackers.clone());
            }
            Ok(Err(e)) => {
                log::debug!("Metadata fetch from {} failed: {}", addr, e);
            }
            Err(_) => {
                log::debug!("Metadata fetch from {} timed out", addr);
            }
        }
    }
    Err(Error::MetadataFetch("no peer served the metadata"))
}

async fn fetch_from_peer(
    info_hash: Sha1Hash,
    client_id: PeerId,
    addr: SocketAddr,
) -> Result<Vec<u8>> {
    let socket = TcpStream::connect(addr).await?;
    let mut socket = Framed::new(socket, HandshakeCodec);
    socket.send(Handshake::new(info_hash, client_id)).await?;

    let peer_handshake = match socket.next().await {
        Some(handshake) => handshake?,
        None => {
            return Err(Error::ProtocolViolation(
                "connection closed during handshake",
            ))
        }
    };
    if peer_handshake.info_hash != info_hash {
        return Err(Error::InvalidPeerInfoHash);
    }
    if !peer_handshake.supports_extensions() {
        return Err(Error::MetadataFetch("peer has no extension protocol"));
    }

    // switch to the peer message codec, keeping the read buffer
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    let ours = ExtendedHandshake::ours(0, None);
    socket
        .send(Message::Extended {
            id: EXTENDED_HANDSHAKE_ID,
            payload: ours.encode()?,
        })
        .await?;

    // wait for the peer's extended handshake
    let (ut_metadata_id, metadata_size) = loop {
        match socket.next().await {
            Some(msg) => {
                if let Message::Extended {
                    id: EXTENDED_HANDSHAKE_ID,
                    payload,
                } = msg?
                {
                    let theirs = ExtendedHandshake::decode(&payload)?;
                    let id = theirs.ut_metadata_id().ok_or(
                        Error::MetadataFetch("peer has no ut_metadata"),
                    )?;
                    let size = theirs.metadata_size.ok_or(
                        Error::MetadataFetch("peer has no metadata size"),
                    )?;
                    break (id, size);
                }
                // other messages (bitfield etc) may arrive first
            }
            None => {
                return Err(Error::ProtocolViolation(
                    "connection closed during extended handshake",
                ))
            }
        }
    };
    if metadata_size <= 0 || metadata_size > MAX_METADATA_SIZE {
        return Err(Error::MetadataFetch("implausible metadata size"));
    }
    let metadata_size = metadata_size as usize;
    let piece_count =
        (metadata_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;

    // request all pieces up front; they are small
    for piece in 0..piece_count {
        let header =
            serde_bencode::to_bytes(&MetadataMessage::request(piece as i64))?;
        socket
            .send(Message::Extended {
                id: ut_metadata_id,
                payload: header,
            })
            .await?;
    }

    let mut pieces: Vec<Option<Vec<u8>>> = vec![None; piece_count];
    let mut received = 0;
    while received < piece_count {
        let msg = match socket.next().await {
            Some(msg) => msg?,
            None => {
                return Err(Error::ProtocolViolation(
                    "connection closed during metadata exchange",
                ))
            }
        };
        let payload = match msg {
            Message::Extended {
                id: UT_METADATA_ID,
                payload,
            } => payload,
            // tolerate unrelated traffic during the exchange
            _ => continue,
        };
        let (header, data) = split_message(&payload)?;
        match header.msg_type {
            MSG_DATA => {
                let index: usize = header
                    .piece
                    .try_into()
                    .map_err(|_| {
                        Error::ProtocolViolation("invalid metadata piece")
                    })?;
                if index >= piece_count {
                    return Err(Error::ProtocolViolation(
                        "metadata piece out of range",
                    ));
                }
                let expected_len = if index == piece_count - 1 {
                    metadata_size - index * METADATA_PIECE_LEN
                } else {
                    METADATA_PIECE_LEN
                };
                if data.len() != expected_len {
                    return Err(Error::ProtocolViolation(
                        "metadata piece of wrong size",
                    ));
                }
                if pieces[index].is_none() {
                    pieces[index] = Some(data.to_vec());
                    received += 1;
                }
            }
            MSG_REJECT => {
                return Err(Error::MetadataFetch("peer rejected our request"));
            }
            _ => {}
        }
    }

    let mut info_bytes = Vec::with_capacity(metadata_size);
    for piece in pieces {
        // all pieces are present, received == piece_count
        if let Some(piece) = piece {
            info_bytes.extend_from_slice(&piece);
        }
    }

    // the metadata is self certifying: its hash must be the info hash
    let digest = Sha1::digest(&info_bytes);
    if digest.as_slice() != info_hash {
        return Err(Error::MetadataFetch("metadata hash mismatch"));
    }

    Ok(info_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bencoded_prefix_len() {
        assert_eq!(bencoded_prefix_len(b"i42e"), Some(4));
        assert_eq!(bencoded_prefix_len(b"4:spam"), Some(6));
        assert_eq!(bencoded_prefix_len(b"l4:spami42ee"), Some(12));
        assert_eq!(
            bencoded_prefix_len(b"d8:msg_typei1e5:piecei0eeXXXX"),
            Some(25)
        );
        // truncated values are not parsed
        assert_eq!(bencoded_prefix_len(b"4:sp"), None);
        assert_eq!(bencoded_prefix_len(b"d8:msg_type"), None);
        assert_eq!(bencoded_prefix_len(b"x"), None);
    }

    #[test]
    fn test_split_data_message() {
        let payload = b"d8:msg_typei1e5:piecei0e10:total_sizei5eeHELLO";
        let (header, data) = split_message(payload).unwrap();
        assert_eq!(header.msg_type, MSG_DATA);
        assert_eq!(header.piece, 0);
        assert_eq!(header.total_size, Some(5));
        assert_eq!(data, b"HELLO");
    }

    #[test]
    fn test_reject_for_request() {
        let request =
            serde_bencode::to_bytes(&MetadataMessage::request(3)).unwrap();
        let reject = reject_for_request(&request).unwrap();
        let (header, _) = split_message(&reject).unwrap();
        assert_eq!(header.msg_type, MSG_REJECT);
        assert_eq!(header.piece, 3);

        // data and reject messages don't warrant a reply
        let data = b"d8:msg_typei1e5:piecei0eeDATA";
        assert!(reject_for_request(data).is_none());
    }
}
