//! The handshake and peer message codecs of the BitTorrent wire protocol.
//!
//! After the TCP connection is established both sides send a fixed 68 byte
//! handshake, decoded by [`HandshakeCodec`]. All subsequent traffic is length
//! prefixed messages, decoded by [`PeerCodec`]:
//! `<4 byte big endian length><1 byte id><payload>`, where a length of 0 is
//! a keep-alive.

use std::convert::TryFrom;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string transmitted in the handshake's preamble.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The combined length of the handshake: 1 byte protocol string length, the
/// 19 byte protocol string, 8 reserved bytes, and two 20 byte hashes.
const HANDSHAKE_LEN: usize = 68;

/// A decoded frame may not be larger than this. The largest legitimate
/// frames are block payloads (16 KiB + header) and the bitfields of huge
/// torrents; anything above this limit is treated as a protocol violation.
const MAX_FRAME_LEN: u32 = 0x10_0000;

/// The reserved byte and bit that advertise extension protocol support
/// (BEP 10).
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// The BitTorrent handshake exchanged directly after the TCP connection is
/// made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The protocol string, must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved bytes used to advertise extensions.
    pub reserved: [u8; 8],
    /// The torrent's info hash.
    pub info_hash: Sha1Hash,
    /// The peer's arbitrary id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates the handshake we send, advertising extension protocol
    /// support.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the peer speaks the extension protocol (BEP 10).
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }
}

/// Codec for the handshake exchange. It is switched out for [`PeerCodec`]
/// right after both handshakes are exchanged, carrying over the read and
/// write buffers.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        // the protocol string length is fixed, a mismatch can be rejected
        // before the rest of the handshake arrives
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(Error::ProtocolViolation("invalid protocol string"));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let mut frame = buf.split_to(HANDSHAKE_LEN);
        frame.advance(1);
        let mut prot = [0; 19];
        frame.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::ProtocolViolation("invalid protocol string"));
        }
        let mut reserved = [0; 8];
        frame.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        frame.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        frame.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a peer message, as transmitted on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            20 => Ok(Self::Extended),
            _ => Err(Error::ProtocolViolation("unknown message id")),
        }
    }
}

/// A peer message after the handshake.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// An extension protocol message (BEP 10): the extended message id
    /// followed by a bencoded payload.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// The message's wire id, or `None` for keep-alives, which have no id.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

/// Codec for the length prefixed peer messages.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                encode_block_info(&block, buf);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                encode_block_info(&block, buf);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.put_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len > MAX_FRAME_LEN {
            return Err(Error::ProtocolViolation("frame too large"));
        }
        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if buf.len() < 4 + len as usize {
            // make room for the rest of the frame in one go
            buf.reserve(4 + len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(len as usize);
        let id = MessageId::try_from(frame.get_u8())?;
        let msg = match id {
            MessageId::Choke => expect_empty(&frame, Message::Choke)?,
            MessageId::Unchoke => expect_empty(&frame, Message::Unchoke)?,
            MessageId::Interested => {
                expect_empty(&frame, Message::Interested)?
            }
            MessageId::NotInterested => {
                expect_empty(&frame, Message::NotInterested)?
            }
            MessageId::Have => {
                if frame.remaining() != 4 {
                    return Err(Error::ProtocolViolation(
                        "have payload is not 4 bytes",
                    ));
                }
                Message::Have {
                    piece_index: frame.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(frame.to_vec()))
            }
            MessageId::Request => Message::Request(decode_block_info(
                &mut frame,
            )?),
            MessageId::Block => {
                if frame.remaining() < 8 {
                    return Err(Error::ProtocolViolation(
                        "piece payload too short",
                    ));
                }
                let piece_index = frame.get_u32() as PieceIndex;
                let offset = frame.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: frame.to_vec(),
                }
            }
            MessageId::Cancel => {
                Message::Cancel(decode_block_info(&mut frame)?)
            }
            MessageId::Extended => {
                if !frame.has_remaining() {
                    return Err(Error::ProtocolViolation(
                        "extended message without id",
                    ));
                }
                let id = frame.get_u8();
                Message::Extended {
                    id,
                    payload: frame.to_vec(),
                }
            }
        };
        Ok(Some(msg))
    }
}

fn expect_empty(frame: &BytesMut, msg: Message) -> Result<Message, Error> {
    if frame.has_remaining() {
        Err(Error::ProtocolViolation("unexpected message payload"))
    } else {
        Ok(msg)
    }
}

fn encode_block_info(block: &BlockInfo, buf: &mut BytesMut) {
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

fn decode_block_info(frame: &mut BytesMut) -> Result<BlockInfo, Error> {
    if frame.remaining() != 12 {
        return Err(Error::ProtocolViolation(
            "request payload is not 12 bytes",
        ));
    }
    Ok(BlockInfo {
        piece_index: frame.get_u32() as PieceIndex,
        offset: frame.get_u32(),
        len: frame.get_u32(),
    })
}

// This From impl is needed by `Framed`, whose `Stream` and `Sink`
// implementations surface transport failures through the codec's error type.
impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(msg: Message) {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake::new([0xab; 20], *b"-CC0101-abcdefghijkl");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(decoded.supports_extensions());
    }

    #[test]
    fn test_handshake_partial_input() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(40);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(
            HandshakeCodec.decode(&mut partial).unwrap().unwrap(),
            handshake
        );
    }

    #[test]
    fn test_handshake_wrong_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(5);
        buf.put_slice(b"BitTo");
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_message_roundtrips() {
        roundtrip(Message::KeepAlive);
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have { piece_index: 42 });
        roundtrip(Message::Bitfield(Bitfield::from_vec(vec![0b1010_0001])));
        roundtrip(Message::Request(BlockInfo {
            piece_index: 1,
            offset: 0x4000,
            len: 0x4000,
        }));
        roundtrip(Message::Block {
            piece_index: 3,
            offset: 0x8000,
            data: vec![0xfe; 1024],
        });
        roundtrip(Message::Cancel(BlockInfo {
            piece_index: 1,
            offset: 0x4000,
            len: 0x4000,
        }));
        roundtrip(Message::Extended {
            id: 0,
            payload: b"d1:md6:ut_pexi1eee".to_vec(),
        });
    }

    #[test]
    fn test_decode_across_partial_reads() {
        let mut full = BytesMut::new();
        PeerCodec
            .encode(Message::Have { piece_index: 7 }, &mut full)
            .unwrap();
        let mut partial = full.split_to(3);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert_eq!(
            PeerCodec.decode(&mut partial).unwrap().unwrap(),
            Message::Have { piece_index: 7 }
        );
    }

    #[test]
    fn test_unknown_message_id_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        buf.put_u8(MessageId::Block as u8);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_malformed_payload_rejected() {
        // a choke with a payload
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(MessageId::Choke as u8);
        buf.put_u8(0);
        assert!(PeerCodec.decode(&mut buf).is_err());

        // a request with a truncated payload
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}
