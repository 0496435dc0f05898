//! BitTorrent peer wire framing.
//!
//! Two codecs share one TCP stream: [`HandshakeCodec`] frames the fixed
//! 68-byte handshake, then the stream is re-framed with [`PeerCodec`] for
//! length-prefixed messages, keeping any bytes already buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The BitTorrent v1 protocol string.
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Reserved-bits flag advertising extension protocol (BEP 10) support.
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;

/// Upper bound on a single wire message. A `piece` message is a 16 KiB
/// block plus headers; anything larger is a protocol violation.
const MAX_MESSAGE_LEN: u32 = 2 * 1024 * 1024;

/// The fixed-size connection opener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Builds our side of the handshake, advertising extension support.
    #[must_use]
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= EXTENSION_PROTOCOL_BIT;
        Self { reserved, info_hash, peer_id }
    }

    /// True when the remote supports BEP 10 extended messages.
    #[must_use]
    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_PROTOCOL_BIT != 0
    }
}

/// A block request/cancel triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

/// Messages after the handshake, per BEP 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// Raw wire-order bitfield; sized to the piece count by the receiver.
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece {
        piece: u32,
        begin: u32,
        data: Bytes,
    },
    Cancel(BlockInfo),
    /// DHT listen port (BEP 5).
    Port(u16),
    /// BEP 10 extended message: extension id plus bencoded payload.
    Extended {
        id: u8,
        payload: Bytes,
    },
}

impl Message {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeepAlive => "keep-alive",
            Self::Choke => "choke",
            Self::Unchoke => "unchoke",
            Self::Interested => "interested",
            Self::NotInterested => "not-interested",
            Self::Have(_) => "have",
            Self::Bitfield(_) => "bitfield",
            Self::Request(_) => "request",
            Self::Piece { .. } => "piece",
            Self::Cancel(_) => "cancel",
            Self::Port(_) => "port",
            Self::Extended { .. } => "extended",
        }
    }
}

/// Codec errors surface as `io::Error` so they compose with `Framed`.
fn protocol_error(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

/// Frames the 68-byte handshake.
#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = std::io::Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(68);
        dst.put_u8(19);
        dst.put_slice(PROTOCOL_STRING);
        dst.put_slice(&handshake.reserved);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, Self::Error> {
        if src.len() < 68 {
            return Ok(None);
        }
        if src[0] != 19 || &src[1..20] != PROTOCOL_STRING {
            return Err(protocol_error("invalid handshake protocol string"));
        }
        src.advance(20);
        let mut reserved = [0u8; 8];
        src.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        src.copy_to_slice(&mut peer_id);
        Ok(Some(Handshake { reserved, info_hash, peer_id }))
    }
}

/// Frames length-prefixed peer messages.
#[derive(Debug, Default)]
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = std::io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            }
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            }
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            }
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            }
            Message::Have(piece) => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(piece);
            }
            Message::Bitfield(bits) => {
                dst.put_u32(1 + bits.len() as u32);
                dst.put_u8(5);
                dst.put_slice(&bits);
            }
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece);
                dst.put_u32(block.begin);
                dst.put_u32(block.length);
            }
            Message::Piece { piece, begin, data } => {
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(piece);
                dst.put_u32(begin);
                dst.put_slice(&data);
            }
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece);
                dst.put_u32(block.begin);
                dst.put_u32(block.length);
            }
            Message::Port(port) => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            }
            Message::Extended { id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(id);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len > MAX_MESSAGE_LEN {
            return Err(protocol_error("message exceeds maximum length"));
        }
        if src.len() < 4 + len as usize {
            src.reserve(4 + len as usize - src.len());
            return Ok(None);
        }
        src.advance(4);

        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let id = src.get_u8();
        let mut body = src.split_to(len as usize - 1);

        let msg = match id {
            0 => expect_empty(&body, Message::Choke)?,
            1 => expect_empty(&body, Message::Unchoke)?,
            2 => expect_empty(&body, Message::Interested)?,
            3 => expect_empty(&body, Message::NotInterested)?,
            4 => {
                if body.len() != 4 {
                    return Err(protocol_error("bad have length"));
                }
                Message::Have(body.get_u32())
            }
            5 => Message::Bitfield(body.to_vec()),
            6 | 8 => {
                if body.len() != 12 {
                    return Err(protocol_error("bad request/cancel length"));
                }
                let block = BlockInfo {
                    piece: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                };
                if id == 6 { Message::Request(block) } else { Message::Cancel(block) }
            }
            7 => {
                if body.len() < 8 {
                    return Err(protocol_error("bad piece length"));
                }
                let piece = body.get_u32();
                let begin = body.get_u32();
                Message::Piece { piece, begin, data: body.freeze() }
            }
            9 => {
                if body.len() != 2 {
                    return Err(protocol_error("bad port length"));
                }
                Message::Port(body.get_u16())
            }
            20 => {
                if body.is_empty() {
                    return Err(protocol_error("bad extended length"));
                }
                let ext_id = body.get_u8();
                Message::Extended { id: ext_id, payload: body.freeze() }
            }
            _ => return Err(protocol_error("unknown message id")),
        };
        Ok(Some(msg))
    }
}

fn expect_empty(body: &BytesMut, msg: Message) -> Result<Message, std::io::Error> {
    if body.is_empty() {
        Ok(msg)
    } else {
        Err(protocol_error("unexpected payload"))
    }
}
