use super::error::PeerError;
use super::peer_id::PeerId;
use crate::constants::{HANDSHAKE_LEN, MAX_MESSAGE_SIZE, PROTOCOL_STRING, RESERVED_BYTES};
use crate::metainfo::InfoHash;
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Extension bits; written as zero, ignored on receipt.
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: RESERVED_BYTES,
            info_hash,
            peer_id,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake("truncated"));
        }
        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err(PeerError::InvalidHandshake("unknown protocol"));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let info_hash =
            InfoHash::from_bytes(&data[28..48]).map_err(|_| PeerError::InvalidHandshake("info hash"))?;
        let peer_id =
            PeerId::from_bytes(&data[48..68]).ok_or(PeerError::InvalidHandshake("peer id"))?;

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Takes a handshake off the front of `buf` once all 68 bytes have arrived.
    ///
    /// The protocol prefix is checked as soon as it is present so a foreign
    /// protocol is rejected without waiting for the full frame.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Self>, PeerError> {
        let prefix = buf.len().min(20);
        let mut expected = [0u8; 20];
        expected[0] = PROTOCOL_STRING.len() as u8;
        expected[1..].copy_from_slice(PROTOCOL_STRING);
        if buf[..prefix] != expected[..prefix] {
            return Err(PeerError::InvalidHandshake("unknown protocol"));
        }

        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let frame = buf.split_to(HANDSHAKE_LEN);
        Self::decode(&frame).map(Some)
    }
}

/// A peer wire message (BEP-3 ids 0 through 8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    /// An id outside 0..=8; extensions are never negotiated, so these are skipped.
    Unknown(u8),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have { .. } => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
            Message::Unknown(_) => "unknown",
        }
    }

    /// Appends the length-prefixed frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_header(buf, 0, 0),
            Message::Unchoke => put_header(buf, 1, 0),
            Message::Interested => put_header(buf, 2, 0),
            Message::NotInterested => put_header(buf, 3, 0),
            Message::Have { piece } => {
                put_header(buf, 4, 4);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                put_header(buf, 5, bits.len());
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                put_header(buf, 6, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                put_header(buf, 7, 8 + data.len());
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                put_header(buf, 8, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Unknown(id) => put_header(buf, *id, 0),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes a frame body: the id byte followed by the payload.
    pub fn decode(mut body: Bytes) -> Result<Self, PeerError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = body.get_u8();
        let fixed = |expected: usize, body: &Bytes| {
            if body.len() == expected {
                Ok(())
            } else {
                Err(PeerError::InvalidMessage(format!(
                    "message {id} has {} payload bytes, expected {expected}",
                    body.len()
                )))
            }
        };

        match id {
            0..=3 => {
                fixed(0, &body)?;
                Ok(match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                })
            }
            4 => {
                fixed(4, &body)?;
                Ok(Message::Have {
                    piece: body.get_u32(),
                })
            }
            5 => Ok(Message::Bitfield(body)),
            6 | 8 => {
                fixed(12, &body)?;
                let (index, begin, length) = (body.get_u32(), body.get_u32(), body.get_u32());
                Ok(if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                })
            }
            7 => {
                if body.len() < 8 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: body,
                })
            }
            other => Ok(Message::Unknown(other)),
        }
    }

    /// Takes one complete frame off the front of `buf`, or `None` until one has arrived.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Self>, PeerError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::MessageTooLarge(length));
        }
        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let body = buf.split_to(length).freeze();
        Self::decode(body).map(Some)
    }
}

fn put_header(buf: &mut BytesMut, id: u8, payload_len: usize) {
    buf.reserve(5 + payload_len);
    buf.put_u32(1 + payload_len as u32);
    buf.put_u8(id);
}
