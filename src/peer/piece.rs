use bytes::Bytes;

use super::message::Message;

/// A block of a piece: the unit of requests on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    pub fn to_request(self) -> Message {
        Message::Request {
            index: self.piece,
            begin: self.offset,
            length: self.length,
        }
    }

    pub fn to_cancel(self) -> Message {
        Message::Cancel {
            index: self.piece,
            begin: self.offset,
            length: self.length,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(piece: u32, offset: u32, data: Bytes) -> Self {
        Self {
            piece,
            offset,
            data,
        }
    }

    pub fn request(&self) -> BlockRequest {
        BlockRequest {
            piece: self.piece,
            offset: self.offset,
            length: self.data.len() as u32,
        }
    }

    pub fn into_message(self) -> Message {
        Message::Piece {
            index: self.piece,
            begin: self.offset,
            data: self.data,
        }
    }
}

pub fn compute_block_count(piece_length: u64, block_size: u32) -> u32 {
    piece_length.div_ceil(block_size as u64) as u32
}

pub fn compute_block_length(piece_length: u64, block_index: u32, block_size: u32) -> u32 {
    let offset = block_index as u64 * block_size as u64;
    let remaining = piece_length.saturating_sub(offset);
    remaining.min(block_size as u64) as u32
}
