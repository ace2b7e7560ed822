use bytes::Bytes;

use super::error::PeerError;

/// One bit per piece, high bit of the first byte first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xff; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Parses a `bitfield` message payload.
    ///
    /// The payload must be exactly `⌈piece_count / 8⌉` bytes; set spare bits
    /// after the last piece are a protocol violation.
    pub fn from_payload(payload: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if payload.len() != expected {
            return Err(PeerError::Protocol(format!(
                "bitfield is {} bytes, expected {expected}",
                payload.len()
            )));
        }

        let bf = Self {
            bits: payload.to_vec(),
            piece_count,
        };
        let spare = piece_count % 8;
        if spare != 0 && bf.bits[expected - 1] & (0xff >> spare) != 0 {
            return Err(PeerError::Protocol("bitfield has spare bits set".into()));
        }
        Ok(bf)
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set_piece(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear_piece(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Indices of set bits, ascending.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has_piece(i))
    }

    /// True when `self` has at least one piece that `ours` lacks.
    pub fn has_any_missing_from(&self, ours: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(&ours.bits)
            .any(|(theirs, ours)| theirs & !ours != 0)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.piece_count % 8;
        if spare == 0 {
            return;
        }
        if let Some(last) = self.bits.last_mut() {
            *last &= 0xff << (8 - spare);
        }
    }
}
