use std::collections::HashSet;

use crate::peer::{compute_block_count, compute_block_length, Bitfield, BlockRequest, PeerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    Missing,
    /// In flight to these peers; more than one only during end-game.
    Requested(Vec<PeerId>),
    Received,
}

#[derive(Debug, Default)]
struct PieceEntry {
    verified: bool,
    /// Empty until the first block of the piece is requested or received.
    blocks: Vec<BlockStatus>,
    /// Peers whose data went into the piece.
    contributors: HashSet<PeerId>,
}

/// Result of handing a received block to the picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// New data; the listed peers were also asked for it and should get a cancel.
    Accepted { cancel: Vec<PeerId> },
    /// Already received or already verified.
    Duplicate,
    /// Does not line up with the block grid.
    Invalid,
}

/// Chooses which blocks to request from which peer.
///
/// Pieces are taken rarest first (ties go to the lower index) and blocks in
/// order within a piece. A block in flight to one peer is not requested from
/// another unless end-game has started, that is, fewer than the threshold of
/// pieces are still missing.
#[derive(Debug)]
pub struct PiecePicker {
    pieces: Vec<PieceEntry>,
    availability: Vec<u32>,
    piece_length: u64,
    total_length: u64,
    block_size: u32,
    missing: usize,
    endgame_threshold: usize,
}

impl PiecePicker {
    pub fn new(
        have: &Bitfield,
        piece_length: u64,
        total_length: u64,
        block_size: u32,
        endgame_threshold: usize,
    ) -> Self {
        let count = have.piece_count();
        let pieces: Vec<PieceEntry> = (0..count)
            .map(|i| PieceEntry {
                verified: have.has_piece(i),
                ..PieceEntry::default()
            })
            .collect();
        let missing = pieces.iter().filter(|p| !p.verified).count();

        Self {
            pieces,
            availability: vec![0; count],
            piece_length,
            total_length,
            block_size,
            missing,
            endgame_threshold,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn missing(&self) -> usize {
        self.missing
    }

    pub fn is_endgame(&self) -> bool {
        self.missing > 0 && self.missing < self.endgame_threshold
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.availability.get(piece as usize).copied().unwrap_or(0)
    }

    fn piece_size(&self, piece: usize) -> u64 {
        let start = piece as u64 * self.piece_length;
        self.total_length.saturating_sub(start).min(self.piece_length)
    }

    fn ensure_blocks(&mut self, piece: usize) {
        if self.pieces[piece].blocks.is_empty() {
            let count = compute_block_count(self.piece_size(piece), self.block_size) as usize;
            self.pieces[piece].blocks = vec![BlockStatus::Missing; count];
        }
    }

    fn block(&self, piece: usize, index: usize) -> BlockRequest {
        BlockRequest::new(
            piece as u32,
            index as u32 * self.block_size,
            compute_block_length(self.piece_size(piece), index as u32, self.block_size),
        )
    }

    pub fn peer_bitfield(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.pieces() {
            if let Some(count) = self.availability.get_mut(piece) {
                *count += 1;
            }
        }
    }

    pub fn peer_have(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    /// Forgets a departed peer: its pieces no longer count toward
    /// availability and its in-flight blocks become requestable again.
    pub fn peer_gone(&mut self, peer: &PeerId, bitfield: &Bitfield, in_flight: &[BlockRequest]) {
        for piece in bitfield.pieces() {
            if let Some(count) = self.availability.get_mut(piece) {
                *count = count.saturating_sub(1);
            }
        }
        self.cancel_requests(peer, in_flight);
    }

    /// Releases blocks that `peer` will no longer deliver.
    pub fn cancel_requests(&mut self, peer: &PeerId, requests: &[BlockRequest]) {
        for request in requests {
            let Some(entry) = self.pieces.get_mut(request.piece as usize) else {
                continue;
            };
            let index = (request.offset / self.block_size) as usize;
            if let Some(status) = entry.blocks.get_mut(index) {
                if let BlockStatus::Requested(peers) = status {
                    peers.retain(|p| p != peer);
                    if peers.is_empty() {
                        *status = BlockStatus::Missing;
                    }
                }
            }
        }
    }

    /// Whether `bitfield` offers any piece we still need.
    pub fn interesting(&self, bitfield: &Bitfield) -> bool {
        bitfield
            .pieces()
            .any(|i| self.pieces.get(i).is_some_and(|p| !p.verified))
    }

    /// Picks up to `max` blocks to request from `peer` and marks them requested.
    pub fn next_requests(&mut self, peer: &PeerId, bitfield: &Bitfield, max: usize) -> Vec<BlockRequest> {
        let mut picked = Vec::new();
        if max == 0 {
            return picked;
        }

        let mut candidates: Vec<usize> = bitfield
            .pieces()
            .filter(|&i| self.pieces.get(i).is_some_and(|p| !p.verified))
            .collect();
        candidates.sort_by_key(|&i| (self.availability[i], i));

        for &piece in &candidates {
            self.ensure_blocks(piece);
            for index in 0..self.pieces[piece].blocks.len() {
                if picked.len() == max {
                    return picked;
                }
                if self.pieces[piece].blocks[index] == BlockStatus::Missing {
                    self.pieces[piece].blocks[index] = BlockStatus::Requested(vec![*peer]);
                    picked.push(self.block(piece, index));
                }
            }
        }

        if !self.is_endgame() {
            return picked;
        }

        for &piece in &candidates {
            for index in 0..self.pieces[piece].blocks.len() {
                if picked.len() == max {
                    return picked;
                }
                if let BlockStatus::Requested(peers) = &mut self.pieces[piece].blocks[index] {
                    if !peers.contains(peer) {
                        peers.push(*peer);
                        let request = self.block(piece, index);
                        picked.push(request);
                    }
                }
            }
        }

        picked
    }

    /// Records a block that arrived from `peer`.
    pub fn block_received(&mut self, peer: &PeerId, request: &BlockRequest) -> BlockOutcome {
        let piece = request.piece as usize;
        if piece >= self.pieces.len()
            || request.offset % self.block_size != 0
            || request.length == 0
        {
            return BlockOutcome::Invalid;
        }
        if self.pieces[piece].verified {
            return BlockOutcome::Duplicate;
        }

        self.ensure_blocks(piece);
        let index = (request.offset / self.block_size) as usize;
        if index >= self.pieces[piece].blocks.len() || self.block(piece, index) != *request {
            return BlockOutcome::Invalid;
        }

        let entry = &mut self.pieces[piece];
        let previous = std::mem::replace(&mut entry.blocks[index], BlockStatus::Received);
        let cancel = match previous {
            BlockStatus::Received => return BlockOutcome::Duplicate,
            BlockStatus::Missing => Vec::new(),
            BlockStatus::Requested(peers) => peers.into_iter().filter(|p| p != peer).collect(),
        };
        entry.contributors.insert(*peer);
        BlockOutcome::Accepted { cancel }
    }

    pub fn piece_verified(&mut self, piece: u32) {
        if let Some(entry) = self.pieces.get_mut(piece as usize) {
            if !entry.verified {
                entry.verified = true;
                entry.blocks = Vec::new();
                entry.contributors.clear();
                self.missing -= 1;
            }
        }
    }

    /// Resets a piece that failed verification and returns the peers that
    /// supplied its data.
    pub fn piece_failed(&mut self, piece: u32) -> Vec<PeerId> {
        match self.pieces.get_mut(piece as usize) {
            Some(entry) if !entry.verified => {
                entry.blocks.clear();
                entry.contributors.drain().collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn block_status(&self, request: &BlockRequest) -> Option<&BlockStatus> {
        let entry = self.pieces.get(request.piece as usize)?;
        entry.blocks.get((request.offset / self.block_size) as usize)
    }
}
