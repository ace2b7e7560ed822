use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use super::bitfield::Bitfield;
use super::choking::ChokingState;
use super::error::PeerError;
use super::message::Message;
use super::peer_id::PeerId;
use super::piece::BlockRequest;
use crate::reactor::ConnectionId;

/// Everything a torrent session knows about one connected peer.
///
/// State changes that the peer must hear about go through methods that queue
/// the matching message, so only real transitions reach the wire.
#[derive(Debug)]
pub struct PeerState {
    pub id: PeerId,
    pub connection: ConnectionId,
    pub addr: SocketAddr,
    pub choking: ChokingState,
    pub bitfield: Bitfield,
    /// Blocks we asked this peer for and have not received.
    pub in_flight: Vec<BlockRequest>,
    /// Blocks the peer asked us for, served in order.
    pub upload_queue: VecDeque<BlockRequest>,
    pub downloaded: u64,
    pub uploaded: u64,
    outbox: BytesMut,
    received_any: bool,
    last_sent: Instant,
}

impl PeerState {
    pub fn new(id: PeerId, connection: ConnectionId, addr: SocketAddr, piece_count: usize) -> Self {
        Self {
            id,
            connection,
            addr,
            choking: ChokingState::default(),
            bitfield: Bitfield::new(piece_count),
            in_flight: Vec::new(),
            upload_queue: VecDeque::new(),
            downloaded: 0,
            uploaded: 0,
            outbox: BytesMut::new(),
            received_any: false,
            last_sent: Instant::now(),
        }
    }

    /// Queues a message for the peer.
    pub fn send(&mut self, message: &Message) {
        message.encode_into(&mut self.outbox);
        self.last_sent = Instant::now();
    }

    /// Moves queued bytes into `out`, preserving order.
    pub fn drain_outbox(&mut self, out: &mut BytesMut) {
        if !self.outbox.is_empty() {
            out.extend_from_slice(&self.outbox);
            self.outbox.clear();
        }
    }

    pub fn has_outbox(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Records that a message other than keep-alive arrived. Returns whether
    /// it was the first one.
    pub fn mark_received(&mut self) -> bool {
        !std::mem::replace(&mut self.received_any, true)
    }

    /// Applies a `bitfield` message, which is only valid as the first message.
    pub fn apply_bitfield(&mut self, payload: &[u8], first: bool) -> Result<(), PeerError> {
        if !first {
            return Err(PeerError::Protocol(
                "bitfield is only allowed as the first message".into(),
            ));
        }
        self.bitfield = Bitfield::from_payload(payload, self.bitfield.piece_count())?;
        Ok(())
    }

    /// Applies a `have` message. Returns `true` if the piece is new for this peer.
    pub fn apply_have(&mut self, piece: u32) -> Result<bool, PeerError> {
        let index = piece as usize;
        if index >= self.bitfield.piece_count() {
            return Err(PeerError::Protocol(format!("have for piece {piece} out of range")));
        }
        if self.bitfield.has_piece(index) {
            return Ok(false);
        }
        self.bitfield.set_piece(index);
        Ok(true)
    }

    /// Updates our interest, queueing a message only on change.
    pub fn set_interest(&mut self, interested: bool) -> bool {
        if self.choking.am_interested == interested {
            return false;
        }
        self.choking.am_interested = interested;
        self.send(if interested {
            &Message::Interested
        } else {
            &Message::NotInterested
        });
        true
    }

    /// Chokes or unchokes the peer, queueing a message only on change.
    /// Choking drops the peer's pending upload requests.
    pub fn set_choking(&mut self, choking: bool) -> bool {
        if self.choking.am_choking == choking {
            return false;
        }
        self.choking.am_choking = choking;
        if choking {
            self.upload_queue.clear();
            self.send(&Message::Choke);
        } else {
            self.send(&Message::Unchoke);
        }
        true
    }

    /// Free request slots in the pipeline.
    pub fn pipeline_room(&self, depth: usize) -> usize {
        depth.saturating_sub(self.in_flight.len())
    }

    pub fn can_request(&self) -> bool {
        !self.choking.peer_choking && self.choking.am_interested
    }

    /// Removes a block from the in-flight list. Returns whether it was there.
    pub fn complete_request(&mut self, request: &BlockRequest) -> bool {
        match self.in_flight.iter().position(|r| r == request) {
            Some(pos) => {
                self.in_flight.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Queues an upload unless the same block is already queued.
    pub fn queue_upload(&mut self, request: BlockRequest) {
        if !self.upload_queue.contains(&request) {
            self.upload_queue.push_back(request);
        }
    }

    pub fn cancel_upload(&mut self, request: &BlockRequest) -> bool {
        let before = self.upload_queue.len();
        self.upload_queue.retain(|r| r != request);
        self.upload_queue.len() != before
    }

    pub fn keepalive_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_sent) >= interval
    }
}
