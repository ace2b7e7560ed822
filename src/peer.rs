//! Peer wire protocol (BEP-3)
//!
//! Handshake and message framing, per-peer state, block bookkeeping and the
//! upload choking policy. [`PeerChannel`] plugs a peer socket into the
//! reactor and hands decoded messages to the owning torrent session.
//!
//! No extensions are negotiated: reserved handshake bytes are sent as zero
//! and ignored on receipt, and unknown message ids are skipped.

mod bitfield;
mod channel;
mod choking;
mod error;
mod message;
mod peer_id;
mod piece;
mod state;

pub use bitfield::Bitfield;
pub use channel::PeerChannel;
pub use choking::{ChokingAlgorithm, ChokingState, PeerStats};
pub use error::PeerError;
pub use message::{Handshake, Message};
pub use peer_id::PeerId;
pub use piece::{compute_block_count, compute_block_length, Block, BlockRequest};
pub use state::PeerState;

#[cfg(test)]
mod tests;
