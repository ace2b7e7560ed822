use thiserror::Error;

use super::peer_id::PeerId;
use crate::metainfo::InfoHash;
use crate::storage::StorageError;

/// Errors that end a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(&'static str),

    /// An outbound connection answered for a different torrent.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// An inbound handshake named a torrent we are not serving.
    #[error("unknown torrent {0}")]
    UnknownTorrent(InfoHash),

    #[error("connected to ourselves")]
    SelfConnection,

    /// Another connection to the same peer for the same torrent is active.
    #[error("duplicate connection to {0}")]
    DuplicatePeer(PeerId),

    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer limit reached")]
    TooManyPeers,

    #[error("torrent session stopped")]
    SessionStopped,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
