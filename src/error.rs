//! Crate-level error and its recovery classification.

use std::io;

use thiserror::Error;

use crate::bencode::BencodeError;
use crate::metainfo::{InfoHash, MetainfoError};
use crate::peer::PeerError;
use crate::reactor::ReactorError;
use crate::server::ServerError;
use crate::storage::StorageError;
use crate::tracker::TrackerError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bencode(#[from] BencodeError),

    #[error(transparent)]
    Metainfo(#[from] MetainfoError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("torrent {0} is already added")]
    DuplicateTorrent(InfoHash),

    #[error("unknown torrent {0}")]
    UnknownTorrent(InfoHash),
}

/// How a failure is recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or illegal input from a peer; the peer is dropped.
    ProtocolViolation,
    /// A piece failed its digest; contributing peers are dropped.
    HashMismatch,
    /// A connect, idle or hashing wait expired.
    Timeout,
    /// Socket level failure; the connection is dropped.
    Transport,
    /// A tracker failed; the announcer backs off.
    Tracker,
    /// Local disk, worker pool or configuration failure; fatal to the session.
    Resource,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Bencode(_) => ErrorKind::ProtocolViolation,
            Error::Metainfo(e) => metainfo_kind(e),
            Error::Storage(e) => storage_kind(e),
            Error::Reactor(e) => reactor_kind(e),
            Error::Peer(e) => peer_kind(e),
            Error::Tracker(_) => ErrorKind::Tracker,
            Error::Server(_) => ErrorKind::Transport,
            Error::Io(_) | Error::DuplicateTorrent(_) | Error::UnknownTorrent(_) => {
                ErrorKind::Resource
            }
        }
    }
}

fn metainfo_kind(e: &MetainfoError) -> ErrorKind {
    match e {
        MetainfoError::SlowHashing(_) => ErrorKind::Timeout,
        MetainfoError::Hashing | MetainfoError::Io(_) | MetainfoError::OutsideParent(_) => {
            ErrorKind::Resource
        }
        _ => ErrorKind::ProtocolViolation,
    }
}

fn storage_kind(e: &StorageError) -> ErrorKind {
    match e {
        StorageError::HashMismatch(_) => ErrorKind::HashMismatch,
        StorageError::Hashing(inner) => metainfo_kind(inner),
        e if e.is_resource() => ErrorKind::Resource,
        _ => ErrorKind::ProtocolViolation,
    }
}

fn reactor_kind(e: &ReactorError) -> ErrorKind {
    match e {
        ReactorError::Timeout(_) => ErrorKind::Timeout,
        ReactorError::Shutdown => ErrorKind::Resource,
        ReactorError::Rejected(_) => ErrorKind::ProtocolViolation,
        ReactorError::Io(_) | ReactorError::Connect { .. } => ErrorKind::Transport,
    }
}

fn peer_kind(e: &PeerError) -> ErrorKind {
    match e {
        PeerError::Io(_) => ErrorKind::Transport,
        PeerError::Storage(inner) => storage_kind(inner),
        PeerError::SessionStopped | PeerError::TooManyPeers => ErrorKind::Resource,
        _ => ErrorKind::ProtocolViolation,
    }
}
