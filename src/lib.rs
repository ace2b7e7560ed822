//! bitswarm - BitTorrent metainfo builder, tracker and client
//!
//! The crate builds and parses torrent descriptors, runs an HTTP tracker and
//! drives a seeding/leeching client over the BitTorrent 1.0 peer wire
//! protocol.
//!
//! # Modules
//!
//! - [`bencode`] - Bencode encoding/decoding
//! - [`metainfo`] - Torrent descriptors, info-hashes and the piece hashing pool
//! - [`storage`] - Piece storage over a torrent's files
//! - [`reactor`] - Single-threaded non-blocking connection reactor
//! - [`peer`] - Peer wire protocol, per-peer state and choking
//! - [`session`] - Torrent sessions, piece picking and the client
//! - [`tracker`] - HTTP tracker client and announce scheduling
//! - [`server`] - HTTP tracker server
//! - [`throttle`] - Bandwidth limiting
//! - [`config`] / [`constants`] - Runtime settings and protocol defaults

pub mod bencode;
pub mod config;
pub mod constants;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod reactor;
pub mod server;
pub mod session;
pub mod storage;
pub mod throttle;
pub mod tracker;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{ClientConfig, HashingConfig, ReactorConfig, SessionConfig, TrackerConfig};
pub use error::{Error, ErrorKind, Result};
pub use metainfo::{File, HashingPool, Info, InfoHash, Metainfo, MetainfoError, TorrentBuilder};
pub use peer::{
    Bitfield, Block, BlockRequest, ChokingAlgorithm, Handshake, Message, PeerChannel, PeerError,
    PeerId, PeerState,
};
pub use reactor::{ConnectionListener, Reactor, ReactorError, ReactorHandle};
pub use server::{ServerError, SwarmRegistry, TrackerServer};
pub use session::{Client, TorrentSession};
pub use storage::{FileEntry, PieceState, PieceStore, StorageError};
pub use tracker::{
    AnnounceResponse, Announcer, CompactPeer, HttpTracker, ScrapeResponse, TrackerError,
    TrackerEvent,
};
