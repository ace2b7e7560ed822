//! Torrent sessions and the client that hosts them.
//!
//! A [`TorrentSession`] owns one torrent's piece store, its peer arena, the
//! [`PiecePicker`] and the choking policy. Sessions are shared through a
//! [`SessionTable`] with every [`PeerChannel`](crate::peer::PeerChannel);
//! the [`PeerRegistry`] guarantees one connection per (info-hash, peer id).
//! [`Client`] wires sessions to the reactor, the hashing pool and the
//! tracker announcers.

mod client;
mod picker;
mod registry;
mod table;
mod torrent;

pub use client::Client;
pub use picker::{BlockOutcome, BlockStatus, PiecePicker};
pub use registry::PeerRegistry;
pub use table::SessionTable;
pub use torrent::TorrentSession;

#[cfg(test)]
mod tests;
