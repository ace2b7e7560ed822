//! Torrent descriptors: building, hashing and parsing.
//!
//! A descriptor (`.torrent` file) names the shared content, splits it into
//! fixed-size pieces and records the SHA-1 digest of each piece. The digest
//! of the bencoded `info` dictionary, the [`InfoHash`], identifies the swarm.
//!
//! # Examples
//!
//! ## Creating a descriptor
//!
//! ```no_run
//! use bitswarm::config::HashingConfig;
//! use bitswarm::metainfo::TorrentBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bytes = TorrentBuilder::new("movie.mkv")
//!     .announce("http://localhost:6969/announce")
//!     .hashing(HashingConfig::from_env())
//!     .build()?;
//! std::fs::write("movie.torrent", &bytes)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Parsing one
//!
//! ```no_run
//! use bitswarm::metainfo::Metainfo;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let torrent = Metainfo::from_file("movie.torrent")?;
//! for file in &torrent.info.files {
//!     println!("{} ({} bytes)", file.path.display(), file.length);
//! }
//! for tracker in torrent.trackers() {
//!     println!("tracker: {tracker}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Piece hashing
//!
//! [`HashingPool::hash_files`] reads the files as one stream through a single
//! rolling buffer. Each full buffer is handed to a worker; at most
//! `threads` digests are outstanding before they are collected, in the order
//! they were submitted. The output is therefore the same for any pool size.
//! A digest that takes longer than the configured timeout aborts the build
//! with [`MetainfoError::SlowHashing`].

mod builder;
mod error;
mod hasher;
mod info_hash;
mod torrent;

pub use builder::{list_files, TorrentBuilder};
pub use error::MetainfoError;
pub use hasher::{HashingPool, PendingDigest};
pub use info_hash::InfoHash;
pub use torrent::{expected_piece_count, File, Info, Metainfo};

#[cfg(test)]
mod tests;
