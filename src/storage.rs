//! Piece storage over the files of a torrent.
//!
//! A torrent's files are treated as one logical byte stream; pieces and blocks
//! are ranges of that stream and may cross file boundaries. [`PieceStore`]
//! maps those ranges to file I/O, tracks the [`PieceState`] of every piece and
//! checks completed pieces against their SHA-1 digests.
//!
//! # Examples
//!
//! ```no_run
//! use bitswarm::metainfo::Metainfo;
//! use bitswarm::storage::{PieceState, PieceStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let metainfo = Metainfo::from_file("example.torrent")?;
//! let store = PieceStore::open("downloads", &metainfo)?;
//! store.preallocate()?;
//!
//! let block = vec![0u8; 16384];
//! if store.write_block(0, 0, &block)? == PieceState::Complete {
//!     let valid = store.verify_piece(0)?;
//!     println!("piece 0 valid: {valid}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! File handles are opened lazily and kept for the store's lifetime. Paths
//! that are absolute or contain `..` are rejected when the store is built.

mod error;
mod file;
mod store;

pub use error::StorageError;
pub use file::{file_spans, FileEntry, FileSpan};
pub use store::{PieceState, PieceStore};
