use std::time::Duration;

use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors raised while building or parsing torrent descriptors.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("info hash must be 20 bytes, got {0}")]
    InvalidInfoHashLength(usize),

    /// A file handed to the builder does not live under the torrent's parent directory.
    #[error("{0} is not inside the torrent directory")]
    OutsideParent(String),

    /// A hashing worker went away before delivering its digest.
    #[error("hashing worker failed")]
    Hashing,

    #[error("very slow hashing: took more than {} seconds to calculate several pieces", .0.as_secs())]
    SlowHashing(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
