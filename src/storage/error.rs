use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece hash mismatch for piece {0}")]
    HashMismatch(u32),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("invalid block: piece {piece}, offset {offset}, length {length}")]
    InvalidBlock { piece: u32, offset: u32, length: u32 },

    #[error("disk full")]
    DiskFull,

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("hashing failed: {0}")]
    Hashing(#[from] crate::metainfo::MetainfoError),
}

impl StorageError {
    /// Failures of the local disk, as opposed to bad input from a peer.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::DiskFull | StorageError::Hashing(_)
        )
    }

    pub(crate) fn from_write(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::StorageFull {
            StorageError::DiskFull
        } else {
            StorageError::Io(e)
        }
    }
}
