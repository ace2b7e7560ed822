use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Error returned by a listener callback. The reactor closes the connection.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection rejected: {0}")]
    Rejected(ListenerError),

    #[error("reactor is shut down")]
    Shutdown,
}

impl ReactorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReactorError::Timeout(_))
    }
}
