use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("missing parameter: {0}")]
    MissingParam(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
}
