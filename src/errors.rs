use std::io;
use std::result;

use thiserror::Error;

/// Errors surfaced by the host-interface layer.
///
/// Interface add/del return the underlying error verbatim; the upper vrouter
/// decides whether to drive cleanup. The TX path only ever reports that a
/// buffer could not be enqueued -- the buffer itself has already been freed
/// with a categorised drop counter by then.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}: not found")]
    NotFound(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    /// The process-wide stop flag is set; add/del are refused without
    /// side effects.
    #[error("device busy")]
    Busy,

    #[error("out of resources: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = result::Result<T, Error>;
