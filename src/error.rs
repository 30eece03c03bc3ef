use std::fmt::{Display, Formatter};

use crate::backend::BackendError;

/// Error type for the playback engine core.
#[derive(Debug)]
pub enum MediaError {
    /// Invalid or unknown configuration surfaced at `open`.
    Config(String),
    Io(std::io::Error),
    /// A demuxer read exceeded the configured read timeout.
    ReadTimeout,
    Seek(String),
    Decode(String),
    /// A frame could not be materialized into a block.
    Allocation(String),
    /// Operation on a disposed or uninitialized container.
    State(String),
    /// Writer-lock acquisition on a block's payload timed out.
    Contention(&'static str),
    Backend(BackendError),
}

impl Display for MediaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::ReadTimeout => write!(f, "read timed out"),
            Self::Seek(msg) => write!(f, "seek failed: {}", msg),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::Allocation(msg) => write!(f, "block allocation failed: {}", msg),
            Self::State(msg) => write!(f, "invalid state: {}", msg),
            Self::Contention(what) => write!(f, "lock contention on {}", what),
            Self::Backend(err) => write!(f, "backend error: {}", err),
        }
    }
}

impl std::error::Error for MediaError {}

impl From<std::io::Error> for MediaError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<BackendError> for MediaError {
    fn from(value: BackendError) -> Self {
        Self::Backend(value)
    }
}
