use thiserror::Error;

/// Errors surfaced by channel operations and the bind dispatcher.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    ChannelClosed,
    #[error("map batch at offset {offset} is entirely behind offset {expected}")]
    StaleOffset { offset: u64, expected: u64 },
    #[error("map batch at offset {offset} leaves a gap before offset {expected}")]
    GapOffset { offset: u64, expected: u64 },
    #[error("back channel broken")]
    BackChannelBroken,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Request-level failures in the HTTP dispatcher.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("Unknown SID")]
    UnknownSession,
    #[error("Unsupported protocol version.")]
    UnsupportedVersion,
}

impl RequestError {
    pub fn malformed(what: impl Into<String>) -> Self {
        Self::Malformed(what.into())
    }
}
