use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FetchError>;

/// Failures while turning a raw body into text.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("gzip body could not be inflated: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),
}

/// Unified error type for fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Attempt task failed: {0}")]
    TaskFailed(String),

    #[error("Response rejected: {0}")]
    Rejected(String),

    #[error("Engine is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether a different exit address might make the next attempt succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_builder(),
            Self::Timeout(_) | Self::TaskFailed(_) | Self::Io(_) | Self::Rejected(_) => true,
            Self::Decode(DecodeError::Gzip(_)) => true,
            Self::Decode(DecodeError::UnsupportedCharset(_)) => false,
            Self::InvalidRequest(_) | Self::Closed => false,
        }
    }
}
