//! Error types shared by every layer of the crate.

use thiserror::Error;

use crate::protocol::FrameParsingError;

pub type Result<T> = core::result::Result<T, Error>;

/// Coarse classification of an [`Error`], for callers that only need to branch
/// on the failure category.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Validation,
    Timeout,
    Transport,
    Authentication,
    Integrity,
    Protocol,
    Capacity,
    SessionExpired,
    Unsupported,
    Config,
}

#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied property was unknown or out of range. No I/O happened.
    #[error("{0}")]
    OutOfRange(String),

    #[error("No response received: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// CRC, checksum or signature mismatch.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Maximum queue depth reached")]
    QueueFull,

    #[error("Session expired")]
    SessionExpired,

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Config(String),

    #[error("Invalid hex string: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfRange(_) => ErrorKind::Validation,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Transport(_) | Error::Io(_) | Error::Http(_) => ErrorKind::Transport,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Protocol(_) | Error::Json(_) => ErrorKind::Protocol,
            Error::QueueFull => ErrorKind::Capacity,
            Error::SessionExpired => ErrorKind::SessionExpired,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Config(_) | Error::Hex(_) => ErrorKind::Config,
        }
    }

    /// Timeouts and transport failures may succeed when the command is sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Transport)
    }
}

impl<'a> From<FrameParsingError<'a>> for Error {
    fn from(err: FrameParsingError<'a>) -> Self {
        match err {
            FrameParsingError::InvalidChecksum => Error::Integrity("invalid checksum".into()),
            FrameParsingError::InvalidCrc => Error::Integrity("invalid CRC8".into()),
            FrameParsingError::InvalidHeader => Error::Protocol("invalid frame header".into()),
            FrameParsingError::IncompleteData(needed) => {
                Error::Protocol(format!("incomplete frame (needed {:?})", needed))
            }
            FrameParsingError::UnknownError(rest) => {
                Error::Protocol(format!("unparseable frame data: {}", hex::encode(rest)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_test() {
        assert_eq!(ErrorKind::Validation, Error::OutOfRange("x".into()).kind());
        assert_eq!(ErrorKind::Capacity, Error::QueueFull.kind());
        assert_eq!(ErrorKind::Integrity, Error::from(FrameParsingError::InvalidCrc).kind());
        assert!(Error::Timeout("getStatus".into()).is_retryable());
        assert!(!Error::Authentication("bad signature".into()).is_retryable());
    }
}
