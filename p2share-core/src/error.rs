//! Error taxonomy shared by the codec, endpoints and the engine.

use std::time::Duration;

use crate::integrity::ContentHash;
use crate::protocol::{ErrorCode, FileId};
use crate::transport::TransportError;
use crate::wire::FrameError;

/// Malformed or out-of-sequence traffic. The connection is closed and not retried.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("stream ended mid-frame ({remaining} bytes pending)")]
    Truncated { remaining: usize },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unexpected {got} while {during}")]
    Unexpected { got: &'static str, during: &'static str },
    #[error("chunk sequence {got} out of order (expected {expected})")]
    OutOfSequence { expected: u64, got: u64 },
    #[error("message for session {got} on session {expected}")]
    SessionMismatch { expected: u32, got: u32 },
    #[error("peer sent {got} bytes for a file advertised as {advertised}")]
    SizeExceeded { advertised: u64, got: u64 },
    #[error("peer offered {got} instead of requested {requested}")]
    WrongFile { requested: FileId, got: FileId },
}

/// Anything that ends a request or a transfer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("integrity check failed for {file_id}: expected {expected}, got {actual}")]
    Integrity {
        file_id: FileId,
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("peer is busy with another transfer")]
    Busy,
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("no data for {after:?} while {during}")]
    Timeout { after: Duration, during: &'static str },
    #[error("peer reported {code}: {detail}")]
    Remote { code: ErrorCode, detail: String },
    #[error("catalog: {0}")]
    Catalog(#[source] std::io::Error),
    #[error("reply of {len} bytes exceeds frame limit of {max}")]
    Oversize { len: usize, max: usize },
    #[error("endpoint already closed")]
    Closed,
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Map an `ERROR` message from the peer onto the local taxonomy.
    pub fn from_remote(code: ErrorCode, detail: String) -> Self {
        match code {
            ErrorCode::Busy => Error::Busy,
            ErrorCode::NotFound => Error::NotFound(detail),
            code => Error::Remote { code, detail },
        }
    }

    /// Whether the connection can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Protocol(_)
                | Error::Timeout { .. }
                | Error::Closed
                | Error::Cancelled
        )
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Transport(_) | Error::Closed => FailureKind::Transport,
            Error::Protocol(_) => FailureKind::Protocol,
            Error::Integrity { .. } => FailureKind::Integrity,
            Error::Busy => FailureKind::Busy,
            Error::NotFound(_) => FailureKind::NotFound,
            Error::Timeout { .. } => FailureKind::Timeout,
            Error::Remote { .. } => FailureKind::Remote,
            Error::Catalog(_) | Error::Oversize { .. } => FailureKind::Local,
            Error::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => Error::Transport(TransportError::Io(e)),
            FrameError::Protocol(e) => Error::Protocol(e),
            FrameError::Oversize { len, max } => Error::Oversize { len, max },
            FrameError::Encode(e) => Error::Protocol(ProtocolError::Malformed(e.to_string())),
        }
    }
}

/// Terminal failure reason of a transfer, as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Protocol,
    Integrity,
    Busy,
    NotFound,
    Timeout,
    Remote,
    Local,
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
