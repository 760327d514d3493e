//! # Transport Errors
//!
//! Purpose: Describe every way a framed request can fail so callers can
//! match on the cause instead of parsing messages.
//!
//! ## Usage Notes
//!
//! - Errors reach callers through the completion callback; none of them are
//!   raised as panics. The only panic in the client is a second `submit` on a
//!   busy connection.
//! - I/O variants keep the underlying `std::io::Error` as their source.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type for frame encoding.
pub type FrameResult<T> = Result<T, FrameError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised while building a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The payload length does not fit the 32-bit length prefix.
    #[error("payload of {len} bytes does not fit in a frame")]
    PayloadTooLarge { len: usize },
}

/// Errors surfaced to the completion callback of a request.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Every endpoint refused the connection; carries the last attempt.
    #[error("connect to {endpoint} failed: {source}")]
    ConnectFailed {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Socket error while writing the request frame.
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),
    /// Socket error while reading the response frame.
    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),
    /// The request deadline elapsed before the response arrived.
    #[error("request timed out")]
    TimedOut,
    /// The owner shut the connection down while the request was pending.
    #[error("connection shut down")]
    Shutdown,
    /// The pool already holds its maximum number of outstanding requests.
    #[error("too many outstanding requests")]
    Backpressure,
    /// A connection was built without any endpoint to dial.
    #[error("no endpoints to connect to")]
    NoEndpoints,
    /// Host name resolution failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    /// The request payload could not be framed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl TransportError {
    /// Returns true when the request ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::TimedOut)
    }

    /// Returns the I/O error kind for socket-level failures.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::ConnectFailed { source, .. } | TransportError::Resolve { source, .. } => {
                Some(source.kind())
            }
            TransportError::WriteFailed(err) | TransportError::ReadFailed(err) => Some(err.kind()),
            _ => None,
        }
    }
}
