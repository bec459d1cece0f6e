//! Crate-level error: one variant per externally visible failure kind.
//! `Display` is the human-readable reason; `kind()` is the stable code.

use uuid::Uuid;

use crate::boundary::{BackendError, HostError};
use crate::chunk::ChunkError;
use crate::connection::ConnectionError;
use crate::crdt::DocumentError;
use crate::dispatch::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedMessage,
    NotConnected,
    DuplicateHandler,
    AuthenticationFailed,
    DivergenceDetected,
    UnresolvedSync,
    QuotaExceeded,
    Backend,
    Host,
    UnknownPage,
    InvalidState,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("not connected to the SamePage network")]
    NotConnected,
    #[error("operation {0} already has a handler")]
    DuplicateHandler(String),
    #[error("Failed to connect to SamePage Network: {0}")]
    AuthenticationFailed(String),
    #[error("page {page} diverged from its peers: {reason}")]
    DivergenceDetected { page: Uuid, reason: String },
    #[error("page {page} could not be resynchronized: {reason}")]
    UnresolvedSync { page: Uuid, reason: String },
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("backend request failed: {0}")]
    Backend(#[from] BackendError),
    #[error("host application failed: {0}")]
    Host(#[from] HostError),
    #[error("unknown page {0}")]
    UnknownPage(String),
    #[error("{0}")]
    InvalidState(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::DuplicateHandler(_) => ErrorKind::DuplicateHandler,
            Error::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Error::DivergenceDetected { .. } => ErrorKind::DivergenceDetected,
            Error::UnresolvedSync { .. } => ErrorKind::UnresolvedSync,
            Error::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Error::Backend(_) => ErrorKind::Backend,
            Error::Host(_) => ErrorKind::Host,
            Error::UnknownPage(_) => ErrorKind::UnknownPage,
            Error::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Text a host application can show as-is.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<ChunkError> for Error {
    fn from(e: ChunkError) -> Self {
        Error::MalformedMessage(e.to_string())
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::NotConnected => Error::NotConnected,
        }
    }
}

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::DuplicateHandler(op) => Error::DuplicateHandler(op),
        }
    }
}

impl From<DocumentError> for Error {
    fn from(e: DocumentError) -> Self {
        Error::InvalidState(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_is_distinct_from_kind() {
        let e = Error::AuthenticationFailed("token expired".into());
        assert_eq!(e.kind(), ErrorKind::AuthenticationFailed);
        assert!(e.reason().contains("token expired"));
    }

    #[test]
    fn not_connected_maps_from_connection_error() {
        let e: Error = ConnectionError::NotConnected.into();
        assert_eq!(e.kind(), ErrorKind::NotConnected);
    }
}
