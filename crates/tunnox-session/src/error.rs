//! Session error taxonomy and packet handler dispositions

use thiserror::Error;
use tunnox_broker::BrokerError;
use tunnox_proto::{FrameError, PacketError};
use tunnox_storage::StorageError;
use tunnox_transport::TransportError;

/// Errors surfaced by the session core
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unsupported packet type: {0:#04x}")]
    Unsupported(u8),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<PacketError> for SessionError {
    fn from(e: PacketError) -> Self {
        SessionError::InvalidPacket(e.to_string())
    }
}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        SessionError::InvalidPacket(e.to_string())
    }
}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => SessionError::NotFound(key),
            StorageError::Expired(key) => SessionError::NotFound(key),
            StorageError::Unavailable(reason) => SessionError::Unavailable(reason),
        }
    }
}

impl From<BrokerError> for SessionError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Timeout(what) => SessionError::Timeout(what),
            other => SessionError::Unavailable(other.to_string()),
        }
    }
}

/// What the read loop should do with a connection after a packet
/// has been handled
///
/// `HandedOff` means a bridge now owns the connection's bytes: the
/// read loop exits silently and must not touch the stream again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep reading packets
    Continue,
    /// The connection now belongs to a bridge; stop reading, do not close
    HandedOff,
    /// Close the connection
    CloseConnection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        let e: SessionError = StorageError::NotFound("k".to_string()).into();
        assert!(matches!(e, SessionError::NotFound(_)));

        let e: SessionError = StorageError::Expired("k".to_string()).into();
        assert!(matches!(e, SessionError::NotFound(_)));

        let e: SessionError = StorageError::Unavailable("down".to_string()).into();
        assert!(matches!(e, SessionError::Unavailable(_)));
    }

    #[test]
    fn test_broker_error_mapping() {
        let e: SessionError = BrokerError::Timeout("tunnel.ready t1".to_string()).into();
        assert!(matches!(e, SessionError::Timeout(_)));

        let e: SessionError = BrokerError::Closed.into();
        assert!(matches!(e, SessionError::Unavailable(_)));
    }
}
