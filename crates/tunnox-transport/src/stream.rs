//! Stream traits and connection capabilities

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tunnox_proto::{PacketError, TransferPacket};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] PacketError),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Transient timeouts (UDP-style reads) that a copy loop should
    /// ride over instead of treating as end-of-stream
    pub fn is_temporary(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Physical transport a connection arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    WebSocket,
    Quic,
    HttpLongPoll,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::WebSocket => "websocket",
            TransportProtocol::Quic => "quic",
            TransportProtocol::HttpLongPoll => "http-longpoll",
        }
    }
}

/// What a connection's transport can do for the session layer
///
/// Replaces per-call feature probing: the flags are fixed per transport
/// variant and every behavioral fork in the core keys off one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCapabilities {
    /// The bridge data plane may consume this connection's raw bytes
    pub supports_byte_bridging: bool,
    /// The connection stays registered as control after a tunnel open
    /// (long-polling transports reuse one registration across polls)
    pub keep_in_registry_after_tunnel: bool,
    /// May stand in as a short-lived control channel before handshake
    pub can_be_temporary_control: bool,
    /// The transport layer itself authenticates and carries a client id
    pub carries_client_id_in_protocol: bool,
}

impl ConnectionCapabilities {
    pub fn for_protocol(protocol: TransportProtocol) -> Self {
        match protocol {
            TransportProtocol::Tcp => Self {
                supports_byte_bridging: true,
                keep_in_registry_after_tunnel: false,
                can_be_temporary_control: false,
                carries_client_id_in_protocol: false,
            },
            TransportProtocol::WebSocket => Self {
                supports_byte_bridging: true,
                keep_in_registry_after_tunnel: false,
                can_be_temporary_control: false,
                carries_client_id_in_protocol: true,
            },
            TransportProtocol::Quic => Self {
                supports_byte_bridging: true,
                keep_in_registry_after_tunnel: false,
                can_be_temporary_control: false,
                carries_client_id_in_protocol: true,
            },
            TransportProtocol::HttpLongPoll => Self {
                supports_byte_bridging: true,
                keep_in_registry_after_tunnel: true,
                can_be_temporary_control: true,
                carries_client_id_in_protocol: false,
            },
        }
    }
}

/// Raw byte I/O over a connection
///
/// `read_bytes` returning `Ok(0)` signals end-of-stream. Writes are
/// complete-or-error. `shutdown_write` half-closes so EOF propagates to
/// the peer while reads continue draining.
#[async_trait]
pub trait ByteStream: Send + Sync {
    async fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    async fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn shutdown_write(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Framed packet I/O over a connection
///
/// A `PacketStream` is also a [`ByteStream`]: once the session hands a
/// connection to a bridge, the bridge reads the same underlying pipe in
/// byte mode (buffered leftovers first).
#[async_trait]
pub trait PacketStream: ByteStream {
    /// Send one framed packet
    async fn send_packet(&self, packet: &TransferPacket) -> Result<(), TransportError>;

    /// Receive one framed packet; `Ok(None)` on a clean end-of-stream
    async fn recv_packet(&self) -> Result<Option<TransferPacket>, TransportError>;

    fn protocol(&self) -> TransportProtocol;

    fn capabilities(&self) -> ConnectionCapabilities {
        ConnectionCapabilities::for_protocol(self.protocol())
    }

    /// Client id the transport layer authenticated, if it carries one
    fn transport_client_id(&self) -> Option<i64>;

    /// Upcast helper for handing the stream to a bridge
    fn as_byte_stream(self: Arc<Self>) -> Arc<dyn ByteStream>;
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Builds a [`PacketStream`] over a reader/writer pair
pub trait StreamFactory: Send + Sync {
    fn create(
        &self,
        reader: BoxedReader,
        writer: BoxedWriter,
        protocol: TransportProtocol,
    ) -> Arc<dyn PacketStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_per_protocol() {
        let tcp = ConnectionCapabilities::for_protocol(TransportProtocol::Tcp);
        assert!(tcp.supports_byte_bridging);
        assert!(!tcp.keep_in_registry_after_tunnel);
        assert!(!tcp.carries_client_id_in_protocol);

        let quic = ConnectionCapabilities::for_protocol(TransportProtocol::Quic);
        assert!(quic.carries_client_id_in_protocol);

        let poll = ConnectionCapabilities::for_protocol(TransportProtocol::HttpLongPoll);
        assert!(poll.keep_in_registry_after_tunnel);
        assert!(poll.can_be_temporary_control);
    }

    #[test]
    fn test_temporary_errors() {
        assert!(TransportError::Timeout.is_temporary());
        assert!(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "read timed out"
        ))
        .is_temporary());
        assert!(!TransportError::ConnectionClosed.is_temporary());
    }
}
