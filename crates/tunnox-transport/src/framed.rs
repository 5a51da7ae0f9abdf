//! Framed packet stream over a byte pipe
//!
//! [`FramedPacketStream`] speaks the packet codec while the connection
//! is in its framed phase and exposes raw byte I/O afterwards; bytes
//! already buffered by the decoder are drained first so nothing is lost
//! at the switch. [`DuplexByteStream`] is the byte-only wrapper used
//! for dedicated inter-node TCP connections.
//!
//! Both wrappers carry an internal close token: `close()` interrupts
//! in-flight reads and writes instead of waiting for the peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use tunnox_proto::TransferPacket;

use crate::codec::PacketCodec;
use crate::stream::{
    BoxedReader, BoxedWriter, ByteStream, PacketStream, StreamFactory, TransportError,
    TransportProtocol,
};

struct ReadState {
    inner: BoxedReader,
    buffer: BytesMut,
}

/// Packet stream over an arbitrary reader/writer pair
pub struct FramedPacketStream {
    reader: Mutex<Option<ReadState>>,
    writer: Mutex<Option<BoxedWriter>>,
    protocol: TransportProtocol,
    transport_client_id: Option<i64>,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl FramedPacketStream {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, protocol: TransportProtocol) -> Self {
        Self {
            reader: Mutex::new(Some(ReadState {
                inner: reader,
                buffer: BytesMut::with_capacity(8 * 1024),
            })),
            writer: Mutex::new(Some(writer)),
            protocol,
            transport_client_id: None,
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        }
    }

    /// Attach the client id the transport layer authenticated
    pub fn with_transport_client_id(mut self, client_id: i64) -> Self {
        self.transport_client_id = Some(client_id);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ByteStream for FramedPacketStream {
    async fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let read = async {
            let mut guard = self.reader.lock().await;
            let state = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

            // Drain decoder leftovers before touching the pipe
            if !state.buffer.is_empty() {
                let n = state.buffer.len().min(buf.len());
                buf[..n].copy_from_slice(&state.buffer[..n]);
                state.buffer.advance(n);
                return Ok(n);
            }

            Ok(state.inner.read(buf).await?)
        };

        tokio::select! {
            r = read => r,
            _ = self.close_token.cancelled() => Err(TransportError::ConnectionClosed),
        }
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok(())
        };

        tokio::select! {
            r = write => r,
            _ = self.close_token.cancelled() => Err(TransportError::ConnectionClosed),
        }
    }

    async fn shutdown_write(&self) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        trace!(protocol = self.protocol.as_str(), "Closing packet stream");
        // Interrupt in-flight reads and writes so the locks free up
        self.close_token.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        Ok(())
    }
}

#[async_trait]
impl PacketStream for FramedPacketStream {
    async fn send_packet(&self, packet: &TransferPacket) -> Result<(), TransportError> {
        let encoded = PacketCodec::encode(packet)?;
        self.write_bytes(&encoded).await
    }

    async fn recv_packet(&self) -> Result<Option<TransferPacket>, TransportError> {
        let recv = async {
            let mut guard = self.reader.lock().await;
            let state = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

            loop {
                if let Some(packet) = PacketCodec::decode(&mut state.buffer)? {
                    return Ok(Some(packet));
                }

                let n = state.inner.read_buf(&mut state.buffer).await?;
                if n == 0 {
                    return if state.buffer.is_empty() {
                        Ok(None)
                    } else {
                        // Peer died mid-packet
                        Err(TransportError::ConnectionClosed)
                    };
                }
            }
        };

        tokio::select! {
            r = recv => r,
            _ = self.close_token.cancelled() => Err(TransportError::ConnectionClosed),
        }
    }

    fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    fn transport_client_id(&self) -> Option<i64> {
        self.transport_client_id
    }

    fn as_byte_stream(self: Arc<Self>) -> Arc<dyn ByteStream> {
        self
    }
}

/// Byte-only stream over a reader/writer pair
///
/// Used for dedicated inter-node TCP connections once their single
/// leading frame has been consumed.
pub struct DuplexByteStream {
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl DuplexByteStream {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        }
    }

    /// Wrap a TCP stream by splitting it into owned halves
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::new(Box::new(read_half), Box::new(write_half))
    }
}

#[async_trait]
impl ByteStream for DuplexByteStream {
    async fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let read = async {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
            Ok(reader.read(buf).await?)
        };

        tokio::select! {
            r = read => r,
            _ = self.close_token.cancelled() => Err(TransportError::ConnectionClosed),
        }
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok(())
        };

        tokio::select! {
            r = write => r,
            _ = self.close_token.cancelled() => Err(TransportError::ConnectionClosed),
        }
    }

    async fn shutdown_write(&self) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.close_token.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        Ok(())
    }
}

/// Default [`StreamFactory`] producing [`FramedPacketStream`]s
#[derive(Debug, Default, Clone)]
pub struct FramedStreamFactory;

impl StreamFactory for FramedStreamFactory {
    fn create(
        &self,
        reader: BoxedReader,
        writer: BoxedWriter,
        protocol: TransportProtocol,
    ) -> Arc<dyn PacketStream> {
        Arc::new(FramedPacketStream::new(reader, writer, protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tunnox_proto::PacketKind;

    fn stream_pair() -> (FramedPacketStream, FramedPacketStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            FramedPacketStream::new(Box::new(ar), Box::new(aw), TransportProtocol::Tcp),
            FramedPacketStream::new(Box::new(br), Box::new(bw), TransportProtocol::Tcp),
        )
    }

    #[tokio::test]
    async fn test_packet_round_trip() {
        let (client, server) = stream_pair();

        let packet = TransferPacket::new(PacketKind::Heartbeat, Bytes::from_static(b"{}"));
        client.send_packet(&packet).await.unwrap();

        let received = server.recv_packet().await.unwrap().unwrap();
        assert_eq!(received.kind, PacketKind::Heartbeat);
        assert_eq!(received.payload, packet.payload);
    }

    #[tokio::test]
    async fn test_recv_none_on_clean_eof() {
        let (client, server) = stream_pair();
        client.close().await.unwrap();

        let result = server.recv_packet().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_byte_mode_drains_decoder_buffer() {
        let (client, server) = stream_pair();

        // A packet followed immediately by raw bytes, written together
        let packet = TransferPacket::empty(PacketKind::TunnelOpenAck);
        let mut wire = PacketCodec::encode(&packet).unwrap().to_vec();
        wire.extend_from_slice(b"raw tunnel bytes");
        client.write_bytes(&wire).await.unwrap();

        // Framed read consumes the packet, byte reads get the rest
        let received = server.recv_packet().await.unwrap().unwrap();
        assert_eq!(received.kind, PacketKind::TunnelOpenAck);

        let mut buf = [0u8; 64];
        let n = server.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"raw tunnel bytes");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = stream_pair();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());

        let result = client
            .send_packet(&TransferPacket::empty(PacketKind::Heartbeat))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_read() {
        let (client, _server) = stream_pair();
        let client = Arc::new(client);

        let reader = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                client.read_bytes(&mut buf).await
            })
        };
        tokio::task::yield_now().await;

        client.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read should unblock promptly")
            .unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_duplex_byte_stream_half_close() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let left = DuplexByteStream::new(Box::new(ar), Box::new(aw));
        let right = DuplexByteStream::new(Box::new(br), Box::new(bw));

        left.write_bytes(b"last words").await.unwrap();
        left.shutdown_write().await.unwrap();

        let mut buf = [0u8; 64];
        let n = right.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"last words");

        // EOF after the half-close
        let n = right.read_bytes(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
