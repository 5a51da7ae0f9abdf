//! Cross-node plumbing: dedicated inter-node connections, the
//! forwarder/listener pair, frame I/O and the pending-request manager

pub mod commands;
pub mod conn_manager;
pub mod forwarder;
pub mod listener;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use tunnox_proto::{
    tunnel_id_from_bytes, FrameType, TunnelFrame, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD,
    TUNNEL_ID_LEN,
};
use tunnox_transport::{ByteStream, TransportError};

use crate::error::SessionError;

pub use commands::{CommandOutcome, PendingRequests};
pub use conn_manager::{CrossNodeTunnelConn, TunnelConnectionManager};
pub use forwarder::CrossNodeForwarder;
pub use listener::CrossNodeListener;

/// Resolves a node id to the TCP address of its cross-node listener
#[async_trait]
pub trait NodeResolver: Send + Sync {
    async fn resolve(&self, node_id: &str) -> Result<String, SessionError>;
}

/// Fixed node-id → address map
#[derive(Default)]
pub struct StaticNodeResolver {
    peers: DashMap<String, String>,
}

impl StaticNodeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, node_id: impl Into<String>, addr: impl Into<String>) {
        self.peers.insert(node_id.into(), addr.into());
    }
}

#[async_trait]
impl NodeResolver for StaticNodeResolver {
    async fn resolve(&self, node_id: &str) -> Result<String, SessionError> {
        self.peers
            .get(node_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(format!("node {}", node_id)))
    }
}

/// Read one inter-node frame
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<TunnelFrame, SessionError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| SessionError::Network(TransportError::Io(e)))?;

    let mut id_bytes = [0u8; TUNNEL_ID_LEN];
    id_bytes.copy_from_slice(&header[..TUNNEL_ID_LEN]);
    let tunnel_id = tunnel_id_from_bytes(&id_bytes)?;
    let frame_type = FrameType::try_from(header[TUNNEL_ID_LEN])?;

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[TUNNEL_ID_LEN + 1..FRAME_HEADER_LEN]);
    let length = u32::from_be_bytes(len_bytes) as usize;
    if length > MAX_FRAME_PAYLOAD {
        return Err(SessionError::InvalidPacket(format!(
            "frame payload of {} bytes exceeds the cap",
            length
        )));
    }

    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| SessionError::Network(TransportError::Io(e)))?;

    Ok(TunnelFrame::new(tunnel_id, frame_type, payload.into()))
}

/// Write one inter-node frame
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &TunnelFrame,
) -> Result<(), SessionError> {
    let encoded = frame.encode()?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| SessionError::Network(TransportError::Io(e)))?;
    writer
        .flush()
        .await
        .map_err(|e| SessionError::Network(TransportError::Io(e)))?;
    Ok(())
}

/// Write one inter-node frame over a byte stream
pub(crate) async fn write_frame_bytes(
    stream: &Arc<dyn ByteStream>,
    frame: &TunnelFrame,
) -> Result<(), SessionError> {
    let encoded = frame.encode()?;
    stream.write_bytes(&encoded).await?;
    Ok(())
}

/// Bidirectional raw copy between two endpoints
///
/// Each direction half-closes its write side on EOF so end-of-stream
/// propagates; both endpoints are closed when both directions finish
/// or the scope is cancelled.
pub(crate) async fn splice(
    a: Arc<dyn ByteStream>,
    b: Arc<dyn ByteStream>,
    cancel: CancellationToken,
) {
    let forward = copy_one_way(a.clone(), b.clone(), &cancel);
    let backward = copy_one_way(b.clone(), a.clone(), &cancel);
    tokio::join!(forward, backward);

    let _ = a.close().await;
    let _ = b.close().await;
}

async fn copy_one_way(from: Arc<dyn ByteStream>, to: Arc<dyn ByteStream>, cancel: &CancellationToken) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let read = tokio::select! {
            r = from.read_bytes(&mut buf) => r,
            _ = cancel.cancelled() => break,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.is_temporary() => continue,
            Err(_) => break,
        };
        if to.write_bytes(&buf[..n]).await.is_err() {
            break;
        }
        trace!(bytes = n, "Spliced");
    }
    let _ = to.shutdown_write().await;
}
