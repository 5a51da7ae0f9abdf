//! Dedicated inter-node tunnel connections
//!
//! One TCP connection per tunnel, bound to the tunnel's lifetime. No
//! pooling: the connection dies with the tunnel, and an idle sweep
//! reaps ones whose tunnel went quiet.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tunnox_transport::{ByteStream, DuplexByteStream};

/// A dedicated inter-node connection for one tunnel
pub struct CrossNodeTunnelConn {
    tunnel_id: String,
    peer_node_id: String,
    stream: Arc<DuplexByteStream>,
    last_activity: std::sync::RwLock<Instant>,
    cancel: CancellationToken,
}

impl CrossNodeTunnelConn {
    pub fn new(
        tunnel_id: impl Into<String>,
        peer_node_id: impl Into<String>,
        stream: Arc<DuplexByteStream>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            peer_node_id: peer_node_id.into(),
            stream,
            last_activity: std::sync::RwLock::new(Instant::now()),
            cancel: parent.child_token(),
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn peer_node_id(&self) -> &str {
        &self.peer_node_id
    }

    pub fn stream(&self) -> Arc<DuplexByteStream> {
        self.stream.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn touch(&self) {
        *self.last_activity.write().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().unwrap().elapsed()
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.stream.close().await;
    }
}

/// Tracks dedicated inter-node connections by tunnel id
pub struct TunnelConnectionManager {
    conns: DashMap<String, Arc<CrossNodeTunnelConn>>,
    idle_timeout: Duration,
}

impl TunnelConnectionManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            conns: DashMap::new(),
            idle_timeout,
        }
    }

    /// Register a connection, closing any previous one for the tunnel
    pub async fn register(&self, conn: Arc<CrossNodeTunnelConn>) {
        let replaced = self.conns.insert(conn.tunnel_id().to_string(), conn);
        if let Some(old) = replaced {
            debug!(tunnel_id = %old.tunnel_id(), "Replacing dedicated inter-node connection");
            old.close().await;
        }
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<CrossNodeTunnelConn>> {
        self.conns.get(tunnel_id).map(|entry| entry.value().clone())
    }

    /// Detach a connection; the caller decides whether to close it
    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<CrossNodeTunnelConn>> {
        self.conns.remove(tunnel_id).map(|(_, conn)| conn)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Close and drop connections idle past the cutoff
    pub async fn purge_idle(&self) -> usize {
        let idle: Vec<Arc<CrossNodeTunnelConn>> = self
            .conns
            .iter()
            .filter(|entry| entry.value().idle_for() >= self.idle_timeout)
            .map(|entry| entry.value().clone())
            .collect();

        for conn in &idle {
            info!(
                tunnel_id = %conn.tunnel_id(),
                peer = %conn.peer_node_id(),
                "Closing idle inter-node connection"
            );
            self.conns.remove(conn.tunnel_id());
            conn.close().await;
        }
        idle.len()
    }
}
