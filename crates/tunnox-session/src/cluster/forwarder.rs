//! Target-side cross-node forwarder
//!
//! Runs on the node a target client is attached to when the tunnel's
//! bridge lives elsewhere. Finds the waiting state, dials the source
//! node's cross-node listener on a dedicated TCP connection, announces
//! the target with a `TargetReady` frame and then splices the local
//! client connection to the wire.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use tunnox_proto::{
    encode_target_ready, FrameType, PacketKind, TransferPacket, TunnelFrame, TunnelOpenAck,
    TunnelOpenRequest,
};
use tunnox_transport::{ByteStream, DuplexByteStream};

use crate::bridge::TunnelBridge;
use crate::cluster::conn_manager::CrossNodeTunnelConn;
use crate::cluster::{splice, write_frame_bytes, NodeResolver};
use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::error::{Disposition, SessionError};
use crate::tunnel_open::TunnelLifecycle;

const POLL_INITIAL_DELAY: Duration = Duration::from_millis(50);
const POLL_MAX_DELAY: Duration = Duration::from_millis(200);

/// Cross-node forwarder, target side
pub struct CrossNodeForwarder {
    node_id: String,
    lifecycle: Arc<TunnelLifecycle>,
    resolver: Arc<dyn NodeResolver>,
    config: SessionConfig,
}

impl CrossNodeForwarder {
    pub fn new(
        node_id: String,
        lifecycle: Arc<TunnelLifecycle>,
        resolver: Arc<dyn NodeResolver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            node_id,
            lifecycle,
            resolver,
            config,
        }
    }

    /// Forward a target-side tunnel open whose bridge is not local
    pub async fn forward(
        &self,
        conn: &Arc<Connection>,
        request: &TunnelOpenRequest,
    ) -> Result<Disposition, SessionError> {
        let tunnel_id = &request.tunnel_id;

        // The waiting state may land in the KV store a moment after the
        // broadcast that woke the target; poll with backoff
        let state = self.poll_waiting_state(tunnel_id).await?;

        if state.source_node_id == self.node_id {
            // Stale routing entry: the bridge is (or will shortly be)
            // local after all
            debug!(tunnel_id = %tunnel_id, "Routing entry points at this node; polling bridge map");
            let bridge = self.poll_local_bridge(tunnel_id).await?;
            return self.attach_local_target(conn, tunnel_id, &bridge).await;
        }

        let addr = self.resolver.resolve(&state.source_node_id).await?;
        let tcp = match tokio::time::timeout(
            self.config.internode_dial_timeout,
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                warn!(tunnel_id = %tunnel_id, addr = %addr, error = %e, "Cross-node dial failed");
                return Err(SessionError::Network(e.into()));
            }
            Err(_) => {
                return Err(SessionError::Timeout(format!("dialing {}", addr)));
            }
        };

        let stream = Arc::new(DuplexByteStream::from_tcp(tcp));
        let cross = Arc::new(CrossNodeTunnelConn::new(
            tunnel_id.clone(),
            state.source_node_id.clone(),
            stream.clone(),
            conn.cancel_token(),
        ));
        self.lifecycle.conn_manager.register(cross.clone()).await;

        // Ack the local client before announcing the target upstream
        conn.stream()
            .send_packet(&TransferPacket::json(
                PacketKind::TunnelOpenAck,
                &TunnelOpenAck::ok(tunnel_id.clone()),
            )?)
            .await?;

        let ready = TunnelFrame::new(
            tunnel_id.clone(),
            FrameType::TargetReady,
            encode_target_ready(tunnel_id, &self.node_id),
        );
        let wire: Arc<dyn ByteStream> = stream.clone();
        write_frame_bytes(&wire, &ready).await?;

        self.lifecycle
            .routing
            .record_cross_conn(
                tunnel_id,
                serde_json::json!({
                    "source_node_id": state.source_node_id,
                    "target_node_id": self.node_id,
                    "created_at": chrono::Utc::now().to_rfc3339(),
                }),
            )
            .await;

        info!(
            tunnel_id = %tunnel_id,
            source_node = %state.source_node_id,
            "Splicing target client to remote bridge"
        );

        self.lifecycle.promote(conn, tunnel_id);

        let local: Arc<dyn ByteStream> = conn.stream().clone().as_byte_stream();
        let scope = cross.cancel_token().child_token();
        let tunnel_id = tunnel_id.clone();
        let lifecycle = self.lifecycle.clone();
        let conn_id = conn.id();
        tokio::spawn(async move {
            splice(local, wire, scope).await;
            lifecycle.conn_manager.remove(&tunnel_id);
            lifecycle.tunnels.unregister(conn_id);
            lifecycle.closed.mark_closed(&tunnel_id);
            lifecycle.routing.remove_cross_conn(&tunnel_id).await;
            debug!(tunnel_id = %tunnel_id, "Cross-node splice finished");
        });

        Ok(Disposition::HandedOff)
    }

    /// Attach the inbound connection as the target of a local bridge
    pub async fn attach_local_target(
        &self,
        conn: &Arc<Connection>,
        tunnel_id: &str,
        bridge: &Arc<TunnelBridge>,
    ) -> Result<Disposition, SessionError> {
        // Ack before the endpoint is pump-visible
        conn.stream()
            .send_packet(&TransferPacket::json(
                PacketKind::TunnelOpenAck,
                &TunnelOpenAck::ok(tunnel_id),
            )?)
            .await?;

        bridge
            .set_target_connection(conn.stream().clone().as_byte_stream(), Some(conn.id()))
            .await;
        // Readiness fires after the ack went out; the bridge's wait
        // window is armed on the source path alone
        bridge.notify_target_ready();

        self.lifecycle.promote(conn, tunnel_id);
        Ok(Disposition::HandedOff)
    }

    async fn poll_waiting_state(
        &self,
        tunnel_id: &str,
    ) -> Result<tunnox_proto::TunnelWaitingState, SessionError> {
        let deadline = self.config.routing_lookup_timeout;
        let poll = async {
            let mut delay = POLL_INITIAL_DELAY;
            loop {
                match self.lifecycle.routing.lookup(tunnel_id).await {
                    Ok(state) => return Ok(state),
                    Err(SessionError::NotFound(_)) => {}
                    // A KV outage fails the cross-node forward outright
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(POLL_MAX_DELAY);
            }
        };

        match tokio::time::timeout(deadline, poll).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(format!(
                "waiting state for tunnel {}",
                tunnel_id
            ))),
        }
    }

    async fn poll_local_bridge(&self, tunnel_id: &str) -> Result<Arc<TunnelBridge>, SessionError> {
        let deadline = self.config.local_bridge_poll_timeout;
        let poll = async {
            let mut delay = POLL_INITIAL_DELAY;
            loop {
                if let Some(bridge) = self.lifecycle.bridges.get(tunnel_id) {
                    return bridge;
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(POLL_MAX_DELAY);
            }
        };

        tokio::time::timeout(deadline, poll).await.map_err(|_| {
            SessionError::Timeout(format!("local bridge for tunnel {}", tunnel_id))
        })
    }
}
