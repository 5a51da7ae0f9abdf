//! Tunnel open handling
//!
//! Three cases for an inbound `TunnelOpen`:
//!
//! - a bridge already exists for the tunnel: the packet is either the
//!   target endpoint arriving or the source endpoint reconnecting,
//!   classified by the inbound client id against the mapping
//! - no local bridge but the routing table has a waiting state: this
//!   node holds the target client of a cross-node tunnel and the
//!   forwarder takes over
//! - neither: this is the listen side and a fresh bridge is created
//!   here, registered cluster-wide, and started in the background

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use tunnox_broker::BridgeManager;
use tunnox_proto::{
    CommandRequestBody, PacketKind, PortMapping, TransferPacket, TunnelOpenAck,
    TunnelOpenBroadcast, TunnelOpenRequest, TunnelReadyBroadcast, CMD_TUNNEL_OPEN,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::TunnelBridge;
use crate::client_registry::ClientRegistry;
use crate::cloud::CloudControl;
use crate::cluster::{CrossNodeForwarder, TunnelConnectionManager};
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Disposition, SessionError};
use crate::router::PacketHandler;
use crate::routing::RoutingTable;
use crate::tunnel_registry::{BridgeMap, ClosedTunnels, TunnelRegistry};

/// Registry bundle shared by everything that promotes or tears down
/// tunnels
pub struct TunnelLifecycle {
    pub clients: Arc<ClientRegistry>,
    pub bridges: Arc<BridgeMap>,
    pub tunnels: Arc<TunnelRegistry>,
    pub routing: Arc<RoutingTable>,
    pub conn_manager: Arc<TunnelConnectionManager>,
    pub closed: Arc<ClosedTunnels>,
}

impl TunnelLifecycle {
    /// Move a connection into stream mode under a bridge
    ///
    /// Long-polling transports keep their control registration across
    /// tunnels; everything else leaves the control registry here.
    pub fn promote(&self, conn: &Arc<Connection>, tunnel_id: &str) {
        if !conn.capabilities().keep_in_registry_after_tunnel {
            self.clients.unregister(conn.id());
        }
        conn.set_state(ConnectionState::StreamMode);
        self.tunnels.register(tunnel_id, conn.clone());
    }

    /// Remove the bridge, routing entry, dedicated connection and
    /// registered endpoints for a tunnel. Terminal; the closed set
    /// absorbs any residual frames or broadcasts.
    pub async fn finalize(&self, tunnel_id: &str) {
        self.closed.mark_closed(tunnel_id);

        if let Some(bridge) = self.bridges.remove(tunnel_id) {
            bridge.close().await;
        }
        self.routing.remove(tunnel_id).await;
        self.routing.remove_cross_conn(tunnel_id).await;

        if let Some(cross) = self.conn_manager.remove(tunnel_id) {
            cross.close().await;
        }

        for conn in self.tunnels.conns_for_tunnel(tunnel_id) {
            self.tunnels.unregister(conn.id());
            conn.cancel_token().cancel();
            let _ = conn.stream().close().await;
            conn.set_state(ConnectionState::Closed);
        }

        debug!(tunnel_id = %tunnel_id, "Tunnel finalized");
    }
}

/// `TunnelOpen` packet handler
pub struct TunnelOpenHandler {
    node_id: String,
    lifecycle: Arc<TunnelLifecycle>,
    broker: Arc<dyn BridgeManager>,
    cloud: Option<Arc<dyn CloudControl>>,
    forwarder: Option<Arc<CrossNodeForwarder>>,
    config: SessionConfig,
    cancel: CancellationToken,
}

impl TunnelOpenHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        lifecycle: Arc<TunnelLifecycle>,
        broker: Arc<dyn BridgeManager>,
        cloud: Option<Arc<dyn CloudControl>>,
        forwarder: Option<Arc<CrossNodeForwarder>>,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_id,
            lifecycle,
            broker,
            cloud,
            forwarder,
            config,
            cancel,
        }
    }

    async fn nack(&self, conn: &Arc<Connection>, tunnel_id: &str, reason: &str) {
        let ack = TunnelOpenAck::failed(tunnel_id, reason);
        if let Ok(packet) = TransferPacket::json(PacketKind::TunnelOpenAck, &ack) {
            let _ = conn.stream().send_packet(&packet).await;
        }
    }

    async fn send_ok_ack(
        &self,
        conn: &Arc<Connection>,
        tunnel_id: &str,
    ) -> Result<(), SessionError> {
        conn.stream()
            .send_packet(&TransferPacket::json(
                PacketKind::TunnelOpenAck,
                &TunnelOpenAck::ok(tunnel_id),
            )?)
            .await?;
        Ok(())
    }

    async fn lookup_mapping(&self, mapping_id: &str) -> Result<PortMapping, SessionError> {
        let cloud = self
            .cloud
            .as_ref()
            .ok_or_else(|| SessionError::Unavailable("cloud control not configured".to_string()))?;
        cloud.get_port_mapping(mapping_id).await
    }

    /// Case A: the bridge exists; classify the inbound endpoint
    async fn handle_existing_bridge(
        &self,
        conn: &Arc<Connection>,
        request: &TunnelOpenRequest,
        bridge: Arc<TunnelBridge>,
    ) -> Result<Disposition, SessionError> {
        let mapping = match self.lookup_mapping(&request.mapping_id).await {
            Ok(mapping) => mapping,
            Err(e) => {
                self.nack(conn, &request.tunnel_id, &e.to_string()).await;
                return Ok(Disposition::CloseConnection);
            }
        };

        let client_id = conn.client_id();
        let is_source = client_id.is_some() && client_id == mapping.listen_client_id;

        // The ack must be on the wire before the endpoint becomes
        // visible to the pumps: a forwarding bridge would otherwise
        // interleave raw tunnel bytes ahead of the framed ack
        self.send_ok_ack(conn, &request.tunnel_id).await?;

        if is_source {
            debug!(
                tunnel_id = %request.tunnel_id,
                conn_id = conn.id(),
                "Source endpoint reconnecting to existing bridge"
            );
            bridge
                .set_source_connection(conn.stream().clone().as_byte_stream(), Some(conn.id()))
                .await;
        } else {
            debug!(
                tunnel_id = %request.tunnel_id,
                conn_id = conn.id(),
                "Target endpoint attaching to existing bridge"
            );
            bridge
                .set_target_connection(conn.stream().clone().as_byte_stream(), Some(conn.id()))
                .await;
            // Readiness fires immediately; the 30 s wait is only ever
            // armed on the source path
            bridge.notify_target_ready();
        }

        self.lifecycle.promote(conn, &request.tunnel_id);
        Ok(Disposition::HandedOff)
    }

    /// Case C: create the bridge here; this node is the source side
    async fn open_as_source(
        &self,
        conn: &Arc<Connection>,
        request: &TunnelOpenRequest,
    ) -> Result<Disposition, SessionError> {
        let tunnel_id = &request.tunnel_id;

        let mapping = match self.lookup_mapping(&request.mapping_id).await {
            Ok(mapping) => mapping,
            Err(e) => {
                self.nack(conn, tunnel_id, &e.to_string()).await;
                return Ok(Disposition::CloseConnection);
            }
        };

        let Some(listen_client_id) = mapping.listen_client_id else {
            self.nack(conn, tunnel_id, "mapping has no listen client").await;
            return Ok(Disposition::CloseConnection);
        };

        if conn.client_id() != Some(listen_client_id) {
            // A target endpoint racing the source's routing-table write
            // lands here; the forwarder's backoff absorbs the race
            if let Some(forwarder) = &self.forwarder {
                return match forwarder.forward(conn, request).await {
                    Ok(disposition) => Ok(disposition),
                    Err(e) => {
                        warn!(tunnel_id = %tunnel_id, error = %e, "Cross-node forward failed");
                        self.nack(conn, tunnel_id, &e.to_string()).await;
                        Ok(Disposition::CloseConnection)
                    }
                };
            }
            self.nack(conn, tunnel_id, "no bridge for this tunnel").await;
            return Ok(Disposition::CloseConnection);
        }

        let bridge = Arc::new(TunnelBridge::new(
            tunnel_id.clone(),
            Some(&mapping),
            self.cloud.clone(),
            &self.cancel,
            self.config.target_ready_timeout,
        ));
        bridge
            .set_source_connection(conn.stream().clone().as_byte_stream(), Some(conn.id()))
            .await;

        if let Err(e) = self.lifecycle.bridges.insert(bridge.clone()) {
            self.nack(conn, tunnel_id, &e.to_string()).await;
            return Ok(Disposition::CloseConnection);
        }

        let target_host = request
            .target_host
            .clone()
            .unwrap_or_else(|| mapping.target_host.clone());
        let target_port = request.target_port.unwrap_or(mapping.target_port);

        let state = self.lifecycle.routing.waiting_state(
            tunnel_id,
            &mapping.id,
            &mapping.secret_key,
            &self.node_id,
            listen_client_id,
            mapping.target_client_id,
            &target_host,
            target_port,
        );
        self.lifecycle.routing.register(&state).await;

        if let Err(e) = self
            .broker
            .notify_tunnel_ready(&TunnelReadyBroadcast {
                tunnel_id: tunnel_id.clone(),
                source_node_id: self.node_id.clone(),
            })
            .await
        {
            debug!(tunnel_id = %tunnel_id, error = %e, "tunnel.ready publish failed");
        }

        self.wake_target(&mapping, request, &target_host, target_port)
            .await;

        if let Err(e) = self.send_ok_ack(conn, tunnel_id).await {
            // The listen side is gone before the tunnel ever carried a
            // byte; undo everything
            warn!(tunnel_id = %tunnel_id, error = %e, "Ack write failed; tearing bridge down");
            self.lifecycle.finalize(tunnel_id).await;
            return Err(e);
        }

        self.lifecycle.promote(conn, tunnel_id);

        info!(
            tunnel_id = %tunnel_id,
            mapping_id = %mapping.id,
            listen_client_id,
            target_client_id = mapping.target_client_id,
            "Bridge created, waiting for target"
        );

        let lifecycle = self.lifecycle.clone();
        let tunnel_id = tunnel_id.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.start().await {
                warn!(tunnel_id = %tunnel_id, error = %e, "Bridge ended with error");
            }
            lifecycle.finalize(&tunnel_id).await;
        });

        Ok(Disposition::HandedOff)
    }

    /// Nudge the target client: directly when it is attached here,
    /// through the broker otherwise. Never fails the caller.
    async fn wake_target(
        &self,
        mapping: &PortMapping,
        request: &TunnelOpenRequest,
        target_host: &str,
        target_port: u16,
    ) {
        let broadcast = TunnelOpenBroadcast {
            kind: "tunnel_open".to_string(),
            tunnel_id: request.tunnel_id.clone(),
            mapping_id: mapping.id.clone(),
            secret_key: mapping.secret_key.clone(),
            client_id: mapping.target_client_id,
            source_node_id: self.node_id.clone(),
            timestamp: Utc::now().timestamp(),
            target_host: Some(target_host.to_string()),
            target_port: Some(target_port),
        };

        if let Some(target) = self.lifecycle.clients.get_by_client_id(mapping.target_client_id) {
            let body = CommandRequestBody {
                command_id: Uuid::new_v4().to_string(),
                command_type: CMD_TUNNEL_OPEN.to_string(),
                target_client_id: Some(mapping.target_client_id),
                payload: serde_json::to_value(&broadcast).unwrap_or_default(),
            };
            let Ok(packet) = TransferPacket::json(PacketKind::JsonCommand, &body) else {
                return;
            };
            let send = target.stream().send_packet(&packet);
            match tokio::time::timeout(self.config.broadcast_send_timeout, send).await {
                Ok(Ok(())) => {
                    debug!(
                        tunnel_id = %request.tunnel_id,
                        target_client_id = mapping.target_client_id,
                        "Woke local target client"
                    );
                    return;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Local target wake failed; broadcasting instead");
                }
                Err(_) => {
                    warn!("Local target wake timed out; broadcasting instead");
                }
            }
        }

        if let Err(e) = self.broker.broadcast_tunnel_open(&broadcast).await {
            warn!(tunnel_id = %request.tunnel_id, error = %e, "tunnel.open broadcast failed");
        }
    }
}

#[async_trait]
impl PacketHandler for TunnelOpenHandler {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        packet: TransferPacket,
    ) -> Result<Disposition, SessionError> {
        let request: TunnelOpenRequest = packet.decode_body()?;
        let tunnel_id = &request.tunnel_id;

        if !conn.capabilities().supports_byte_bridging {
            self.nack(conn, tunnel_id, "transport cannot carry tunnel bytes")
                .await;
            return Ok(Disposition::CloseConnection);
        }

        if let Some(bridge) = self.lifecycle.bridges.get(tunnel_id) {
            return self.handle_existing_bridge(conn, &request, bridge).await;
        }

        match self.lifecycle.routing.lookup(tunnel_id).await {
            Ok(_) => {
                let Some(forwarder) = &self.forwarder else {
                    self.nack(conn, tunnel_id, "cross-node forwarding not configured")
                        .await;
                    return Ok(Disposition::CloseConnection);
                };
                return match forwarder.forward(conn, &request).await {
                    Ok(disposition) => Ok(disposition),
                    Err(e) => {
                        warn!(tunnel_id = %tunnel_id, error = %e, "Cross-node forward failed");
                        self.nack(conn, tunnel_id, &e.to_string()).await;
                        Ok(Disposition::CloseConnection)
                    }
                };
            }
            Err(SessionError::NotFound(_)) => {}
            Err(e) => {
                // A KV outage must not break single-node tunnels
                warn!(tunnel_id = %tunnel_id, error = %e, "Routing lookup failed; assuming local");
            }
        }

        self.open_as_source(conn, &request).await
    }
}
