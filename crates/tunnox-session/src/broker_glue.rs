//! Broker topic consumers
//!
//! One task per topic. Payloads that fail to decode are dropped;
//! payloads addressed to clients not attached to this node are
//! silently ignored; some other node will act on them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunnox_broker::BridgeManager;
use tunnox_proto::{
    CommandRequestBody, ConfigPushBroadcast, PacketKind, TransferPacket, TunnelOpenBroadcast,
    TunnelReadyBroadcast, CMD_CONFIG_SET, CMD_TUNNEL_OPEN, TOPIC_CONFIG_PUSH, TOPIC_TUNNEL_OPEN,
    TOPIC_TUNNEL_READY,
};
use uuid::Uuid;

use crate::client_registry::ClientRegistry;
use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::tunnel_registry::ClosedTunnels;

/// Owns the per-topic consumer tasks for one session manager
pub struct BrokerGlue {
    node_id: String,
    broker: Arc<dyn BridgeManager>,
    clients: Arc<ClientRegistry>,
    closed: Arc<ClosedTunnels>,
    config: SessionConfig,
    cancel: CancellationToken,
}

impl BrokerGlue {
    pub fn new(
        broker: Arc<dyn BridgeManager>,
        clients: Arc<ClientRegistry>,
        closed: Arc<ClosedTunnels>,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_id: broker.node_id(),
            broker,
            clients,
            closed,
            config,
            cancel,
        }
    }

    /// Spawn the three topic consumers
    pub fn spawn_consumers(self: Arc<Self>) {
        let glue = self.clone();
        tokio::spawn(async move { glue.consume_tunnel_open().await });
        let glue = self.clone();
        tokio::spawn(async move { glue.consume_tunnel_ready().await });
        tokio::spawn(async move { self.consume_config_push().await });
    }

    async fn consume_tunnel_open(&self) {
        let Ok(mut subscription) = self.broker.subscribe(TOPIC_TUNNEL_OPEN).await else {
            warn!("Failed to subscribe to tunnel.open");
            return;
        };
        loop {
            let payload = tokio::select! {
                p = subscription.recv() => p,
                _ = self.cancel.cancelled() => break,
            };
            let Some(payload) = payload else { break };
            let Ok(broadcast) = serde_json::from_str::<TunnelOpenBroadcast>(&payload) else {
                debug!("Dropping malformed tunnel.open payload");
                continue;
            };
            // The publisher already checked its own clients
            if broadcast.source_node_id == self.node_id {
                continue;
            }
            if self.closed.is_closed(&broadcast.tunnel_id) {
                debug!(tunnel_id = %broadcast.tunnel_id, "Ignoring tunnel.open for closed tunnel");
                continue;
            }
            let Some(target) = self.clients.get_by_client_id(broadcast.client_id) else {
                continue;
            };
            self.wake_client(&target, &broadcast).await;
        }
    }

    async fn wake_client(&self, target: &Arc<Connection>, broadcast: &TunnelOpenBroadcast) {
        let body = CommandRequestBody {
            command_id: Uuid::new_v4().to_string(),
            command_type: CMD_TUNNEL_OPEN.to_string(),
            target_client_id: Some(broadcast.client_id),
            payload: serde_json::to_value(broadcast).unwrap_or_default(),
        };
        let Ok(packet) = TransferPacket::json(PacketKind::JsonCommand, &body) else {
            return;
        };
        let send = target.stream().send_packet(&packet);
        match tokio::time::timeout(self.config.broadcast_send_timeout, send).await {
            Ok(Ok(())) => {
                debug!(
                    tunnel_id = %broadcast.tunnel_id,
                    client_id = broadcast.client_id,
                    "Woke target client from broadcast"
                );
            }
            Ok(Err(e)) => {
                warn!(client_id = broadcast.client_id, error = %e, "Broadcast wake failed");
            }
            Err(_) => {
                warn!(client_id = broadcast.client_id, "Broadcast wake timed out");
            }
        }
    }

    async fn consume_tunnel_ready(&self) {
        let Ok(mut subscription) = self.broker.subscribe(TOPIC_TUNNEL_READY).await else {
            warn!("Failed to subscribe to tunnel.ready");
            return;
        };
        loop {
            let payload = tokio::select! {
                p = subscription.recv() => p,
                _ = self.cancel.cancelled() => break,
            };
            let Some(payload) = payload else { break };
            let Ok(notice) = serde_json::from_str::<TunnelReadyBroadcast>(&payload) else {
                debug!("Dropping malformed tunnel.ready payload");
                continue;
            };
            // Informational; a closed tunnel must stay closed
            if self.closed.is_closed(&notice.tunnel_id) {
                debug!(tunnel_id = %notice.tunnel_id, "Ignoring tunnel.ready for closed tunnel");
                continue;
            }
            debug!(
                tunnel_id = %notice.tunnel_id,
                source_node = %notice.source_node_id,
                "Tunnel bridge announced"
            );
        }
    }

    async fn consume_config_push(&self) {
        let Ok(mut subscription) = self.broker.subscribe(TOPIC_CONFIG_PUSH).await else {
            warn!("Failed to subscribe to config.push");
            return;
        };
        loop {
            let payload = tokio::select! {
                p = subscription.recv() => p,
                _ = self.cancel.cancelled() => break,
            };
            let Some(payload) = payload else { break };
            let Ok(push) = serde_json::from_str::<ConfigPushBroadcast>(&payload) else {
                debug!("Dropping malformed config.push payload");
                continue;
            };
            let Some(client) = self.clients.get_by_client_id(push.client_id) else {
                continue;
            };

            let body = CommandRequestBody {
                command_id: Uuid::new_v4().to_string(),
                command_type: CMD_CONFIG_SET.to_string(),
                target_client_id: Some(push.client_id),
                payload: push.config_body.clone(),
            };
            let Ok(packet) = TransferPacket::json(PacketKind::JsonCommand, &body) else {
                continue;
            };
            let send = client.stream().send_packet(&packet);
            match tokio::time::timeout(self.config.config_push_timeout, send).await {
                Ok(Ok(())) => {
                    debug!(client_id = push.client_id, "Delivered config push");
                }
                Ok(Err(e)) => {
                    warn!(client_id = push.client_id, error = %e, "Config push failed");
                }
                Err(_) => {
                    warn!(client_id = push.client_id, "Config push timed out");
                }
            }
        }
    }
}
