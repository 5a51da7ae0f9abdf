//! JSON command routing
//!
//! Inbound `JsonCommand` packets are forwarded to the addressed
//! client: down its local control stream when it is attached here,
//! over a cross-node `Command` frame when another node holds it.
//! Inbound `CommandResp` packets resolve whichever pending request is
//! waiting on the command id. The round trips run in spawned tasks so
//! the read loop never blocks on them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use tunnox_proto::{
    CommandEnvelope, CommandRequestBody, CommandResponseBody, CommandResponseEnvelope, FrameType,
    PacketKind, TransferPacket, TunnelFrame,
};

use crate::client_registry::ClientRegistry;
use crate::cluster::commands::{CommandOutcome, PendingRequests};
use crate::cluster::{read_frame, write_frame, NodeResolver};
use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::error::{Disposition, SessionError};
use crate::router::PacketHandler;
use crate::routing::RoutingTable;

/// Handler for `JsonCommand` and `CommandResp` packets
pub struct CommandHandler {
    node_id: String,
    clients: Arc<ClientRegistry>,
    pending: Arc<PendingRequests>,
    routing: Arc<RoutingTable>,
    resolver: Option<Arc<dyn NodeResolver>>,
    config: SessionConfig,
}

impl CommandHandler {
    pub fn new(
        node_id: String,
        clients: Arc<ClientRegistry>,
        pending: Arc<PendingRequests>,
        routing: Arc<RoutingTable>,
        resolver: Option<Arc<dyn NodeResolver>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            node_id,
            clients,
            pending,
            routing,
            resolver,
            config,
        }
    }

    async fn respond(
        origin: &Arc<Connection>,
        command_id: &str,
        outcome: CommandOutcome,
    ) {
        let body = CommandResponseBody {
            command_id: command_id.to_string(),
            success: outcome.success,
            error: outcome.error,
            payload: outcome.payload,
        };
        match TransferPacket::json(PacketKind::CommandResp, &body) {
            Ok(packet) => {
                if let Err(e) = origin.stream().send_packet(&packet).await {
                    debug!(command_id, error = %e, "Failed to deliver command response");
                }
            }
            Err(e) => debug!(command_id, error = %e, "Failed to encode command response"),
        }
    }

    /// Forward to a client attached to this node and relay the answer
    fn forward_local(
        &self,
        origin: Arc<Connection>,
        target: Arc<Connection>,
        body: CommandRequestBody,
    ) {
        let pending = self.pending.clone();
        let timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            let command_id = body.command_id.clone();
            let rx = pending.register(&command_id);

            let packet = match TransferPacket::json(PacketKind::JsonCommand, &body) {
                Ok(packet) => packet,
                Err(e) => {
                    pending.cancel(&command_id);
                    Self::respond(&origin, &command_id, CommandOutcome::failed(e.to_string()))
                        .await;
                    return;
                }
            };
            if let Err(e) = target.stream().send_packet(&packet).await {
                pending.cancel(&command_id);
                Self::respond(
                    &origin,
                    &command_id,
                    CommandOutcome::failed(format!("target send failed: {}", e)),
                )
                .await;
                return;
            }

            let outcome = match pending.wait(&command_id, rx, timeout).await {
                Ok(outcome) => outcome,
                Err(e) => CommandOutcome::failed(e.to_string()),
            };
            Self::respond(&origin, &command_id, outcome).await;
        });
    }

    /// Forward to a client on another node over a `Command` frame
    fn forward_remote(&self, origin: Arc<Connection>, target_client_id: i64, body: CommandRequestBody) {
        let routing = self.routing.clone();
        let resolver = self.resolver.clone();
        let node_id = self.node_id.clone();
        let dial_timeout = self.config.internode_dial_timeout;
        let rpc_timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            let command_id = body.command_id.clone();
            let outcome = remote_round_trip(
                routing,
                resolver,
                node_id,
                target_client_id,
                body,
                dial_timeout,
                rpc_timeout,
            )
            .await
            .unwrap_or_else(|e| CommandOutcome::failed(e.to_string()));
            Self::respond(&origin, &command_id, outcome).await;
        });
    }
}

async fn remote_round_trip(
    routing: Arc<RoutingTable>,
    resolver: Option<Arc<dyn NodeResolver>>,
    node_id: String,
    target_client_id: i64,
    body: CommandRequestBody,
    dial_timeout: std::time::Duration,
    rpc_timeout: std::time::Duration,
) -> Result<CommandOutcome, SessionError> {
    let resolver =
        resolver.ok_or_else(|| SessionError::Unavailable("no node resolver".to_string()))?;

    let target_node = routing.lookup_client_node(target_client_id).await?;
    let addr = resolver.resolve(&target_node).await?;

    let mut tcp = tokio::time::timeout(dial_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| SessionError::Timeout(format!("dialing {}", addr)))?
        .map_err(|e| SessionError::Network(e.into()))?;

    let envelope = CommandEnvelope {
        command_id: body.command_id.clone(),
        command_type: Some(body.command_type.clone()),
        target_client_id,
        source_node_id: node_id,
        payload: serde_json::to_vec(&body).map_err(|e| SessionError::Internal(e.to_string()))?,
    };
    let frame = TunnelFrame::new(
        body.command_id.clone(),
        FrameType::Command,
        serde_json::to_vec(&envelope)
            .map_err(|e| SessionError::Internal(e.to_string()))?
            .into(),
    );
    write_frame(&mut tcp, &frame).await?;

    let reply = tokio::time::timeout(rpc_timeout, read_frame(&mut tcp))
        .await
        .map_err(|_| SessionError::Timeout(format!("command {}", envelope.command_id)))??;
    if reply.frame_type != FrameType::CommandResponse {
        return Err(SessionError::InvalidPacket(format!(
            "expected CommandResponse, got {:?}",
            reply.frame_type
        )));
    }

    let response: CommandResponseEnvelope = serde_json::from_slice(&reply.payload)
        .map_err(|e| SessionError::InvalidPacket(format!("command response envelope: {}", e)))?;
    Ok(CommandOutcome {
        success: response.success,
        error: response.error,
        payload: serde_json::from_slice(&response.payload).unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl PacketHandler for CommandHandler {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        packet: TransferPacket,
    ) -> Result<Disposition, SessionError> {
        match packet.kind {
            PacketKind::CommandResp => {
                let body: CommandResponseBody = packet.decode_body()?;
                let outcome = CommandOutcome {
                    success: body.success,
                    error: body.error,
                    payload: body.payload,
                };
                if !self.pending.resolve(&body.command_id, outcome) {
                    debug!(command_id = %body.command_id, "Response with no waiter");
                }
                Ok(Disposition::Continue)
            }
            PacketKind::JsonCommand => {
                let body: CommandRequestBody = packet.decode_body()?;
                let Some(target_client_id) = body.target_client_id else {
                    Self::respond(
                        conn,
                        &body.command_id,
                        CommandOutcome::failed("command names no target client"),
                    )
                    .await;
                    return Ok(Disposition::Continue);
                };

                if let Some(target) = self.clients.get_by_client_id(target_client_id) {
                    self.forward_local(conn.clone(), target, body);
                } else {
                    debug!(
                        target_client_id,
                        command_id = %body.command_id,
                        "Target not attached here; forwarding across the cluster"
                    );
                    self.forward_remote(conn.clone(), target_client_id, body);
                }
                Ok(Disposition::Continue)
            }
            other => {
                warn!(kind = ?other, "Command handler got unexpected packet kind");
                Err(SessionError::Unsupported(other as u8))
            }
        }
    }
}
