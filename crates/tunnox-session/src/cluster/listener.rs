//! Source-side cross-node listener
//!
//! Accepts dedicated inter-node TCP connections and dispatches on the
//! first frame. A `TargetReady` frame binds the connection as a local
//! bridge's target endpoint for the tunnel's lifetime; the RPC frame
//! types (`Command`, `HTTPProxy`, `DNSQuery`) are request-scoped and
//! the connection closes once the response frame is written.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunnox_proto::{
    CommandEnvelope, CommandRequestBody, CommandResponseEnvelope, DnsQueryEnvelope,
    DnsResponseEnvelope, FrameType, HttpProxyEnvelope, HttpResponseEnvelope, PacketKind,
    TransferPacket, TunnelFrame,
};
use tunnox_transport::DuplexByteStream;

use crate::cluster::commands::{CommandOutcome, PendingRequests};
use crate::cluster::conn_manager::CrossNodeTunnelConn;
use crate::cluster::{read_frame, write_frame};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::tunnel_open::TunnelLifecycle;

/// Cross-node listener, source side
pub struct CrossNodeListener {
    node_id: String,
    lifecycle: Arc<TunnelLifecycle>,
    pending: Arc<PendingRequests>,
    config: SessionConfig,
    cancel: CancellationToken,
}

impl CrossNodeListener {
    pub fn new(
        node_id: String,
        lifecycle: Arc<TunnelLifecycle>,
        pending: Arc<PendingRequests>,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_id,
            lifecycle,
            pending,
            config,
            cancel,
        }
    }

    /// Accept loop; runs until the session shuts down
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        info!(
            node_id = %self.node_id,
            addr = ?listener.local_addr().ok(),
            "Cross-node listener started"
        );
        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = self.cancel.cancelled() => break,
            };
            match accepted {
                Ok((tcp, peer)) => {
                    debug!(peer = %peer, "Accepted inter-node connection");
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(tcp).await {
                            warn!(peer = %peer, error = %e, "Inter-node connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Cross-node accept failed");
                }
            }
        }
        debug!("Cross-node listener stopped");
    }

    async fn handle_connection(&self, mut tcp: TcpStream) -> Result<(), SessionError> {
        let frame = tokio::time::timeout(self.config.rpc_timeout, read_frame(&mut tcp))
            .await
            .map_err(|_| SessionError::Timeout("first inter-node frame".to_string()))??;

        match frame.frame_type {
            FrameType::TargetReady => self.handle_target_ready(tcp, frame).await,
            FrameType::Command => self.handle_command_rpc(tcp, frame).await,
            FrameType::HttpProxy => self.handle_http_proxy_rpc(tcp, frame).await,
            FrameType::DnsQuery => self.handle_dns_rpc(tcp, frame).await,
            other => {
                warn!(frame_type = ?other, "Unexpected first inter-node frame");
                Err(SessionError::InvalidPacket(format!(
                    "unexpected first frame {:?}",
                    other
                )))
            }
        }
    }

    /// Bind the connection as the tunnel's target endpoint
    async fn handle_target_ready(
        &self,
        tcp: TcpStream,
        frame: TunnelFrame,
    ) -> Result<(), SessionError> {
        // The payload carries the full tunnel id; the header field is
        // truncated at sixteen bytes and only a fallback
        let (tunnel_id, target_node) = match tunnox_proto::decode_target_ready(&frame.payload) {
            Ok(decoded) => decoded,
            Err(_) => (frame.tunnel_id.clone(), String::new()),
        };

        if self.lifecycle.closed.is_closed(&tunnel_id) {
            debug!(tunnel_id = %tunnel_id, "Dropping TargetReady for a closed tunnel");
            return Ok(());
        }

        let Some(bridge) = self.lifecycle.bridges.get(&tunnel_id) else {
            warn!(tunnel_id = %tunnel_id, "TargetReady for unknown tunnel");
            return Ok(());
        };

        let stream = Arc::new(DuplexByteStream::from_tcp(tcp));
        let cross = Arc::new(CrossNodeTunnelConn::new(
            tunnel_id.clone(),
            target_node.clone(),
            stream.clone(),
            bridge.cancel_token(),
        ));
        self.lifecycle.conn_manager.register(cross).await;

        info!(
            tunnel_id = %tunnel_id,
            target_node = %target_node,
            "Remote target attached to bridge"
        );

        // The bridge's own task pumps from here; the connection lives
        // exactly as long as the bridge does
        bridge.set_target_connection(stream, None).await;
        bridge.notify_target_ready();
        Ok(())
    }

    /// Opaque command RPC addressed to a locally attached client
    async fn handle_command_rpc(
        &self,
        mut tcp: TcpStream,
        frame: TunnelFrame,
    ) -> Result<(), SessionError> {
        let envelope: CommandEnvelope = serde_json::from_slice(&frame.payload)
            .map_err(|e| SessionError::InvalidPacket(format!("command envelope: {}", e)))?;

        // The command envelope carries a full inner command
        let outcome = match serde_json::from_slice::<CommandRequestBody>(&envelope.payload) {
            Ok(body) => {
                self.dispatch_to_client(
                    envelope.target_client_id,
                    &envelope.command_id,
                    body,
                    self.config.rpc_timeout,
                )
                .await
            }
            Err(e) => CommandOutcome::failed(format!("malformed inner command: {}", e)),
        };

        let response = CommandResponseEnvelope {
            command_id: envelope.command_id.clone(),
            success: outcome.success,
            error: outcome.error.clone(),
            payload: serde_json::to_vec(&outcome.payload).unwrap_or_default(),
        };
        let reply = TunnelFrame::new(
            frame.tunnel_id.clone(),
            FrameType::CommandResponse,
            serde_json::to_vec(&response)
                .map_err(|e| SessionError::Internal(e.to_string()))?
                .into(),
        );
        write_frame(&mut tcp, &reply).await
    }

    async fn handle_http_proxy_rpc(
        &self,
        mut tcp: TcpStream,
        frame: TunnelFrame,
    ) -> Result<(), SessionError> {
        let envelope: HttpProxyEnvelope = serde_json::from_slice(&frame.payload)
            .map_err(|e| SessionError::InvalidPacket(format!("http proxy envelope: {}", e)))?;

        // The request bytes stay opaque; they ride inside a command
        // the client understands
        let body = CommandRequestBody {
            command_id: envelope.request_id.clone(),
            command_type: "http_proxy".to_string(),
            target_client_id: Some(envelope.target_client_id),
            payload: serde_json::json!({ "request": STANDARD.encode(&envelope.request) }),
        };
        let outcome = self
            .dispatch_to_client(
                envelope.target_client_id,
                &envelope.request_id,
                body,
                self.config.rpc_timeout,
            )
            .await;

        let response = HttpResponseEnvelope {
            request_id: envelope.request_id.clone(),
            success: outcome.success,
            error: outcome.error.clone(),
            response: serde_json::to_vec(&outcome.payload).unwrap_or_default(),
        };
        let reply = TunnelFrame::new(
            frame.tunnel_id.clone(),
            FrameType::HttpResponse,
            serde_json::to_vec(&response)
                .map_err(|e| SessionError::Internal(e.to_string()))?
                .into(),
        );
        write_frame(&mut tcp, &reply).await
    }

    async fn handle_dns_rpc(
        &self,
        mut tcp: TcpStream,
        frame: TunnelFrame,
    ) -> Result<(), SessionError> {
        let envelope: DnsQueryEnvelope = serde_json::from_slice(&frame.payload)
            .map_err(|e| SessionError::InvalidPacket(format!("dns envelope: {}", e)))?;

        let body = CommandRequestBody {
            command_id: envelope.request_id.clone(),
            command_type: "dns_query".to_string(),
            target_client_id: Some(envelope.target_client_id),
            payload: serde_json::json!({ "query": STANDARD.encode(&envelope.payload) }),
        };
        let outcome = self
            .dispatch_to_client(
                envelope.target_client_id,
                &envelope.request_id,
                body,
                self.config.dns_rpc_timeout,
            )
            .await;

        let response = DnsResponseEnvelope {
            request_id: envelope.request_id.clone(),
            success: outcome.success,
            error: outcome.error.clone(),
            payload: serde_json::to_vec(&outcome.payload).unwrap_or_default(),
        };
        let reply = TunnelFrame::new(
            frame.tunnel_id.clone(),
            FrameType::DnsResponse,
            serde_json::to_vec(&response)
                .map_err(|e| SessionError::Internal(e.to_string()))?
                .into(),
        );
        write_frame(&mut tcp, &reply).await
    }

    /// Forward an inner command to a local client's control stream and
    /// await its `CommandResp`
    async fn dispatch_to_client(
        &self,
        client_id: i64,
        command_id: &str,
        body: CommandRequestBody,
        timeout: std::time::Duration,
    ) -> CommandOutcome {
        let Some(client) = self.lifecycle.clients.get_by_client_id(client_id) else {
            return CommandOutcome::failed(format!("client {} not attached here", client_id));
        };

        let packet = match TransferPacket::json(PacketKind::JsonCommand, &body) {
            Ok(packet) => packet,
            Err(e) => return CommandOutcome::failed(e.to_string()),
        };

        let rx = self.pending.register(command_id);
        if let Err(e) = client.stream().send_packet(&packet).await {
            self.pending.cancel(command_id);
            return CommandOutcome::failed(format!("client send failed: {}", e));
        }

        match self.pending.wait(command_id, rx, timeout).await {
            Ok(outcome) => outcome,
            Err(e) => CommandOutcome::failed(e.to_string()),
        }
    }
}
