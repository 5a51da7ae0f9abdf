//! Handshake handling
//!
//! The first packet on every connection. Authentication is delegated
//! to the `AuthHandler` seam; success registers the connection as
//! control (with eviction of any stale holder) or flags it as a tunnel
//! channel, failure sends a negative ack and closes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use tunnox_proto::{
    ConnectionType, HandshakeAck, HandshakeRequest, PacketKind, TransferPacket,
};

use crate::client_registry::ClientRegistry;
use crate::cloud::AuthHandler;
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Disposition, SessionError};
use crate::router::PacketHandler;
use crate::routing::RoutingTable;

/// Handshake packet handler
pub struct HandshakeHandler {
    node_id: String,
    auth: Arc<dyn AuthHandler>,
    clients: Arc<ClientRegistry>,
    routing: Arc<RoutingTable>,
    config: SessionConfig,
}

impl HandshakeHandler {
    pub fn new(
        node_id: String,
        auth: Arc<dyn AuthHandler>,
        clients: Arc<ClientRegistry>,
        routing: Arc<RoutingTable>,
        config: SessionConfig,
    ) -> Self {
        Self {
            node_id,
            auth,
            clients,
            routing,
            config,
        }
    }

    async fn send_ack(&self, conn: &Arc<Connection>, ack: &HandshakeAck) -> Result<(), SessionError> {
        conn.stream()
            .send_packet(&TransferPacket::json(PacketKind::HandshakeAck, ack)?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for HandshakeHandler {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        packet: TransferPacket,
    ) -> Result<Disposition, SessionError> {
        conn.set_state(ConnectionState::Authenticating);

        let mut request: HandshakeRequest = packet.decode_body()?;
        if request.client_id.is_none() && conn.capabilities().carries_client_id_in_protocol {
            request.client_id = conn.stream().transport_client_id();
        }

        let outcome = match self.auth.handshake(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                info!(conn_id = conn.id(), error = %e, "Handshake rejected");
                let _ = self.send_ack(conn, &HandshakeAck::failed(e.to_string())).await;
                return Ok(Disposition::CloseConnection);
            }
        };

        conn.set_client_id(outcome.client_id);

        let is_tunnel =
            request.mapping_id.is_some() || outcome.connection_type == ConnectionType::Tunnel;
        if is_tunnel {
            // Tunnel channels never enter the control registry; the
            // coming TunnelOpen promotes them the rest of the way
            if let Some(mapping_id) = &request.mapping_id {
                conn.set_mapping_id(mapping_id.clone());
            }
            conn.set_state(ConnectionState::Tunnel);
            debug!(
                conn_id = conn.id(),
                client_id = outcome.client_id,
                "Handshake complete (tunnel channel)"
            );
            self.send_ack(
                conn,
                &HandshakeAck::ok(outcome.client_id, ConnectionType::Tunnel),
            )
            .await?;
            return Ok(Disposition::Continue);
        }

        if self.clients.len() >= self.config.max_control_connections {
            warn!(
                conn_id = conn.id(),
                limit = self.config.max_control_connections,
                "Control connection limit reached"
            );
            let _ = self
                .send_ack(conn, &HandshakeAck::failed("control connection limit reached"))
                .await;
            return Ok(Disposition::CloseConnection);
        }

        let evicted = self.clients.register(outcome.client_id, conn.clone());
        conn.set_state(ConnectionState::Control);

        if let Some(old) = evicted {
            old.set_state(ConnectionState::Closing);
            old.cancel_token().cancel();
            let _ = old.stream().close().await;
            old.set_state(ConnectionState::Closed);
        }

        self.routing
            .register_client_node(outcome.client_id, &self.node_id)
            .await;

        info!(
            conn_id = conn.id(),
            client_id = outcome.client_id,
            protocol = conn.protocol().as_str(),
            "Control connection registered"
        );

        self.send_ack(
            conn,
            &HandshakeAck::ok(outcome.client_id, ConnectionType::Control),
        )
        .await?;
        Ok(Disposition::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::HandshakeOutcome;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tunnox_storage::MemoryStorage;
    use tunnox_transport::{FramedStreamFactory, PacketStream, StreamFactory, TransportProtocol};

    struct TokenAuth;

    #[async_trait]
    impl AuthHandler for TokenAuth {
        async fn handshake(
            &self,
            request: &HandshakeRequest,
        ) -> Result<HandshakeOutcome, SessionError> {
            if request.auth_token != "good" {
                return Err(SessionError::Unauthenticated("bad token".to_string()));
            }
            Ok(HandshakeOutcome {
                client_id: request.client_id.unwrap_or(1),
                connection_type: if request.mapping_id.is_some() {
                    ConnectionType::Tunnel
                } else {
                    ConnectionType::Control
                },
            })
        }
    }

    fn handler(clients: Arc<ClientRegistry>) -> HandshakeHandler {
        HandshakeHandler::new(
            "node-a".to_string(),
            Arc::new(TokenAuth),
            clients,
            Arc::new(RoutingTable::new(
                Arc::new(MemoryStorage::new()),
                Duration::from_secs(30),
            )),
            SessionConfig::default(),
        )
    }

    fn conn_pair(id: u64) -> (Arc<Connection>, Arc<dyn PacketStream>) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let server = FramedStreamFactory.create(Box::new(ar), Box::new(aw), TransportProtocol::Tcp);
        let client = FramedStreamFactory.create(Box::new(br), Box::new(bw), TransportProtocol::Tcp);
        (
            Arc::new(Connection::new(id, server, &CancellationToken::new())),
            client,
        )
    }

    fn handshake_packet(token: &str, client_id: i64, mapping_id: Option<&str>) -> TransferPacket {
        TransferPacket::json(
            PacketKind::Handshake,
            &HandshakeRequest {
                auth_token: token.to_string(),
                client_id: Some(client_id),
                mapping_id: mapping_id.map(str::to_string),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_successful_control_handshake() {
        let clients = Arc::new(ClientRegistry::new());
        let handler = handler(clients.clone());
        let (conn, client) = conn_pair(1);

        let disposition = handler
            .handle(&conn, handshake_packet("good", 100, None))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(conn.state(), ConnectionState::Control);
        assert!(clients.get_by_client_id(100).is_some());

        let ack: HandshakeAck = client
            .recv_packet()
            .await
            .unwrap()
            .unwrap()
            .decode_body()
            .unwrap();
        assert!(ack.success);
        assert_eq!(ack.client_id, Some(100));
        assert_eq!(ack.connection_type, Some(ConnectionType::Control));
    }

    #[tokio::test]
    async fn test_failed_handshake_sends_negative_ack() {
        let clients = Arc::new(ClientRegistry::new());
        let handler = handler(clients.clone());
        let (conn, client) = conn_pair(1);

        let disposition = handler
            .handle(&conn, handshake_packet("wrong", 100, None))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::CloseConnection);
        assert!(clients.get_by_client_id(100).is_none());

        let ack: HandshakeAck = client
            .recv_packet()
            .await
            .unwrap()
            .unwrap()
            .decode_body()
            .unwrap();
        assert!(!ack.success);
    }

    #[tokio::test]
    async fn test_tunnel_handshake_skips_control_registry() {
        let clients = Arc::new(ClientRegistry::new());
        let handler = handler(clients.clone());
        let (conn, client) = conn_pair(1);

        let disposition = handler
            .handle(&conn, handshake_packet("good", 100, Some("m1")))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(conn.state(), ConnectionState::Tunnel);
        assert_eq!(conn.mapping_id().as_deref(), Some("m1"));
        assert!(clients.get_by_client_id(100).is_none());

        let ack: HandshakeAck = client
            .recv_packet()
            .await
            .unwrap()
            .unwrap()
            .decode_body()
            .unwrap();
        assert_eq!(ack.connection_type, Some(ConnectionType::Tunnel));
    }

    #[tokio::test]
    async fn test_second_handshake_evicts_first() {
        let clients = Arc::new(ClientRegistry::new());
        let handler = handler(clients.clone());

        let (first, _first_client) = conn_pair(1);
        handler
            .handle(&first, handshake_packet("good", 100, None))
            .await
            .unwrap();

        let (second, _second_client) = conn_pair(2);
        handler
            .handle(&second, handshake_packet("good", 100, None))
            .await
            .unwrap();

        assert_eq!(clients.get_by_client_id(100).unwrap().id(), 2);
        assert_eq!(first.state(), ConnectionState::Closed);
        assert!(first.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_control_connection_cap() {
        let clients = Arc::new(ClientRegistry::new());
        let handler = HandshakeHandler::new(
            "node-a".to_string(),
            Arc::new(TokenAuth),
            clients.clone(),
            Arc::new(RoutingTable::new(
                Arc::new(MemoryStorage::new()),
                Duration::from_secs(30),
            )),
            SessionConfig::default().with_max_control_connections(1),
        );

        let (first, _first_client) = conn_pair(1);
        handler
            .handle(&first, handshake_packet("good", 100, None))
            .await
            .unwrap();

        let (second, second_client) = conn_pair(2);
        let disposition = handler
            .handle(&second, handshake_packet("good", 200, None))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::CloseConnection);
        assert!(clients.get_by_client_id(200).is_none());

        let ack: HandshakeAck = second_client
            .recv_packet()
            .await
            .unwrap()
            .unwrap()
            .decode_body()
            .unwrap();
        assert!(!ack.success);
    }

    #[tokio::test]
    async fn test_malformed_handshake_is_invalid_packet() {
        let clients = Arc::new(ClientRegistry::new());
        let handler = handler(clients);
        let (conn, _client) = conn_pair(1);

        let packet = TransferPacket::new(
            PacketKind::Handshake,
            bytes::Bytes::from_static(b"not json"),
        );
        let result = handler.handle(&conn, packet).await;
        assert!(matches!(result, Err(SessionError::InvalidPacket(_))));
    }
}
