//! Shared fixtures for the session integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tunnox_proto::{
    ConnectionType, HandshakeAck, HandshakeRequest, PacketKind, PortMapping, TrafficDelta,
    TransferPacket, TunnelOpenAck, TunnelOpenRequest,
};
use tunnox_session::{
    AuthHandler, CloudControl, ConnId, HandshakeOutcome, SessionError, SessionManager,
};
use tunnox_transport::{ByteStream, FramedPacketStream, PacketStream, TransportProtocol};

/// Install the test log subscriber once per process
pub fn init_tracing() {
    use std::sync::OnceLock;
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Accepts any token except `"bad"`; the client id comes from the
/// request
pub struct StaticAuth;

#[async_trait]
impl AuthHandler for StaticAuth {
    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeOutcome, SessionError> {
        if request.auth_token == "bad" {
            return Err(SessionError::Unauthenticated("invalid token".to_string()));
        }
        let client_id = request
            .client_id
            .ok_or_else(|| SessionError::Unauthenticated("no client id".to_string()))?;
        Ok(HandshakeOutcome {
            client_id,
            connection_type: if request.mapping_id.is_some() {
                ConnectionType::Tunnel
            } else {
                ConnectionType::Control
            },
        })
    }
}

/// In-memory mapping database recording every stats update
#[derive(Default)]
pub struct FakeCloud {
    mappings: DashMap<String, PortMapping>,
    stats: DashMap<String, TrafficDelta>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mapping(&self, mapping: PortMapping) {
        self.mappings.insert(mapping.id.clone(), mapping);
    }

    pub fn recorded_delta(&self, mapping_id: &str) -> Option<TrafficDelta> {
        self.stats.get(mapping_id).map(|d| *d.value())
    }
}

#[async_trait]
impl CloudControl for FakeCloud {
    async fn get_port_mapping(&self, mapping_id: &str) -> Result<PortMapping, SessionError> {
        self.mappings
            .get(mapping_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| SessionError::NotFound(format!("mapping {}", mapping_id)))
    }

    async fn update_port_mapping_stats(
        &self,
        mapping_id: &str,
        delta: TrafficDelta,
    ) -> Result<(), SessionError> {
        let mut entry = self.stats.entry(mapping_id.to_string()).or_default();
        entry.bytes_sent += delta.bytes_sent;
        entry.bytes_received += delta.bytes_received;
        Ok(())
    }
}

pub fn mapping(id: &str, listen: i64, target: i64, bandwidth_limit: u64) -> PortMapping {
    PortMapping {
        id: id.to_string(),
        listen_client_id: Some(listen),
        target_client_id: target,
        secret_key: "sk".to_string(),
        target_host: "127.0.0.1".to_string(),
        target_port: 9000,
        protocol: "tcp".to_string(),
        bandwidth_limit,
        transform: serde_json::Value::Null,
        traffic_stats: Default::default(),
    }
}

/// Client half of an in-process connection to a session manager
pub struct TestClient {
    pub stream: Arc<FramedPacketStream>,
    pub conn_id: ConnId,
}

impl TestClient {
    /// Open a duplex pipe and hand the far side to the session
    pub fn connect(session: &Arc<SessionManager>) -> Self {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (fr, fw) = tokio::io::split(far);
        let conn_id = session
            .accept(Box::new(fr), Box::new(fw), TransportProtocol::Tcp)
            .expect("accept");

        let (nr, nw) = tokio::io::split(near);
        let stream = Arc::new(FramedPacketStream::new(
            Box::new(nr),
            Box::new(nw),
            TransportProtocol::Tcp,
        ));
        Self { stream, conn_id }
    }

    pub async fn handshake(
        &self,
        token: &str,
        client_id: i64,
        mapping_id: Option<&str>,
    ) -> HandshakeAck {
        let request = HandshakeRequest {
            auth_token: token.to_string(),
            client_id: Some(client_id),
            mapping_id: mapping_id.map(str::to_string),
        };
        self.stream
            .send_packet(&TransferPacket::json(PacketKind::Handshake, &request).unwrap())
            .await
            .expect("send handshake");

        let packet = self
            .recv()
            .await
            .expect("handshake ack");
        assert_eq!(packet.kind, PacketKind::HandshakeAck);
        packet.decode_body().expect("decode handshake ack")
    }

    pub async fn open_tunnel(&self, tunnel_id: &str, mapping_id: &str) -> TunnelOpenAck {
        let request = TunnelOpenRequest {
            tunnel_id: tunnel_id.to_string(),
            mapping_id: mapping_id.to_string(),
            secret_key: "sk".to_string(),
            target_host: None,
            target_port: None,
        };
        self.stream
            .send_packet(&TransferPacket::json(PacketKind::TunnelOpen, &request).unwrap())
            .await
            .expect("send tunnel open");

        let packet = self.recv().await.expect("tunnel open ack");
        assert_eq!(packet.kind, PacketKind::TunnelOpenAck);
        packet.decode_body().expect("decode tunnel open ack")
    }

    pub async fn recv(&self) -> Option<TransferPacket> {
        tokio::time::timeout(std::time::Duration::from_secs(10), self.stream.recv_packet())
            .await
            .expect("recv timed out")
            .expect("recv failed")
    }

    pub async fn write_raw(&self, data: &[u8]) {
        self.stream.write_bytes(data).await.expect("raw write");
    }

    pub async fn read_raw(&self, buf: &mut [u8]) -> usize {
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            self.stream.read_bytes(buf),
        )
        .await
        .expect("raw read timed out")
        .expect("raw read failed")
    }
}
