//! Cluster-facing payloads: broker broadcasts, cross-node RPC
//! envelopes, waiting-tunnel state and the shared KV key layout

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broker topic for tunnel-open fan-out
pub const TOPIC_TUNNEL_OPEN: &str = "tunnel.open";
/// Broker topic announcing a freshly created bridge
pub const TOPIC_TUNNEL_READY: &str = "tunnel.ready";
/// Broker topic for configuration pushes to named clients
pub const TOPIC_CONFIG_PUSH: &str = "config.push";

/// Command type delivered to a target client to wake it for a tunnel
pub const CMD_TUNNEL_OPEN: &str = "tunnel_open";
/// Command type delivering a pushed configuration body
pub const CMD_CONFIG_SET: &str = "config_set";

/// KV key for a tunnel's waiting state
pub fn tunnel_waiting_key(tunnel_id: &str) -> String {
    format!("tunnox:tunnel_waiting:{}", tunnel_id)
}

/// KV key mapping an authenticated client to its node
pub fn client_node_key(client_id: i64) -> String {
    format!("tunnox:client_node:{}", client_id)
}

/// KV key for cross-node connection metadata (observability only)
pub fn cross_server_conn_key(tunnel_id: &str) -> String {
    format!("tunnox:cross_server_conn:{}", tunnel_id)
}

/// State of a tunnel whose bridge waits for its target endpoint
///
/// Written by the source node at bridge creation, consumed by whichever
/// node the target client turns up on. The KV layer's TTL is
/// authoritative for expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelWaitingState {
    pub tunnel_id: String,
    pub mapping_id: String,
    pub secret_key: String,
    pub source_node_id: String,
    pub source_client_id: i64,
    pub target_client_id: i64,
    pub target_host: String,
    pub target_port: u16,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// `tunnel.open` broadcast payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelOpenBroadcast {
    #[serde(rename = "type")]
    pub kind: String,
    pub tunnel_id: String,
    pub mapping_id: String,
    pub secret_key: String,
    /// Target client the broadcast is trying to wake
    pub client_id: i64,
    pub source_node_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
}

/// `tunnel.ready` broadcast payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelReadyBroadcast {
    pub tunnel_id: String,
    pub source_node_id: String,
}

/// `config.push` broadcast payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigPushBroadcast {
    pub client_id: i64,
    pub config_body: serde_json::Value,
    pub timestamp: i64,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(&text).map_err(serde::de::Error::custom)
    }
}

/// `Command` frame envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
    pub target_client_id: i64,
    pub source_node_id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// `CommandResponse` frame envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponseEnvelope {
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// `HTTPProxy` frame envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpProxyEnvelope {
    pub request_id: String,
    pub target_client_id: i64,
    pub source_node_id: String,
    #[serde(with = "base64_bytes")]
    pub request: Vec<u8>,
}

/// `HTTPResponse` frame envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpResponseEnvelope {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "base64_bytes")]
    pub response: Vec<u8>,
}

/// `DNSQuery` frame envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsQueryEnvelope {
    pub request_id: String,
    pub target_client_id: i64,
    pub source_node_id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// `DNSResponse` frame envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsResponseEnvelope {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}
