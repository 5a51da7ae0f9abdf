//! Port mapping model
//!
//! Mappings are owned by the cloud control plane; the core reads them
//! to authorize tunnel opens and writes back traffic accounting deltas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A configured listen/target pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    pub id: String,
    /// Client allowed to open the listen side. Canonical field; mappings
    /// without it are rejected by the tunnel-open path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_client_id: Option<i64>,
    pub target_client_id: i64,
    pub secret_key: String,
    pub target_host: String,
    pub target_port: u16,
    pub protocol: String,
    /// Bytes per second; zero disables limiting
    #[serde(default)]
    pub bandwidth_limit: u64,
    /// Compression/encryption metadata, opaque to nodes and forwarded
    /// verbatim between the two clients
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub transform: serde_json::Value,
    #[serde(default)]
    pub traffic_stats: TrafficStats,
}

/// Cumulative traffic counters for a mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            last_updated: Utc::now(),
        }
    }
}

/// Byte-count delta reported when a bridge closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TrafficStats {
    pub fn apply(&mut self, delta: TrafficDelta) {
        self.bytes_sent += delta.bytes_sent;
        self.bytes_received += delta.bytes_received;
        self.last_updated = Utc::now();
    }
}
