//! Collaborator seams: credential validation and the mapping database
//!
//! Both live outside the core. `AuthHandler` turns a handshake payload
//! into a client identity; `CloudControl` owns port mappings and their
//! traffic accounting.

use async_trait::async_trait;
use tunnox_proto::{ConnectionType, HandshakeRequest, PortMapping, TrafficDelta};

use crate::error::SessionError;

/// Result of a successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub client_id: i64,
    pub connection_type: ConnectionType,
}

/// Credential validation seam
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Validate a handshake and assign the connection's identity.
    ///
    /// Failures become a negative ack followed by connection close.
    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeOutcome, SessionError>;
}

/// Port-mapping database seam
#[async_trait]
pub trait CloudControl: Send + Sync {
    async fn get_port_mapping(&self, mapping_id: &str) -> Result<PortMapping, SessionError>;

    /// Fold a closed bridge's byte counters into the mapping's stats
    async fn update_port_mapping_stats(
        &self,
        mapping_id: &str,
        delta: TrafficDelta,
    ) -> Result<(), SessionError>;
}
