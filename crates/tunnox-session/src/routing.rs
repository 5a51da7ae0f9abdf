//! Routing table over the shared KV store
//!
//! Thin wrapper translating the cluster's coordination state into the
//! `tunnox:` key layout. The KV layer's TTL is authoritative for
//! expiry; nothing here scans for stale keys. A store outage during
//! `register` is logged and swallowed so a single node keeps working
//! without its KV backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use tunnox_proto::{client_node_key, cross_server_conn_key, tunnel_waiting_key, TunnelWaitingState};
use tunnox_storage::Storage;

use crate::error::SessionError;

/// Cluster routing state
pub struct RoutingTable {
    storage: Arc<dyn Storage>,
    waiting_ttl: Duration,
}

impl RoutingTable {
    pub fn new(storage: Arc<dyn Storage>, waiting_ttl: Duration) -> Self {
        Self {
            storage,
            waiting_ttl,
        }
    }

    /// TTL applied to waiting states, for building `expires_at` stamps
    pub fn waiting_ttl(&self) -> Duration {
        self.waiting_ttl
    }

    /// Record a waiting tunnel. Outages are logged, not propagated.
    pub async fn register(&self, state: &TunnelWaitingState) {
        let key = tunnel_waiting_key(&state.tunnel_id);
        let value = match serde_json::to_string(state) {
            Ok(value) => value,
            Err(e) => {
                warn!(tunnel_id = %state.tunnel_id, error = %e, "Failed to encode waiting state");
                return;
            }
        };
        if let Err(e) = self.storage.set(&key, value, Some(self.waiting_ttl)).await {
            warn!(
                tunnel_id = %state.tunnel_id,
                error = %e,
                "KV store unreachable; tunnel will be single-node only"
            );
        }
    }

    /// Fetch a live waiting state
    pub async fn lookup(&self, tunnel_id: &str) -> Result<TunnelWaitingState, SessionError> {
        let raw = self.storage.get(&tunnel_waiting_key(tunnel_id)).await?;
        serde_json::from_str(&raw)
            .map_err(|e| SessionError::Internal(format!("corrupt waiting state: {}", e)))
    }

    /// Drop a waiting state; missing keys are fine
    pub async fn remove(&self, tunnel_id: &str) {
        if let Err(e) = self.storage.delete(&tunnel_waiting_key(tunnel_id)).await {
            debug!(tunnel_id = %tunnel_id, error = %e, "Failed to remove waiting state");
        }
    }

    /// Build the waiting state written at bridge creation
    pub fn waiting_state(
        &self,
        tunnel_id: &str,
        mapping_id: &str,
        secret_key: &str,
        node_id: &str,
        source_client_id: i64,
        target_client_id: i64,
        target_host: &str,
        target_port: u16,
    ) -> TunnelWaitingState {
        let now = Utc::now();
        TunnelWaitingState {
            tunnel_id: tunnel_id.to_string(),
            mapping_id: mapping_id.to_string(),
            secret_key: secret_key.to_string(),
            source_node_id: node_id.to_string(),
            source_client_id,
            target_client_id,
            target_host: target_host.to_string(),
            target_port,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.waiting_ttl)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    /// Record which node holds a client's control connection
    pub async fn register_client_node(&self, client_id: i64, node_id: &str) {
        if let Err(e) = self
            .storage
            .set(&client_node_key(client_id), node_id.to_string(), None)
            .await
        {
            warn!(client_id, error = %e, "Failed to record client node");
        }
    }

    /// Which node holds a client's control connection
    pub async fn lookup_client_node(&self, client_id: i64) -> Result<String, SessionError> {
        Ok(self.storage.get(&client_node_key(client_id)).await?)
    }

    /// Drop the client-node entry, but only if this node still owns it
    pub async fn remove_client_node(&self, client_id: i64, node_id: &str) {
        let key = client_node_key(client_id);
        match self.storage.get(&key).await {
            Ok(owner) if owner == node_id => {
                let _ = self.storage.delete(&key).await;
            }
            Ok(_) => {
                debug!(client_id, "Client re-homed to another node; keeping entry");
            }
            Err(_) => {}
        }
    }

    /// Observability breadcrumb for a dedicated inter-node connection
    pub async fn record_cross_conn(&self, tunnel_id: &str, metadata: serde_json::Value) {
        let key = cross_server_conn_key(tunnel_id);
        if let Err(e) = self
            .storage
            .set(&key, metadata.to_string(), Some(Duration::from_secs(300)))
            .await
        {
            debug!(tunnel_id = %tunnel_id, error = %e, "Failed to record cross-node metadata");
        }
    }

    pub async fn remove_cross_conn(&self, tunnel_id: &str) {
        let _ = self.storage.delete(&cross_server_conn_key(tunnel_id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnox_storage::MemoryStorage;

    fn table() -> RoutingTable {
        RoutingTable::new(Arc::new(MemoryStorage::new()), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_register_lookup_remove() {
        let routing = table();
        let state = routing.waiting_state("t1", "m1", "sk", "node-a", 100, 200, "127.0.0.1", 9000);

        routing.register(&state).await;
        let found = routing.lookup("t1").await.unwrap();
        assert_eq!(found, state);

        routing.remove("t1").await;
        assert!(matches!(
            routing.lookup("t1").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let routing = table();
        assert!(matches!(
            routing.lookup("nope").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_state_expires() {
        let routing = table();
        let state = routing.waiting_state("t1", "m1", "sk", "node-a", 100, 200, "127.0.0.1", 9000);
        routing.register(&state).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(
            routing.lookup("t1").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_client_node_index() {
        let routing = table();

        routing.register_client_node(100, "node-a").await;
        assert_eq!(routing.lookup_client_node(100).await.unwrap(), "node-a");

        // Another node took the client over; our removal must not clobber it
        routing.register_client_node(100, "node-b").await;
        routing.remove_client_node(100, "node-a").await;
        assert_eq!(routing.lookup_client_node(100).await.unwrap(), "node-b");

        routing.remove_client_node(100, "node-b").await;
        assert!(routing.lookup_client_node(100).await.is_err());
    }
}
