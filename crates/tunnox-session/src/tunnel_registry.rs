//! Tunnel-side registries: promoted tunnel connections, per-tunnel
//! bridges, and the recently-closed set
//!
//! Three separate lock domains. The tunnel connection indices share
//! one lock; the bridge map and the closed set are lock-free maps of
//! their own.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::bridge::TunnelBridge;
use crate::connection::{ConnId, Connection};
use crate::error::SessionError;

#[derive(Default)]
struct TunnelIndices {
    by_conn: HashMap<ConnId, Arc<Connection>>,
    /// Both endpoints of a local tunnel register under its id
    by_tunnel: HashMap<String, Vec<ConnId>>,
}

/// Registry of connections promoted to tunnel mode
#[derive(Default)]
pub struct TunnelRegistry {
    inner: RwLock<TunnelIndices>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tunnel_id: &str, conn: Arc<Connection>) {
        let mut inner = self.inner.write().unwrap();
        let ids = inner.by_tunnel.entry(tunnel_id.to_string()).or_default();
        if !ids.contains(&conn.id()) {
            ids.push(conn.id());
        }
        inner.by_conn.insert(conn.id(), conn);
    }

    pub fn unregister(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().unwrap();
        let conn = inner.by_conn.remove(&conn_id)?;
        for ids in inner.by_tunnel.values_mut() {
            ids.retain(|id| *id != conn_id);
        }
        inner.by_tunnel.retain(|_, ids| !ids.is_empty());
        Some(conn)
    }

    pub fn get_by_conn_id(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        self.inner.read().unwrap().by_conn.get(&conn_id).cloned()
    }

    /// All connections registered under a tunnel id
    pub fn conns_for_tunnel(&self, tunnel_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_tunnel
            .get(tunnel_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_conn.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains_conn(&self, conn_id: ConnId) -> bool {
        self.inner.read().unwrap().by_conn.contains_key(&conn_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().by_conn.is_empty()
    }
}

/// Per-tunnel bridge map
///
/// At most one bridge per tunnel id; concurrent creation loses with
/// `AlreadyExists`.
#[derive(Default)]
pub struct BridgeMap {
    bridges: DashMap<String, Arc<TunnelBridge>>,
}

impl BridgeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bridge: Arc<TunnelBridge>) -> Result<(), SessionError> {
        let tunnel_id = bridge.tunnel_id().to_string();
        match self.bridges.entry(tunnel_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SessionError::AlreadyExists(
                format!("bridge for tunnel {}", tunnel_id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(bridge);
                Ok(())
            }
        }
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<TunnelBridge>> {
        self.bridges.get(tunnel_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<TunnelBridge>> {
        self.bridges.remove(tunnel_id).map(|(_, bridge)| bridge)
    }

    /// Bridge with `conn_id` as one of its endpoints
    pub fn find_by_conn_id(&self, conn_id: ConnId) -> Option<Arc<TunnelBridge>> {
        self.bridges
            .iter()
            .find(|entry| entry.value().involves_conn(conn_id))
            .map(|entry| entry.value().clone())
    }

    /// Bridge created for `mapping_id` by `client_id`'s listen side
    pub fn find_by_mapping_id(&self, mapping_id: &str, client_id: i64) -> Option<Arc<TunnelBridge>> {
        self.bridges
            .iter()
            .find(|entry| {
                entry.value().mapping_id() == Some(mapping_id)
                    && entry.value().source_client_id() == Some(client_id)
            })
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<TunnelBridge>> {
        self.bridges.iter().map(|e| e.value().clone()).collect()
    }
}

/// Recently-closed tunnel ids
///
/// Residual frames and broadcasts for a closed tunnel keep arriving
/// for a short while; this set lets the node drop them instead of
/// treating them as new work.
pub struct ClosedTunnels {
    entries: DashMap<String, Instant>,
    retention: Duration,
}

impl ClosedTunnels {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    pub fn mark_closed(&self, tunnel_id: &str) {
        self.entries.insert(tunnel_id.to_string(), Instant::now());
    }

    pub fn is_closed(&self, tunnel_id: &str) -> bool {
        match self.entries.get(tunnel_id) {
            Some(entry) => entry.value().elapsed() < self.retention,
            None => false,
        }
    }

    /// Drop entries past retention; called from the cleanup sweep
    pub fn purge(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, closed_at| closed_at.elapsed() < self.retention);
        let purged = before - self.entries.len();
        if purged > 0 {
            debug!(purged, "Purged expired closed-tunnel entries");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use tunnox_transport::{FramedStreamFactory, StreamFactory, TransportProtocol};

    fn test_connection(id: ConnId) -> Arc<Connection> {
        let (a, _b) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(a);
        let stream = FramedStreamFactory.create(
            Box::new(reader),
            Box::new(writer),
            TransportProtocol::Tcp,
        );
        Arc::new(Connection::new(id, stream, &CancellationToken::new()))
    }

    fn test_bridge(tunnel_id: &str) -> Arc<TunnelBridge> {
        Arc::new(TunnelBridge::new(
            tunnel_id,
            None,
            None,
            &CancellationToken::new(),
            Duration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn test_tunnel_registry_round_trip() {
        let registry = TunnelRegistry::new();
        registry.register("t1", test_connection(5));

        assert_eq!(registry.conns_for_tunnel("t1")[0].id(), 5);
        assert!(registry.contains_conn(5));
        assert_eq!(registry.len(), 1);

        let removed = registry.unregister(5).unwrap();
        assert_eq!(removed.id(), 5);
        assert!(registry.conns_for_tunnel("t1").is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_registry_tracks_both_endpoints() {
        let registry = TunnelRegistry::new();
        registry.register("t1", test_connection(5));
        registry.register("t1", test_connection(6));

        let conns = registry.conns_for_tunnel("t1");
        assert_eq!(conns.len(), 2);

        registry.unregister(5);
        assert_eq!(registry.conns_for_tunnel("t1").len(), 1);
        assert_eq!(registry.conns_for_tunnel("t1")[0].id(), 6);
    }

    #[tokio::test]
    async fn test_bridge_map_rejects_duplicates() {
        let map = BridgeMap::new();
        map.insert(test_bridge("t1")).unwrap();

        let result = map.insert(test_bridge("t1"));
        assert!(matches!(result, Err(SessionError::AlreadyExists(_))));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_bridge_map_lookup_by_conn() {
        let map = BridgeMap::new();
        let bridge = test_bridge("t1");
        let (a, _b) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(a);
        let endpoint = Arc::new(tunnox_transport::DuplexByteStream::new(
            Box::new(reader),
            Box::new(writer),
        ));
        bridge.set_source_connection(endpoint, Some(9)).await;
        map.insert(bridge).unwrap();

        assert!(map.find_by_conn_id(9).is_some());
        assert!(map.find_by_conn_id(10).is_none());
    }

    #[tokio::test]
    async fn test_bridge_map_remove() {
        let map = BridgeMap::new();
        map.insert(test_bridge("t1")).unwrap();

        assert!(map.remove("t1").is_some());
        assert!(map.remove("t1").is_none());
        assert!(map.get("t1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_tunnels_expiry() {
        let closed = ClosedTunnels::new(Duration::from_secs(30));
        closed.mark_closed("t1");
        assert!(closed.is_closed("t1"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!closed.is_closed("t1"));
        assert_eq!(closed.purge(), 1);
    }
}
