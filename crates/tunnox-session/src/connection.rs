//! Per-connection state and the accept-time connection map

use std::sync::{RwLock, Weak};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tunnox_transport::{ConnectionCapabilities, PacketStream, TransportProtocol};

/// Connection identifier, unique per session manager
pub type ConnId = u64;

/// Lifecycle of a connection
///
/// Promotion to `Control` or `Tunnel` happens on the first
/// post-handshake packet; `StreamMode` means a bridge owns the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Authenticating,
    Control,
    Tunnel,
    StreamMode,
    Closing,
    Closed,
}

/// One accepted connection
pub struct Connection {
    id: ConnId,
    stream: Arc<dyn PacketStream>,
    protocol: TransportProtocol,
    state: RwLock<ConnectionState>,
    client_id: RwLock<Option<i64>>,
    mapping_id: RwLock<Option<String>>,
    last_activity: RwLock<Instant>,
    cancel: CancellationToken,
    opened_at: DateTime<Utc>,
}

/// Read-only view of a connection for accessors and logs
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnId,
    pub state: ConnectionState,
    pub protocol: TransportProtocol,
    pub client_id: Option<i64>,
    pub mapping_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(id: ConnId, stream: Arc<dyn PacketStream>, parent: &CancellationToken) -> Self {
        let protocol = stream.protocol();
        Self {
            id,
            stream,
            protocol,
            state: RwLock::new(ConnectionState::Accepted),
            client_id: RwLock::new(None),
            mapping_id: RwLock::new(None),
            last_activity: RwLock::new(Instant::now()),
            cancel: parent.child_token(),
            opened_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn stream(&self) -> &Arc<dyn PacketStream> {
        &self.stream
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn capabilities(&self) -> ConnectionCapabilities {
        self.stream.capabilities()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap() = state;
    }

    /// Client id for this connection: assigned at handshake, or carried
    /// by the transport itself when the protocol authenticates
    pub fn client_id(&self) -> Option<i64> {
        self.client_id
            .read()
            .unwrap()
            .or_else(|| self.stream.transport_client_id())
    }

    pub fn set_client_id(&self, client_id: i64) {
        *self.client_id.write().unwrap() = Some(client_id);
    }

    pub fn mapping_id(&self) -> Option<String> {
        self.mapping_id.read().unwrap().clone()
    }

    pub fn set_mapping_id(&self, mapping_id: String) {
        *self.mapping_id.write().unwrap() = Some(mapping_id);
    }

    /// Refresh the activity stamp; heartbeats and every routed packet
    /// call this
    pub fn touch(&self) {
        *self.last_activity.write().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.read().unwrap().elapsed()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            state: self.state(),
            protocol: self.protocol,
            client_id: self.client_id(),
            mapping_id: self.mapping_id(),
            opened_at: self.opened_at,
        }
    }
}

/// Accept-time index of all connections
///
/// Holds weak references only: after promotion exactly one registry
/// (control or tunnel) owns the connection, and before promotion the
/// read-loop task does. A dead entry just means the owner already let
/// go.
#[derive(Default)]
pub struct ConnectionMap {
    conns: DashMap<ConnId, Weak<Connection>>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: &Arc<Connection>) {
        self.conns.insert(conn.id(), Arc::downgrade(conn));
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        let upgraded = self.conns.get(&id).and_then(|weak| weak.upgrade());
        if upgraded.is_none() {
            self.conns.remove_if(&id, |_, weak| weak.upgrade().is_none());
        }
        upgraded
    }

    pub fn remove(&self, id: ConnId) {
        self.conns.remove(&id);
    }

    /// Connections still alive somewhere
    pub fn live_count(&self) -> usize {
        self.conns
            .iter()
            .filter(|entry| entry.value().upgrade().is_some())
            .count()
    }

    /// Drop entries whose owner is gone
    pub fn prune(&self) -> usize {
        let before = self.conns.len();
        self.conns.retain(|_, weak| weak.upgrade().is_some());
        before - self.conns.len()
    }

    /// Live connections, for the idle sweep
    pub fn live(&self) -> Vec<Arc<Connection>> {
        self.conns
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnox_transport::{FramedStreamFactory, StreamFactory};

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

    #[tokio::test]
    async fn test_state_transitions() {
        let conn = test_connection(1);
        assert_eq!(conn.state(), ConnectionState::Accepted);

        conn.set_state(ConnectionState::Authenticating);
        conn.set_state(ConnectionState::Control);
        assert_eq!(conn.state(), ConnectionState::Control);
    }

    #[tokio::test]
    async fn test_client_id_assignment() {
        let conn = test_connection(1);
        assert!(conn.client_id().is_none());

        conn.set_client_id(42);
        assert_eq!(conn.client_id(), Some(42));
    }

    #[tokio::test]
    async fn test_map_holds_weak_references() {
        let map = ConnectionMap::new();
        let conn = test_connection(7);
        map.insert(&conn);

        assert!(map.get(7).is_some());
        assert_eq!(map.live_count(), 1);

        drop(conn);
        assert!(map.get(7).is_none());
        assert_eq!(map.live_count(), 0);
    }

    #[tokio::test]
    async fn test_prune_drops_dead_entries() {
        let map = ConnectionMap::new();
        let keep = test_connection(1);
        map.insert(&keep);
        {
            let short_lived = test_connection(2);
            map.insert(&short_lived);
        }

        assert_eq!(map.prune(), 1);
        assert!(map.get(1).is_some());
    }
}
