//! Registry of authenticated control connections
//!
//! Two mutually-consistent indices under one lock: `connID → conn` and
//! `clientID → conn`. At most one control connection per client exists
//! on a node; re-registration evicts the previous holder. The lock is
//! never held across I/O: eviction hands the old connection back to
//! the caller, which closes it outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::connection::{ConnId, Connection};

#[derive(Default)]
struct Indices {
    by_conn: HashMap<ConnId, Arc<Connection>>,
    by_client: HashMap<i64, Arc<Connection>>,
}

/// Control connection registry
#[derive(Default)]
pub struct ClientRegistry {
    inner: RwLock<Indices>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` as the control connection for `client_id`
    ///
    /// Returns the evicted previous connection, if any. Both indices
    /// are updated atomically.
    pub fn register(&self, client_id: i64, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().unwrap();

        let evicted = inner.by_client.remove(&client_id);
        if let Some(old) = &evicted {
            inner.by_conn.remove(&old.id());
            info!(
                client_id,
                old_conn_id = old.id(),
                new_conn_id = conn.id(),
                "Evicting stale control connection"
            );
        }

        inner.by_conn.insert(conn.id(), conn.clone());
        inner.by_client.insert(client_id, conn);
        evicted
    }

    /// Remove a connection by its id, fixing up both indices
    pub fn unregister(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().unwrap();

        let conn = inner.by_conn.remove(&conn_id)?;
        if let Some(client_id) = conn.client_id() {
            // Only drop the client index entry if it still points here;
            // an eviction may already have replaced it
            match inner.by_client.get(&client_id) {
                Some(current) if current.id() == conn_id => {
                    inner.by_client.remove(&client_id);
                }
                Some(_) => {}
                None => {
                    warn!(conn_id, client_id, "Client index missing during unregister");
                }
            }
        }
        Some(conn)
    }

    pub fn get_by_client_id(&self, client_id: i64) -> Option<Arc<Connection>> {
        self.inner.read().unwrap().by_client.get(&client_id).cloned()
    }

    pub fn get_by_conn_id(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        self.inner.read().unwrap().by_conn.get(&conn_id).cloned()
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

    /// Check the two indices agree; used by tests and the debug sweep
    pub fn indices_consistent(&self) -> bool {
        let inner = self.inner.read().unwrap();
        if inner.by_conn.len() != inner.by_client.len() {
            return false;
        }
        inner.by_client.iter().all(|(_, conn)| {
            inner
                .by_conn
                .get(&conn.id())
                .is_some_and(|other| Arc::ptr_eq(other, conn))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use tunnox_transport::{FramedStreamFactory, StreamFactory, TransportProtocol};

    fn test_connection(id: ConnId, client_id: i64) -> Arc<Connection> {
        let (a, _b) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(a);
        let stream = FramedStreamFactory.create(
            Box::new(reader),
            Box::new(writer),
            TransportProtocol::Tcp,
        );
        let conn = Arc::new(Connection::new(id, stream, &CancellationToken::new()));
        conn.set_client_id(client_id);
        conn
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ClientRegistry::new();
        let conn = test_connection(1, 100);

        assert!(registry.register(100, conn.clone()).is_none());
        assert_eq!(registry.get_by_client_id(100).unwrap().id(), 1);
        assert_eq!(registry.get_by_conn_id(1).unwrap().client_id(), Some(100));
        assert!(registry.indices_consistent());
    }

    #[tokio::test]
    async fn test_reregistration_evicts_previous() {
        let registry = ClientRegistry::new();
        let first = test_connection(1, 100);
        let second = test_connection(2, 100);

        registry.register(100, first);
        let evicted = registry.register(100, second).unwrap();

        assert_eq!(evicted.id(), 1);
        assert_eq!(registry.get_by_client_id(100).unwrap().id(), 2);
        assert!(registry.get_by_conn_id(1).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.indices_consistent());
    }

    #[tokio::test]
    async fn test_unregister_removes_both_indices() {
        let registry = ClientRegistry::new();
        registry.register(100, test_connection(1, 100));

        let removed = registry.unregister(1).unwrap();
        assert_eq!(removed.client_id(), Some(100));
        assert!(registry.get_by_client_id(100).is_none());
        assert!(registry.get_by_conn_id(1).is_none());
        assert!(registry.is_empty());
        assert!(registry.indices_consistent());
    }

    #[tokio::test]
    async fn test_unregister_evicted_conn_keeps_replacement() {
        let registry = ClientRegistry::new();
        let first = test_connection(1, 100);
        registry.register(100, first.clone());
        registry.register(100, test_connection(2, 100));

        // Late unregister of the evicted connection must not disturb
        // the replacement's client index entry
        assert!(registry.unregister(1).is_none());
        assert_eq!(registry.get_by_client_id(100).unwrap().id(), 2);
        assert!(registry.indices_consistent());
    }

    #[tokio::test]
    async fn test_unregister_unknown() {
        let registry = ClientRegistry::new();
        assert!(registry.unregister(99).is_none());
    }

    #[tokio::test]
    async fn test_multiple_clients() {
        let registry = ClientRegistry::new();
        registry.register(100, test_connection(1, 100));
        registry.register(200, test_connection(2, 200));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_by_client_id(100).unwrap().id(), 1);
        assert_eq!(registry.get_by_client_id(200).unwrap().id(), 2);
        assert!(registry.indices_consistent());
    }
}
