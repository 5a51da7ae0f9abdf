//! Session manager: entry point for every connection and packet
//!
//! Owns the registries, the packet router and the background sweeps.
//! A connection is accepted, read in a loop, and routed packet by
//! packet until a handler closes it or hands it off to a bridge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnox_broker::BridgeManager;
use tunnox_proto::{PacketKind, TransferPacket};
use tunnox_storage::Storage;
use tunnox_transport::{
    BoxedReader, BoxedWriter, FramedStreamFactory, StreamFactory, TransportProtocol,
};

use crate::bridge::TunnelBridge;
use crate::broker_glue::BrokerGlue;
use crate::client_registry::ClientRegistry;
use crate::cloud::{AuthHandler, CloudControl};
use crate::cluster::{
    CrossNodeForwarder, CrossNodeListener, NodeResolver, PendingRequests, TunnelConnectionManager,
};
use crate::command::CommandHandler;
use crate::config::SessionConfig;
use crate::connection::{ConnId, Connection, ConnectionMap, ConnectionSnapshot, ConnectionState};
use crate::error::{Disposition, SessionError};
use crate::handshake::HandshakeHandler;
use crate::router::{HeartbeatHandler, PacketRouter};
use crate::routing::RoutingTable;
use crate::tunnel_open::{TunnelLifecycle, TunnelOpenHandler};
use crate::tunnel_registry::{BridgeMap, ClosedTunnels, TunnelRegistry};

/// Builder for [`SessionManager`]
pub struct SessionManagerBuilder {
    config: SessionConfig,
    auth: Arc<dyn AuthHandler>,
    storage: Arc<dyn Storage>,
    broker: Arc<dyn BridgeManager>,
    cloud: Option<Arc<dyn CloudControl>>,
    resolver: Option<Arc<dyn NodeResolver>>,
    factory: Arc<dyn StreamFactory>,
}

impl SessionManagerBuilder {
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cloud_control(mut self, cloud: Arc<dyn CloudControl>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_node_resolver(mut self, resolver: Arc<dyn NodeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_stream_factory(mut self, factory: Arc<dyn StreamFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn build(self) -> Arc<SessionManager> {
        let node_id = self.broker.node_id();
        let cancel = CancellationToken::new();

        let clients = Arc::new(ClientRegistry::new());
        let routing = Arc::new(RoutingTable::new(
            self.storage.clone(),
            self.config.waiting_state_ttl,
        ));
        let lifecycle = Arc::new(TunnelLifecycle {
            clients: clients.clone(),
            bridges: Arc::new(BridgeMap::new()),
            tunnels: Arc::new(TunnelRegistry::new()),
            routing: routing.clone(),
            conn_manager: Arc::new(TunnelConnectionManager::new(
                self.config.internode_idle_timeout,
            )),
            closed: Arc::new(ClosedTunnels::new(self.config.closed_tunnel_retention)),
        });
        let pending = Arc::new(PendingRequests::new());

        let forwarder = self.resolver.as_ref().map(|resolver| {
            Arc::new(CrossNodeForwarder::new(
                node_id.clone(),
                lifecycle.clone(),
                resolver.clone(),
                self.config.clone(),
            ))
        });

        let router = Arc::new(PacketRouter::new());
        router.register(
            PacketKind::Handshake,
            Arc::new(HandshakeHandler::new(
                node_id.clone(),
                self.auth.clone(),
                clients.clone(),
                routing.clone(),
                self.config.clone(),
            )),
        );
        router.register(
            PacketKind::TunnelOpen,
            Arc::new(TunnelOpenHandler::new(
                node_id.clone(),
                lifecycle.clone(),
                self.broker.clone(),
                self.cloud.clone(),
                forwarder.clone(),
                self.config.clone(),
                cancel.clone(),
            )),
        );
        let command_handler = Arc::new(CommandHandler::new(
            node_id.clone(),
            clients.clone(),
            pending.clone(),
            routing.clone(),
            self.resolver.clone(),
            self.config.clone(),
        ));
        router.register(PacketKind::JsonCommand, command_handler.clone());
        router.register(PacketKind::CommandResp, command_handler);
        router.register(PacketKind::Heartbeat, Arc::new(HeartbeatHandler));

        Arc::new(SessionManager {
            config: self.config,
            node_id,
            conns: ConnectionMap::new(),
            clients,
            lifecycle,
            router,
            routing,
            broker: self.broker,
            pending,
            factory: self.factory,
            next_conn_id: AtomicU64::new(1),
            cancel,
        })
    }
}

/// The session and tunnel core of one node
pub struct SessionManager {
    config: SessionConfig,
    node_id: String,
    conns: ConnectionMap,
    clients: Arc<ClientRegistry>,
    lifecycle: Arc<TunnelLifecycle>,
    router: Arc<PacketRouter>,
    routing: Arc<RoutingTable>,
    broker: Arc<dyn BridgeManager>,
    pending: Arc<PendingRequests>,
    factory: Arc<dyn StreamFactory>,
    next_conn_id: AtomicU64,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn builder(
        auth: Arc<dyn AuthHandler>,
        storage: Arc<dyn Storage>,
        broker: Arc<dyn BridgeManager>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config: SessionConfig::default(),
            auth,
            storage,
            broker,
            cloud: None,
            resolver: None,
            factory: Arc::new(FramedStreamFactory),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Spawn the background sweeps and the broker consumers
    pub fn start(self: &Arc<Self>) {
        Arc::new(BrokerGlue::new(
            self.broker.clone(),
            self.clients.clone(),
            self.lifecycle.closed.clone(),
            self.config.clone(),
            self.cancel.child_token(),
        ))
        .spawn_consumers();

        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.cleanup_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => this.cleanup_sweep().await,
                    _ = this.cancel.cancelled() => break,
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.internode_cleanup_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        this.lifecycle.conn_manager.purge_idle().await;
                    }
                    _ = this.cancel.cancelled() => break,
                }
            }
        });
    }

    /// Spawn the cross-node listener on an already-bound socket
    pub fn serve_cross_node(self: &Arc<Self>, listener: TcpListener) {
        let cross = Arc::new(CrossNodeListener::new(
            self.node_id.clone(),
            self.lifecycle.clone(),
            self.pending.clone(),
            self.config.clone(),
            self.cancel.child_token(),
        ));
        tokio::spawn(cross.run(listener));
    }

    /// Accept a new connection over a reader/writer pair
    pub fn accept(
        self: &Arc<Self>,
        reader: BoxedReader,
        writer: BoxedWriter,
        protocol: TransportProtocol,
    ) -> Result<ConnId, SessionError> {
        if self.conns.live_count() >= self.config.max_connections {
            return Err(SessionError::ResourceExhausted(format!(
                "connection limit of {} reached",
                self.config.max_connections
            )));
        }

        let stream = self.factory.create(reader, writer, protocol);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(conn_id, stream, &self.cancel));
        self.conns.insert(&conn);

        debug!(conn_id, protocol = protocol.as_str(), "Connection accepted");

        let this = self.clone();
        tokio::spawn(async move { this.read_loop(conn).await });
        Ok(conn_id)
    }

    /// One packet at a time until close or hand-off
    async fn read_loop(self: Arc<Self>, conn: Arc<Connection>) {
        loop {
            let received = tokio::select! {
                r = conn.stream().recv_packet() => r,
                _ = conn.cancel_token().cancelled() => break,
            };

            let packet = match received {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    debug!(conn_id = conn.id(), "Connection closed by peer");
                    break;
                }
                Err(e) => {
                    debug!(conn_id = conn.id(), error = %e, "Read failed");
                    break;
                }
            };

            conn.touch();
            match self.router.route(&conn, packet).await {
                Ok(Disposition::Continue) => {}
                Ok(Disposition::HandedOff) => {
                    // A bridge owns the stream now; leave without
                    // touching it
                    debug!(conn_id = conn.id(), "Connection handed off to bridge");
                    return;
                }
                Ok(Disposition::CloseConnection) => break,
                Err(e) => {
                    match &e {
                        SessionError::InvalidPacket(reason) => {
                            warn!(conn_id = conn.id(), reason = %reason, "Malformed packet");
                        }
                        SessionError::Unsupported(kind) => {
                            warn!(conn_id = conn.id(), kind, "Unsupported packet type");
                        }
                        other => {
                            warn!(conn_id = conn.id(), error = %other, "Handler failed");
                        }
                    }
                    break;
                }
            }
        }
        self.close_connection(&conn).await;
    }

    /// Close a connection by id; idempotent
    pub async fn close(&self, conn_id: ConnId) {
        if let Some(conn) = self.conns.get(conn_id) {
            self.close_connection(&conn).await;
        } else {
            self.conns.remove(conn_id);
        }
    }

    async fn close_connection(&self, conn: &Arc<Connection>) {
        if matches!(conn.state(), ConnectionState::Closed) {
            return;
        }
        conn.set_state(ConnectionState::Closing);
        conn.cancel_token().cancel();
        let _ = conn.stream().close().await;

        self.conns.remove(conn.id());
        if self.clients.unregister(conn.id()).is_some() {
            if let Some(client_id) = conn.client_id() {
                self.routing
                    .remove_client_node(client_id, &self.node_id)
                    .await;
            }
        }
        self.lifecycle.tunnels.unregister(conn.id());
        conn.set_state(ConnectionState::Closed);
        debug!(conn_id = conn.id(), "Connection closed");
    }

    /// Route a packet directly, bypassing the read loop (tests)
    pub async fn handle_packet(
        &self,
        conn_id: ConnId,
        packet: TransferPacket,
    ) -> Result<Disposition, SessionError> {
        let conn = self
            .conns
            .get(conn_id)
            .ok_or_else(|| SessionError::NotFound(format!("connection {}", conn_id)))?;
        self.router.route(&conn, packet).await
    }

    /// Registered connections: control plus tunnel, not merely accepted
    pub fn active_connections(&self) -> usize {
        self.clients.len() + self.lifecycle.tunnels.len()
    }

    pub fn get_control_connection_by_client_id(&self, client_id: i64) -> Option<Arc<Connection>> {
        self.clients.get_by_client_id(client_id)
    }

    pub fn get_tunnel_bridge_by_connection_id(&self, conn_id: ConnId) -> Option<Arc<TunnelBridge>> {
        self.lifecycle.bridges.find_by_conn_id(conn_id)
    }

    pub fn get_tunnel_bridge_by_mapping_id(
        &self,
        mapping_id: &str,
        client_id: i64,
    ) -> Option<Arc<TunnelBridge>> {
        self.lifecycle.bridges.find_by_mapping_id(mapping_id, client_id)
    }

    pub fn get_tunnel_bridge(&self, tunnel_id: &str) -> Option<Arc<TunnelBridge>> {
        self.lifecycle.bridges.get(tunnel_id)
    }

    pub fn get_stream_connection_info(&self, conn_id: ConnId) -> Option<ConnectionSnapshot> {
        self.conns.get(conn_id).map(|conn| conn.snapshot())
    }

    /// Drop idle connections, dead map entries and stale closed-tunnel
    /// markers
    async fn cleanup_sweep(&self) {
        self.conns.prune();
        self.lifecycle.closed.purge();

        for conn in self.conns.live() {
            let reapable = match conn.state() {
                // Long-poll channels park unauthenticated between polls
                ConnectionState::Accepted | ConnectionState::Authenticating => {
                    !conn.capabilities().can_be_temporary_control
                }
                ConnectionState::Control | ConnectionState::Tunnel => true,
                _ => false,
            };
            if reapable && conn.idle_for() >= self.config.heartbeat_timeout {
                info!(
                    conn_id = conn.id(),
                    idle = ?conn.idle_for(),
                    "Reaping idle connection"
                );
                self.close_connection(&conn).await;
            }
        }
    }

    /// Tear the whole session down: every tunnel, every connection
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, "Session manager shutting down");
        self.cancel.cancel();

        for bridge in self.lifecycle.bridges.all() {
            self.lifecycle.finalize(bridge.tunnel_id()).await;
        }
        for conn in self.conns.live() {
            self.close_connection(&conn).await;
        }
    }
}
