//! Session and tunnel core of a multi-node reverse-tunnel service
//!
//! Terminates long-lived control connections from clients, runs the
//! tunnel handshake between listen and target endpoints, and bridges
//! byte streams between them, including across nodes, via a shared
//! KV routing table, a pub/sub broker and dedicated inter-node TCP
//! connections.
//!
//! External collaborators plug in behind seams: `AuthHandler` for
//! credentials, `CloudControl` for port mappings, `StreamFactory` for
//! physical transports, `Storage` for the shared KV store and
//! `BridgeManager` for the broker.

pub mod bridge;
pub mod broker_glue;
pub mod client_registry;
pub mod cloud;
pub mod cluster;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod limiter;
pub mod router;
pub mod routing;
pub mod session;
pub mod tunnel_open;
pub mod tunnel_registry;

pub use bridge::TunnelBridge;
pub use client_registry::ClientRegistry;
pub use cloud::{AuthHandler, CloudControl, HandshakeOutcome};
pub use cluster::{
    CrossNodeForwarder, CrossNodeListener, CrossNodeTunnelConn, NodeResolver, PendingRequests,
    StaticNodeResolver, TunnelConnectionManager,
};
pub use config::SessionConfig;
pub use connection::{ConnId, Connection, ConnectionSnapshot, ConnectionState};
pub use error::{Disposition, SessionError};
pub use limiter::RateLimiter;
pub use router::{PacketHandler, PacketRouter};
pub use routing::RoutingTable;
pub use session::{SessionManager, SessionManagerBuilder};
pub use tunnel_registry::{BridgeMap, ClosedTunnels, TunnelRegistry};
