//! Session configuration

use std::time::Duration;

/// Tunables for a session manager instance
///
/// Defaults match production; tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Close control connections idle longer than this
    pub heartbeat_timeout: Duration,
    /// Period of the idle-connection sweep
    pub cleanup_interval: Duration,
    /// Cap on accepted connections
    pub max_connections: usize,
    /// Cap on authenticated control connections
    pub max_control_connections: usize,
    /// How long a bridge waits for its target endpoint
    pub target_ready_timeout: Duration,
    /// Total budget for polling the routing table on the target side
    pub routing_lookup_timeout: Duration,
    /// Budget for polling the local bridge map on a stale routing entry
    pub local_bridge_poll_timeout: Duration,
    /// TTL of a tunnel's waiting state in the shared KV store
    pub waiting_state_ttl: Duration,
    /// Cross-node RPC round-trip budget
    pub rpc_timeout: Duration,
    /// Cross-node DNS round-trip budget
    pub dns_rpc_timeout: Duration,
    /// Send budget for broadcast-driven client wakeups
    pub broadcast_send_timeout: Duration,
    /// Send budget for config pushes
    pub config_push_timeout: Duration,
    /// Dial budget for dedicated inter-node connections
    pub internode_dial_timeout: Duration,
    /// Idle cutoff for dedicated inter-node connections
    pub internode_idle_timeout: Duration,
    /// Period of the inter-node idle sweep
    pub internode_cleanup_interval: Duration,
    /// How long a closed tunnel id keeps dropping residual frames
    pub closed_tunnel_retention: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(15),
            max_connections: 10_000,
            max_control_connections: 5_000,
            target_ready_timeout: Duration::from_secs(30),
            routing_lookup_timeout: Duration::from_secs(10),
            local_bridge_poll_timeout: Duration::from_secs(5),
            waiting_state_ttl: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(30),
            dns_rpc_timeout: Duration::from_secs(5),
            broadcast_send_timeout: Duration::from_secs(5),
            config_push_timeout: Duration::from_secs(5),
            internode_dial_timeout: Duration::from_secs(5),
            internode_idle_timeout: Duration::from_secs(300),
            internode_cleanup_interval: Duration::from_secs(30),
            closed_tunnel_retention: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_control_connections(mut self, max: usize) -> Self {
        self.max_control_connections = max;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_target_ready_timeout(mut self, timeout: Duration) -> Self {
        self.target_ready_timeout = timeout;
        self
    }

    pub fn with_waiting_state_ttl(mut self, ttl: Duration) -> Self {
        self.waiting_state_ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.cleanup_interval, Duration::from_secs(15));
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.max_control_connections, 5_000);
        assert_eq!(config.target_ready_timeout, Duration::from_secs(30));
        assert_eq!(config.internode_idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::default()
            .with_max_connections(10)
            .with_target_ready_timeout(Duration::from_millis(100));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.target_ready_timeout, Duration::from_millis(100));
    }
}
