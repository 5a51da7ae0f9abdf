//! Pub/sub broker seam
//!
//! Cluster nodes fan out tunnel-open wakeups, bridge-ready notices and
//! config pushes through a broker. Production deployments plug in an
//! external broker behind [`BridgeManager`]; [`MemoryBroker`] serves
//! single-node operation and tests.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use tunnox_proto::{
    TunnelOpenBroadcast, TunnelReadyBroadcast, TOPIC_TUNNEL_OPEN, TOPIC_TUNNEL_READY,
};

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Broker closed")]
    Closed,
}

/// A live subscription to one topic
pub struct Subscription {
    topic: String,
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    /// Next message on the topic; `None` once the broker is gone.
    ///
    /// Lagged receivers skip to the oldest retained message rather than
    /// failing: topic payloads are self-contained notifications.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(topic = %self.topic, skipped, "Subscription lagged, skipping ahead");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Broker handle shared by all session components
#[async_trait]
pub trait BridgeManager: Send + Sync {
    /// Identity of this node within the cluster
    fn node_id(&self) -> String;

    /// Publish a raw payload on a topic
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError>;

    /// Subscribe to a topic
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;

    /// Fan a tunnel-open wakeup out to the cluster
    async fn broadcast_tunnel_open(&self, request: &TunnelOpenBroadcast)
        -> Result<(), BrokerError>;

    /// Announce a freshly created bridge
    async fn notify_tunnel_ready(&self, notice: &TunnelReadyBroadcast) -> Result<(), BrokerError>;

    /// Block until some node announces the tunnel's bridge, or time out
    async fn wait_for_tunnel_ready(
        &self,
        tunnel_id: &str,
        timeout: Duration,
    ) -> Result<TunnelReadyBroadcast, BrokerError>;
}

/// In-process broker for single-node mode and tests
pub struct MemoryBroker {
    node_id: String,
    topics: std::sync::Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBroker {
    const CHANNEL_CAPACITY: usize = 256;

    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            topics: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Another node's handle onto the same topic space; multi-node
    /// tests run a whole cluster over one in-process broker
    pub fn handle(&self, node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            topics: self.topics.clone(),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(Self::CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl BridgeManager for MemoryBroker {
    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        // A send with no subscribers is fine; broadcasts are best-effort
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        Ok(Subscription {
            topic: topic.to_string(),
            receiver: self.sender(topic).subscribe(),
        })
    }

    async fn broadcast_tunnel_open(
        &self,
        request: &TunnelOpenBroadcast,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(request)?;
        self.publish(TOPIC_TUNNEL_OPEN, payload).await
    }

    async fn notify_tunnel_ready(&self, notice: &TunnelReadyBroadcast) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(notice)?;
        self.publish(TOPIC_TUNNEL_READY, payload).await
    }

    async fn wait_for_tunnel_ready(
        &self,
        tunnel_id: &str,
        timeout: Duration,
    ) -> Result<TunnelReadyBroadcast, BrokerError> {
        let mut subscription = self.subscribe(TOPIC_TUNNEL_READY).await?;

        let wait = async {
            while let Some(payload) = subscription.recv().await {
                match serde_json::from_str::<TunnelReadyBroadcast>(&payload) {
                    Ok(notice) if notice.tunnel_id == tunnel_id => return Some(notice),
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "Dropping malformed tunnel.ready payload");
                        continue;
                    }
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(notice)) => Ok(notice),
            Ok(None) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::Timeout(format!("tunnel.ready {}", tunnel_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let broker = MemoryBroker::new("node-a");

        let mut sub = broker.subscribe("tunnel.open").await.unwrap();
        broker
            .publish("tunnel.open", "hello".to_string())
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broker = MemoryBroker::new("node-a");
        broker
            .publish("tunnel.ready", "nobody listening".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_each_get_a_copy() {
        let broker = MemoryBroker::new("node-a");

        let mut sub1 = broker.subscribe("config.push").await.unwrap();
        let mut sub2 = broker.subscribe("config.push").await.unwrap();
        broker
            .publish("config.push", "payload".to_string())
            .await
            .unwrap();

        assert_eq!(sub1.recv().await.unwrap(), "payload");
        assert_eq!(sub2.recv().await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_wait_for_tunnel_ready() {
        let broker = std::sync::Arc::new(MemoryBroker::new("node-a"));

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .wait_for_tunnel_ready("t1", Duration::from_secs(5))
                    .await
            })
        };

        // Let the waiter subscribe before publishing
        tokio::task::yield_now().await;

        broker
            .notify_tunnel_ready(&TunnelReadyBroadcast {
                tunnel_id: "other".to_string(),
                source_node_id: "node-b".to_string(),
            })
            .await
            .unwrap();
        broker
            .notify_tunnel_ready(&TunnelReadyBroadcast {
                tunnel_id: "t1".to_string(),
                source_node_id: "node-b".to_string(),
            })
            .await
            .unwrap();

        let notice = waiter.await.unwrap().unwrap();
        assert_eq!(notice.tunnel_id, "t1");
        assert_eq!(notice.source_node_id, "node-b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tunnel_ready_timeout() {
        let broker = MemoryBroker::new("node-a");

        let result = broker
            .wait_for_tunnel_ready("t1", Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_shared_handle_sees_other_nodes_messages() {
        let broker_a = MemoryBroker::new("node-a");
        let broker_b = broker_a.handle("node-b");
        assert_eq!(broker_b.node_id(), "node-b");

        let mut sub = broker_b.subscribe("tunnel.open").await.unwrap();
        broker_a
            .publish("tunnel.open", "from a".to_string())
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap(), "from a");
    }

    #[tokio::test]
    async fn test_broadcast_tunnel_open_payload() {
        let broker = MemoryBroker::new("node-a");
        let mut sub = broker.subscribe(TOPIC_TUNNEL_OPEN).await.unwrap();

        let request = TunnelOpenBroadcast {
            kind: "tunnel_open".to_string(),
            tunnel_id: "t1".to_string(),
            mapping_id: "m1".to_string(),
            secret_key: "sk".to_string(),
            client_id: 200,
            source_node_id: "node-a".to_string(),
            timestamp: 1700000000,
            target_host: Some("127.0.0.1".to_string()),
            target_port: Some(8080),
        };
        broker.broadcast_tunnel_open(&request).await.unwrap();

        let payload = sub.recv().await.unwrap();
        let decoded: TunnelOpenBroadcast = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded, request);
    }
}
