//! Per-tunnel bridge: the bidirectional data plane
//!
//! A bridge lives on the tunnel's source node. It is created with the
//! source endpoint attached, waits for the target endpoint (a local
//! client connection or a cross-node TCP connection), then pumps bytes
//! both ways with optional bandwidth limiting and batched traffic
//! accounting. Payload bytes are forwarded verbatim: any compression
//! or encryption is end-to-end between the clients and the node cannot
//! read it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnox_proto::{PortMapping, TrafficDelta};
use tunnox_transport::ByteStream;

use crate::cloud::CloudControl;
use crate::connection::ConnId;
use crate::error::SessionError;
use crate::limiter::RateLimiter;

/// Read chunk size for each copy direction
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Batched counter bytes before an atomic flush
const COUNTER_FLUSH_BATCH: u64 = 1024 * 1024;

/// Loop iterations between explicit cancellation checks
const CANCEL_CHECK_INTERVAL: u32 = 10_000;

type EndpointSlot = RwLock<Option<Arc<dyn ByteStream>>>;

/// Bridge for one tunnel
pub struct TunnelBridge {
    tunnel_id: String,
    mapping_id: Option<String>,
    source_client_id: Option<i64>,
    limiter: Option<RateLimiter>,
    source: EndpointSlot,
    target: EndpointSlot,
    source_conn_id: std::sync::RwLock<Option<ConnId>>,
    target_conn_id: std::sync::RwLock<Option<ConnId>>,
    /// Fired exactly once when the target endpoint is bound
    target_ready: CancellationToken,
    cancel: CancellationToken,
    target_ready_timeout: Duration,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    cloud: Option<Arc<dyn CloudControl>>,
    closed: AtomicBool,
    stats_reported: AtomicBool,
}

impl TunnelBridge {
    pub fn new(
        tunnel_id: impl Into<String>,
        mapping: Option<&PortMapping>,
        cloud: Option<Arc<dyn CloudControl>>,
        parent: &CancellationToken,
        target_ready_timeout: Duration,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            mapping_id: mapping.map(|m| m.id.clone()),
            source_client_id: mapping.and_then(|m| m.listen_client_id),
            limiter: mapping.and_then(|m| RateLimiter::from_bandwidth_limit(m.bandwidth_limit)),
            source: RwLock::new(None),
            target: RwLock::new(None),
            source_conn_id: std::sync::RwLock::new(None),
            target_conn_id: std::sync::RwLock::new(None),
            target_ready: CancellationToken::new(),
            cancel: parent.child_token(),
            target_ready_timeout,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            cloud,
            closed: AtomicBool::new(false),
            stats_reported: AtomicBool::new(false),
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn mapping_id(&self) -> Option<&str> {
        self.mapping_id.as_deref()
    }

    pub fn source_client_id(&self) -> Option<i64> {
        self.source_client_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn target_is_ready(&self) -> bool {
        self.target_ready.is_cancelled()
    }

    /// Whether `conn_id` is one of this bridge's endpoints
    pub fn involves_conn(&self, conn_id: ConnId) -> bool {
        *self.source_conn_id.read().unwrap() == Some(conn_id)
            || *self.target_conn_id.read().unwrap() == Some(conn_id)
    }

    /// Bind or replace the source endpoint
    ///
    /// A long-polling source reconnecting mid-tunnel lands here; the
    /// previous endpoint is closed so the pump picks up the new one.
    pub async fn set_source_connection(
        &self,
        endpoint: Arc<dyn ByteStream>,
        conn_id: Option<ConnId>,
    ) {
        let old = self.source.write().await.replace(endpoint);
        *self.source_conn_id.write().unwrap() = conn_id;
        if let Some(old) = old {
            debug!(tunnel_id = %self.tunnel_id, "Replacing bridge source endpoint");
            let _ = old.close().await;
        }
    }

    /// Bind or replace the target endpoint
    pub async fn set_target_connection(
        &self,
        endpoint: Arc<dyn ByteStream>,
        conn_id: Option<ConnId>,
    ) {
        let old = self.target.write().await.replace(endpoint);
        *self.target_conn_id.write().unwrap() = conn_id;
        if let Some(old) = old {
            debug!(tunnel_id = %self.tunnel_id, "Replacing bridge target endpoint");
            let _ = old.close().await;
        }
    }

    /// Signal that the target endpoint is bound; idempotent
    pub fn notify_target_ready(&self) {
        self.target_ready.cancel();
    }

    /// Run the bridge to completion
    ///
    /// Blocks until the target is ready, then pumps both directions
    /// until either ends. Returns `Timeout` if the target never shows
    /// up within the window; returns `Ok` after a normal run or when
    /// the bridge is cancelled while waiting.
    pub async fn start(&self) -> Result<(), SessionError> {
        tokio::select! {
            _ = self.target_ready.cancelled() => {}
            _ = self.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.target_ready_timeout) => {
                warn!(tunnel_id = %self.tunnel_id, "Target endpoint never arrived");
                return Err(SessionError::Timeout(format!(
                    "target for tunnel {} not ready",
                    self.tunnel_id
                )));
            }
        }

        debug!(tunnel_id = %self.tunnel_id, "Bridge entering forwarding state");

        let fwd = self.pump(&self.source, &self.target, &self.bytes_sent);
        let rev = self.pump(&self.target, &self.source, &self.bytes_received);
        tokio::pin!(fwd, rev);

        // Either direction ending terminates the bridge; the survivor
        // wakes on the cancelled token and flushes its batch
        tokio::select! {
            _ = &mut fwd => {
                self.cancel.cancel();
                rev.await;
            }
            _ = &mut rev => {
                self.cancel.cancel();
                fwd.await;
            }
        }

        self.close().await;
        Ok(())
    }

    /// One copy direction: read, limit, write, count
    async fn pump(&self, from_slot: &EndpointSlot, to_slot: &EndpointSlot, counter: &AtomicU64) {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut batch: u64 = 0;
        let mut iters: u32 = 0;

        'endpoints: loop {
            let Some(from) = from_slot.read().await.clone() else {
                break;
            };
            let Some(to) = to_slot.read().await.clone() else {
                break;
            };

            loop {
                iters += 1;
                if iters >= CANCEL_CHECK_INTERVAL {
                    iters = 0;
                    if self.cancel.is_cancelled() {
                        break 'endpoints;
                    }
                }

                let read = tokio::select! {
                    r = from.read_bytes(&mut buf) => r,
                    _ = self.cancel.cancelled() => break 'endpoints,
                };

                let n = match read {
                    Ok(0) => {
                        if self.endpoint_changed(from_slot, &from).await {
                            continue 'endpoints;
                        }
                        break 'endpoints;
                    }
                    Ok(n) => n,
                    Err(e) if e.is_temporary() => continue,
                    Err(_) => {
                        if self.endpoint_changed(from_slot, &from).await {
                            continue 'endpoints;
                        }
                        break 'endpoints;
                    }
                };

                if let Some(limiter) = &self.limiter {
                    tokio::select! {
                        _ = limiter.wait_n(n) => {}
                        _ = self.cancel.cancelled() => break 'endpoints,
                    }
                }

                if to.write_bytes(&buf[..n]).await.is_err() {
                    if self.endpoint_changed(to_slot, &to).await {
                        continue 'endpoints;
                    }
                    break 'endpoints;
                }

                batch += n as u64;
                if batch >= COUNTER_FLUSH_BATCH {
                    counter.fetch_add(batch, Ordering::Relaxed);
                    batch = 0;
                }
            }
        }

        counter.fetch_add(batch, Ordering::Relaxed);

        // Propagate end-of-stream to the peer; reads keep draining
        if let Some(to) = to_slot.read().await.clone() {
            let _ = to.shutdown_write().await;
        }
    }

    /// True when the slot no longer holds `current`: the endpoint was
    /// replaced under us (long-poll reconnect) and the pump should
    /// continue with the new one
    async fn endpoint_changed(&self, slot: &EndpointSlot, current: &Arc<dyn ByteStream>) -> bool {
        match slot.read().await.as_ref() {
            Some(now) => !Arc::ptr_eq(now, current),
            None => false,
        }
    }

    /// Tear the bridge down; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let source = self.source.write().await.take();
        let target = self.target.write().await.take();
        if let Some(source) = source {
            let _ = source.close().await;
        }
        if let Some(target) = target {
            let _ = target.close().await;
        }

        self.report_stats().await;

        info!(
            tunnel_id = %self.tunnel_id,
            bytes_sent = self.bytes_sent(),
            bytes_received = self.bytes_received(),
            "Bridge closed"
        );
    }

    async fn report_stats(&self) {
        if self.stats_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        let (Some(cloud), Some(mapping_id)) = (&self.cloud, &self.mapping_id) else {
            return;
        };
        let delta = TrafficDelta {
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
        };
        if delta.bytes_sent == 0 && delta.bytes_received == 0 {
            return;
        }
        if let Err(e) = cloud.update_port_mapping_stats(mapping_id, delta).await {
            warn!(
                tunnel_id = %self.tunnel_id,
                mapping_id = %mapping_id,
                error = %e,
                "Failed to report bridge traffic stats"
            );
        }
    }
}
