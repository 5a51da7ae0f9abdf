//! Request-response tracking for command traffic
//!
//! Commands forwarded to a client come back as `CommandResp` packets
//! matched by command id. One manager instance lives on each session
//! manager; there is no process-wide state.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::SessionError;

/// Terminal result of a tracked command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub payload: serde_json::Value,
}

impl CommandOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            payload: serde_json::Value::Null,
        }
    }
}

/// In-flight commands keyed by command id
#[derive(Default)]
pub struct PendingRequests {
    waiters: DashMap<String, oneshot::Sender<CommandOutcome>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new command; the receiver resolves when a response
    /// arrives or the entry is cancelled
    pub fn register(&self, command_id: &str) -> oneshot::Receiver<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(command_id.to_string(), tx).is_some() {
            debug!(command_id, "Replacing stale pending command entry");
        }
        rx
    }

    /// Deliver a response; false when nobody is waiting
    pub fn resolve(&self, command_id: &str, outcome: CommandOutcome) -> bool {
        match self.waiters.remove(command_id) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop a tracked command without resolving it
    pub fn cancel(&self, command_id: &str) {
        self.waiters.remove(command_id);
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Await a tracked command's outcome with a deadline
    pub async fn wait(
        &self,
        command_id: &str,
        rx: oneshot::Receiver<CommandOutcome>,
        timeout: Duration,
    ) -> Result<CommandOutcome, SessionError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => {
                self.cancel(command_id);
                Err(SessionError::Internal(format!(
                    "pending command {} dropped",
                    command_id
                )))
            }
            Err(_) => {
                self.cancel(command_id);
                Err(SessionError::Timeout(format!("command {}", command_id)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_resolve() {
        let pending = PendingRequests::new();
        let rx = pending.register("c1");

        assert!(pending.resolve(
            "c1",
            CommandOutcome {
                success: true,
                error: None,
                payload: serde_json::json!({"ok": true}),
            }
        ));

        let outcome = pending
            .wait("c1", rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_command() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve("nope", CommandOutcome::failed("x")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_cleans_up() {
        let pending = PendingRequests::new();
        let rx = pending.register("c1");

        let result = pending.wait("c1", rx, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_drops_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register("c1");
        pending.cancel("c1");

        let result = pending.wait("c1", rx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::Internal(_))));
    }
}
