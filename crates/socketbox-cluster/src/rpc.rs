// Correlation of outstanding RPC requests to their waiters.
use crate::envelope::RpcResponse;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::time::Instant;
use tokio::sync::oneshot;

/// Application hook for RPC operations the cluster layer does not serve
/// itself. Returns the result value, or an error string carried back to
/// the calling node.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(
        &self,
        operation: &str,
        args: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String>;
}

/// Default handler: every non-built-in operation is unknown.
#[derive(Debug, Default)]
pub struct NoRpcHandlers;

#[async_trait]
impl RpcHandler for NoRpcHandlers {
    async fn handle(
        &self,
        operation: &str,
        _args: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String> {
        Err(format!("unknown rpc operation: {operation}"))
    }
}

/// Per-peer outcome of a cluster-wide RPC fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct PeerRpcOutcome {
    pub success: bool,
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PendingRpc {
    waiter: oneshot::Sender<RpcResponse>,
    started: Instant,
}

/// Tracks in-flight outbound requests by id. An entry lives from request
/// send until response arrival or caller timeout; responses for ids that
/// no longer exist are dropped.
#[derive(Default)]
pub struct RpcCoordinator {
    pending: DashMap<String, PendingRpc>,
}

impl RpcCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id and get the waiter end.
    pub fn register(&self, id: &str) -> oneshot::Receiver<RpcResponse> {
        let (waiter, receiver) = oneshot::channel();
        self.pending.insert(
            id.to_string(),
            PendingRpc {
                waiter,
                started: Instant::now(),
            },
        );
        receiver
    }

    /// Deliver a response to its waiter, stamping the round-trip time.
    /// Late responses (entry already removed by timeout) are dropped.
    pub fn complete(&self, mut response: RpcResponse) {
        match self.pending.remove(&response.id) {
            Some((_, pending)) => {
                response.execution_time_ms = Some(pending.started.elapsed().as_millis() as u64);
                // The waiter may have given up between removal and send.
                let _ = pending.waiter.send(response);
            }
            None => {
                tracing::debug!(id = %response.id, "late rpc response dropped");
                metrics::counter!("rpc_late_responses_total").increment(1);
            }
        }
    }

    /// Forget a request after its caller gave up.
    pub fn cancel(&self, id: &str) {
        self.pending.remove(id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: &str) -> RpcResponse {
        RpcResponse {
            id: id.to_string(),
            result: serde_json::json!("ok"),
            success: true,
            error: None,
            execution_time_ms: None,
        }
    }

    #[tokio::test]
    async fn complete_wakes_the_registered_waiter() {
        let coordinator = RpcCoordinator::new();
        let receiver = coordinator.register("req-1");
        coordinator.complete(response("req-1"));
        let delivered = receiver.await.expect("response");
        assert!(delivered.success);
        assert!(delivered.execution_time_ms.is_some());
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_response_is_dropped() {
        let coordinator = RpcCoordinator::new();
        let receiver = coordinator.register("req-1");
        coordinator.cancel("req-1");
        // Must not panic or resurrect the entry.
        coordinator.complete(response("req-1"));
        assert_eq!(coordinator.pending_count(), 0);
        assert!(receiver.await.is_err());
    }

    #[tokio::test]
    async fn responses_correlate_by_id_not_order() {
        let coordinator = RpcCoordinator::new();
        let first = coordinator.register("a");
        let second = coordinator.register("b");
        coordinator.complete(response("b"));
        coordinator.complete(response("a"));
        assert_eq!(second.await.expect("b").id, "b");
        assert_eq!(first.await.expect("a").id, "a");
    }

    #[tokio::test]
    async fn default_handler_rejects_everything() {
        let handler = NoRpcHandlers;
        let err = handler
            .handle("reboot", &serde_json::json!({}))
            .await
            .expect_err("unknown");
        assert!(err.contains("reboot"));
    }
}
