//! Transport layer for MCP communication.
//!
//! Every session wraps a [`TransportClient`]: the abstract per-connection RPC
//! surface of an MCP server. Three transports are provided:
//!
//! - [`StdioTransport`] spawns a child process and speaks newline-delimited
//!   JSON-RPC over its standard streams.
//! - [`SseTransport`] uses HTTP server-sent events for the stream direction
//!   and HTTP POST for requests.
//! - [`InProcessTransport`] calls directly into a [`ToolServer`] living in
//!   the same process.

mod inproc;
mod sse;
mod stdio;

pub use inproc::{InProcessTransport, NotificationSink, ToolServer};
pub use sse::{SseOptions, SseTransport};
pub use stdio::StdioTransport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{McpError, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcResponse, ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult,
};

/// Handler invoked for every server-pushed notification.
pub type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// The per-session RPC surface of an MCP server.
///
/// Implementations are internally synchronized; callers may share them behind
/// an `Arc` and issue calls from any task.
#[async_trait::async_trait]
pub trait TransportClient: Send + Sync {
    /// Start the transport's stream direction, where one exists.
    async fn start(&self) -> Result<()>;

    /// Perform the MCP initialize handshake.
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// List the tools the server exposes.
    async fn list_tools(&self) -> Result<ListToolsResult>;

    /// Invoke a tool.
    async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult>;

    /// List the resources the server exposes.
    async fn list_resources(&self) -> Result<ListResourcesResult>;

    /// Read a resource by URI.
    async fn read_resource(&self, params: ReadResourceParams) -> Result<ReadResourceResult>;

    /// Attach a notification handler. Handlers accumulate; every registered
    /// handler sees every notification.
    fn on_notification(&self, handler: NotificationHandler);

    /// Close the transport. Idempotent.
    async fn close(&self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// In-flight requests awaiting a response, keyed by request id.
#[derive(Default)]
pub(crate) struct Pending {
    map: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl Pending {
    /// Register a request id and return the receiver for its response.
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.map.lock().unwrap().insert(id, tx);
        rx
    }

    /// Route a response to its waiter. Unmatched responses are dropped.
    pub(crate) fn complete(&self, response: JsonRpcResponse) {
        let sender = self.map.lock().unwrap().remove(&response.id);
        match sender {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(id = response.id, "dropping response with no waiter");
            }
        }
    }

    /// Forget a request id (after a timeout).
    pub(crate) fn forget(&self, id: u64) {
        self.map.lock().unwrap().remove(&id);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub(crate) fn fail_all(&self) {
        self.map.lock().unwrap().clear();
    }
}

/// Accumulated notification handlers for one transport.
#[derive(Default)]
pub(crate) struct Handlers {
    inner: RwLock<Vec<NotificationHandler>>,
}

impl Handlers {
    pub(crate) fn push(&self, handler: NotificationHandler) {
        self.inner.write().unwrap().push(handler);
    }

    pub(crate) fn dispatch(&self, notification: &JsonRpcNotification) {
        let handlers = self.inner.read().unwrap().clone();
        for handler in handlers {
            handler(notification.clone());
        }
    }
}

/// A message arriving on a transport's stream direction.
pub(crate) enum Incoming {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Classify a raw incoming JSON value as a response or a notification.
///
/// A message carrying both `id` and `method` is a server-to-client request,
/// which this client does not serve.
pub(crate) fn classify_incoming(value: Value) -> Result<Incoming> {
    let has_id = value.get("id").is_some_and(|id| !id.is_null());
    if value.get("method").is_some() {
        if has_id {
            return Err(McpError::protocol(
                "server-to-client requests are not supported",
            ));
        }
        let notification: JsonRpcNotification = serde_json::from_value(value)?;
        Ok(Incoming::Notification(notification))
    } else if has_id {
        let response: JsonRpcResponse = serde_json::from_value(value)?;
        Ok(Incoming::Response(response))
    } else {
        Err(McpError::protocol(
            "message is neither response nor notification",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_routes_by_id() {
        let pending = Pending::default();
        let rx = pending.register(7);

        pending.complete(JsonRpcResponse::success(7, serde_json::json!({"ok": true})));

        let response = rx.await.unwrap();
        assert_eq!(response.id, 7);
        assert_eq!(response.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_pending_fail_all_closes_waiters() {
        let pending = Pending::default();
        let rx = pending.register(1);
        pending.fail_all();
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_classify_incoming_response() {
        let value = serde_json::json!({"jsonrpc": "2.0", "id": 3, "result": {}});
        assert!(matches!(
            classify_incoming(value).unwrap(),
            Incoming::Response(r) if r.id == 3
        ));
    }

    #[test]
    fn test_classify_incoming_notification() {
        let value = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {"progress": 0.5}
        });
        assert!(matches!(
            classify_incoming(value).unwrap(),
            Incoming::Notification(n) if n.method == "notifications/progress"
        ));
    }

    #[test]
    fn test_classify_incoming_garbage() {
        let value = serde_json::json!({"jsonrpc": "2.0"});
        assert!(classify_incoming(value).is_err());
    }

    #[test]
    fn test_handlers_dispatch_to_all() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let handlers = Handlers::default();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = count.clone();
            handlers.push(Arc::new(move |_n| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        handlers.dispatch(&JsonRpcNotification::new("notifications/test", None));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
