//! In-process transport: direct calls into a server living in this process.

use std::sync::Arc;

use crate::error::{McpError, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcNotification,
    ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult,
    ServerCapabilities, ServerInfo, ToolsCapability, MCP_PROTOCOL_VERSION,
};
use crate::transport::{Handlers, NotificationHandler, TransportClient};

/// Sink a [`ToolServer`] may keep to push notifications to its client.
pub type NotificationSink = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// An MCP server implemented in-process.
///
/// Only `list_tools` and `call_tool` are mandatory; the handshake, liveness
/// and resource methods carry reasonable defaults.
#[async_trait::async_trait]
pub trait ToolServer: Send + Sync {
    /// Server name reported during the handshake.
    fn name(&self) -> &str {
        "in-process"
    }

    /// Perform the handshake.
    async fn initialize(&self, _params: InitializeParams) -> Result<InitializeResult> {
        Ok(InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
                ..ServerCapabilities::default()
            },
            server_info: ServerInfo {
                name: self.name().to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })
    }

    /// Liveness probe.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// List the tools this server exposes.
    async fn list_tools(&self) -> Result<ListToolsResult>;

    /// Invoke a tool.
    async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult>;

    /// List the resources this server exposes.
    async fn list_resources(&self) -> Result<ListResourcesResult> {
        Ok(ListResourcesResult {
            resources: Vec::new(),
        })
    }

    /// Read a resource by URI.
    async fn read_resource(&self, params: ReadResourceParams) -> Result<ReadResourceResult> {
        Err(McpError::protocol(format!(
            "resource not found: {}",
            params.uri
        )))
    }

    /// Receive a sink for pushing notifications to the client. Servers that
    /// never notify can ignore this.
    fn connect_notifications(&self, _sink: NotificationSink) {}
}

/// Transport wrapping an in-process [`ToolServer`].
pub struct InProcessTransport {
    server: Arc<dyn ToolServer>,
    handlers: Arc<Handlers>,
}

impl InProcessTransport {
    /// Wrap a server. The server receives a notification sink immediately.
    pub fn new(server: Arc<dyn ToolServer>) -> Self {
        let handlers = Arc::new(Handlers::default());

        let sink_handlers = handlers.clone();
        server.connect_notifications(Arc::new(move |notification| {
            sink_handlers.dispatch(&notification);
        }));

        Self { server, handlers }
    }
}

#[async_trait::async_trait]
impl TransportClient for InProcessTransport {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        self.server.initialize(params).await
    }

    async fn ping(&self) -> Result<()> {
        self.server.ping().await
    }

    async fn list_tools(&self) -> Result<ListToolsResult> {
        self.server.list_tools().await
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult> {
        self.server.call_tool(params).await
    }

    async fn list_resources(&self) -> Result<ListResourcesResult> {
        self.server.list_resources().await
    }

    async fn read_resource(&self, params: ReadResourceParams) -> Result<ReadResourceResult> {
        self.server.read_resource(params).await
    }

    fn on_notification(&self, handler: NotificationHandler) {
        self.handlers.push(handler);
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolInfo;
    use std::sync::Mutex;

    struct ClockServer {
        sink: Mutex<Option<NotificationSink>>,
    }

    impl ClockServer {
        fn new() -> Self {
            Self {
                sink: Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl ToolServer for ClockServer {
        fn name(&self) -> &str {
            "clock"
        }

        async fn list_tools(&self) -> Result<ListToolsResult> {
            Ok(ListToolsResult {
                tools: vec![ToolInfo {
                    name: "get_current_time".to_string(),
                    description: Some("Return the current time".to_string()),
                    input_schema: None,
                }],
            })
        }

        async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult> {
            match params.name.as_str() {
                "get_current_time" => Ok(CallToolResult::text("2024-01-01T12:00:00Z")),
                other => Err(McpError::protocol(format!("unknown tool: {}", other))),
            }
        }

        fn connect_notifications(&self, sink: NotificationSink) {
            *self.sink.lock().unwrap() = Some(sink);
        }
    }

    #[tokio::test]
    async fn test_initialize_defaults() {
        let transport = InProcessTransport::new(Arc::new(ClockServer::new()));
        let init = transport
            .initialize(InitializeParams::default())
            .await
            .unwrap();
        assert_eq!(init.server_info.name, "clock");
        assert_eq!(init.protocol_version, MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_call_tool_roundtrip() {
        let transport = InProcessTransport::new(Arc::new(ClockServer::new()));

        let result = transport
            .call_tool(CallToolParams {
                name: "get_current_time".to_string(),
                arguments: None,
            })
            .await
            .unwrap();
        assert_eq!(
            result.text_content(),
            Some("2024-01-01T12:00:00Z".to_string())
        );

        let err = transport
            .call_tool(CallToolParams {
                name: "no_such_tool".to_string(),
                arguments: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_server_pushed_notifications_reach_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let server = Arc::new(ClockServer::new());
        let transport = InProcessTransport::new(server.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        transport.on_notification(Arc::new(move |n| {
            assert_eq!(n.method, "notifications/tick");
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let sink = server.sink.lock().unwrap().clone().unwrap();
        sink(JsonRpcNotification::new("notifications/tick", None));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_resource_methods() {
        let transport = InProcessTransport::new(Arc::new(ClockServer::new()));

        let resources = transport.list_resources().await.unwrap();
        assert!(resources.resources.is_empty());

        let err = transport
            .read_resource(ReadResourceParams {
                uri: "mem://missing".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mem://missing"));
    }
}
