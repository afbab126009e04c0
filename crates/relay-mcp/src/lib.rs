//! MCP (Model Context Protocol) connection host for Relay.
//!
//! This crate multiplexes connections to MCP tool servers over three
//! transports and exposes a tool/resource RPC surface keyed by server id.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  McpHost                                                    │
//! │  - Keyed registry of Sessions (RwLock'd map)                │
//! │  - Liveness checks, SSE auto-reconnect                      │
//! │  - Notification fan-out (per-session + broadcaster)         │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TransportClient (trait)                                    │
//! │  - SseTransport: SSE stream down, HTTP POST up              │
//! │  - StdioTransport: child process, line-delimited JSON-RPC   │
//! │  - InProcessTransport: direct calls into a ToolServer       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_mcp::{McpHost, SseOptions};
//!
//! let host = McpHost::new();
//! host.connect_sse("search", "http://localhost:8080/sse", SseOptions::default()).await?;
//!
//! let tools = host.list_tools("search").await?;
//! let result = host.execute_tool("search", "web_search", args).await?;
//! ```

pub mod error;
pub mod host;
pub mod protocol;
pub mod transport;

// Re-export main types
pub use error::{McpError, Result};
pub use host::{GlobalNotificationHandler, McpHost, Session, TransportKind};
pub use protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult,
    ResourceContents, ResourceInfo, ServerCapabilities, ServerInfo, ToolContent, ToolInfo,
    ToolsCapability,
};
pub use transport::{
    InProcessTransport, NotificationHandler, NotificationSink, SseOptions, SseTransport,
    StdioTransport, ToolServer, TransportClient,
};
