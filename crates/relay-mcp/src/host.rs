//! Multi-server connection host.
//!
//! The [`McpHost`] owns a keyed set of [`Session`]s, each binding a server id
//! to a live transport. It provides the tool/resource RPC surface keyed by
//! server id, liveness checks with SSE auto-reconnect, and notification
//! fan-out.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_mcp::{McpHost, SseOptions};
//!
//! let host = McpHost::new();
//! host.connect_sse("search", "http://localhost:8080/sse", SseOptions::default()).await?;
//! host.connect_stdio("files", "mcp-server-files", &[], &[]).await?;
//!
//! let tools = host.list_tools("search").await?;
//! let result = host.execute_tool("files", "read_file", args).await?;
//!
//! host.disconnect_all().await;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{McpError, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcNotification,
    ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult,
};
use crate::transport::{
    InProcessTransport, NotificationHandler, SseOptions, SseTransport, StdioTransport, ToolServer,
    TransportClient,
};

/// Transport kind of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// HTTP server-sent events.
    Sse,
    /// Child process over standard streams.
    Stdio,
    /// Server object in the same process.
    InProcess,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::InProcess => write!(f, "in-process"),
        }
    }
}

/// Handler receiving notifications from every session, tagged with the
/// originating server id.
pub type GlobalNotificationHandler = Arc<dyn Fn(&str, JsonRpcNotification) + Send + Sync>;

/// Recipe for re-establishing a dead transport. Only SSE sessions carry one;
/// reconnection policy lives on the session, not in host control flow.
type ReconnectFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn TransportClient>>> + Send + Sync>;

/// One live connection to one tool server.
pub struct Session {
    server_id: String,
    kind: TransportKind,
    client: Arc<dyn TransportClient>,
    server_info: InitializeResult,
    connected: AtomicBool,
    reconnect: Option<ReconnectFn>,
}

impl Session {
    /// The id this session is registered under.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// The transport kind.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The transport client.
    pub fn client(&self) -> Arc<dyn TransportClient> {
        self.client.clone()
    }

    /// The handshake result (server name/version and capabilities).
    pub fn server_info(&self) -> &InitializeResult {
        &self.server_info
    }

    /// Whether the session is still registered with its host.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server_id", &self.server_id)
            .field("kind", &self.kind)
            .field("server", &self.server_info.server_info.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Host managing multiple MCP server connections.
///
/// The registry is the only shared-mutable structure; lookups take the read
/// lock, insert/delete the write lock, and all per-session RPC happens
/// outside the lock.
#[derive(Default)]
pub struct McpHost {
    connections: RwLock<HashMap<String, Arc<Session>>>,
    global_handler: Arc<std::sync::RwLock<Option<GlobalNotificationHandler>>>,
}

impl McpHost {
    /// Create an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connecting
    // ─────────────────────────────────────────────────────────────────────

    /// Connect to an MCP server over SSE.
    ///
    /// Fails if `server_id` is already registered. On any failure the
    /// half-built transport is closed.
    pub async fn connect_sse(
        &self,
        server_id: &str,
        url: &str,
        options: SseOptions,
    ) -> Result<Arc<Session>> {
        self.check_unregistered(server_id).await?;

        let client: Arc<dyn TransportClient> =
            Arc::new(SseTransport::connect(url, options.clone())?);
        if let Err(e) = client.start().await {
            let _ = client.close().await;
            return Err(e);
        }

        let reconnect: ReconnectFn = {
            let url = url.to_string();
            Arc::new(move || {
                let url = url.clone();
                let options = options.clone();
                Box::pin(async move {
                    let client: Arc<dyn TransportClient> =
                        Arc::new(SseTransport::connect(&url, options)?);
                    if let Err(e) = client.start().await {
                        let _ = client.close().await;
                        return Err(e);
                    }
                    Ok(client)
                })
            })
        };

        let session = self
            .register(server_id, TransportKind::Sse, client, Some(reconnect))
            .await?;

        tracing::info!(server = %server_id, url = %url, "connected MCP server via SSE");
        Ok(session)
    }

    /// Connect to an MCP server spawned as a child process.
    pub async fn connect_stdio(
        &self,
        server_id: &str,
        command: &str,
        env: &[(String, String)],
        args: &[String],
    ) -> Result<Arc<Session>> {
        self.check_unregistered(server_id).await?;

        // Stdio transports begin on construction; there is no start step.
        let client: Arc<dyn TransportClient> = Arc::new(StdioTransport::spawn(command, env, args)?);

        let session = self
            .register(server_id, TransportKind::Stdio, client, None)
            .await?;

        tracing::info!(server = %server_id, command = %command, "connected MCP server via stdio");
        Ok(session)
    }

    /// Connect to an MCP server living in this process.
    pub async fn connect_in_process(
        &self,
        server_id: &str,
        server: Arc<dyn ToolServer>,
    ) -> Result<Arc<Session>> {
        self.check_unregistered(server_id).await?;

        let client: Arc<dyn TransportClient> = Arc::new(InProcessTransport::new(server));
        if let Err(e) = client.start().await {
            let _ = client.close().await;
            return Err(e);
        }

        let session = self
            .register(server_id, TransportKind::InProcess, client, None)
            .await?;

        tracing::info!(server = %server_id, "connected in-process MCP server");
        Ok(session)
    }

    async fn check_unregistered(&self, server_id: &str) -> Result<()> {
        if self.connections.read().await.contains_key(server_id) {
            return Err(McpError::DuplicateSession(server_id.to_string()));
        }
        Ok(())
    }

    /// Handshake, subscribe to the host broadcaster, and insert into the
    /// registry. Closes the transport on every error path.
    async fn register(
        &self,
        server_id: &str,
        kind: TransportKind,
        client: Arc<dyn TransportClient>,
        reconnect: Option<ReconnectFn>,
    ) -> Result<Arc<Session>> {
        let server_info = match client.initialize(InitializeParams::default()).await {
            Ok(info) => info,
            Err(e) => {
                let _ = client.close().await;
                return Err(McpError::handshake(e.to_string()));
            }
        };

        // Subscribe the session to the host-owned broadcaster. The handler
        // slot is read at dispatch time, so a global handler installed later
        // still reaches this session.
        {
            let id = server_id.to_string();
            let slot = self.global_handler.clone();
            client.on_notification(Arc::new(move |notification| {
                let handler = slot.read().unwrap().clone();
                if let Some(handler) = handler {
                    handler(&id, notification);
                }
            }));
        }

        let session = Arc::new(Session {
            server_id: server_id.to_string(),
            kind,
            client: client.clone(),
            server_info,
            connected: AtomicBool::new(true),
            reconnect,
        });

        let mut connections = self.connections.write().await;
        if connections.contains_key(server_id) {
            drop(connections);
            let _ = client.close().await;
            return Err(McpError::DuplicateSession(server_id.to_string()));
        }
        connections.insert(server_id.to_string(), session.clone());

        Ok(session)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Disconnecting
    // ─────────────────────────────────────────────────────────────────────

    /// Close and remove a session. Fails if the id is unknown; the close
    /// itself is best-effort.
    pub async fn disconnect(&self, server_id: &str) -> Result<()> {
        let session = {
            let mut connections = self.connections.write().await;
            connections
                .remove(server_id)
                .ok_or_else(|| McpError::UnknownSession(server_id.to_string()))?
        };

        session.connected.store(false, Ordering::SeqCst);
        if let Err(e) = session.client.close().await {
            tracing::warn!(server = %server_id, error = %e, "error closing transport");
        }

        tracing::info!(server = %server_id, "disconnected MCP server");
        Ok(())
    }

    /// Close and remove every session.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, session)| session).collect()
        };

        for session in sessions {
            session.connected.store(false, Ordering::SeqCst);
            if let Err(e) = session.client.close().await {
                tracing::warn!(server = %session.server_id, error = %e, "error closing transport");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Liveness
    // ─────────────────────────────────────────────────────────────────────

    /// Look up a session and verify it is alive.
    ///
    /// A failed ping disconnects the session. SSE sessions then get exactly
    /// one immediate reconnect attempt with their stored URL and options;
    /// other kinds surface a reconnect error.
    pub async fn ensure_connection(&self, server_id: &str) -> Result<Arc<Session>> {
        let session = self
            .get(server_id)
            .await
            .ok_or_else(|| McpError::UnknownSession(server_id.to_string()))?;

        match session.client.ping().await {
            Ok(()) => Ok(session),
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "ping failed, disconnecting");
                let _ = self.disconnect(server_id).await;

                let Some(reconnect) = session.reconnect.clone() else {
                    return Err(McpError::Reconnect(server_id.to_string()));
                };

                tracing::info!(server = %server_id, "attempting SSE reconnect");
                let client = match reconnect().await {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::warn!(server = %server_id, error = %e, "reconnect failed");
                        return Err(McpError::Reconnect(server_id.to_string()));
                    }
                };

                self.register(server_id, session.kind, client, Some(reconnect))
                    .await
                    .map_err(|e| {
                        tracing::warn!(server = %server_id, error = %e, "reconnect handshake failed");
                        McpError::Reconnect(server_id.to_string())
                    })
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // RPC surface
    // ─────────────────────────────────────────────────────────────────────

    /// Execute a tool on the given server.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> Result<CallToolResult> {
        let session = self.ensure_connection(server_id).await?;
        session
            .client
            .call_tool(CallToolParams {
                name: tool_name.to_string(),
                arguments: Some(Value::Object(args)),
            })
            .await
    }

    /// List the tools on the given server.
    pub async fn list_tools(&self, server_id: &str) -> Result<ListToolsResult> {
        let session = self.ensure_connection(server_id).await?;
        session.client.list_tools().await
    }

    /// List the resources on the given server.
    pub async fn list_resources(&self, server_id: &str) -> Result<ListResourcesResult> {
        let session = self.ensure_connection(server_id).await?;
        session.client.list_resources().await
    }

    /// Read a resource from the given server.
    pub async fn read_resource(&self, server_id: &str, uri: &str) -> Result<ReadResourceResult> {
        let session = self.ensure_connection(server_id).await?;
        session
            .client
            .read_resource(ReadResourceParams {
                uri: uri.to_string(),
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────

    /// Attach a notification handler to one session.
    pub async fn set_notification_handler(
        &self,
        server_id: &str,
        handler: NotificationHandler,
    ) -> Result<()> {
        let session = self
            .get(server_id)
            .await
            .ok_or_else(|| McpError::UnknownSession(server_id.to_string()))?;
        session.client.on_notification(handler);
        Ok(())
    }

    /// Install the global notification handler.
    ///
    /// Every session subscribes to the host broadcaster at creation, so the
    /// handler reaches sessions registered before and after this call.
    pub fn set_global_notification_handler(&self, handler: GlobalNotificationHandler) {
        *self.global_handler.write().unwrap() = Some(handler);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    /// Look up a session by id.
    pub async fn get(&self, server_id: &str) -> Option<Arc<Session>> {
        self.connections.read().await.get(server_id).cloned()
    }

    /// Snapshot of all sessions, sorted by server id.
    pub async fn connections(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> =
            self.connections.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        sessions
    }

    /// Sorted ids of all registered sessions.
    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered sessions.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl std::fmt::Debug for McpHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpHost").finish_non_exhaustive()
    }
}
