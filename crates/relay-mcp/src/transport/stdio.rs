//! Stdio transport: a child process speaking newline-delimited JSON-RPC.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult,
};
use crate::transport::{
    Handlers, Incoming, NotificationHandler, Pending, TransportClient, classify_incoming,
};

/// Default timeout for a single request/response exchange.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport that spawns an MCP server as a child process and exchanges
/// newline-delimited JSON-RPC messages over its standard streams.
///
/// A background task owns the child's stdout, routing responses to their
/// waiters and fanning notifications out to registered handlers. Stderr is
/// drained into the log.
pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Arc<Pending>,
    handlers: Arc<Handlers>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Spawn the server process and begin reading its output.
    pub fn spawn(command: &str, env: &[(String, String)], args: &[String]) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::spawn_failed(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::spawn_failed("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::spawn_failed("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::spawn_failed("failed to capture stderr"))?;

        let pending = Arc::new(Pending::default());
        let handlers = Arc::new(Handlers::default());
        let shutdown = CancellationToken::new();

        // Reader task: routes stdout lines until EOF or shutdown.
        {
            let pending = pending.clone();
            let handlers = handlers.clone();
            let shutdown = shutdown.clone();
            let command = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => route_line(&line, &pending, &handlers),
                            Ok(None) => {
                                tracing::debug!(command = %command, "MCP server closed stdout");
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(command = %command, error = %e, "error reading MCP server stdout");
                                break;
                            }
                        },
                    }
                }
                pending.fail_all();
            });
        }

        // Stderr drain: the server's own logging, forwarded at debug level.
        {
            let command = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(command = %command, "server stderr: {}", line);
                }
            });
        }

        tracing::info!(command = %command, "spawned MCP server via stdio");

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            handlers,
            next_id: AtomicU64::new(1),
            shutdown,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn write_line(&self, value: &Value) -> Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let rx = self.pending.register(id);

        if let Err(e) = self.write_line(&serde_json::to_value(&request)?).await {
            self.pending.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response
                .into_result()
                .map_err(|e| McpError::server_error(e.code, e.message, e.data)),
            Ok(Err(_)) => Err(McpError::ConnectionClosed),
            Err(_) => {
                self.pending.forget(id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.write_line(&serde_json::to_value(&notification)?).await
    }
}

fn route_line(line: &str, pending: &Pending, handlers: &Handlers) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "discarding unparsable line from MCP server");
            return;
        }
    };

    match classify_incoming(value) {
        Ok(Incoming::Response(response)) => pending.complete(response),
        Ok(Incoming::Notification(notification)) => handlers.dispatch(&notification),
        Err(e) => tracing::warn!(error = %e, "discarding unclassifiable MCP message"),
    }
}

#[async_trait::async_trait]
impl TransportClient for StdioTransport {
    async fn start(&self) -> Result<()> {
        // Stdio begins on construction.
        Ok(())
    }

    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let result = self
            .send_request("initialize", Some(serde_json::to_value(&params)?))
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        self.send_notification("notifications/initialized", None)
            .await?;

        tracing::info!(
            server = %init.server_info.name,
            version = %init.server_info.version,
            protocol = %init.protocol_version,
            "MCP server initialized"
        );

        Ok(init)
    }

    async fn ping(&self) -> Result<()> {
        self.send_request("ping", None).await?;
        Ok(())
    }

    async fn list_tools(&self) -> Result<ListToolsResult> {
        let result = self.send_request("tools/list", None).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult> {
        let result = self
            .send_request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn list_resources(&self) -> Result<ListResourcesResult> {
        let result = self.send_request("resources/list", None).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn read_resource(&self, params: ReadResourceParams) -> Result<ReadResourceResult> {
        let result = self
            .send_request("resources/read", Some(serde_json::to_value(&params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    fn on_notification(&self, handler: NotificationHandler) {
        self.handlers.push(handler);
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.pending.fail_all();

        let mut child = self.child.lock().await;
        let _ = child.kill().await;
        Ok(())
    }
}
