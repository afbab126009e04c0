//! SSE transport: HTTP server-sent events downstream, HTTP POST upstream.
//!
//! The server's event stream opens with an `endpoint` event naming the POST
//! URL for requests. Responses and notifications then arrive as `message`
//! events on the stream; servers that answer a POST with a JSON-RPC body
//! directly are tolerated as well.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult,
};
use crate::transport::{
    Handlers, Incoming, NotificationHandler, Pending, TransportClient, classify_incoming,
};

/// Default wait for the server's `endpoint` event.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single request/response exchange.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for an SSE connection.
#[derive(Debug, Clone)]
pub struct SseOptions {
    /// Headers sent with the stream GET and every POST.
    pub headers: Vec<(String, String)>,
    /// How long to wait for the `endpoint` event during `start`.
    pub connect_timeout: Duration,
    /// Timeout for a single request/response exchange.
    pub request_timeout: Duration,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl SseOptions {
    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Transport connecting to a remote MCP server over HTTP + SSE.
pub struct SseTransport {
    base_url: url::Url,
    options: SseOptions,
    http: reqwest::Client,
    endpoint: Arc<RwLock<Option<String>>>,
    pending: Arc<Pending>,
    handlers: Arc<Handlers>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl SseTransport {
    /// Create the transport. The event stream is not opened until [`start`].
    ///
    /// [`start`]: TransportClient::start
    pub fn connect(url: &str, options: SseOptions) -> Result<Self> {
        let base_url = url::Url::parse(url)
            .map_err(|e| McpError::transport(format!("invalid URL '{}': {}", url, e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| McpError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            options,
            http,
            endpoint: Arc::new(RwLock::new(None)),
            pending: Arc::new(Pending::default()),
            handlers: Arc::new(Handlers::default()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.options.headers {
            builder = builder.header(key, value);
        }
        builder
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let endpoint = self
            .endpoint
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| McpError::transport("SSE transport not started"))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let rx = self.pending.register(id);

        let post = self
            .apply_headers(self.http.post(&endpoint))
            .timeout(self.options.request_timeout)
            .json(&request)
            .send()
            .await;

        let response = match post {
            Ok(r) => r,
            Err(e) => {
                self.pending.forget(id);
                return Err(McpError::transport(format!("POST failed: {}", e)));
            }
        };

        if !response.status().is_success() {
            self.pending.forget(id);
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::transport(format!("HTTP error {}: {}", status, body)));
        }

        // Some servers answer the POST body with the JSON-RPC response
        // instead of pushing it on the stream; route it like any other.
        if let Ok(text) = response.text().await {
            if !text.trim().is_empty() {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    if let Ok(Incoming::Response(r)) = classify_incoming(value) {
                        self.pending.complete(r);
                    }
                }
            }
        }

        match tokio::time::timeout(self.options.request_timeout, rx).await {
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
        let endpoint = self
            .endpoint
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| McpError::transport("SSE transport not started"))?;

        let notification = JsonRpcNotification::new(method, params);
        self.apply_headers(self.http.post(&endpoint))
            .timeout(self.options.request_timeout)
            .json(&notification)
            .send()
            .await
            .map_err(|e| McpError::transport(format!("POST failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TransportClient for SseTransport {
    async fn start(&self) -> Result<()> {
        let response = self
            .apply_headers(self.http.get(self.base_url.clone()))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::transport(format!("failed to open SSE stream: {}", e)))?;

        if !response.status().is_success() {
            return Err(McpError::transport(format!(
                "SSE stream returned HTTP {}",
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        // Reader task: parses the event stream until close or error.
        {
            let base_url = self.base_url.clone();
            let endpoint = self.endpoint.clone();
            let pending = self.pending.clone();
            let handlers = self.handlers.clone();
            let shutdown = self.shutdown.clone();
            let mut endpoint_tx = Some(endpoint_tx);

            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                let mut parser = SseEventParser::default();

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        chunk = stream.next() => match chunk {
                            Some(Ok(bytes)) => {
                                for event in parser.push(&bytes) {
                                    handle_event(
                                        event,
                                        &base_url,
                                        &endpoint,
                                        &mut endpoint_tx,
                                        &pending,
                                        &handlers,
                                    );
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "SSE stream error");
                                break;
                            }
                            None => {
                                tracing::debug!("SSE stream closed by server");
                                break;
                            }
                        },
                    }
                }
                pending.fail_all();
            });
        }

        match tokio::time::timeout(self.options.connect_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => {
                tracing::info!(url = %self.base_url, endpoint = %endpoint, "SSE stream established");
                Ok(())
            }
            Ok(Err(_)) => Err(McpError::transport(
                "SSE stream closed before endpoint event",
            )),
            Err(_) => Err(McpError::transport(
                "timed out waiting for SSE endpoint event",
            )),
        }
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
        Ok(())
    }
}

fn handle_event(
    event: SseEvent,
    base_url: &url::Url,
    endpoint: &Arc<RwLock<Option<String>>>,
    endpoint_tx: &mut Option<oneshot::Sender<String>>,
    pending: &Pending,
    handlers: &Handlers,
) {
    match event.name.as_str() {
        "endpoint" => {
            let resolved = match base_url.join(event.data.trim()) {
                Ok(url) => url.to_string(),
                Err(e) => {
                    tracing::warn!(data = %event.data, error = %e, "invalid endpoint event");
                    return;
                }
            };
            *endpoint.write().unwrap() = Some(resolved.clone());
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(resolved);
            }
        }
        "message" => {
            let value: Value = match serde_json::from_str(&event.data) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unparsable SSE message");
                    return;
                }
            };
            match classify_incoming(value) {
                Ok(Incoming::Response(response)) => pending.complete(response),
                Ok(Incoming::Notification(notification)) => handlers.dispatch(&notification),
                Err(e) => tracing::warn!(error = %e, "discarding unclassifiable SSE message"),
            }
        }
        other => {
            tracing::debug!(event = %other, "ignoring unknown SSE event type");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event parsing
// ─────────────────────────────────────────────────────────────────────────────

/// One parsed server-sent event.
#[derive(Debug, PartialEq)]
struct SseEvent {
    /// Event name; "message" when the stream does not name one.
    name: String,
    /// Concatenated data lines.
    data: String,
}

/// Incremental parser over the raw SSE byte stream.
///
/// Events are delimited by a blank line; chunk boundaries may fall anywhere,
/// including inside a CRLF pair.
#[derive(Default)]
struct SseEventParser {
    buf: String,
}

impl SseEventParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        if self.buf.contains('\r') {
            self.buf = self.buf.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let raw: String = self.buf.drain(..pos + 2).collect();
            if let Some(event) = parse_event(raw.trim_end_matches('\n')) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut name: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if name.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        name: name.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}
