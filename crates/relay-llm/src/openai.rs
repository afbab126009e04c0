//! OpenAI-compatible chat-completion backend.
//!
//! Works against OpenAI itself or any API-compatible service (vLLM, Ollama,
//! Groq, gateway deployments). Streaming uses the `data:` SSE line protocol
//! with incremental tool-call assembly.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{DeltaSink, Llm, with_retry};
use crate::error::{LlmError, Result};
use crate::options::LlmOptions;
use crate::types::{FunctionCall, Generation, Message, Role, Tool, ToolCall, Usage};

/// Default OpenAI API base URL.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default model.
const DEFAULT_MODEL: &str = "gpt-4o";

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key (optional for local services).
    pub api_key: Option<String>,
    /// Base URL of the API.
    pub base_url: String,
    /// Default model when the call options name none.
    pub model: String,
    /// Request timeout; elapsing it is a hard deadline error.
    pub timeout: Duration,
    /// Maximum retries for transient errors (non-streaming calls).
    pub max_retries: u32,
    /// Initial backoff between retries.
    pub retry_backoff: Duration,
    /// Name for this backend instance.
    pub name: String,
}

impl OpenAiConfig {
    /// Create a config for OpenAI with the given key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            name: "openai".to_string(),
        }
    }

    /// Create a config from `OPENAI_API_KEY`, `OPENAI_BASE_URL` and
    /// `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LlmError::config("OPENAI_API_KEY environment variable not set"))?;

        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.model = model;
        }
        Ok(config)
    }

    /// Set a custom base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the backend name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// OpenAI-compatible API client.
pub struct OpenAiClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    /// Create a client with the given configuration.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    /// Create a client from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(OpenAiConfig::from_env()?)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_request(
        &self,
        messages: &[Message],
        options: &LlmOptions,
        stream: bool,
    ) -> WireRequest {
        WireRequest {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages: to_wire_messages(messages),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            n: options.n,
            seed: options.seed,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            stop: options.stop_words.clone(),
            stream,
            stream_options: stream.then(|| WireStreamOptions {
                include_usage: true,
            }),
            tools: options.tools.clone(),
            tool_choice: options.tool_choice.clone(),
            parallel_tool_calls: if options.tools.is_empty() {
                None
            } else {
                options.parallel_tool_calls
            },
            response_format: options
                .json_mode
                .then(|| serde_json::json!({"type": "json_object"})),
        }
    }

    async fn post(&self, request: &WireRequest) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(self.completions_url())
            .header(header::CONTENT_TYPE, "application/json");

        if let Some(ref api_key) = self.config.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", api_key));
        }

        let response = builder.json(request).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::DeadlineExceeded
            } else {
                LlmError::request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Llm for OpenAiClient {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn complete(&self, messages: &[Message], options: &LlmOptions) -> Result<Generation> {
        let request = self.build_request(messages, options, false);

        let wire: WireResponse = with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            &self.config.name,
            || async {
                let response = self.post(&request).await?;
                response
                    .json()
                    .await
                    .map_err(|e| LlmError::stream(format!("failed to decode response: {}", e)))
            },
        )
        .await?;

        generation_from_response(wire)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &LlmOptions,
        sink: DeltaSink,
    ) -> Result<Generation> {
        let request = self.build_request(messages, options, true);
        let response = self.post(&request).await?;

        let mut generation = Generation {
            role: String::new(),
            ..Generation::default()
        };
        let mut stream = response.bytes_stream();
        let mut buf = String::new();

        'outer: loop {
            let chunk = tokio::select! {
                _ = options.cancellation.cancelled() => {
                    tracing::debug!(backend = %self.config.name, "stream cancelled, returning partial generation");
                    break 'outer;
                }
                chunk = stream.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) if e.is_timeout() => return Err(LlmError::DeadlineExceeded),
                Some(Err(e)) => return Err(LlmError::stream(e.to_string())),
                None => break,
            };

            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..pos + 1).collect();
                let line = line.trim();

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'outer;
                }

                match serde_json::from_str::<WireStreamChunk>(data) {
                    Ok(chunk) => apply_stream_chunk(&mut generation, chunk, &sink),
                    Err(e) => {
                        tracing::warn!(error = %e, "discarding unparsable stream chunk");
                    }
                }
            }
        }

        if generation.role.is_empty() {
            generation.role = "assistant".to_string();
        }
        Ok(generation)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire mapping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<WireStreamOptions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCall>,
}

fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            // Some providers reject empty content outright.
            let content = if message.content.is_empty() {
                " ".to_string()
            } else {
                message.content.clone()
            };
            WireMessage {
                role,
                content,
                name: message.name.clone(),
                tool_call_id: message.tool_call_id.clone(),
                tool_calls: message.tool_calls.clone(),
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

fn generation_from_response(response: WireResponse) -> Result<Generation> {
    let usage = response.usage.map(Usage::from);
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or(LlmError::EmptyResponse)?;

    Ok(Generation {
        role: choice.message.role.unwrap_or_else(|| "assistant".to_string()),
        content: choice.message.content.unwrap_or_default(),
        reasoning_content: choice.message.reasoning_content.unwrap_or_default(),
        stop_reason: choice.finish_reason.unwrap_or_default(),
        tool_calls: choice.message.tool_calls.unwrap_or_default(),
        usage,
        ..Generation::default()
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireDeltaToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    call_type: Option<String>,
    #[serde(default)]
    function: Option<WireDeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct WireDeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn apply_stream_chunk(generation: &mut Generation, chunk: WireStreamChunk, sink: &DeltaSink) {
    if let Some(usage) = chunk.usage {
        generation.usage = Some(usage.into());
    }

    let Some(choice) = chunk.choices.into_iter().next() else {
        return;
    };

    if generation.role.is_empty() {
        if let Some(role) = choice.delta.role {
            generation.role = role;
        }
    }

    if let Some(content) = choice.delta.content {
        if !content.is_empty() {
            generation.content.push_str(&content);
            sink(&content);
        }
    }

    if let Some(reasoning) = choice.delta.reasoning_content {
        generation.reasoning_content.push_str(&reasoning);
    }

    if let Some(finish) = choice.finish_reason {
        generation.stop_reason = finish;
    }

    if let Some(deltas) = choice.delta.tool_calls {
        merge_tool_call_deltas(&mut generation.tool_calls, deltas);
    }
}

/// Fold streamed tool-call fragments into complete calls.
///
/// Fragments carry an index (OpenAI) or an id (some gateways); name and
/// argument text accumulate across fragments.
fn merge_tool_call_deltas(calls: &mut Vec<ToolCall>, deltas: Vec<WireDeltaToolCall>) {
    for delta in deltas {
        let slot = match delta.index {
            Some(index) => {
                while calls.len() <= index {
                    calls.push(ToolCall {
                        id: String::new(),
                        call_type: "function".to_string(),
                        function: FunctionCall::default(),
                    });
                }
                &mut calls[index]
            }
            None => {
                let id = delta.id.clone().unwrap_or_default();
                let position = calls
                    .iter()
                    .position(|call| !id.is_empty() && call.id == id);
                match position {
                    Some(position) => &mut calls[position],
                    None => {
                        calls.push(ToolCall {
                            id: String::new(),
                            call_type: "function".to_string(),
                            function: FunctionCall::default(),
                        });
                        calls.last_mut().unwrap()
                    }
                }
            }
        };

        if let Some(id) = delta.id {
            if !id.is_empty() {
                slot.id = id;
            }
        }
        if let Some(call_type) = delta.call_type {
            if !call_type.is_empty() {
                slot.call_type = call_type;
            }
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                slot.function.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                slot.function.arguments.push_str(&arguments);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wire_messages_roles_and_empty_content() {
        let messages = vec![
            Message::system("sys"),
            Message::user("hello"),
            Message::assistant_with_tool_calls("", vec![ToolCall::function("c1", "a.b", "{}")]),
            Message::tool("c1", "result"),
        ];

        let wire = to_wire_messages(&messages);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
        // Empty content replaced with a single space.
        assert_eq!(wire[2].content, " ");
        assert_eq!(wire[2].tool_calls.len(), 1);
        assert_eq!(wire[3].role, "tool");
        assert_eq!(wire[3].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_generation_from_response() {
        let json = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "It is 12:00 UTC.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "srv1.get_current_time", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });

        let wire: WireResponse = serde_json::from_value(json).unwrap();
        let generation = generation_from_response(wire).unwrap();

        assert_eq!(generation.content, "It is 12:00 UTC.");
        assert_eq!(generation.stop_reason, "tool_calls");
        assert_eq!(generation.tool_calls.len(), 1);
        assert_eq!(generation.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_generation_from_empty_response() {
        let wire: WireResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(matches!(
            generation_from_response(wire),
            Err(LlmError::EmptyResponse)
        ));
    }

    #[test]
    fn test_merge_tool_call_deltas_by_index() {
        let mut calls = Vec::new();

        let first: Vec<WireDeltaToolCall> = serde_json::from_value(serde_json::json!([
            {"index": 0, "id": "call_1", "type": "function",
             "function": {"name": "srv1.get_", "arguments": "{\"a\""}}
        ]))
        .unwrap();
        merge_tool_call_deltas(&mut calls, first);

        let second: Vec<WireDeltaToolCall> = serde_json::from_value(serde_json::json!([
            {"index": 0, "function": {"name": "time", "arguments": ":1}"}}
        ]))
        .unwrap();
        merge_tool_call_deltas(&mut calls, second);

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "srv1.get_time");
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
    }

    #[test]
    fn test_merge_tool_call_deltas_by_id() {
        let mut calls = Vec::new();

        let deltas: Vec<WireDeltaToolCall> = serde_json::from_value(serde_json::json!([
            {"id": "x", "function": {"name": "srv1.echo"}},
            {"id": "x", "function": {"arguments": "{}"}},
            {"id": "y", "function": {"name": "srv2.other"}}
        ]))
        .unwrap();
        merge_tool_call_deltas(&mut calls, deltas);

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.name, "srv1.echo");
        assert_eq!(calls[0].function.arguments, "{}");
        assert_eq!(calls[1].function.name, "srv2.other");
    }

    #[test]
    fn test_apply_stream_chunk_accumulates() {
        let mut generation = Generation::default();
        let collected = Arc::new(std::sync::Mutex::new(String::new()));
        let sink: DeltaSink = {
            let collected = collected.clone();
            Arc::new(move |chunk: &str| collected.lock().unwrap().push_str(chunk))
        };

        for (role, content) in [(Some("assistant"), "It is "), (None, "12:00 UTC.")] {
            let chunk: WireStreamChunk = serde_json::from_value(serde_json::json!({
                "choices": [{"delta": {"role": role, "content": content}}]
            }))
            .unwrap();
            apply_stream_chunk(&mut generation, chunk, &sink);
        }

        assert_eq!(generation.role, "assistant");
        assert_eq!(generation.content, "It is 12:00 UTC.");
        assert_eq!(*collected.lock().unwrap(), "It is 12:00 UTC.");
    }

    #[test]
    fn test_build_request_defaults_model() {
        let client = OpenAiClient::new(OpenAiConfig::new("key")).unwrap();
        let request = client.build_request(&[Message::user("q")], &LlmOptions::default(), false);
        assert_eq!(request.model, DEFAULT_MODEL);
        assert!(!request.stream);
        assert!(request.stream_options.is_none());

        let options = LlmOptions::default().with_model("custom-model");
        let request = client.build_request(&[Message::user("q")], &options, true);
        assert_eq!(request.model, "custom-model");
        assert!(request.stream);
        assert!(request.stream_options.is_some());
    }

    #[test]
    fn test_completions_url_trims_slash() {
        let client = OpenAiClient::new(
            OpenAiConfig::new("key").with_base_url("http://localhost:8000/v1/"),
        )
        .unwrap();
        assert_eq!(
            client.completions_url(),
            "http://localhost:8000/v1/chat/completions"
        );
    }
}
