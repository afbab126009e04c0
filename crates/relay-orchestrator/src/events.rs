//! Progress events and streaming sink events.
//!
//! The orchestrator reports its state machine through [`ExecutionEvent`]s
//! delivered to an advisory callback, and streams output to the caller
//! through tagged [`SinkEvent`]s: raw LLM deltas or structured tool-result
//! batches.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// State notifications
// ─────────────────────────────────────────────────────────────────────────────

/// What part of the loop an event reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The run entered the execution loop.
    ProcessStart,
    /// A round began.
    ExecutionRound,
    /// Task extraction from text content (text mode).
    ExtractingTasks,
    /// Native tool-call processing (function-call mode).
    ProcessingToolCalls,
    /// One tool dispatch.
    ToolCall,
    /// One tool outcome.
    ToolResult,
    /// A feedback LLM call.
    IntermediateGeneration,
    /// The run finished.
    ProcessComplete,
}

/// Stage of the reported step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Start,
    Complete,
    Error,
}

/// One progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Stage within the step.
    pub stage: Stage,
    /// Server involved, for tool-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Tool involved, for tool-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Round numbers, counts, args or error strings, as appropriate.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ExecutionEvent {
    /// Create an event with no tool attribution.
    pub fn new(event_type: EventType, stage: Stage, data: Value) -> Self {
        Self {
            event_type,
            stage,
            server_id: None,
            tool_name: None,
            data,
        }
    }

    /// Create a tool-level event.
    pub fn for_tool(
        event_type: EventType,
        stage: Stage,
        server_id: impl Into<String>,
        tool_name: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            event_type,
            stage,
            server_id: Some(server_id.into()),
            tool_name: Some(tool_name.into()),
            data,
        }
    }
}

/// Advisory progress callback. Its return value is ignored and a panic
/// inside it never aborts the loop.
pub type StateNotify = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Deliver an event to the callback, swallowing panics.
pub(crate) fn notify(callback: &Option<StateNotify>, event: ExecutionEvent) {
    if let Some(callback) = callback {
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
        if outcome.is_err() {
            tracing::warn!("state notify callback panicked; continuing");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming sink
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one tool execution, as streamed to the sink and rendered on
/// the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    /// Server id.
    pub server: String,
    /// Tool name.
    pub tool: String,
    /// Call arguments.
    pub args: Map<String, Value>,
    /// "success" or "error".
    pub status: ExecutionStatus,
    /// Result value, if successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description, if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Native tool-call id (function-call mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Tool execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// One event delivered to the streaming sink.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// A raw LLM text delta.
    Delta(String),
    /// One round's batch of tool results.
    Results(Vec<ToolExecutionRecord>),
}

impl SinkEvent {
    /// The delta text, if this is a delta event.
    pub fn as_delta(&self) -> Option<&str> {
        match self {
            SinkEvent::Delta(text) => Some(text),
            SinkEvent::Results(_) => None,
        }
    }

    /// The result batch, if this is a results event.
    pub fn as_results(&self) -> Option<&[ToolExecutionRecord]> {
        match self {
            SinkEvent::Delta(_) => None,
            SinkEvent::Results(records) => Some(records),
        }
    }
}

/// Sink receiving the orchestrator's streamed output.
pub type StreamSink = Arc<dyn Fn(SinkEvent) + Send + Sync>;
