//! Core types for LLM requests and responses.
//!
//! These types follow the OpenAI-compatible chat-completion shape while
//! staying provider-agnostic, and carry the tool-invocation dialect metadata
//! the orchestrator stamps onto each generation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// Optional author name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The text content of the message.
    pub content: String,
    /// Id of the tool call this message answers (tool role only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls issued by the assistant (assistant role only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            name: None,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            name: None,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            name: None,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Create an assistant message bearing tool calls.
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            name: None,
            content: content.into(),
            tool_call_id: None,
            tool_calls,
        }
    }

    /// Create a tool-role message answering one tool call.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            name: None,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool calls and tool descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// A native tool-call request emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique id for this call.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Call type (always "function").
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub call_type: String,
    /// The function being called.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a function tool call.
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// The function half of a tool call: name plus raw JSON argument string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name; qualified as `"<serverId>.<toolName>"`.
    #[serde(default)]
    pub name: String,
    /// Arguments as a JSON string.
    #[serde(default)]
    pub arguments: String,
}

/// A tool made available to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool type (always "function").
    #[serde(rename = "type")]
    pub tool_type: String,
    /// The function definition.
    pub function: FunctionDefinition,
}

impl Tool {
    /// Create a function tool.
    pub fn function(definition: FunctionDefinition) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: definition,
        }
    }
}

/// Definition of a function the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Function name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Generation
// ─────────────────────────────────────────────────────────────────────────────

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens.
    #[serde(default)]
    pub total_tokens: u32,
}

/// The tool-invocation dialect a generation was produced under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    /// Tag-delimited JSON task blocks inside the text content.
    #[default]
    Text,
    /// Native function-calling API.
    FunctionCall,
}

impl std::fmt::Display for WorkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkMode::Text => write!(f, "text"),
            WorkMode::FunctionCall => write!(f, "function_call"),
        }
    }
}

/// One LLM output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Generation {
    /// Author role, normally "assistant".
    #[serde(default)]
    pub role: String,
    /// Text content.
    #[serde(default)]
    pub content: String,
    /// Reasoning content, for models that emit it separately.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning_content: String,
    /// Why generation stopped.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stop_reason: String,
    /// Native tool calls, in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Token usage, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Opaque per-generation metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub generation_info: Map<String, Value>,

    // Dialect tags stamped by the orchestrator.
    /// The work mode that produced this generation.
    #[serde(skip)]
    pub work_mode: WorkMode,
    /// Task tag in effect.
    #[serde(skip)]
    pub task_tag: String,
    /// Result tag in effect.
    #[serde(skip)]
    pub result_tag: String,
    /// System prompt in effect.
    #[serde(skip)]
    pub system_prompt: String,
}

impl Generation {
    /// Create an assistant generation holding plain text.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Create an assistant generation holding native tool calls.
    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_calls,
            ..Self::default()
        }
    }

    /// Whether the generation carries native tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = Message::system("be helpful");
        assert_eq!(msg.role, Role::System);

        let msg = Message::user("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "hello");

        let msg = Message::tool("call_1", "result text");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_tool_call_wire_shape() {
        let call = ToolCall::function("call_1", "srv1.get_current_time", "{}");
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains("\"type\":\"function\""));
        assert!(json.contains("srv1.get_current_time"));

        let parsed: ToolCall = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.function.name, "srv1.get_current_time");
    }

    #[test]
    fn test_assistant_with_tool_calls_skips_empty() {
        let msg = Message::assistant("plain");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("tool_calls"));

        let msg = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::function("c1", "a.b", "{}")],
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("tool_calls"));
    }

    #[test]
    fn test_generation_defaults() {
        let generation = Generation::text("hi");
        assert_eq!(generation.role, "assistant");
        assert_eq!(generation.work_mode, WorkMode::Text);
        assert!(!generation.has_tool_calls());
    }

    #[test]
    fn test_work_mode_display() {
        assert_eq!(WorkMode::Text.to_string(), "text");
        assert_eq!(WorkMode::FunctionCall.to_string(), "function_call");
    }
}
