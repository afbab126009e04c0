//! LLM backend abstraction for Relay.
//!
//! This crate defines the [`Llm`] capability the orchestrator drives: a
//! chat-completion call returning a [`Generation`], with optional streaming
//! delivery of text deltas to a caller-provided sink.
//!
//! # Core Components
//!
//! - [`Llm`]: the backend trait (`complete` / `complete_stream`)
//! - [`OpenAiClient`]: OpenAI-compatible HTTP backend
//! - [`MockLlm`]: scripted backend for deterministic tests
//! - [`Generation`]: one model output, including native tool calls and the
//!   tool-invocation dialect tags the orchestrator stamps onto it

pub mod backend;
pub mod error;
pub mod openai;
pub mod options;
pub mod types;

// Re-export main types
pub use backend::{DeltaSink, Llm, MockLlm, SharedLlm, with_retry};
pub use error::{LlmError, Result, is_retryable};
pub use openai::{OpenAiClient, OpenAiConfig};
pub use options::LlmOptions;
pub use types::{
    FunctionCall, FunctionDefinition, Generation, Message, Role, Tool, ToolCall, Usage, WorkMode,
};
