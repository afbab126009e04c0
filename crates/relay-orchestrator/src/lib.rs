//! Tool-execution loop for Relay.
//!
//! This crate drives a large language model through a bounded, multi-round
//! loop in which the model requests tool invocations, the connection host
//! dispatches them, and results are fed back to the model until it produces
//! a final answer.
//!
//! # Architecture
//!
//! ```text
//! prompt ──► catalog ──► LLM ──► task parser / native tool calls
//!                          ▲                      │
//!                          │                      ▼
//!                    feedback msgs ◄──── McpHost.execute_tool
//! ```
//!
//! Two tool-invocation dialects are supported:
//!
//! - **Text mode**: the model emits tag-wrapped JSON task blocks inside its
//!   text content (`<MCP_HOST_TASK>{"server":…,"tool":…,"args":…}</MCP_HOST_TASK>`).
//! - **Function-call mode**: the model uses the native tool-call API with
//!   qualified `"server.tool"` function names.
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_orchestrator::{GenerateOptions, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(llm, host);
//! let generation = orchestrator
//!     .generate(
//!         "What time is it?",
//!         GenerateOptions::new().with_auto_execute(true),
//!     )
//!     .await?;
//! println!("{}", generation.content);
//! ```

pub mod catalog;
pub mod client;
pub mod error;
pub mod events;
mod exec;
pub mod options;
pub mod parser;
pub mod prompts;

// Re-export core types
pub use client::Orchestrator;
pub use error::{OrchestratorError, Result};
pub use events::{
    EventType, ExecutionEvent, ExecutionStatus, SinkEvent, Stage, StateNotify, StreamSink,
    ToolExecutionRecord,
};
pub use options::{GenerateOptions, PromptTemplates};
pub use parser::{McpTask, TaskResult, contains_tasks, extract_tasks};
pub use prompts::{
    DEFAULT_MAX_ROUNDS, DEFAULT_RESULT_TAG, DEFAULT_TASK_TAG, FALLBACK_TASK_TAG,
};

// Re-export what callers need from the lower layers
pub use relay_llm::{Generation, LlmOptions, Message, Role, WorkMode};
