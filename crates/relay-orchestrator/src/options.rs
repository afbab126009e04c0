//! Per-call orchestrator configuration.

use relay_llm::{LlmOptions, WorkMode};

use crate::error::{OrchestratorError, Result};
use crate::events::{StateNotify, StreamSink};
use crate::prompts;

/// The format-string bundle used to construct feedback messages.
///
/// Placeholders are named: `{tag}`, `{server}`, `{tool}`, `{result}`,
/// `{error}`, `{rounds}`. A template missing a placeholder is used verbatim.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    /// System prompt prefix for text mode. Blank is a hard error there.
    pub system_prompt: String,
    /// Message carrying one successful tool result. `{tag}`, `{result}`.
    pub tool_result: String,
    /// Message carrying one failed tool call. `{tag}`, `{server}`, `{tool}`,
    /// `{error}`.
    pub tool_error: String,
    /// Guidance for intermediate rounds. `{rounds}`.
    pub next_round: String,
    /// Guidance for the terminal round.
    pub final_result: String,
    /// System prompt for function-call mode.
    pub function_call_system: String,
    /// Prefix for the user question in function-call feedback.
    pub user_question_prefix: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system_prompt: prompts::DEFAULT_SYSTEM_PROMPT.to_string(),
            tool_result: prompts::DEFAULT_TOOL_RESULT_TEMPLATE.to_string(),
            tool_error: prompts::DEFAULT_TOOL_ERROR_TEMPLATE.to_string(),
            next_round: prompts::DEFAULT_NEXT_ROUND_TEMPLATE.to_string(),
            final_result: prompts::DEFAULT_FINAL_RESULT_TEMPLATE.to_string(),
            function_call_system: prompts::DEFAULT_FUNCTION_CALL_SYSTEM_PROMPT.to_string(),
            user_question_prefix: prompts::DEFAULT_USER_QUESTION_PREFIX.to_string(),
        }
    }
}

impl PromptTemplates {
    /// Render the tool-result message.
    pub fn render_tool_result(&self, tag: &str, result_json: &str) -> String {
        prompts::render(&self.tool_result, &[("tag", tag), ("result", result_json)])
    }

    /// Render the tool-error message.
    pub fn render_tool_error(&self, tag: &str, server: &str, tool: &str, error: &str) -> String {
        prompts::render(
            &self.tool_error,
            &[("tag", tag), ("server", server), ("tool", tool), ("error", error)],
        )
    }

    /// Render the next-round guidance.
    pub fn render_next_round(&self, remaining_rounds: u32) -> String {
        prompts::render(
            &self.next_round,
            &[("rounds", &remaining_rounds.to_string())],
        )
    }
}

/// Immutable configuration for one `generate` call.
#[derive(Clone)]
pub struct GenerateOptions {
    /// Standard LLM knobs, passed through to the backend.
    pub llm: LlmOptions,
    /// Tool-invocation dialect. Defaults to text mode.
    pub work_mode: WorkMode,
    /// Run the tool-execution loop; when false the first generation is
    /// returned untouched.
    pub auto_execute: bool,
    /// Tag wrapping task JSON in text mode.
    pub task_tag: String,
    /// Tag opening streamed tool-result blocks.
    pub result_tag: String,
    /// Qualified `"server.tool"` names excluded from the catalog and dropped
    /// before dispatch.
    pub disabled_tools: Vec<String>,
    /// Round budget for the execution loop.
    pub max_rounds: u32,
    /// Feedback message templates.
    pub templates: PromptTemplates,
    /// Sink for streamed deltas and tool-result batches.
    pub stream_sink: Option<StreamSink>,
    /// Advisory progress callback.
    pub state_notify: Option<StateNotify>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerateOptions {
    /// Options with the default tags, templates and round budget.
    pub fn new() -> Self {
        Self {
            llm: LlmOptions::default(),
            work_mode: WorkMode::Text,
            auto_execute: false,
            task_tag: prompts::DEFAULT_TASK_TAG.to_string(),
            result_tag: prompts::DEFAULT_RESULT_TAG.to_string(),
            disabled_tools: Vec::new(),
            max_rounds: prompts::DEFAULT_MAX_ROUNDS,
            templates: PromptTemplates::default(),
            stream_sink: None,
            state_notify: None,
        }
    }

    /// Set the work mode.
    pub fn with_work_mode(mut self, work_mode: WorkMode) -> Self {
        self.work_mode = work_mode;
        self
    }

    /// Enable or disable the execution loop.
    pub fn with_auto_execute(mut self, auto_execute: bool) -> Self {
        self.auto_execute = auto_execute;
        self
    }

    /// Set the task tag.
    pub fn with_task_tag(mut self, tag: impl Into<String>) -> Self {
        self.task_tag = tag.into();
        self
    }

    /// Set the result tag.
    pub fn with_result_tag(mut self, tag: impl Into<String>) -> Self {
        self.result_tag = tag.into();
        self
    }

    /// Disable a qualified `"server.tool"` name.
    pub fn with_disabled_tool(mut self, qualified: impl Into<String>) -> Self {
        self.disabled_tools.push(qualified.into());
        self
    }

    /// Set the round budget.
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Replace the system prompt template.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.templates.system_prompt = prompt.into();
        self
    }

    /// Set the LLM options.
    pub fn with_llm(mut self, llm: LlmOptions) -> Self {
        self.llm = llm;
        self
    }

    /// Attach a streaming sink.
    pub fn with_stream_sink(mut self, sink: StreamSink) -> Self {
        self.stream_sink = Some(sink);
        self
    }

    /// Attach a progress callback.
    pub fn with_state_notify(mut self, callback: StateNotify) -> Self {
        self.state_notify = Some(callback);
        self
    }

    /// Effective task tag; an unset tag falls back to the default.
    pub fn effective_task_tag(&self) -> &str {
        if self.task_tag.trim().is_empty() {
            prompts::DEFAULT_TASK_TAG
        } else {
            &self.task_tag
        }
    }

    /// Effective result tag; an unset tag falls back to the default.
    pub fn effective_result_tag(&self) -> &str {
        if self.result_tag.trim().is_empty() {
            prompts::DEFAULT_RESULT_TAG
        } else {
            &self.result_tag
        }
    }

    /// Validate the configuration at entry.
    pub fn validate(&self) -> Result<()> {
        if self.work_mode == WorkMode::Text && self.templates.system_prompt.trim().is_empty() {
            return Err(OrchestratorError::config(
                "system prompt template is blank",
            ));
        }
        if self.max_rounds == 0 {
            return Err(OrchestratorError::config(
                "max tool execution rounds must be at least 1",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for GenerateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateOptions")
            .field("work_mode", &self.work_mode)
            .field("auto_execute", &self.auto_execute)
            .field("task_tag", &self.task_tag)
            .field("result_tag", &self.result_tag)
            .field("disabled_tools", &self.disabled_tools)
            .field("max_rounds", &self.max_rounds)
            .field("stream_sink", &self.stream_sink.is_some())
            .field("state_notify", &self.state_notify.is_some())
            .finish_non_exhaustive()
    }
}
