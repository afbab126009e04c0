//! The orchestrator: an LLM wrapped with MCP tool awareness.
//!
//! [`Orchestrator`] pairs an [`Llm`] backend with an [`McpHost`] and drives
//! one user turn: the catalog is rendered into the call, the model's tool
//! requests are dispatched, and results are fed back until the model
//! produces a final answer (or the round budget runs out).
//!
//! [`Llm`]: relay_llm::Llm

use std::sync::Arc;

use relay_llm::{DeltaSink, Generation, Message, SharedLlm, WorkMode};
use relay_mcp::McpHost;

use crate::catalog;
use crate::error::Result;
use crate::events::SinkEvent;
use crate::exec::call_result_value;
use crate::options::GenerateOptions;
use crate::parser::{self, McpTask, TaskResult};
use crate::prompts::FALLBACK_TASK_TAG;

/// Drives an LLM through tool-augmented generation against an MCP host.
pub struct Orchestrator {
    pub(crate) llm: SharedLlm,
    pub(crate) host: Arc<McpHost>,
}

impl Orchestrator {
    /// Create an orchestrator over the given backend and host.
    pub fn new(llm: SharedLlm, host: Arc<McpHost>) -> Self {
        Self { llm, host }
    }

    /// The connection host.
    pub fn host(&self) -> Arc<McpHost> {
        self.host.clone()
    }

    /// The LLM backend.
    pub fn llm(&self) -> SharedLlm {
        self.llm.clone()
    }

    /// Generate a reply to a single user prompt.
    pub async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<Generation> {
        self.generate_messages(vec![Message::user(prompt)], options)
            .await
    }

    /// Generate a reply to a message list.
    ///
    /// In text mode a system message built from the system-prompt template
    /// and the tool catalog is prepended; in function-call mode the catalog
    /// is attached as native tool descriptors. With `auto_execute` the
    /// multi-round execution loop runs; otherwise the first generation is
    /// returned untouched (function-call mode additionally appends a
    /// tag-rendered echo of any native tool calls).
    pub async fn generate_messages(
        &self,
        messages: Vec<Message>,
        options: GenerateOptions,
    ) -> Result<Generation> {
        options.validate()?;

        match options.work_mode {
            WorkMode::Text => self.generate_text_mode(messages, options).await,
            WorkMode::FunctionCall => self.generate_function_call_mode(messages, options).await,
        }
    }

    async fn generate_text_mode(
        &self,
        messages: Vec<Message>,
        options: GenerateOptions,
    ) -> Result<Generation> {
        let system_prompt = options.templates.system_prompt.trim().to_string();
        let catalog_text = catalog::format_tools_text(
            &self.host,
            options.effective_task_tag(),
            &options.disabled_tools,
        )
        .await;

        let system = if catalog_text.is_empty() {
            system_prompt.clone()
        } else {
            format!("{}\n\n{}", system_prompt, catalog_text)
        };

        let mut all_messages = Vec::with_capacity(messages.len() + 1);
        all_messages.push(Message::system(system));
        all_messages.extend(messages.iter().cloned());

        let mut generation = self.call_llm(&all_messages, &options).await?;
        stamp_dialect(&mut generation, &options, &system_prompt);

        if options.auto_execute && has_tool_requests(&generation) {
            return self.execute_and_feedback(generation, messages, options).await;
        }

        Ok(generation)
    }

    async fn generate_function_call_mode(
        &self,
        messages: Vec<Message>,
        options: GenerateOptions,
    ) -> Result<Generation> {
        let tools = catalog::collect_function_tools(&self.host, &options.disabled_tools).await;

        let mut options = options;
        options.llm.tools = tools;

        let mut generation = self.call_llm(&messages, &options).await?;
        stamp_dialect(&mut generation, &options, "");

        if options.auto_execute && generation.has_tool_calls() {
            return self.execute_and_feedback(generation, messages, options).await;
        }

        if !options.auto_execute {
            append_tool_calls_to_content(&mut generation, options.effective_task_tag());
        }

        Ok(generation)
    }

    /// Issue one LLM call, streaming deltas to the caller's sink when one is
    /// configured.
    pub(crate) async fn call_llm(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<Generation> {
        let generation = match &options.stream_sink {
            Some(sink) => {
                let sink = sink.clone();
                let delta_sink: DeltaSink =
                    Arc::new(move |chunk: &str| sink(SinkEvent::Delta(chunk.to_string())));
                self.llm
                    .complete_stream(messages, &options.llm, delta_sink)
                    .await?
            }
            None => self.llm.complete(messages, &options.llm).await?,
        };
        Ok(generation)
    }

    /// Parse tasks out of arbitrary text and execute them directly.
    ///
    /// Per-task failures are recorded in the returned results, not raised.
    pub async fn execute_tasks(&self, content: &str, task_tag: &str) -> Vec<TaskResult> {
        let tasks = parser::extract_tasks(content, task_tag);
        let mut results = Vec::with_capacity(tasks.len());

        for task in tasks {
            let outcome = self
                .host
                .execute_tool(&task.server, &task.tool, task.args.clone())
                .await;
            let result = match outcome {
                Ok(r) if r.is_error() => {
                    let error = r.text_content().unwrap_or_else(|| "tool error".to_string());
                    TaskResult::failure(task, error)
                }
                Ok(r) => TaskResult::success(task, call_result_value(r)),
                Err(e) => TaskResult::failure(task, e.to_string()),
            };
            results.push(result);
        }

        results
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("llm", &self.llm.name())
            .finish_non_exhaustive()
    }
}

/// Stamp the dialect metadata onto a generation.
pub(crate) fn stamp_dialect(
    generation: &mut Generation,
    options: &GenerateOptions,
    system_prompt: &str,
) {
    generation.work_mode = options.work_mode;
    generation.task_tag = options.effective_task_tag().to_string();
    generation.result_tag = options.effective_result_tag().to_string();
    generation.system_prompt = system_prompt.to_string();
}

/// Whether a generation requests any tool work in its dialect.
pub(crate) fn has_tool_requests(generation: &Generation) -> bool {
    match generation.work_mode {
        WorkMode::Text => {
            parser::contains_tasks(&generation.content, &generation.task_tag, FALLBACK_TASK_TAG)
        }
        WorkMode::FunctionCall => generation.has_tool_calls(),
    }
}

/// Append a tag-rendered echo of native tool calls to the content, so a
/// caller that skipped auto-execution still sees them textually.
pub(crate) fn append_tool_calls_to_content(generation: &mut Generation, task_tag: &str) {
    if generation.tool_calls.is_empty() {
        return;
    }

    let mut rendered = String::from("\n\n");
    let mut any = false;

    for call in &generation.tool_calls {
        let Some((server, tool)) = call.function.name.split_once('.') else {
            continue;
        };
        let Ok(args) = serde_json::from_str(&call.function.arguments) else {
            continue;
        };

        let task = McpTask {
            server: server.to_string(),
            tool: tool.to_string(),
            args,
            text: String::new(),
        };
        let Ok(json) = serde_json::to_string(&task) else {
            continue;
        };

        rendered.push_str(&format!("<{0}>\n{1}\n</{0}>\n", task_tag, json));
        any = true;
    }

    if any {
        generation.content.push_str(&rendered);
    }
}
