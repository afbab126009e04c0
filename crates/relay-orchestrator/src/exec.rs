//! The multi-round tool-execution loop.
//!
//! One `generate` call with auto-execution enters this state machine: parse
//! or read the model's tool requests, dispatch them through the host,
//! stream the results, rebuild the feedback conversation from scratch and
//! call the model again, until a round produces no new work or the budget
//! runs out. The terminal round instructs the model to answer without
//! further tools.
//!
//! Everything streamed to the caller's sink is mirrored into a captured
//! buffer; its bytes become the final generation's content.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use relay_llm::{DeltaSink, Generation, Message, Role, ToolCall, WorkMode};
use relay_mcp::{CallToolResult, ToolContent};
use serde_json::{Map, Value, json};

use crate::catalog;
use crate::client::Orchestrator;
use crate::error::Result;
use crate::events::{
    EventType, ExecutionEvent, ExecutionStatus, SinkEvent, Stage, ToolExecutionRecord, notify,
};
use crate::options::GenerateOptions;
use crate::parser::{self, McpTask, TaskResult};
use crate::prompts::FALLBACK_TASK_TAG;

/// Live scratchpad of one auto-executing `generate` call.
pub(crate) struct ExecutionState {
    options: GenerateOptions,
    /// The caller's original messages, without the injected system message.
    user_messages: Vec<Message>,
    /// The user question, for function-call feedback layout.
    prompt: String,
    /// Every task outcome so far; doubles as the dedup ledger.
    ledger: Vec<TaskResult>,
    /// Per-call-id outcomes accumulated across function-call rounds.
    fc_info: Map<String, Value>,
    /// Loop round counter (1-based inside the loop).
    round: u32,
    /// Rounds that actually dispatched work.
    rounds_executed: u32,
    /// Byte-exact mirror of everything sent to the stream sink.
    captured: Arc<Mutex<String>>,
    /// The most recent generation.
    current: Generation,
}

impl ExecutionState {
    fn new(generation: Generation, user_messages: Vec<Message>, options: GenerateOptions) -> Self {
        let captured = Arc::new(Mutex::new(generation.content.clone()));
        let prompt = user_messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.clone())
            .unwrap_or_default();

        Self {
            options,
            user_messages,
            prompt,
            ledger: Vec::new(),
            fc_info: Map::new(),
            round: 0,
            rounds_executed: 0,
            captured,
            current: generation,
        }
    }

    fn executed_texts(&self) -> HashSet<String> {
        self.ledger
            .iter()
            .map(|result| result.task.text.clone())
            .collect()
    }

    fn remaining_rounds(&self) -> u32 {
        self.options.max_rounds.saturating_sub(self.round)
    }

    /// Build the final generation: captured bytes as content, dialect
    /// metadata preserved, ledger and round count merged into the info map.
    fn into_final_generation(self) -> Generation {
        let mut generation = self.current;
        generation.content = self.captured.lock().unwrap().clone();

        let has_results = !self.ledger.is_empty() || !self.fc_info.is_empty();
        if !self.ledger.is_empty() {
            generation.generation_info.insert(
                "mcp_task_results".to_string(),
                serde_json::to_value(&self.ledger).unwrap_or(Value::Null),
            );
        }
        if has_results {
            generation
                .generation_info
                .insert("mcp_execution_rounds".to_string(), json!(self.rounds_executed));
        }
        for (key, value) in self.fc_info {
            generation.generation_info.insert(key, value);
        }

        generation
    }
}

impl Orchestrator {
    /// Run the execution loop over an initial generation that requested
    /// tool work.
    pub(crate) async fn execute_and_feedback(
        &self,
        generation: Generation,
        user_messages: Vec<Message>,
        options: GenerateOptions,
    ) -> Result<Generation> {
        let mut state = ExecutionState::new(generation, user_messages, options);

        notify(
            &state.options.state_notify,
            ExecutionEvent::new(
                EventType::ProcessStart,
                Stage::Start,
                json!({"mode": state.options.work_mode.to_string()}),
            ),
        );

        while state.round < state.options.max_rounds {
            state.round += 1;
            notify(
                &state.options.state_notify,
                ExecutionEvent::new(
                    EventType::ExecutionRound,
                    Stage::Start,
                    json!({"round": state.round, "max_rounds": state.options.max_rounds}),
                ),
            );

            let executed = match state.options.work_mode {
                WorkMode::Text => self.execute_text_round(&mut state).await,
                WorkMode::FunctionCall => self.execute_function_call_round(&mut state).await,
            };

            if !executed {
                break;
            }
            state.rounds_executed += 1;

            if state.round >= state.options.max_rounds {
                // Budget spent: one terminal call that must answer without
                // further tool use.
                self.feedback_round(&mut state, true).await?;
                break;
            }

            self.feedback_round(&mut state, false).await?;
        }

        notify(
            &state.options.state_notify,
            ExecutionEvent::new(
                EventType::ProcessComplete,
                Stage::Complete,
                json!({
                    "has_results": !state.ledger.is_empty() || !state.fc_info.is_empty(),
                    "mode": state.options.work_mode.to_string(),
                    "execution_rounds": state.rounds_executed,
                }),
            ),
        );

        Ok(state.into_final_generation())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Text-mode rounds
    // ─────────────────────────────────────────────────────────────────────

    /// Returns whether the round dispatched any work.
    async fn execute_text_round(&self, state: &mut ExecutionState) -> bool {
        notify(
            &state.options.state_notify,
            ExecutionEvent::new(
                EventType::ExtractingTasks,
                Stage::Start,
                json!({"round": state.round}),
            ),
        );

        let tag = state.options.effective_task_tag().to_string();
        let mut tasks = parser::extract_tasks(&state.current.content, &tag);
        if tag != FALLBACK_TASK_TAG {
            tasks.extend(parser::extract_tasks(&state.current.content, FALLBACK_TASK_TAG));
        }

        let executed = state.executed_texts();
        let new_tasks: Vec<McpTask> = tasks
            .into_iter()
            .filter(|task| !executed.contains(&task.text))
            .collect();

        notify(
            &state.options.state_notify,
            ExecutionEvent::new(
                EventType::ExtractingTasks,
                Stage::Complete,
                json!({"round": state.round, "task_count": new_tasks.len()}),
            ),
        );

        if new_tasks.is_empty() {
            return false;
        }

        let mut round_results = Vec::with_capacity(new_tasks.len());
        for task in new_tasks {
            round_results.push(self.dispatch_task(state, task).await);
        }

        self.stream_results(
            state,
            round_results.iter().map(record_from_task_result).collect(),
        );
        state.ledger.extend(round_results);
        true
    }

    async fn dispatch_task(&self, state: &ExecutionState, task: McpTask) -> TaskResult {
        let qualified = task.qualified_name();
        if state.options.disabled_tools.contains(&qualified) {
            tracing::warn!(tool = %qualified, "dropping task for disabled tool");
            return TaskResult::failure(task, format!("tool {} is disabled", qualified));
        }

        notify(
            &state.options.state_notify,
            ExecutionEvent::for_tool(
                EventType::ToolCall,
                Stage::Start,
                &task.server,
                &task.tool,
                Value::Object(task.args.clone()),
            ),
        );

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

        let data = match (&result.result, &result.error) {
            (_, Some(error)) => json!({"error": error}),
            (value, None) => json!({"result": value}),
        };
        notify(
            &state.options.state_notify,
            ExecutionEvent::for_tool(
                EventType::ToolResult,
                Stage::Complete,
                &result.task.server,
                &result.task.tool,
                data,
            ),
        );

        result
    }

    // ─────────────────────────────────────────────────────────────────────
    // Function-call rounds
    // ─────────────────────────────────────────────────────────────────────

    /// Returns whether the round dispatched any work.
    async fn execute_function_call_round(&self, state: &mut ExecutionState) -> bool {
        let calls = state.current.tool_calls.clone();

        notify(
            &state.options.state_notify,
            ExecutionEvent::new(
                EventType::ProcessingToolCalls,
                Stage::Start,
                json!({"round": state.round, "call_count": calls.len()}),
            ),
        );

        if calls.is_empty() {
            notify(
                &state.options.state_notify,
                ExecutionEvent::new(
                    EventType::ProcessingToolCalls,
                    Stage::Complete,
                    json!({"round": state.round}),
                ),
            );
            return false;
        }

        let mut records = Vec::with_capacity(calls.len());
        for call in &calls {
            if let Some(record) = self.dispatch_tool_call(state, call).await {
                records.push(record);
            }
        }

        notify(
            &state.options.state_notify,
            ExecutionEvent::new(
                EventType::ProcessingToolCalls,
                Stage::Complete,
                json!({"round": state.round}),
            ),
        );

        self.stream_results(state, records);
        true
    }

    /// Dispatch one native tool call. Malformed names or argument strings
    /// are skipped silently, like malformed text-mode tasks.
    async fn dispatch_tool_call(
        &self,
        state: &mut ExecutionState,
        call: &ToolCall,
    ) -> Option<ToolExecutionRecord> {
        let (server, tool) = call.function.name.split_once('.')?;
        let (server, tool) = (server.trim().to_string(), tool.trim().to_string());
        if server.is_empty() || tool.is_empty() {
            return None;
        }

        let args: Map<String, Value> = serde_json::from_str(&call.function.arguments).ok()?;

        let mut record = ToolExecutionRecord {
            server: server.clone(),
            tool: tool.clone(),
            args: args.clone(),
            status: ExecutionStatus::Error,
            result: None,
            error: None,
            id: Some(call.id.clone()),
        };

        let qualified = format!("{}.{}", server, tool);
        if state.options.disabled_tools.contains(&qualified) {
            tracing::warn!(tool = %qualified, "dropping tool call for disabled tool");
            let error = format!("tool {} is disabled", qualified);
            self.store_call_outcome(state, &call.id, Err(&error));
            record.error = Some(error);
            return Some(record);
        }

        notify(
            &state.options.state_notify,
            ExecutionEvent::for_tool(
                EventType::ToolCall,
                Stage::Start,
                &server,
                &tool,
                json!({"call_id": call.id}),
            ),
        );

        let outcome = self.host.execute_tool(&server, &tool, args).await;
        let data = match outcome {
            Ok(r) if r.is_error() => {
                let error = r.text_content().unwrap_or_else(|| "tool error".to_string());
                self.store_call_outcome(state, &call.id, Err(&error));
                record.error = Some(error.clone());
                json!({"call_id": call.id, "error": error})
            }
            Ok(r) => {
                let value = call_result_value(r);
                self.store_call_outcome(state, &call.id, Ok(&value));
                record.status = ExecutionStatus::Success;
                record.result = Some(value.clone());
                json!({"call_id": call.id, "result": value})
            }
            Err(e) => {
                let error = e.to_string();
                self.store_call_outcome(state, &call.id, Err(&error));
                record.error = Some(error.clone());
                json!({"call_id": call.id, "error": error})
            }
        };

        notify(
            &state.options.state_notify,
            ExecutionEvent::for_tool(EventType::ToolResult, Stage::Complete, &server, &tool, data),
        );

        Some(record)
    }

    /// Record a call outcome under `tool_result_<id>` / `tool_error_<id>`,
    /// both on the current generation (for feedback construction) and in
    /// the run-wide accumulator (for the final generation).
    fn store_call_outcome(
        &self,
        state: &mut ExecutionState,
        call_id: &str,
        outcome: std::result::Result<&Value, &str>,
    ) {
        let (key, value) = match outcome {
            Ok(value) => (format!("tool_result_{}", call_id), value.clone()),
            Err(error) => (format!("tool_error_{}", call_id), json!(error)),
        };
        state
            .current
            .generation_info
            .insert(key.clone(), value.clone());
        state.fc_info.insert(key, value);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Streaming
    // ─────────────────────────────────────────────────────────────────────

    /// Emit one round's result batch. Text mode opens the batch with a
    /// result-tag marker in the captured output.
    fn stream_results(&self, state: &ExecutionState, records: Vec<ToolExecutionRecord>) {
        let Some(sink) = &state.options.stream_sink else {
            return;
        };
        if records.is_empty() {
            return;
        }

        if state.options.work_mode == WorkMode::Text {
            state
                .captured
                .lock()
                .unwrap()
                .push_str(&format!("<{}>", state.options.effective_result_tag()));
        }
        sink(SinkEvent::Results(records));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Feedback
    // ─────────────────────────────────────────────────────────────────────

    /// Rebuild the conversation from scratch and call the model again. The
    /// new generation becomes current; its content lands in the captured
    /// output (via the sink wrapper when streaming, directly otherwise).
    async fn feedback_round(&self, state: &mut ExecutionState, terminal: bool) -> Result<()> {
        let messages = self.build_feedback_messages(state, terminal).await;

        notify(
            &state.options.state_notify,
            ExecutionEvent::new(
                EventType::IntermediateGeneration,
                Stage::Start,
                json!({"round": state.round}),
            ),
        );

        let mut next = match self.feedback_llm_call(state, &messages).await {
            Ok(generation) => generation,
            Err(e) => {
                notify(
                    &state.options.state_notify,
                    ExecutionEvent::new(
                        EventType::IntermediateGeneration,
                        Stage::Error,
                        json!({"round": state.round, "error": e.to_string()}),
                    ),
                );
                return Err(e.into());
            }
        };

        notify(
            &state.options.state_notify,
            ExecutionEvent::new(
                EventType::IntermediateGeneration,
                Stage::Complete,
                json!({"round": state.round}),
            ),
        );

        next.work_mode = state.current.work_mode;
        next.task_tag = state.current.task_tag.clone();
        next.result_tag = state.current.result_tag.clone();
        next.system_prompt = state.current.system_prompt.clone();

        if state.options.stream_sink.is_none() {
            state.captured.lock().unwrap().push_str(&next.content);
        }
        state.current = next;

        Ok(())
    }

    async fn feedback_llm_call(
        &self,
        state: &ExecutionState,
        messages: &[Message],
    ) -> relay_llm::Result<Generation> {
        match &state.options.stream_sink {
            Some(sink) => {
                let sink = sink.clone();
                let captured = state.captured.clone();
                let delta_sink: DeltaSink = Arc::new(move |chunk: &str| {
                    captured.lock().unwrap().push_str(chunk);
                    sink(SinkEvent::Delta(chunk.to_string()));
                });
                self.llm
                    .complete_stream(messages, &state.options.llm, delta_sink)
                    .await
            }
            None => self.llm.complete(messages, &state.options.llm).await,
        }
    }

    /// Feedback messages are rebuilt from scratch each round: system prompt,
    /// the original user message(s), every tool result ever observed, and
    /// one guidance message.
    async fn build_feedback_messages(
        &self,
        state: &ExecutionState,
        terminal: bool,
    ) -> Vec<Message> {
        match state.options.work_mode {
            WorkMode::Text => self.build_text_feedback(state, terminal).await,
            WorkMode::FunctionCall => build_function_call_feedback(state, terminal),
        }
    }

    async fn build_text_feedback(&self, state: &ExecutionState, terminal: bool) -> Vec<Message> {
        let catalog_text = catalog::format_tools_text(
            &self.host,
            state.options.effective_task_tag(),
            &state.options.disabled_tools,
        )
        .await;

        let mut system = state.options.templates.system_prompt.trim().to_string();
        if !catalog_text.is_empty() {
            system.push_str("\n\n");
            system.push_str(&catalog_text);
        }

        let mut messages = vec![Message::system(system)];
        messages.extend(state.user_messages.iter().cloned());

        let result_tag = state.options.effective_result_tag();
        for result in &state.ledger {
            let message = match &result.error {
                Some(error) => state.options.templates.render_tool_error(
                    result_tag,
                    &result.task.server,
                    &result.task.tool,
                    error,
                ),
                None => {
                    let result_json = result
                        .result
                        .as_ref()
                        .and_then(|value| serde_json::to_string(value).ok())
                        .unwrap_or_default();
                    state
                        .options
                        .templates
                        .render_tool_result(result_tag, &result_json)
                }
            };
            messages.push(Message::user(message));
        }

        messages.push(Message::user(guidance(state, terminal)));
        messages
    }
}

fn build_function_call_feedback(state: &ExecutionState, terminal: bool) -> Vec<Message> {
    let mut messages = vec![Message::system(
        state.options.templates.function_call_system.clone(),
    )];
    messages.push(Message::user(format!(
        "{}{}",
        state.options.templates.user_question_prefix, state.prompt
    )));
    messages.push(Message::assistant_with_tool_calls(
        "",
        state.current.tool_calls.clone(),
    ));

    for call in &state.current.tool_calls {
        let error_key = format!("tool_error_{}", call.id);
        let result_key = format!("tool_result_{}", call.id);

        let content = if let Some(error) = state
            .current
            .generation_info
            .get(&error_key)
            .and_then(Value::as_str)
            .filter(|error| !error.is_empty())
        {
            format!("Error: {}", error)
        } else if let Some(result) = state.current.generation_info.get(&result_key) {
            serde_json::to_string(result).unwrap_or_default()
        } else {
            // Calls that never produced an outcome are omitted.
            continue;
        };

        messages.push(Message::tool(&call.id, content));
    }

    messages.push(Message::user(guidance(state, terminal)));
    messages
}

fn guidance(state: &ExecutionState, terminal: bool) -> String {
    if terminal {
        state.options.templates.final_result.clone()
    } else {
        state
            .options
            .templates
            .render_next_round(state.remaining_rounds())
    }
}

/// Collapse a tool-call result into one JSON value: a lone text item becomes
/// a plain string, anything else keeps the content list structure.
pub(crate) fn call_result_value(result: CallToolResult) -> Value {
    if result.content.len() == 1 {
        if let ToolContent::Text { text } = &result.content[0] {
            return Value::String(text.clone());
        }
    }
    serde_json::to_value(&result.content).unwrap_or(Value::Null)
}

fn record_from_task_result(result: &TaskResult) -> ToolExecutionRecord {
    ToolExecutionRecord {
        server: result.task.server.clone(),
        tool: result.task.tool.clone(),
        args: result.task.args.clone(),
        status: if result.is_error() {
            ExecutionStatus::Error
        } else {
            ExecutionStatus::Success
        },
        result: result.result.clone(),
        error: result.error.clone(),
        id: None,
    }
}
