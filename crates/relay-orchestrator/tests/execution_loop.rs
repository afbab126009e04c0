//! End-to-end tests of the execution loop over a scripted LLM and
//! in-process tool servers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use relay_llm::{Generation, MockLlm, ToolCall};
use relay_mcp::{
    CallToolParams, CallToolResult, ListToolsResult, McpError, McpHost, ToolInfo, ToolServer,
};
use relay_orchestrator::{
    EventType, GenerateOptions, Orchestrator, OrchestratorError, Role, SinkEvent, StateNotify,
    StreamSink, WorkMode,
};
use serde_json::{Map, Value, json};

// ─────────────────────────────────────────────────────────────────────────────
// Test plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// In-process tool server with canned per-tool responses.
#[derive(Default)]
struct ScriptedServer {
    tools: Vec<ToolInfo>,
    responses: HashMap<String, String>,
    failures: HashMap<String, String>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl ScriptedServer {
    fn with_tool(mut self, name: &str, response: &str) -> Self {
        self.tools.push(ToolInfo {
            name: name.to_string(),
            description: Some(format!("{} tool", name)),
            input_schema: None,
        });
        self.responses.insert(name.to_string(), response.to_string());
        self
    }

    fn with_failing_tool(mut self, name: &str, error: &str) -> Self {
        self.tools.push(ToolInfo {
            name: name.to_string(),
            description: Some(format!("{} tool", name)),
            input_schema: None,
        });
        self.failures.insert(name.to_string(), error.to_string());
        self
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn called_tools(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ToolServer for ScriptedServer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn list_tools(&self) -> relay_mcp::Result<ListToolsResult> {
        Ok(ListToolsResult {
            tools: self.tools.clone(),
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> relay_mcp::Result<CallToolResult> {
        let args = params
            .arguments
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        self.calls.lock().unwrap().push((params.name.clone(), args));

        if let Some(error) = self.failures.get(&params.name) {
            return Err(McpError::protocol(error.clone()));
        }
        match self.responses.get(&params.name) {
            Some(response) => Ok(CallToolResult::text(response)),
            None => Err(McpError::protocol(format!("unknown tool {}", params.name))),
        }
    }
}

async fn orchestrator_with(
    server: Arc<ScriptedServer>,
    llm: Arc<MockLlm>,
) -> Orchestrator {
    let host = Arc::new(McpHost::new());
    host.connect_in_process("srv1", server).await.unwrap();
    Orchestrator::new(llm, host)
}

fn collecting_sink() -> (StreamSink, Arc<Mutex<Vec<SinkEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink: StreamSink = {
        let events = events.clone();
        Arc::new(move |event| events.lock().unwrap().push(event))
    };
    (sink, events)
}

const TIME_TASK_JSON: &str = r#"{"server":"srv1","tool":"get_current_time","args":{}}"#;

fn tagged(payload: &str) -> String {
    format!("<MCP_HOST_TASK>\n{}\n</MCP_HOST_TASK>", payload)
}

// ─────────────────────────────────────────────────────────────────────────────
// Text mode
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_task_text_mode_one_round() {
    let server = Arc::new(
        ScriptedServer::default().with_tool("get_current_time", "2024-01-01T12:00:00Z"),
    );
    let first_reply = tagged(TIME_TASK_JSON);
    let llm = Arc::new(MockLlm::new(vec![
        Generation::text(&first_reply),
        Generation::text("It is 12:00 UTC."),
    ]));
    let orchestrator = orchestrator_with(server.clone(), llm.clone()).await;

    let (sink, sink_events) = collecting_sink();
    let generation = orchestrator
        .generate(
            "What time is it?",
            GenerateOptions::new()
                .with_auto_execute(true)
                .with_stream_sink(sink),
        )
        .await
        .unwrap();

    // Final content: first reply, result marker, final answer.
    let expected = format!("{}<MCP_HOST_RESULT>It is 12:00 UTC.", first_reply);
    assert_eq!(generation.content, expected);

    // The loop exited on the second round's zero new tasks.
    assert_eq!(generation.generation_info["mcp_execution_rounds"], json!(1));
    let results = generation.generation_info["mcp_task_results"]
        .as_array()
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["task"]["tool"], "get_current_time");
    assert_eq!(results[0]["result"], "2024-01-01T12:00:00Z");

    assert_eq!(server.call_count(), 1);
    assert_eq!(llm.request_count(), 2);

    // The sink saw every delta plus one structured result batch, and the
    // captured content reproduces that stream byte for byte.
    let events = sink_events.lock().unwrap();
    let deltas: String = events.iter().filter_map(SinkEvent::as_delta).collect();
    assert_eq!(deltas, format!("{}It is 12:00 UTC.", first_reply));

    let batches: Vec<_> = events.iter().filter_map(SinkEvent::as_results).collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].server, "srv1");
    assert_eq!(batches[0][0].result, Some(json!("2024-01-01T12:00:00Z")));
}

#[tokio::test]
async fn reissued_task_is_deduplicated() {
    let server = Arc::new(
        ScriptedServer::default().with_tool("get_current_time", "2024-01-01T12:00:00Z"),
    );
    // The model emits the identical task JSON on both rounds.
    let llm = Arc::new(MockLlm::new(vec![
        Generation::text(tagged(TIME_TASK_JSON)),
        Generation::text(tagged(TIME_TASK_JSON)),
    ]));
    let orchestrator = orchestrator_with(server.clone(), llm.clone()).await;

    let generation = orchestrator
        .generate(
            "What time is it?",
            GenerateOptions::new().with_auto_execute(true),
        )
        .await
        .unwrap();

    // Only one dispatch; the second round saw zero new tasks and exited.
    assert_eq!(server.call_count(), 1);
    assert_eq!(llm.request_count(), 2);
    assert_eq!(generation.generation_info["mcp_execution_rounds"], json!(1));
}

#[tokio::test]
async fn round_budget_forces_terminal_answer() {
    let server = Arc::new(
        ScriptedServer::default()
            .with_tool("get_current_time", "2024-01-01T12:00:00Z")
            .with_tool("get_weather", "sunny"),
    );
    // A new task every round; the budget of two rounds must cut it off.
    let llm = Arc::new(MockLlm::new(vec![
        Generation::text(tagged(TIME_TASK_JSON)),
        Generation::text(tagged(
            r#"{"server":"srv1","tool":"get_weather","args":{}}"#,
        )),
        Generation::text("Final answer."),
    ]));
    let orchestrator = orchestrator_with(server.clone(), llm.clone()).await;

    let generation = orchestrator
        .generate(
            "Time and weather?",
            GenerateOptions::new()
                .with_auto_execute(true)
                .with_max_rounds(2),
        )
        .await
        .unwrap();

    assert_eq!(server.call_count(), 2);
    assert_eq!(server.called_tools(), vec!["get_current_time", "get_weather"]);
    assert_eq!(llm.request_count(), 3);
    assert_eq!(generation.generation_info["mcp_execution_rounds"], json!(2));
    assert!(generation.content.ends_with("Final answer."));

    let requests = llm.requests();
    // Intermediate guidance names the remaining budget.
    let guidance = &requests[1].last().unwrap().content;
    assert!(guidance.contains("up to 1 more rounds"));
    // The terminal call instructs the model to answer without further tools.
    let terminal = &requests[2].last().unwrap().content;
    assert_eq!(
        terminal,
        "Based on these results, use no more tools and give me the final answer."
    );
}

#[tokio::test]
async fn disabled_tool_is_hidden_and_never_dispatched() {
    let server = Arc::new(
        ScriptedServer::default()
            .with_tool("get_current_time", "2024-01-01T12:00:00Z")
            .with_tool("dangerous", "should never run"),
    );
    // The model ignores the catalog and asks for the disabled tool anyway.
    let llm = Arc::new(MockLlm::new(vec![
        Generation::text(tagged(r#"{"server":"srv1","tool":"dangerous","args":{}}"#)),
        Generation::text("I cannot use that tool."),
    ]));
    let orchestrator = orchestrator_with(server.clone(), llm.clone()).await;

    let generation = orchestrator
        .generate(
            "Run the dangerous tool.",
            GenerateOptions::new()
                .with_auto_execute(true)
                .with_disabled_tool("srv1.dangerous"),
        )
        .await
        .unwrap();

    // The catalog never listed it.
    let requests = llm.requests();
    let system = &requests[0][0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("get_current_time"));
    assert!(!system.content.contains("dangerous"));

    // Disabled tasks are dropped before dispatch and recorded as errors,
    // so the model is told instead of the tool silently running.
    assert_eq!(server.call_count(), 0);
    let results = generation.generation_info["mcp_task_results"]
        .as_array()
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(
        results[0]["error"]
            .as_str()
            .unwrap()
            .contains("srv1.dangerous is disabled")
    );
    let feedback = &requests[1];
    assert!(
        feedback
            .iter()
            .any(|message| message.content.contains("disabled"))
    );
}

#[tokio::test]
async fn tool_error_is_fed_back_and_loop_continues() {
    let server = Arc::new(ScriptedServer::default().with_failing_tool("broken", "boom"));
    let llm = Arc::new(MockLlm::new(vec![
        Generation::text(tagged(r#"{"server":"srv1","tool":"broken","args":{}}"#)),
        Generation::text("The tool failed, sorry."),
    ]));
    let orchestrator = orchestrator_with(server.clone(), llm.clone()).await;

    let generation = orchestrator
        .generate(
            "Try the broken tool.",
            GenerateOptions::new().with_auto_execute(true),
        )
        .await
        .unwrap();

    assert_eq!(server.call_count(), 1);
    let results = generation.generation_info["mcp_task_results"]
        .as_array()
        .unwrap();
    assert!(results[0]["error"].as_str().unwrap().contains("boom"));
    assert!(results[0].get("result").is_none());

    // The error reached the model through the feedback conversation.
    let feedback = &llm.requests()[1];
    assert!(
        feedback
            .iter()
            .any(|message| message.content.contains("srv1.broken")
                && message.content.contains("boom"))
    );
}

#[tokio::test]
async fn no_auto_execute_returns_first_generation_untouched() {
    let server = Arc::new(
        ScriptedServer::default().with_tool("get_current_time", "2024-01-01T12:00:00Z"),
    );
    let reply = tagged(TIME_TASK_JSON);
    let llm = Arc::new(MockLlm::new(vec![Generation::text(&reply)]));
    let orchestrator = orchestrator_with(server.clone(), llm.clone()).await;

    let generation = orchestrator
        .generate("What time is it?", GenerateOptions::new())
        .await
        .unwrap();

    assert_eq!(generation.content, reply);
    assert_eq!(server.call_count(), 0);
    assert_eq!(llm.request_count(), 1);
}

#[tokio::test]
async fn blank_system_prompt_is_rejected_in_text_mode() {
    let server = Arc::new(ScriptedServer::default());
    let llm = Arc::new(MockLlm::new(vec![]));
    let orchestrator = orchestrator_with(server, llm.clone()).await;

    let result = orchestrator
        .generate(
            "Hello",
            GenerateOptions::new().with_system_prompt("   "),
        )
        .await;

    assert!(matches!(result, Err(OrchestratorError::Config(_))));
    // The failure happened at entry, before any LLM call.
    assert_eq!(llm.request_count(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Function-call mode
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn function_call_no_auto_appends_tag_echo() {
    let server = Arc::new(
        ScriptedServer::default()
            .with_tool("get_current_time", "2024-01-01T12:00:00Z")
            .with_tool("echo", "echoed"),
    );
    let llm = Arc::new(MockLlm::new(vec![Generation::with_tool_calls(
        "",
        vec![
            ToolCall::function("call_1", "srv1.get_current_time", "{}"),
            ToolCall::function("call_2", "srv1.echo", r#"{"text":"hi"}"#),
        ],
    )]));
    let orchestrator = orchestrator_with(server.clone(), llm.clone()).await;

    let generation = orchestrator
        .generate(
            "What time is it?",
            GenerateOptions::new().with_work_mode(WorkMode::FunctionCall),
        )
        .await
        .unwrap();

    // Both native calls echoed as tag blocks; nothing was executed.
    assert_eq!(generation.content.matches("<MCP_HOST_TASK>").count(), 2);
    assert_eq!(generation.tool_calls.len(), 2);
    assert_eq!(server.call_count(), 0);

    // The catalog went out as native tool descriptors.
    let requests = llm.requests();
    assert!(requests[0].iter().all(|message| message.role != Role::System));
}

#[tokio::test]
async fn function_call_auto_executes_and_feeds_back() {
    let server = Arc::new(
        ScriptedServer::default().with_tool("get_current_time", "2024-01-01T12:00:00Z"),
    );
    let llm = Arc::new(MockLlm::new(vec![
        Generation::with_tool_calls(
            "",
            vec![ToolCall::function("call_1", "srv1.get_current_time", "{}")],
        ),
        Generation::text("It is noon."),
    ]));
    let orchestrator = orchestrator_with(server.clone(), llm.clone()).await;

    let generation = orchestrator
        .generate(
            "What time is it?",
            GenerateOptions::new()
                .with_work_mode(WorkMode::FunctionCall)
                .with_auto_execute(true),
        )
        .await
        .unwrap();

    assert_eq!(server.call_count(), 1);
    assert_eq!(generation.generation_info["mcp_execution_rounds"], json!(1));
    assert_eq!(
        generation.generation_info["tool_result_call_1"],
        json!("2024-01-01T12:00:00Z")
    );
    assert_eq!(generation.content, "It is noon.");

    // Feedback layout: system, prefixed question, assistant tool calls,
    // one tool message per outcome, guidance.
    let feedback = &llm.requests()[1];
    assert_eq!(feedback[0].role, Role::System);
    assert!(feedback[1].content.starts_with("[User Question]: "));
    assert_eq!(feedback[2].role, Role::Assistant);
    assert_eq!(feedback[2].tool_calls.len(), 1);
    assert_eq!(feedback[3].role, Role::Tool);
    assert_eq!(feedback[3].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(feedback[3].content, "\"2024-01-01T12:00:00Z\"");
    assert!(feedback[4].content.contains("up to 2 more rounds"));
}

#[tokio::test]
async fn function_call_tool_failure_recorded_per_id() {
    let server = Arc::new(ScriptedServer::default().with_failing_tool("broken", "boom"));
    let llm = Arc::new(MockLlm::new(vec![
        Generation::with_tool_calls(
            "",
            vec![ToolCall::function("call_9", "srv1.broken", "{}")],
        ),
        Generation::text("That did not work."),
    ]));
    let orchestrator = orchestrator_with(server.clone(), llm.clone()).await;

    let generation = orchestrator
        .generate(
            "Try it.",
            GenerateOptions::new()
                .with_work_mode(WorkMode::FunctionCall)
                .with_auto_execute(true),
        )
        .await
        .unwrap();

    let error = generation.generation_info["tool_error_call_9"]
        .as_str()
        .unwrap();
    assert!(error.contains("boom"));

    let feedback = &llm.requests()[1];
    let tool_message = feedback
        .iter()
        .find(|message| message.role == Role::Tool)
        .unwrap();
    assert!(tool_message.content.starts_with("Error: "));
    assert!(tool_message.content.contains("boom"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Progress events
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn progress_events_follow_the_loop() {
    let server = Arc::new(
        ScriptedServer::default().with_tool("get_current_time", "2024-01-01T12:00:00Z"),
    );
    let llm = Arc::new(MockLlm::new(vec![
        Generation::text(tagged(TIME_TASK_JSON)),
        Generation::text("Done."),
    ]));
    let orchestrator = orchestrator_with(server, llm).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let callback: StateNotify = {
        let seen = seen.clone();
        Arc::new(move |event| seen.lock().unwrap().push((event.event_type, event.stage)))
    };

    orchestrator
        .generate(
            "What time is it?",
            GenerateOptions::new()
                .with_auto_execute(true)
                .with_state_notify(callback),
        )
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    let types: Vec<EventType> = seen.iter().map(|(event_type, _)| *event_type).collect();

    assert_eq!(types.first(), Some(&EventType::ProcessStart));
    assert_eq!(types.last(), Some(&EventType::ProcessComplete));
    assert!(types.contains(&EventType::ExecutionRound));
    assert!(types.contains(&EventType::ExtractingTasks));
    assert!(types.contains(&EventType::IntermediateGeneration));

    // tool_call{start} strictly precedes tool_result{complete}.
    let call_position = types
        .iter()
        .position(|event_type| *event_type == EventType::ToolCall)
        .unwrap();
    let result_position = types
        .iter()
        .position(|event_type| *event_type == EventType::ToolResult)
        .unwrap();
    assert!(call_position < result_position);
}
