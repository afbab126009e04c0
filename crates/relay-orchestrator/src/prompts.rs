//! Default tags and prompt templates.
//!
//! Templates use named `{placeholder}` substitution; [`render`] replaces only
//! the placeholders it is given, so a template missing a placeholder is used
//! verbatim.

/// Default tag wrapping task JSON in text mode.
pub const DEFAULT_TASK_TAG: &str = "MCP_HOST_TASK";

/// Default tag opening streamed tool-result blocks.
pub const DEFAULT_RESULT_TAG: &str = "MCP_HOST_RESULT";

/// Hard-coded fallback task tag, scanned in addition to the configured one
/// to tolerate models that ignore it.
pub const FALLBACK_TASK_TAG: &str = "tools";

/// Default round budget for the execution loop.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// Default text-mode system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are now an MCP AI assistant with multi-step reasoning and tool execution capabilities.
When I give you a task, if you need to call external tools or services, please put your tool call request inside <MCP_HOST_TASK> and </MCP_HOST_TASK> tags.
Please strictly use the following format:
<MCP_HOST_TASK>
{"server":"serverId", "tool":"toolName", "args":{parameters}}
</MCP_HOST_TASK>

For example, if you need to get the current time from server "server1", you should return:
<MCP_HOST_TASK>
{"server":"server1", "tool":"get_current_time", "args":{}}
</MCP_HOST_TASK>

You can execute multiple tools in sequence, where each tool's result may inform your next tool selection. Think carefully about the order of tool execution and how to combine their results to solve complex problems.

For tasks requiring multiple steps:
1. First analyze what information you need and which tools would provide that information
2. Execute tools in a logical sequence, using the output of one tool to inform the parameters of the next tool
3. After receiving all necessary information, synthesize the results into a comprehensive answer

You should think first and provide your analysis, then suggest using tools. Don't immediately call tools at the beginning of your response.

IMPORTANT: When you have all the information needed to fully answer the user's question and no further tool calls are required, provide a comprehensive final response that:
- Summarizes all the key information you've gathered
- Directly answers the user's original question
- Presents any relevant insights or conclusions based on the data
- Does NOT suggest additional tool calls or mention needing more information if you already have sufficient data
- You need to use "[User Question]"'s language to answer the question.

Make sure your response is clear, accurate, and strictly follows the format above."#;

/// Default template for a successful tool result message.
/// Placeholders: `{tag}`, `{result}`.
pub const DEFAULT_TOOL_RESULT_TEMPLATE: &str = "I have used a tool and received the following result:\n<{tag}>\n{result}\n</{tag}>";

/// Default template for a failed tool message.
/// Placeholders: `{tag}`, `{server}`, `{tool}`, `{error}`.
pub const DEFAULT_TOOL_ERROR_TEMPLATE: &str =
    "Tool execution error:\n<{tag}>\n{server}.{tool}: {error}\n</{tag}>";

/// Default guidance for intermediate rounds. Placeholder: `{rounds}`.
pub const DEFAULT_NEXT_ROUND_TEMPLATE: &str = "Based on these results, you can use additional tools if needed (up to {rounds} more rounds). Please continue your analysis.";

/// Default guidance for the terminal round.
pub const DEFAULT_FINAL_RESULT_TEMPLATE: &str =
    "Based on these results, use no more tools and give me the final answer.";

/// Default system prompt for function-call mode.
pub const DEFAULT_FUNCTION_CALL_SYSTEM_PROMPT: &str = "You are an AI assistant that can use tools in a multi-step process to help users solve complex problems. After receiving tool results, carefully analyze them to determine if additional tools need to be called. Please provide a complete response based on all tool call results.";

/// Prefix for the user question in function-call feedback messages.
pub const DEFAULT_USER_QUESTION_PREFIX: &str = "[User Question]: ";

/// Replace `{name}` placeholders in a template.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}
