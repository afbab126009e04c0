//! Task extraction from tag-delimited model output.
//!
//! Text-mode models request tool invocations by emitting JSON wrapped in an
//! XML-like tag. Two JSON shapes are accepted:
//!
//! ```text
//! {"server": "srv1", "tool": "get_current_time", "args": {}}
//! {"name": "srv1.get_current_time", "arguments": {}}
//! ```
//!
//! Malformed entries are skipped silently; they never abort a round.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One pending tool invocation parsed from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTask {
    /// Target server id.
    pub server: String,
    /// Tool name on that server.
    pub tool: String,
    /// Call arguments.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// The exact JSON payload as parsed; the deduplication key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

impl McpTask {
    /// The qualified `"server.tool"` name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.server, self.tool)
    }
}

/// Paired outcome of one executed task. `result` and `error` are never both
/// populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// The executed task.
    pub task: McpTask,
    /// Result value, if the call succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description, if the call failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    /// Record a success.
    pub fn success(task: McpTask, result: Value) -> Self {
        Self {
            task,
            result: Some(result),
            error: None,
        }
    }

    /// Record a failure.
    pub fn failure(task: McpTask, error: impl Into<String>) -> Self {
        Self {
            task,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Whether this outcome is an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The two accepted JSON shapes for a task payload.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTask {
    Mcp {
        server: String,
        tool: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    Native {
        name: String,
        #[serde(default)]
        arguments: Map<String, Value>,
    },
}

/// Extract every well-formed `<tag> JSON </tag>` task from `content`.
///
/// Only text after the last `</think>` is scanned. Entries that fail JSON
/// parsing, or whose server or tool is empty, are dropped.
pub fn extract_tasks(content: &str, task_tag: &str) -> Vec<McpTask> {
    let tag = task_tag.trim();
    if tag.is_empty() {
        return Vec::new();
    }

    let Ok(re) = tag_regex(tag) else {
        tracing::debug!(tag = %tag, "task tag does not form a valid pattern");
        return Vec::new();
    };

    let content = after_last_think(content);

    re.captures_iter(content)
        .filter_map(|captures| parse_task(captures[1].trim()))
        .collect()
}

/// Whether `content` holds at least one tag-wrapped block for `task_tag` or
/// the fallback tag.
pub fn contains_tasks(content: &str, task_tag: &str, fallback_tag: &str) -> bool {
    for tag in [task_tag.trim(), fallback_tag.trim()] {
        if tag.is_empty() {
            continue;
        }
        if let Ok(re) = tag_regex(tag) {
            if re.is_match(content) {
                return true;
            }
        }
    }
    false
}

fn tag_regex(tag: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"(?s)<{0}>\s*(.*?)\s*</{0}>",
        regex::escape(tag)
    ))
}

/// Strip everything up to and including the last `</think>`.
fn after_last_think(content: &str) -> &str {
    match content.rfind("</think>") {
        Some(index) => &content[index + "</think>".len()..],
        None => content,
    }
}

fn parse_task(json_text: &str) -> Option<McpTask> {
    let raw: RawTask = serde_json::from_str(json_text).ok()?;

    let (server, tool, args) = match raw {
        RawTask::Mcp { server, tool, args } => (server, tool, args),
        RawTask::Native { name, arguments } => {
            let (server, tool) = name.split_once('.')?;
            (server.to_string(), tool.to_string(), arguments)
        }
    };

    let server = server.trim().to_string();
    let tool = tool.trim().to_string();
    if server.is_empty() || tool.is_empty() {
        return None;
    }

    Some(McpTask {
        server,
        tool,
        args,
        text: json_text.to_string(),
    })
}
