//! Tool catalog enumeration and rendering.
//!
//! The catalog is the union of tools across all live host sessions, filtered
//! by the disabled-tool list. It renders either as a human-readable system
//! prompt fragment (text mode) or as native function descriptors
//! (function-call mode). A server that fails to list its tools is skipped;
//! the catalog degrades instead of failing.

use relay_llm::{FunctionDefinition, Tool};
use relay_mcp::McpHost;
use serde_json::Value;

/// Build native function descriptors for every enabled tool.
///
/// Descriptor names are the qualified `"server.tool"` form; descriptions are
/// prefixed with the originating server.
pub async fn collect_function_tools(host: &McpHost, disabled_tools: &[String]) -> Vec<Tool> {
    let mut tools = Vec::new();

    for server_id in host.server_ids().await {
        let listed = match host.list_tools(&server_id).await {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "failed to list tools, skipping server");
                continue;
            }
        };

        for info in listed.tools {
            let qualified = format!("{}.{}", server_id, info.name);
            if disabled_tools.contains(&qualified) {
                continue;
            }

            tools.push(Tool::function(FunctionDefinition {
                name: qualified,
                description: format!(
                    "[Server: {}] {}",
                    server_id,
                    info.description.unwrap_or_default()
                ),
                parameters: info.input_schema,
            }));
        }
    }

    tools
}

/// Render the catalog as the text-mode system prompt fragment.
///
/// Tools are grouped by server; parameter lines are sorted for deterministic
/// output. A trailing block shows the tag-wrapped JSON shape the model must
/// emit. An empty catalog renders as the empty string.
pub async fn format_tools_text(host: &McpHost, task_tag: &str, disabled_tools: &[String]) -> String {
    let mut out = String::from("Available tools:\n\n");
    let mut has_tools = false;

    for server_id in host.server_ids().await {
        let listed = match host.list_tools(&server_id).await {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "failed to list tools, skipping server");
                continue;
            }
        };

        let enabled: Vec<_> = listed
            .tools
            .into_iter()
            .filter(|info| !disabled_tools.contains(&format!("{}.{}", server_id, info.name)))
            .collect();
        if enabled.is_empty() {
            continue;
        }

        has_tools = true;
        out.push_str(&format!("Server '{}':\n", server_id));

        for info in enabled {
            out.push_str(&format!(
                "  - {}: {}\n",
                info.name,
                info.description.unwrap_or_default()
            ));

            let mut lines = info
                .input_schema
                .as_ref()
                .map(schema_param_lines)
                .unwrap_or_default();
            if !lines.is_empty() {
                lines.sort();
                out.push_str("    Parameters:\n");
                out.push_str(&lines.join("\n"));
                out.push('\n');
            }
        }
        out.push('\n');
    }

    if !has_tools {
        return String::new();
    }

    out.push_str(&format!(
        "To call a tool, wrap one JSON object in <{0}> tags:\n<{0}>\n{{\"server\": \"<serverId>\", \"tool\": \"<toolName>\", \"args\": {{}}}}\n</{0}>\n",
        task_tag
    ));

    out
}

/// Render one parameter line per property of a JSON schema.
///
/// Array-typed parameters include their element type as `array<T>`.
fn schema_param_lines(schema: &Value) -> Vec<String> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };

    properties
        .iter()
        .map(|(name, details)| {
            let mut param_type = details
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if param_type == "array" {
                if let Some(item_type) = details
                    .get("items")
                    .and_then(|items| items.get("type"))
                    .and_then(Value::as_str)
                {
                    param_type = format!("array<{}>", item_type);
                }
            }

            let description = details
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");

            format!("      - {}: {}, {}", name, param_type, description)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_mcp::{CallToolParams, CallToolResult, ListToolsResult, ToolInfo, ToolServer};
    use std::sync::Arc;

    struct CatalogServer {
        tools: Vec<ToolInfo>,
    }

    #[async_trait::async_trait]
    impl ToolServer for CatalogServer {
        async fn list_tools(&self) -> relay_mcp::Result<ListToolsResult> {
            Ok(ListToolsResult {
                tools: self.tools.clone(),
            })
        }

        async fn call_tool(&self, _params: CallToolParams) -> relay_mcp::Result<CallToolResult> {
            Ok(CallToolResult::text("unused"))
        }
    }

    fn tool(name: &str, description: &str, schema: Option<Value>) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: schema,
        }
    }

    async fn host_with(tools: Vec<ToolInfo>) -> McpHost {
        let host = McpHost::new();
        host.connect_in_process("srv1", Arc::new(CatalogServer { tools }))
            .await
            .unwrap();
        host
    }

    #[tokio::test]
    async fn test_empty_catalog_renders_empty_string() {
        let host = McpHost::new();
        let text = format_tools_text(&host, "MCP_HOST_TASK", &[]).await;
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn test_text_rendering_groups_and_sorts() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "zone": {"type": "string", "description": "IANA timezone"},
                "format": {"type": "string", "description": "output format"},
                "offsets": {
                    "type": "array",
                    "items": {"type": "integer"},
                    "description": "extra offsets"
                }
            }
        });
        let host = host_with(vec![tool("get_current_time", "Return the time", Some(schema))]).await;

        let text = format_tools_text(&host, "MCP_HOST_TASK", &[]).await;

        assert!(text.starts_with("Available tools:"));
        assert!(text.contains("Server 'srv1':"));
        assert!(text.contains("  - get_current_time: Return the time"));
        assert!(text.contains("    Parameters:"));
        // Lexicographic parameter order, with array element types surfaced.
        let format_pos = text.find("- format:").unwrap();
        let offsets_pos = text.find("- offsets: array<integer>").unwrap();
        let zone_pos = text.find("- zone:").unwrap();
        assert!(format_pos < offsets_pos && offsets_pos < zone_pos);
        // Trailing instruction block shows the literal wire shape.
        assert!(text.contains("<MCP_HOST_TASK>\n{\"server\": \"<serverId>\""));
    }

    #[tokio::test]
    async fn test_disabled_tools_filtered_from_both_renderings() {
        let host = host_with(vec![
            tool("safe", "ok", None),
            tool("dangerous", "no", None),
        ])
        .await;
        let disabled = vec!["srv1.dangerous".to_string()];

        let text = format_tools_text(&host, "MCP_HOST_TASK", &disabled).await;
        assert!(text.contains("safe"));
        assert!(!text.contains("dangerous"));

        let tools = collect_function_tools(&host, &disabled).await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "srv1.safe");
    }

    #[tokio::test]
    async fn test_server_with_all_tools_disabled_is_omitted() {
        let host = host_with(vec![tool("only", "x", None)]).await;
        let disabled = vec!["srv1.only".to_string()];

        let text = format_tools_text(&host, "MCP_HOST_TASK", &disabled).await;
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn test_function_descriptors_carry_server_prefix() {
        let schema = serde_json::json!({"type": "object", "properties": {}});
        let host = host_with(vec![tool("echo", "Echo input", Some(schema.clone()))]).await;

        let tools = collect_function_tools(&host, &[]).await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_type, "function");
        assert_eq!(tools[0].function.name, "srv1.echo");
        assert_eq!(tools[0].function.description, "[Server: srv1] Echo input");
        assert_eq!(tools[0].function.parameters, Some(schema));
    }

    #[test]
    fn test_schema_param_lines_without_properties() {
        assert!(schema_param_lines(&serde_json::json!({"type": "object"})).is_empty());
        assert!(schema_param_lines(&serde_json::json!("not a schema")).is_empty());
    }
}
