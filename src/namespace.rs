//! Tool namespacing for the aggregated catalog.
//!
//! Aggregated names join the backend name and the backend-local tool name
//! with a single underscore (e.g., `github_search`).

use serde::Serialize;
use serde_json::Value;

use crate::state::ToolDescriptor;

/// A tool as exposed by the hub, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedTool {
    /// `{server}_{original_name}`.
    pub name: String,
    pub original_name: String,
    pub server: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Aggregated name of a backend-local tool.
/// E.g., server="github", tool="search" -> "github_search"
pub fn namespace_tool_name(server: &str, tool: &str) -> String {
    format!("{}_{}", server, tool)
}

/// Lift a backend's tool into the aggregated catalog.
pub fn namespace_tool(server: &str, tool: &ToolDescriptor) -> AggregatedTool {
    AggregatedTool {
        name: namespace_tool_name(server, &tool.name),
        original_name: tool.name.clone(),
        server: server.to_string(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
    }
}
