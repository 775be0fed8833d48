//! On-disk projection of the store.
//!
//! State file: `{ name: {enabled, status, toolCount, error?, errorType?, errorDetails?, lastUpdate?} }`.
//! Tools file: `{ name: [{name, description}] }`.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BackendState, BackendStatus, ToolDescriptor};
use crate::config::BackendConfig;
use crate::error::HubError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub status: BackendStatus,
    #[serde(default)]
    pub tool_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

pub fn render_states(
    states: &BTreeMap<String, BackendState>,
    tools: &BTreeMap<String, Vec<ToolDescriptor>>,
) -> crate::Result<Vec<u8>> {
    let persisted: BTreeMap<&str, PersistedState> = states
        .iter()
        .map(|(name, state)| {
            let entry = PersistedState {
                enabled: state.config.enabled,
                status: state.status,
                tool_count: tools.get(name).map_or(0, Vec::len),
                error: state.error.clone(),
                error_type: state.error_type.clone(),
                error_details: state.error_details.clone(),
                last_update: state.last_update,
            };
            (name.as_str(), entry)
        })
        .collect();
    Ok(serde_json::to_vec_pretty(&persisted)?)
}

pub fn render_tools(tools: &BTreeMap<String, Vec<ToolDescriptor>>) -> crate::Result<Vec<u8>> {
    let persisted: BTreeMap<&str, Vec<PersistedTool>> = tools
        .iter()
        .map(|(name, list)| {
            let entries = list
                .iter()
                .map(|tool| PersistedTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                })
                .collect();
            (name.as_str(), entries)
        })
        .collect();
    Ok(serde_json::to_vec_pretty(&persisted)?)
}

async fn read_snapshot<T: for<'de> Deserialize<'de>>(path: &Path) -> crate::Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| HubError::Persistence(path.display().to_string(), e.to_string()))?;
    serde_json::from_str(&content)
        .map_err(|e| HubError::Persistence(path.display().to_string(), format!("malformed snapshot: {e}")))
}

/// Load the state snapshot.
///
/// No process survives a restart, so `connected` and `updating` entries come
/// back as `disabled`. Only the `enabled` flag of the config is persisted;
/// the rest is filled in by the next configuration apply.
pub async fn load_states(path: &Path) -> crate::Result<BTreeMap<String, BackendState>> {
    let persisted: BTreeMap<String, PersistedState> = read_snapshot(path).await?;
    Ok(persisted
        .into_iter()
        .map(|(name, entry)| {
            let status = match entry.status {
                BackendStatus::Connected | BackendStatus::Updating => BackendStatus::Disabled,
                other => other,
            };
            let mut state = BackendState {
                status,
                config: BackendConfig {
                    enabled: entry.enabled,
                    ..BackendConfig::default()
                },
                error: entry.error,
                error_type: entry.error_type,
                error_details: entry.error_details,
                last_update: entry.last_update,
            };
            if status != BackendStatus::Error {
                state.error = None;
                state.error_type = None;
                state.error_details = None;
            }
            state.normalize();
            (name, state)
        })
        .collect())
}

/// Load the tools snapshot, tagging each tool with its backend.
pub async fn load_tools(path: &Path) -> crate::Result<BTreeMap<String, Vec<ToolDescriptor>>> {
    let persisted: BTreeMap<String, Vec<PersistedTool>> = read_snapshot(path).await?;
    Ok(persisted
        .into_iter()
        .map(|(server, tools)| {
            let tools = tools
                .into_iter()
                .map(|tool| ToolDescriptor {
                    name: tool.name,
                    description: tool.description,
                    server: server.clone(),
                    input_schema: None,
                })
                .collect();
            (server, tools)
        })
        .collect())
}
