//! Backend connectivity state and tool catalogs.
//!
//! [`StateStore`] is the authoritative in-memory owner of every
//! [`BackendState`] and tool list. Files on disk are a projection written
//! through the coalescing [`SaveQueue`].

pub mod save_queue;
mod slots;
pub mod snapshot;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BackendConfig;
use crate::error::HubError;

pub use save_queue::SaveQueue;
pub use store::{StateStore, StorePaths};

/// Connectivity status of one backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    #[default]
    Disabled,
    Updating,
    Connected,
    Error,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Disabled => "disabled",
            BackendStatus::Updating => "updating",
            BackendStatus::Connected => "connected",
            BackendStatus::Error => "error",
        }
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(BackendStatus::Disabled),
            "updating" => Ok(BackendStatus::Updating),
            "connected" => Ok(BackendStatus::Connected),
            "error" => Ok(BackendStatus::Error),
            other => Err(format!(
                "unknown status '{other}', expected disabled, updating, connected or error"
            )),
        }
    }
}

/// Everything the hub knows about one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendState {
    pub status: BackendStatus,
    #[serde(default)]
    pub config: BackendConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl BackendState {
    /// Check the state invariants: an `error` status carries a non-empty message.
    pub fn validate(&self, name: &str) -> crate::Result<()> {
        if self.status == BackendStatus::Error
            && self.error.as_deref().is_none_or(|m| m.trim().is_empty())
        {
            return Err(HubError::Validation(
                name.to_string(),
                "status 'error' requires a non-empty error message".to_string(),
            ));
        }
        Ok(())
    }

    /// Force the invariants to hold instead of rejecting.
    pub(crate) fn normalize(&mut self) {
        if self.status == BackendStatus::Error
            && self.error.as_deref().is_none_or(|m| m.trim().is_empty())
        {
            self.error = Some("Unknown error".to_string());
        }
    }
}

/// A partial update merged into a [`BackendState`].
///
/// Error fields use `Option<Option<_>>`: outer `None` leaves the field alone,
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub status: Option<BackendStatus>,
    pub config: Option<BackendConfig>,
    pub error: Option<Option<String>>,
    pub error_type: Option<Option<String>>,
    pub error_details: Option<Option<String>>,
}

impl StatePatch {
    pub fn status(status: BackendStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch moving a backend to `error` with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(BackendStatus::Error),
            error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: BackendConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(Some(error_type.into()));
        self
    }

    pub fn with_error_details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(Some(details.into()));
        self
    }

    /// Decode a patch sent by an external collaborator as JSON
    /// (`{status?, config?, error?, errorType?, errorDetails?}`).
    ///
    /// Unknown status strings are rejected here, before any state is touched.
    pub fn from_json(name: &str, value: &Value) -> crate::Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            HubError::Validation(name.to_string(), "state patch must be an object".to_string())
        })?;

        let status = match object.get("status") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(
                s.parse::<BackendStatus>()
                    .map_err(|e| HubError::Validation(name.to_string(), e))?,
            ),
            Some(_) => {
                return Err(HubError::Validation(
                    name.to_string(),
                    "status must be a string".to_string(),
                ));
            }
        };

        let config = match object.get("config") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<BackendConfig>(raw.clone()).map_err(
                |e| HubError::Validation(name.to_string(), format!("invalid config: {e}")),
            )?),
        };

        let text_field = |key: &str| -> crate::Result<Option<Option<String>>> {
            match object.get(key) {
                None => Ok(None),
                Some(Value::Null) => Ok(Some(None)),
                Some(Value::String(s)) => Ok(Some(Some(s.clone()))),
                Some(_) => Err(HubError::Validation(
                    name.to_string(),
                    format!("{key} must be a string"),
                )),
            }
        };

        Ok(Self {
            status,
            config,
            error: text_field("error")?,
            error_type: text_field("errorType")?,
            error_details: text_field("errorDetails")?,
        })
    }

    /// Merge this patch into `state`.
    ///
    /// Moving away from `error` without naming error fields clears the stale
    /// error information.
    pub(crate) fn apply_to(&self, state: &mut BackendState) {
        if let Some(status) = self.status {
            let touches_errors =
                self.error.is_some() || self.error_type.is_some() || self.error_details.is_some();
            if status != BackendStatus::Error && !touches_errors {
                state.error = None;
                state.error_type = None;
                state.error_details = None;
            }
            state.status = status;
        }
        if let Some(config) = &self.config {
            state.config = config.clone();
        }
        if let Some(error) = &self.error {
            state.error = error.clone();
        }
        if let Some(error_type) = &self.error_type {
            state.error_type = error_type.clone();
        }
        if let Some(details) = &self.error_details {
            state.error_details = details.clone();
        }
    }
}

/// One tool as reported by its backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Backend-local tool name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Owning backend.
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            server: String::new(),
            input_schema: None,
        }
    }

    /// Convert a tool discovered over MCP.
    pub fn from_mcp(server: &str, tool: &rmcp::model::Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool
                .description
                .as_deref()
                .map(str::to_string)
                .unwrap_or_default(),
            server: server.to_string(),
            input_schema: Some(Value::Object(tool.input_schema.as_ref().clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_status_requires_message() {
        let state = BackendState {
            status: BackendStatus::Error,
            ..BackendState::default()
        };
        assert!(matches!(state.validate("a"), Err(HubError::Validation(name, _)) if name == "a"));

        let blank = BackendState {
            status: BackendStatus::Error,
            error: Some("   ".to_string()),
            ..BackendState::default()
        };
        assert!(blank.validate("a").is_err());
    }

    #[test]
    fn test_normalize_fills_missing_message() {
        let mut state = BackendState {
            status: BackendStatus::Error,
            ..BackendState::default()
        };
        state.normalize();
        assert_eq!(state.error.as_deref(), Some("Unknown error"));
        assert!(state.validate("a").is_ok());
    }

    #[test]
    fn test_patch_from_json_rejects_unknown_status() {
        let result = StatePatch::from_json("a", &json!({"status": "sleeping"}));
        assert!(matches!(result, Err(HubError::Validation(_, msg)) if msg.contains("sleeping")));
    }

    #[test]
    fn test_patch_from_json_fields() {
        let patch = StatePatch::from_json(
            "a",
            &json!({"status": "error", "error": "boom", "errorType": "spawn", "errorDetails": null}),
        )
        .unwrap();
        assert_eq!(patch.status, Some(BackendStatus::Error));
        assert_eq!(patch.error, Some(Some("boom".to_string())));
        assert_eq!(patch.error_type, Some(Some("spawn".to_string())));
        assert_eq!(patch.error_details, Some(None));
        assert_eq!(patch.config, None);
    }

    #[test]
    fn test_leaving_error_clears_stale_fields() {
        let mut state = BackendState::default();
        StatePatch::failed("boom")
            .with_error_type("spawn")
            .apply_to(&mut state);
        assert_eq!(state.error.as_deref(), Some("boom"));

        StatePatch::status(BackendStatus::Updating).apply_to(&mut state);
        assert_eq!(state.status, BackendStatus::Updating);
        assert!(state.error.is_none());
        assert!(state.error_type.is_none());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(BackendStatus::Connected).unwrap(),
            json!("connected")
        );
        assert_eq!("updating".parse::<BackendStatus>(), Ok(BackendStatus::Updating));
    }
}
