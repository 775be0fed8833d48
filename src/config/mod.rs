//! Configuration documents: typed model, validation, repair and migration.
//!
//! The configuration document is JSON (`mcpServers`, `profiles`,
//! `activeProfile`, `version`). Raw input is never trusted to have the right
//! shape: [`repair`] normalizes it field by field, [`validate`] reports errors
//! and warnings, and [`migrate`] advances it across schema versions.

pub mod document;
pub mod migrate;
pub mod repair;
pub mod settings;
pub mod validate;
pub mod version;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Schema version stamped on documents that carry none, and the default
/// migration target.
pub const CURRENT_SCHEMA_VERSION: &str = "1.0.0";

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve `${VAR}` references in a backend's env map against the hub's own
/// environment. Literal values pass through; unknown variables resolve to
/// the empty string.
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(),
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Launch configuration for a single backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: true,
        }
    }
}

impl BackendConfig {
    /// Convenience constructor used by callers that build configs in code.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub version: String,
    #[serde(default)]
    pub profiles: BTreeMap<String, BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, BackendConfig>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_SCHEMA_VERSION.to_string(),
            profiles: BTreeMap::new(),
            active_profile: None,
            mcp_servers: BTreeMap::new(),
        }
    }
}

impl ConfigDocument {
    /// Whether a backend should be running under the current profile selection.
    ///
    /// With an active profile that exists, the profile entry decides (absent
    /// means off). Without one, the backend's own `enabled` flag applies.
    pub fn is_enabled(&self, name: &str) -> bool {
        let Some(config) = self.mcp_servers.get(name) else {
            return false;
        };
        match self
            .active_profile
            .as_ref()
            .and_then(|profile| self.profiles.get(profile))
        {
            Some(profile) => profile.get(name).copied().unwrap_or(false),
            None => config.enabled,
        }
    }

    /// Names of all backends enabled under the current profile selection.
    pub fn enabled_backends(&self) -> Vec<&str> {
        self.mcp_servers
            .keys()
            .filter(|name| self.is_enabled(name))
            .map(String::as_str)
            .collect()
    }
}

pub use document::{load_document, write_document, LoadedDocument};
pub use migrate::{builtin_migrations, MigrationGap, MigrationOutcome, Migrator};
pub use repair::{repair, RepairOutcome};
pub use settings::{BridgeSettings, HubSettings};
pub use validate::{validate, ValidationReport};
pub use version::SchemaVersion;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> ConfigDocument {
        serde_json::from_value(value).expect("valid document")
    }

    #[test]
    fn test_parse_env_ref() {
        assert_eq!(parse_env_ref("${FOO}"), Some("FOO"));
        assert_eq!(parse_env_ref("$FOO"), None);
        assert_eq!(parse_env_ref("literal"), None);
    }

    #[test]
    fn test_resolve_env_vars_keeps_literals() {
        // SAFETY: test-only, no concurrent threads depend on this env var.
        unsafe { std::env::set_var("MCP_HUB_TEST_VAR", "resolved_value") };
        let mut env = HashMap::new();
        env.insert("REF".to_string(), "${MCP_HUB_TEST_VAR}".to_string());
        env.insert("LITERAL".to_string(), "plain".to_string());
        let resolved = resolve_env_vars(&env);
        assert_eq!(resolved["REF"], "resolved_value");
        assert_eq!(resolved["LITERAL"], "plain");
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("MCP_HUB_TEST_VAR") };
    }

    #[test]
    fn test_backend_config_defaults() {
        let config: BackendConfig = serde_json::from_value(json!({"command": "node"})).unwrap();
        assert_eq!(config, BackendConfig::new("node"));
        assert!(config.enabled);
        assert!(config.args.is_empty());
    }

    #[test]
    fn test_document_camel_case_roundtrip() {
        let value = json!({
            "version": "1.0.0",
            "activeProfile": "work",
            "profiles": {"work": {"github": true}},
            "mcpServers": {"github": {"command": "gh-mcp", "args": [], "env": {}, "enabled": true}}
        });
        let parsed = doc(value.clone());
        assert_eq!(parsed.active_profile.as_deref(), Some("work"));
        assert_eq!(serde_json::to_value(&parsed).unwrap(), value);
    }

    #[test]
    fn test_is_enabled_without_profile_uses_flag() {
        let parsed = doc(json!({
            "version": "1.0.0",
            "mcpServers": {
                "a": {"command": "node"},
                "b": {"command": "node", "enabled": false}
            }
        }));
        assert_eq!(parsed.enabled_backends(), vec!["a"]);
        assert!(!parsed.is_enabled("missing"));
    }

    #[test]
    fn test_is_enabled_with_active_profile() {
        let parsed = doc(json!({
            "version": "1.0.0",
            "activeProfile": "minimal",
            "profiles": {"minimal": {"b": true, "a": false}},
            "mcpServers": {
                "a": {"command": "node"},
                "b": {"command": "node", "enabled": false},
                "c": {"command": "node"}
            }
        }));
        assert_eq!(parsed.enabled_backends(), vec!["b"]);
    }
}
