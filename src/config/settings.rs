//! Runtime settings for the hub process: parsing and validation.
//!
//! Settings are TOML (`mcphub.toml`). They locate the configuration document
//! and the state directory, tune persistence, and configure the bridge.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::HubError;

/// Host commands a bridge client may run when settings name none.
pub const DEFAULT_HOST_COMMANDS: &[&str] = &[
    "echo", "pwd", "whoami", "date", "uname", "hostname", "uptime", "ls", "which",
];

/// File name of the persisted backend state snapshot inside `state_dir`.
pub const STATE_FILE: &str = "server-state.json";

/// File name of the persisted tool catalog snapshot inside `state_dir`.
pub const TOOLS_FILE: &str = "server-tools.json";

/// Top-level runtime settings, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    /// Path of the JSON configuration document.
    #[serde(default = "default_config_path")]
    pub config: PathBuf,
    /// Directory holding the state and tools snapshots.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Minimum spacing between two writes of the same snapshot file.
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,
    #[serde(default = "default_hot_reload")]
    pub hot_reload: bool,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

/// Settings for the stdio-over-WebSocket bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Program names allowed for `host-command` frames.
    #[serde(default = "default_host_commands")]
    pub host_commands: Vec<String>,
}

fn default_config_path() -> PathBuf {
    PathBuf::from("mcp-config.json")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_save_interval_ms() -> u64 {
    250
}

fn default_hot_reload() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_host_commands() -> Vec<String> {
    DEFAULT_HOST_COMMANDS.iter().map(|c| c.to_string()).collect()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            host_commands: default_host_commands(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            config: default_config_path(),
            state_dir: default_state_dir(),
            save_interval_ms: default_save_interval_ms(),
            hot_reload: default_hot_reload(),
            bridge: BridgeSettings::default(),
        }
    }
}

impl HubSettings {
    /// Parse settings from TOML text and validate them.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let settings: HubSettings = toml::from_str(content)
            .map_err(|e| HubError::InvalidConfig("settings".into(), e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read and validate a settings file.
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HubError::InvalidConfig(path.display().to_string(), e.to_string()))?;
        let mut settings = Self::from_toml(&content)?;
        settings.resolve_relative_to(path.parent().unwrap_or(Path::new(".")));
        Ok(settings)
    }

    /// Make relative paths relative to the directory the settings file lives in.
    fn resolve_relative_to(&mut self, base: &Path) {
        if self.config.is_relative() {
            self.config = base.join(&self.config);
        }
        if self.state_dir.is_relative() {
            self.state_dir = base.join(&self.state_dir);
        }
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    pub fn tools_file(&self) -> PathBuf {
        self.state_dir.join(TOOLS_FILE)
    }

    /// Validate settings, failing fast before anything is started.
    pub fn validate(&self) -> crate::Result<()> {
        if self.config.as_os_str().is_empty() {
            return Err(HubError::InvalidConfig(
                "settings".into(),
                "'config' must not be empty".to_string(),
            ));
        }

        if self.bridge.port == 0 {
            return Err(HubError::InvalidConfig(
                "bridge".into(),
                "port must be non-zero".to_string(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for command in &self.bridge.host_commands {
            if command.is_empty() || command.contains(char::is_whitespace) || command.contains('/') {
                return Err(HubError::InvalidConfig(
                    "bridge".into(),
                    format!("host command '{}' must be a bare program name", command),
                ));
            }
            if !seen.insert(command.as_str()) {
                return Err(HubError::InvalidConfig(
                    "bridge".into(),
                    format!("duplicate host command '{}'", command),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_from_empty_toml() {
        let settings = HubSettings::from_toml("").unwrap();
        assert_eq!(settings.config, PathBuf::from("mcp-config.json"));
        assert_eq!(settings.save_interval(), Duration::from_millis(250));
        assert_eq!(settings.bridge.port, 3001);
        assert!(settings.bridge.host_commands.iter().any(|c| c == "echo"));
        assert!(settings.hot_reload);
    }

    #[test]
    fn test_bridge_section() {
        let settings = HubSettings::from_toml(
            r#"
            save_interval_ms = 50

            [bridge]
            host = "0.0.0.0"
            port = 4000
            host_commands = ["echo"]
            "#,
        )
        .unwrap();
        assert_eq!(settings.bridge.host, "0.0.0.0");
        assert_eq!(settings.bridge.port, 4000);
        assert_eq!(settings.bridge.host_commands, vec!["echo".to_string()]);
        assert_eq!(settings.save_interval_ms, 50);
    }

    #[test]
    fn test_host_command_with_path_rejected() {
        let result = HubSettings::from_toml(
            r#"
            [bridge]
            host_commands = ["/bin/echo"]
            "#,
        );
        assert!(
            matches!(result, Err(HubError::InvalidConfig(scope, msg)) if scope == "bridge" && msg.contains("/bin/echo"))
        );
    }

    #[test]
    fn test_duplicate_host_command_rejected() {
        let result = HubSettings::from_toml(
            r#"
            [bridge]
            host_commands = ["ls", "ls"]
            "#,
        );
        assert!(matches!(result, Err(HubError::InvalidConfig(_, msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_invalid_toml() {
        let result = HubSettings::from_toml("this is not valid toml {{{{");
        assert!(matches!(result, Err(HubError::InvalidConfig(scope, _)) if scope == "settings"));
    }

    #[tokio::test]
    async fn test_load_resolves_relative_paths() {
        let mut temp = NamedTempFile::new().expect("create temp file");
        writeln!(temp, "config = \"servers.json\"\nstate_dir = \"data\"").expect("write");

        let settings = HubSettings::load(temp.path()).await.unwrap();
        let base = temp.path().parent().unwrap();
        assert_eq!(settings.config, base.join("servers.json"));
        assert_eq!(settings.state_file(), base.join("data").join(STATE_FILE));
    }
}
