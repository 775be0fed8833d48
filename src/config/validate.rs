//! Semantic safety checks for configuration documents.
//!
//! Errors make a document invalid; warnings are reported but leave it valid.
//! Whether either halts startup is the caller's decision.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::repair::repair;
use super::ConfigDocument;

/// Program names that are never acceptable as a backend command.
const DENIED_COMMANDS: &[&str] = &[
    "rm", "rmdir", "mkfs", "dd", "format", "fdisk", "shred", "sudo", "su", "doas", "kill",
    "killall", "pkill", "shutdown", "reboot", "halt", "poweroff",
];

/// Substrings that mark an environment variable name as carrying a secret.
const SENSITIVE_ENV_KEYWORDS: &[&str] = &["PASSWORD", "SECRET", "TOKEN", "KEY", "CREDENTIAL"];

static SHELL_METACHARACTERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[;&|`<>]|\$\(").expect("shell metacharacter pattern is valid")
});

/// Outcome of validating a configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn new() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    fn error(&mut self, message: String) {
        self.valid = false;
        self.errors.push(message);
    }

    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }
}

/// Extract the program name from a command line: first whitespace token,
/// without directory prefix or `.exe` suffix, lowercased.
fn program_name(command: &str) -> Option<String> {
    let first = command.split_whitespace().next()?;
    let base = first.rsplit(['/', '\\']).next().unwrap_or(first);
    let base = base.to_ascii_lowercase();
    Some(base.strip_suffix(".exe").map(str::to_string).unwrap_or(base))
}

/// Whether a command's program name is on the destructive-operation denylist.
pub fn is_denied_command(command: &str) -> bool {
    program_name(command).is_some_and(|program| {
        DENIED_COMMANDS.contains(&program.as_str()) || program.starts_with("mkfs.")
    })
}

fn is_sensitive_env_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SENSITIVE_ENV_KEYWORDS
        .iter()
        .any(|keyword| upper.contains(keyword))
}

fn has_path_traversal(arg: &str) -> bool {
    arg == ".." || arg.contains("../") || arg.contains("..\\")
}

/// Structural checks on the raw JSON: shapes that [`repair`] would have to fix.
fn check_structure(raw: &Value, report: &mut ValidationReport) {
    let Some(root) = raw.as_object() else {
        report.error("document must be a JSON object".to_string());
        return;
    };
    let servers = match root.get("mcpServers") {
        None => return,
        Some(Value::Object(servers)) => servers,
        Some(_) => {
            report.error("mcpServers must be an object".to_string());
            return;
        }
    };
    for (name, entry) in servers {
        let Some(entry) = entry.as_object() else {
            report.error(format!("server '{name}': entry must be an object"));
            continue;
        };
        if entry.get("command").is_some_and(|c| !c.is_string()) {
            report.error(format!("server '{name}': command must be a string"));
        }
        if entry.get("args").is_some_and(|a| !a.is_array()) {
            report.error(format!("server '{name}': args must be an array"));
        }
        if entry.get("env").is_some_and(|e| !e.is_object()) {
            report.error(format!("server '{name}': env must be an object"));
        }
        if entry.get("enabled").is_some_and(|e| !e.is_boolean()) {
            report.error(format!("server '{name}': enabled must be a boolean"));
        }
    }
}

/// Validate a typed document.
pub fn validate_document(document: &ConfigDocument) -> ValidationReport {
    let mut report = ValidationReport::new();
    check_document(document, &mut report);
    report
}

fn check_document(document: &ConfigDocument, report: &mut ValidationReport) {
    for (name, config) in &document.mcp_servers {
        let command = config.command.trim();
        if command.is_empty() {
            report.error(format!("server '{name}': command is required"));
        } else if is_denied_command(command) {
            let program = program_name(command).unwrap_or_default();
            report.error(format!(
                "server '{name}': command '{program}' is a blocked destructive operation"
            ));
        }

        if SHELL_METACHARACTERS.is_match(command) {
            report.warn(format!(
                "server '{name}': command contains shell metacharacters"
            ));
        }

        for arg in &config.args {
            if SHELL_METACHARACTERS.is_match(arg) {
                report.warn(format!(
                    "server '{name}': argument '{arg}' contains shell metacharacters"
                ));
            }
            if has_path_traversal(arg) {
                report.warn(format!(
                    "server '{name}': argument '{arg}' contains path traversal"
                ));
            }
        }

        let mut keys: Vec<&String> = config.env.keys().collect();
        keys.sort();
        for key in keys {
            if is_sensitive_env_key(key) {
                report.warn(format!(
                    "server '{name}': env '{key}' looks like a secret; prefer a secret store"
                ));
            }
        }
    }

    for (profile, entries) in &document.profiles {
        for server in entries.keys() {
            if !document.mcp_servers.contains_key(server) {
                report.warn(format!(
                    "profile '{profile}': references unknown server '{server}'"
                ));
            }
        }
    }

    if let Some(active) = &document.active_profile {
        if !document.profiles.contains_key(active) {
            report.error(format!("activeProfile '{active}' does not exist"));
        }
    }
}

/// Validate a raw configuration document.
///
/// Structural problems are errors. Semantic checks run on the repaired form
/// so that one malformed field does not hide problems elsewhere.
pub fn validate(raw: &Value) -> ValidationReport {
    let mut report = ValidationReport::new();
    check_structure(raw, &mut report);
    match repair(raw.clone()) {
        Ok(outcome) => check_document(&outcome.document, &mut report),
        Err(e) => report.error(format!("document could not be interpreted: {e}")),
    }
    report
}
