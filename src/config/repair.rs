//! Best-effort normalization of raw configuration input.
//!
//! Each field of a backend entry is classified as absent, well-formed or
//! malformed, and has exactly one default-and-repair rule. The rules run the
//! same way whatever shape the input has, and every change is recorded.

use serde_json::{Map, Value};

use super::{ConfigDocument, CURRENT_SCHEMA_VERSION};
use crate::error::HubError;

/// Result of [`repair`]: the normalized JSON, its typed form, and a log of
/// every change made.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub value: Value,
    pub document: ConfigDocument,
    pub changes: Vec<String>,
}

impl RepairOutcome {
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Classification of a raw field.
enum Field<T> {
    Absent,
    Valid(T),
    Malformed(&'static str),
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn classify_args(value: Option<&Value>) -> Field<Vec<Value>> {
    match value {
        None => Field::Absent,
        Some(Value::Array(items)) => Field::Valid(items.clone()),
        Some(other) => Field::Malformed(kind_of(other)),
    }
}

fn classify_env(value: Option<&Value>) -> Field<Map<String, Value>> {
    match value {
        None => Field::Absent,
        Some(Value::Object(map)) => Field::Valid(map.clone()),
        Some(other) => Field::Malformed(kind_of(other)),
    }
}

fn classify_enabled(value: Option<&Value>) -> Field<bool> {
    match value {
        None => Field::Absent,
        Some(Value::Bool(b)) => Field::Valid(*b),
        Some(other) => Field::Malformed(kind_of(other)),
    }
}

fn classify_command(value: Option<&Value>) -> Field<String> {
    match value {
        None => Field::Absent,
        Some(Value::String(s)) => Field::Valid(s.clone()),
        Some(other) => Field::Malformed(kind_of(other)),
    }
}

/// `args`: array of strings, default `[]`.
fn repair_args(server: &str, raw: Option<&Value>, changes: &mut Vec<String>) -> Value {
    let items = match classify_args(raw) {
        Field::Absent => return Value::Array(Vec::new()),
        Field::Malformed(kind) => {
            changes.push(format!(
                "mcpServers.{server}.args: replaced {kind} with empty array"
            ));
            return Value::Array(Vec::new());
        }
        Field::Valid(items) => items,
    };
    let mut repaired = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match scalar_to_string(item) {
            Some(s) => {
                if !item.is_string() {
                    changes.push(format!(
                        "mcpServers.{server}.args[{index}]: converted {} to string",
                        kind_of(item)
                    ));
                }
                repaired.push(Value::String(s));
            }
            None => changes.push(format!(
                "mcpServers.{server}.args[{index}]: dropped {} entry",
                kind_of(item)
            )),
        }
    }
    Value::Array(repaired)
}

/// `env`: object of string values, default `{}`.
fn repair_env(server: &str, raw: Option<&Value>, changes: &mut Vec<String>) -> Value {
    let map = match classify_env(raw) {
        Field::Absent => return Value::Object(Map::new()),
        Field::Malformed(kind) => {
            changes.push(format!(
                "mcpServers.{server}.env: replaced {kind} with empty object"
            ));
            return Value::Object(Map::new());
        }
        Field::Valid(map) => map,
    };
    let mut repaired = Map::new();
    for (key, item) in map {
        match scalar_to_string(&item) {
            Some(s) => {
                if !item.is_string() {
                    changes.push(format!(
                        "mcpServers.{server}.env.{key}: converted {} to string",
                        kind_of(&item)
                    ));
                }
                repaired.insert(key, Value::String(s));
            }
            None => changes.push(format!(
                "mcpServers.{server}.env.{key}: dropped {} value",
                kind_of(&item)
            )),
        }
    }
    Value::Object(repaired)
}

/// `enabled`: boolean, default `true`.
fn repair_enabled(server: &str, raw: Option<&Value>, changes: &mut Vec<String>) -> Value {
    match classify_enabled(raw) {
        Field::Absent => Value::Bool(true),
        Field::Valid(b) => Value::Bool(b),
        Field::Malformed(kind) => {
            changes.push(format!(
                "mcpServers.{server}.enabled: replaced {kind} with true"
            ));
            Value::Bool(true)
        }
    }
}

/// `command`: string, default `""`. An empty command is left for the
/// validator to reject; repair does not invent one.
fn repair_command(server: &str, raw: Option<&Value>, changes: &mut Vec<String>) -> Value {
    match classify_command(raw) {
        Field::Absent => Value::String(String::new()),
        Field::Valid(s) => Value::String(s),
        Field::Malformed(kind) => {
            changes.push(format!(
                "mcpServers.{server}.command: replaced {kind} with empty string"
            ));
            Value::String(String::new())
        }
    }
}

fn repair_server(server: &str, raw: &Value, changes: &mut Vec<String>) -> Value {
    let empty = Map::new();
    let entry = match raw {
        Value::Object(map) => map,
        other => {
            changes.push(format!(
                "mcpServers.{server}: replaced {} with empty entry",
                kind_of(other)
            ));
            &empty
        }
    };
    let mut repaired = Map::new();
    repaired.insert(
        "command".to_string(),
        repair_command(server, entry.get("command"), changes),
    );
    repaired.insert(
        "args".to_string(),
        repair_args(server, entry.get("args"), changes),
    );
    repaired.insert(
        "env".to_string(),
        repair_env(server, entry.get("env"), changes),
    );
    repaired.insert(
        "enabled".to_string(),
        repair_enabled(server, entry.get("enabled"), changes),
    );
    Value::Object(repaired)
}

fn repair_profiles(raw: Option<Value>, changes: &mut Vec<String>) -> Value {
    let profiles = match raw {
        None => return Value::Object(Map::new()),
        Some(Value::Object(map)) => map,
        Some(other) => {
            changes.push(format!(
                "profiles: replaced {} with empty object",
                kind_of(&other)
            ));
            return Value::Object(Map::new());
        }
    };
    let mut repaired = Map::new();
    for (profile, entries) in profiles {
        let Value::Object(entries) = entries else {
            changes.push(format!(
                "profiles.{profile}: replaced {} with empty object",
                kind_of(&entries)
            ));
            repaired.insert(profile, Value::Object(Map::new()));
            continue;
        };
        let mut kept = Map::new();
        for (server, flag) in entries {
            match flag {
                Value::Bool(b) => {
                    kept.insert(server, Value::Bool(b));
                }
                other => changes.push(format!(
                    "profiles.{profile}.{server}: dropped {} entry",
                    kind_of(&other)
                )),
            }
        }
        repaired.insert(profile, Value::Object(kept));
    }
    Value::Object(repaired)
}

/// Normalize a raw configuration document.
///
/// Never rejects input for its shape: a non-object root becomes an empty
/// document, malformed fields take their defaults, and the legacy `servers`
/// key is renamed to `mcpServers`. Semantic problems (empty commands,
/// dangerous commands, unknown profiles) are left to [`super::validate`].
pub fn repair(raw: Value) -> crate::Result<RepairOutcome> {
    let mut changes = Vec::new();

    let mut root = match raw {
        Value::Object(map) => map,
        other => {
            changes.push(format!(
                "document: replaced {} with empty object",
                kind_of(&other)
            ));
            Map::new()
        }
    };

    if let Some(legacy) = root.remove("servers") {
        if root.contains_key("mcpServers") {
            changes.push("servers: dropped legacy key, mcpServers already present".to_string());
        } else {
            changes.push("servers: renamed to mcpServers".to_string());
            root.insert("mcpServers".to_string(), legacy);
        }
    }

    match root.get("version") {
        Some(Value::String(v)) if !v.trim().is_empty() => {}
        Some(other) => {
            changes.push(format!(
                "version: replaced {} with {CURRENT_SCHEMA_VERSION}",
                kind_of(other)
            ));
            root.insert(
                "version".to_string(),
                Value::String(CURRENT_SCHEMA_VERSION.to_string()),
            );
        }
        None => {
            changes.push(format!("version: stamped {CURRENT_SCHEMA_VERSION}"));
            root.insert(
                "version".to_string(),
                Value::String(CURRENT_SCHEMA_VERSION.to_string()),
            );
        }
    }

    let servers = match root.remove("mcpServers") {
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            changes.push(format!(
                "mcpServers: replaced {} with empty object",
                kind_of(&other)
            ));
            Map::new()
        }
    };
    let repaired_servers: Map<String, Value> = servers
        .iter()
        .map(|(name, entry)| (name.clone(), repair_server(name, entry, &mut changes)))
        .collect();
    root.insert("mcpServers".to_string(), Value::Object(repaired_servers));

    let profiles = repair_profiles(root.remove("profiles"), &mut changes);
    root.insert("profiles".to_string(), profiles);

    match root.get("activeProfile") {
        None | Some(Value::String(_)) => {}
        Some(Value::Null) => {
            root.remove("activeProfile");
        }
        Some(other) => {
            changes.push(format!(
                "activeProfile: removed {} value",
                kind_of(other)
            ));
            root.remove("activeProfile");
        }
    }

    let value = Value::Object(root);
    let document: ConfigDocument = serde_json::from_value(value.clone())?;

    for change in &changes {
        tracing::debug!(change = %change, "config repaired");
    }

    Ok(RepairOutcome {
        value,
        document,
        changes,
    })
}
