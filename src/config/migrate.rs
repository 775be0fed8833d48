//! Ordered migration chain for configuration documents.
//!
//! Migrations operate on raw JSON because documents of older versions do not
//! fit the current typed model. Each migration is a pure function; the chain
//! decides which ones apply and in what order.

use serde::Serialize;
use serde_json::{Map, Value};

use super::version::SchemaVersion;
use super::CURRENT_SCHEMA_VERSION;
use crate::error::HubError;

/// Pure document transform.
pub type Transform = fn(Value) -> Value;

/// One step in the schema history.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: SchemaVersion,
    pub description: &'static str,
    pub forward: Transform,
    pub backward: Option<Transform>,
}

impl Migration {
    pub fn new(version: &str, description: &'static str, forward: Transform) -> crate::Result<Self> {
        Ok(Self::at(version.parse()?, description, forward))
    }

    pub fn at(version: SchemaVersion, description: &'static str, forward: Transform) -> Self {
        Self {
            version,
            description,
            forward,
            backward: None,
        }
    }

    pub fn with_backward(mut self, backward: Transform) -> Self {
        self.backward = Some(backward);
        self
    }
}

/// A version delta that no migration covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationGap {
    pub version: String,
    pub reason: String,
}

/// Result of running the chain. Gaps are part of the result, not an error:
/// the caller decides whether an incomplete migration is acceptable.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub document: Value,
    pub from: String,
    pub to: String,
    /// Version stamped on the returned document.
    pub reached: String,
    /// Versions whose transform ran, in application order.
    pub applied: Vec<String>,
    pub gaps: Vec<MigrationGap>,
}

impl MigrationOutcome {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Return the migrated document, or a [`HubError::MigrationGap`] when any
    /// part of the path was not covered.
    pub fn into_complete(self) -> crate::Result<Value> {
        if self.is_complete() {
            Ok(self.document)
        } else {
            Err(HubError::MigrationGap(self.from, self.to))
        }
    }
}

fn stamp_version(document: &mut Value, version: &str) {
    if let Value::Object(map) = document {
        map.insert("version".to_string(), Value::String(version.to_string()));
    }
}

/// The migration chain, kept sorted by version.
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new(builtin_migrations())
    }
}

impl Migrator {
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        Self { migrations }
    }

    pub fn latest_version(&self) -> Option<&SchemaVersion> {
        self.migrations.last().map(|m| &m.version)
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Version declared by a document; absent or blank means `0.0.0`.
    pub fn document_version(document: &Value) -> crate::Result<SchemaVersion> {
        match document.get("version") {
            Some(Value::String(v)) if !v.trim().is_empty() => v.parse(),
            _ => Ok(SchemaVersion::zero()),
        }
    }

    /// Migrate to [`CURRENT_SCHEMA_VERSION`].
    pub fn migrate_to_current(&self, document: Value) -> crate::Result<MigrationOutcome> {
        self.migrate(document, CURRENT_SCHEMA_VERSION)
    }

    /// Move a document from its declared version to `target`.
    ///
    /// Upgrades apply forward transforms with version in `(current, target]`
    /// ascending. Downgrades apply backward transforms with version in
    /// `(target, current]` descending and stop at the first step without a
    /// backward transform. Unreachable targets are reported as gaps.
    pub fn migrate(&self, document: Value, target: &str) -> crate::Result<MigrationOutcome> {
        let current = Self::document_version(&document)?;
        let target: SchemaVersion = target.parse()?;

        let mut outcome = MigrationOutcome {
            document,
            from: current.to_string(),
            to: target.to_string(),
            reached: current.to_string(),
            applied: Vec::new(),
            gaps: Vec::new(),
        };

        if current < target {
            self.upgrade(&current, &target, &mut outcome);
        } else if current > target {
            self.downgrade(&current, &target, &mut outcome);
        }

        tracing::debug!(
            from = %outcome.from,
            to = %outcome.to,
            reached = %outcome.reached,
            applied = outcome.applied.len(),
            gaps = outcome.gaps.len(),
            "config migration finished"
        );
        Ok(outcome)
    }

    fn upgrade(&self, current: &SchemaVersion, target: &SchemaVersion, outcome: &mut MigrationOutcome) {
        for migration in self
            .migrations
            .iter()
            .filter(|m| &m.version > current && &m.version <= target)
        {
            let document = std::mem::take(&mut outcome.document);
            outcome.document = (migration.forward)(document);
            stamp_version(&mut outcome.document, migration.version.as_str());
            outcome.reached = migration.version.to_string();
            outcome.applied.push(migration.version.to_string());
            tracing::debug!(
                version = %migration.version,
                description = migration.description,
                "applied config migration"
            );
        }

        let covered = self.latest_version().is_some_and(|latest| latest >= target);
        if !covered {
            outcome.gaps.push(MigrationGap {
                version: target.to_string(),
                reason: format!(
                    "no migration is known beyond {}",
                    self.latest_version()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| current.to_string())
                ),
            });
        } else if outcome.applied.is_empty() {
            outcome.gaps.push(MigrationGap {
                version: target.to_string(),
                reason: format!("no migration applies between {current} and {target}"),
            });
        } else {
            stamp_version(&mut outcome.document, target.as_str());
            outcome.reached = target.to_string();
        }
    }

    /// Walks backward transforms from newest to oldest. The first step
    /// without one ends the walk: transforms below it were written against
    /// that step's shape, so the document stays stamped at that version.
    fn downgrade(&self, current: &SchemaVersion, target: &SchemaVersion, outcome: &mut MigrationOutcome) {
        let mut reached = target;
        for migration in self
            .migrations
            .iter()
            .rev()
            .filter(|m| &m.version > target && &m.version <= current)
        {
            let Some(backward) = migration.backward else {
                tracing::warn!(
                    version = %migration.version,
                    "config migration has no backward transform, stopping downgrade"
                );
                outcome.gaps.push(MigrationGap {
                    version: migration.version.to_string(),
                    reason: format!(
                        "migration {} ({}) cannot be reversed",
                        migration.version, migration.description
                    ),
                });
                reached = &migration.version;
                break;
            };
            let document = std::mem::take(&mut outcome.document);
            outcome.document = backward(document);
            outcome.applied.push(migration.version.to_string());
        }

        stamp_version(&mut outcome.document, reached.as_str());
        outcome.reached = reached.to_string();
    }
}

fn servers_mut(document: &mut Value) -> Option<&mut Map<String, Value>> {
    document.get_mut("mcpServers").and_then(Value::as_object_mut)
}

fn rename_servers_forward(mut document: Value) -> Value {
    if let Value::Object(map) = &mut document {
        if !map.contains_key("mcpServers") {
            if let Some(servers) = map.remove("servers") {
                map.insert("mcpServers".to_string(), servers);
            }
        }
    }
    document
}

fn rename_servers_backward(mut document: Value) -> Value {
    if let Value::Object(map) = &mut document {
        if !map.contains_key("servers") {
            if let Some(servers) = map.remove("mcpServers") {
                map.insert("servers".to_string(), servers);
            }
        }
    }
    document
}

fn fill_server_defaults(mut document: Value) -> Value {
    if let Some(servers) = servers_mut(&mut document) {
        for entry in servers.values_mut().filter_map(Value::as_object_mut) {
            entry
                .entry("args")
                .or_insert_with(|| Value::Array(Vec::new()));
            entry
                .entry("env")
                .or_insert_with(|| Value::Object(Map::new()));
            entry.entry("enabled").or_insert(Value::Bool(true));
        }
    }
    document
}

fn add_profiles(mut document: Value) -> Value {
    if let Value::Object(map) = &mut document {
        map.entry("profiles")
            .or_insert_with(|| Value::Object(Map::new()));
    }
    document
}

fn remove_profiles(mut document: Value) -> Value {
    if let Value::Object(map) = &mut document {
        map.remove("profiles");
        map.remove("activeProfile");
    }
    document
}

/// The schema history shipped with this crate.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::at(
            SchemaVersion::from_parts(&[0, 1, 0]),
            "rename legacy 'servers' to 'mcpServers'",
            rename_servers_forward,
        )
        .with_backward(rename_servers_backward),
        Migration::at(
            SchemaVersion::from_parts(&[0, 2, 0]),
            "fill default args, env and enabled for every server",
            fill_server_defaults,
        ),
        Migration::at(
            SchemaVersion::from_parts(&[1, 0, 0]),
            "introduce profiles",
            add_profiles,
        )
        .with_backward(remove_profiles),
    ]
}
