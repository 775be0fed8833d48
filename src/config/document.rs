//! Loading and saving configuration documents on disk.

use std::path::Path;

use serde_json::Value;

use super::migrate::{MigrationOutcome, Migrator};
use super::repair::repair;
use super::validate::{validate, validate_document, ValidationReport};
use super::ConfigDocument;
use crate::error::HubError;
use crate::state::save_queue::write_atomic;

/// A document read from disk, with everything that happened to it on the way.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub document: ConfigDocument,
    pub report: ValidationReport,
    /// Repairs applied after migration.
    pub changes: Vec<String>,
    pub migration: MigrationOutcome,
}

impl LoadedDocument {
    /// Run the full pipeline on an already-parsed document:
    /// migrate to the current schema, validate the migrated document, then
    /// repair it. The report describes the document as written.
    pub fn from_value(raw: Value) -> crate::Result<Self> {
        let migration = Migrator::default().migrate_to_current(raw)?;
        for gap in &migration.gaps {
            tracing::warn!(version = %gap.version, reason = %gap.reason, "config migration gap");
        }
        let report = validate(&migration.document);
        let repaired = repair(migration.document.clone())?;
        Ok(Self {
            document: repaired.document,
            report,
            changes: repaired.changes,
            migration,
        })
    }
}

/// Read, migrate, repair and validate the configuration document at `path`.
///
/// Unreadable files and invalid JSON are errors; everything else is reported
/// in the returned [`LoadedDocument`] and left to the caller to act on.
pub async fn load_document(path: &Path) -> crate::Result<LoadedDocument> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| HubError::InvalidConfig(path.display().to_string(), e.to_string()))?;
    let raw: Value = serde_json::from_str(&content)
        .map_err(|e| HubError::InvalidConfig(path.display().to_string(), e.to_string()))?;
    LoadedDocument::from_value(raw)
}

/// Validate `document` and write it to `path` atomically.
///
/// An invalid document is not written.
pub async fn write_document(path: &Path, document: &ConfigDocument) -> crate::Result<()> {
    let report = validate_document(document);
    if !report.valid {
        return Err(HubError::InvalidConfig(
            path.display().to_string(),
            report.errors.join("; "),
        ));
    }
    let mut content = serde_json::to_string_pretty(document)?;
    content.push('\n');
    write_atomic(path, content.as_bytes()).await
}
