//! Dot-separated numeric schema versions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::HubError;

/// A schema version such as `1.0.2`.
///
/// Comparison is numeric per segment; missing trailing segments count as
/// zero, so `1 == 1.0` and `1 < 1.0.1`.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    segments: Vec<u64>,
    raw: String,
}

impl SchemaVersion {
    /// The implicit version of a document that carries none.
    pub fn zero() -> Self {
        Self {
            segments: vec![0, 0, 0],
            raw: "0.0.0".to_string(),
        }
    }

    pub fn from_parts(parts: &[u64]) -> Self {
        Self {
            segments: parts.to_vec(),
            raw: parts
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("."),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn segment(&self, index: usize) -> u64 {
        self.segments.get(index).copied().unwrap_or(0)
    }
}

impl FromStr for SchemaVersion {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(HubError::InvalidVersion(s.to_string()));
        }
        let segments = trimmed
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| HubError::InvalidVersion(s.to_string()))?;
        Ok(Self {
            segments,
            raw: trimmed.to_string(),
        })
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        (0..len)
            .map(|i| self.segment(i).cmp(&other.segment(i)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SchemaVersion {}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
