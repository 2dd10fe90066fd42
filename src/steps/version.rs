use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

/// Dotted numeric schema version such as `0.72.3`. Missing trailing
/// components compare as zero, so `0.78` equals `0.78.0`.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaVersion {
    parts: Vec<u64>,
    text: String,
}

impl SchemaVersion {
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn part(&self, idx: usize) -> u64 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

impl FromStr for SchemaVersion {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(MigrateError::Error("Empty schema version".into()));
        }
        let parts = text
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| MigrateError::Error(format!("Invalid schema version: '{s}'")))?;
        Ok(SchemaVersion {
            parts,
            text: text.to_owned(),
        })
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = MigrateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SchemaVersion> for String {
    fn from(version: SchemaVersion) -> Self {
        version.text
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.part(i).cmp(&other.part(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}
