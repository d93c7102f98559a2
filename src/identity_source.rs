//! Identity source
//!
//! Resolves a selector string to the client records a batch run should act
//! on. [`JsonRecordSource`] reads one JSON object per `*.json` file from a
//! directory.
//!
//! # Query grammar
//!
//! ```text
//! query := term (" AND " term)*
//! term  := "*:*"           every record
//!        | field ":*"      records where `field` is present
//!        | field ":" value `field` equals `value`, or contains it if an array
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{IdentityError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

pub trait IdentitySource: Send + Sync {
    /// Records matching `query`, in the order a batch should process them.
    fn resolve(&self, query: &str) -> Result<Vec<IdentityRecord>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    All,
    Present(String),
    Equals(String, String),
}

impl Term {
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw == "*:*" {
            return Ok(Term::All);
        }
        match raw.split_once(':') {
            Some((field, _)) if field.is_empty() => Err(invalid_query(raw, "empty field name")),
            Some((field, "*")) => Ok(Term::Present(field.to_string())),
            Some((field, value)) => Ok(Term::Equals(field.to_string(), value.to_string())),
            None => Err(invalid_query(raw, "expected field:value")),
        }
    }

    fn matches(&self, record: &IdentityRecord) -> bool {
        match self {
            Term::All => true,
            Term::Present(field) => field == "id" || record.fields.contains_key(field),
            Term::Equals(field, expected) if field == "id" => &record.id == expected,
            Term::Equals(field, expected) => match record.fields.get(field) {
                Some(Value::Array(items)) => items.iter().any(|item| value_eq(item, expected)),
                Some(value) => value_eq(value, expected),
                None => false,
            },
        }
    }
}

fn value_eq(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Bool(b) => b.to_string() == expected,
        Value::Number(n) => n.to_string() == expected,
        _ => false,
    }
}

fn invalid_query(term: &str, reason: &str) -> IdentityError {
    IdentityError::IdentitySource(format!("invalid query term {term:?}: {reason}"))
}

fn parse_query(query: &str) -> Result<Vec<Term>> {
    if query.trim().is_empty() {
        return Err(invalid_query(query, "empty query"));
    }
    query.split(" AND ").map(Term::parse).collect()
}

/// Directory of `*.json` records, resolved in id order.
#[derive(Debug, Clone)]
pub struct JsonRecordSource {
    dir: PathBuf,
}

impl JsonRecordSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load(&self, path: &Path) -> Result<IdentityRecord> {
        let raw = fs::read_to_string(path).map_err(|e| IdentityError::fs(path, e))?;
        serde_json::from_str(&raw).map_err(|e| {
            IdentityError::IdentitySource(format!("failed to parse {}: {e}", path.display()))
        })
    }
}

impl IdentitySource for JsonRecordSource {
    fn resolve(&self, query: &str) -> Result<Vec<IdentityRecord>> {
        let terms = parse_query(query)?;
        let entries = fs::read_dir(&self.dir).map_err(|e| IdentityError::fs(&self.dir, e))?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| IdentityError::fs(&self.dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let record = match self.load(&path) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable record");
                    continue;
                }
            };
            if terms.iter().all(|term| term.matches(&record)) {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(query, matched = records.len(), "identity source resolved");
        Ok(records)
    }
}

/// Ids named directly on the command line. The query is ignored and order
/// is preserved.
#[derive(Debug, Clone, Default)]
pub struct ExplicitIds(pub Vec<String>);

impl IdentitySource for ExplicitIds {
    fn resolve(&self, _query: &str) -> Result<Vec<IdentityRecord>> {
        Ok(self
            .0
            .iter()
            .map(|id| IdentityRecord {
                id: id.clone(),
                fields: serde_json::Map::new(),
            })
            .collect())
    }
}
