// Document model and in-memory keyed store.
//
// A document is a self-describing ordered mapping of field paths to values,
// carrying creation/update timestamps and a monotonic version counter. The
// collection layer stores documents in a concurrent map; the atomic operator
// layer mutates field paths under per-document latches.

pub mod atomic;
pub mod collection;
pub mod path;
pub mod value;

pub use atomic::{AtomicOp, AtomicOperators};
pub use collection::{CollectionStats, Collections, DocumentCollection};
pub use value::Value;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common;
use crate::error::{DbError, Result};

/// A versioned, self-describing document.
///
/// # Invariants
///
/// - `id` is non-empty and unique within its collection.
/// - `version` starts at 1 and increases by exactly 1 per successful
///   mutation.
/// - `updated_at >= created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Document {
    /// Creates a version-1 document. Fails on an empty ID.
    pub fn new(id: impl Into<String>, data: BTreeMap<String, Value>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(DbError::invalid_argument("document ID is empty"));
        }
        let now = common::now();
        Ok(Document {
            id,
            data,
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }

    /// Reads a field path; None when the path does not resolve.
    pub fn get(&self, field_path: &str) -> Result<Option<&Value>> {
        path::get_path(&self.data, field_path)
    }

    /// Writes a field path without touching version bookkeeping. Mutation
    /// entry points call [`Document::touch`] once per successful operation.
    pub fn set(&mut self, field_path: &str, value: Value) -> Result<()> {
        path::set_path(&mut self.data, field_path, value)
    }

    /// Removes a field path; no-op when unresolved.
    pub fn unset(&mut self, field_path: &str) -> Result<Option<Value>> {
        path::unset_path(&mut self.data, field_path)
    }

    /// Records one successful mutation.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = common::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_starts_at_version_one() {
        let doc = Document::new("d1", BTreeMap::new()).unwrap();
        assert_eq!(doc.version, 1);
        assert!(doc.updated_at >= doc.created_at);
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(matches!(
            Document::new("", BTreeMap::new()),
            Err(DbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut doc = Document::new("d1", BTreeMap::new()).unwrap();
        doc.set("a.b", Value::Int(1)).unwrap();
        doc.touch();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.get("a.b").unwrap(), Some(&Value::Int(1)));
    }

    #[test]
    fn test_document_json_round_trip() {
        let mut doc = Document::new("d1", BTreeMap::new()).unwrap();
        doc.set("name", Value::from("alpha")).unwrap();
        doc.set("n", Value::Int(9)).unwrap();

        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
