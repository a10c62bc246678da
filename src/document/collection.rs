// Named collections of documents over a concurrent keyed map.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::common;
use crate::error::{DbError, Result};

use super::Document;

/// Point-in-time counters for a collection.
#[derive(Debug, Clone)]
pub struct CollectionStats {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub live_documents: usize,
    pub total_inserts: u64,
    pub total_deletes: u64,
}

/// In-memory keyed document store for one collection.
///
/// The map itself is concurrent-safe; transactional isolation is layered on
/// top by the lock manager, and single-operator atomicity by the per-document
/// latches in [`super::atomic`].
pub struct DocumentCollection {
    name: String,
    docs: DashMap<String, Document>,
    created_at: DateTime<Utc>,
    total_inserts: AtomicU64,
    total_deletes: AtomicU64,
}

impl DocumentCollection {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(DbError::invalid_argument("collection name is empty"));
        }
        Ok(DocumentCollection {
            name,
            docs: DashMap::new(),
            created_at: common::now(),
            total_inserts: AtomicU64::new(0),
            total_deletes: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Inserts a new document. Fails with `AlreadyExists` on ID collision.
    pub fn insert(&self, doc: Document) -> Result<()> {
        match self.docs.entry(doc.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DbError::already_exists(format!(
                "document '{}' in collection '{}'",
                doc.id, self.name
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(doc);
                self.total_inserts.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Fetches a snapshot of a document by ID.
    pub fn get(&self, id: &str) -> Result<Document> {
        self.docs
            .get(id)
            .map(|d| d.clone())
            .ok_or_else(|| DbError::not_found(format!("{}/{}", self.name, id)))
    }

    /// Snapshot of every live document. Order is unspecified.
    pub fn get_all(&self) -> Vec<Document> {
        self.docs.iter().map(|e| e.value().clone()).collect()
    }

    /// Replaces an existing document. Fails with `NotFound` when absent.
    pub fn update(&self, doc: Document) -> Result<()> {
        match self.docs.get_mut(&doc.id) {
            Some(mut slot) => {
                *slot = doc;
                Ok(())
            }
            None => Err(DbError::not_found(format!("{}/{}", self.name, doc.id))),
        }
    }

    /// Replaces an existing document only when the stored version still
    /// matches `expected_version`.
    pub fn update_guarded(&self, doc: Document, expected_version: u64) -> Result<()> {
        match self.docs.get_mut(&doc.id) {
            Some(mut slot) => {
                if slot.version != expected_version {
                    return Err(DbError::conflict(
                        &self.name,
                        &doc.id,
                        format!("expected version {expected_version}, found {}", slot.version),
                    ));
                }
                *slot = doc;
                Ok(())
            }
            None => Err(DbError::not_found(format!("{}/{}", self.name, doc.id))),
        }
    }

    /// Removes a document, returning its final state.
    pub fn delete(&self, id: &str) -> Result<Document> {
        match self.docs.remove(id) {
            Some((_, doc)) => {
                self.total_deletes.fetch_add(1, Ordering::Relaxed);
                Ok(doc)
            }
            None => Err(DbError::not_found(format!("{}/{}", self.name, id))),
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.docs.len()
    }

    /// Drops every document. Returns the number removed.
    pub fn clear(&self) -> usize {
        let removed = self.docs.len();
        self.docs.clear();
        self.total_deletes
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> CollectionStats {
        CollectionStats {
            name: self.name.clone(),
            created_at: self.created_at,
            live_documents: self.docs.len(),
            total_inserts: self.total_inserts.load(Ordering::Relaxed),
            total_deletes: self.total_deletes.load(Ordering::Relaxed),
        }
    }
}

/// Registry of all collections in the engine.
pub struct Collections {
    inner: DashMap<String, Arc<DocumentCollection>>,
}

impl Collections {
    pub fn new() -> Self {
        Collections {
            inner: DashMap::new(),
        }
    }

    /// Creates a collection. Fails with `AlreadyExists` when the name is
    /// taken.
    pub fn create(&self, name: &str) -> Result<Arc<DocumentCollection>> {
        match self.inner.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(DbError::already_exists(format!("collection '{name}'")))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let col = Arc::new(DocumentCollection::new(name)?);
                slot.insert(Arc::clone(&col));
                Ok(col)
            }
        }
    }

    /// Fetches an existing collection, or creates it on first use.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<DocumentCollection>> {
        if let Some(col) = self.inner.get(name) {
            return Ok(Arc::clone(col.value()));
        }
        match self.create(name) {
            Ok(col) => Ok(col),
            Err(DbError::AlreadyExists { .. }) => self.get(name),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<DocumentCollection>> {
        self.inner
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| DbError::not_found(format!("collection '{name}'")))
    }

    /// Removes a collection, returning it so callers can tombstone its
    /// documents.
    pub fn drop(&self, name: &str) -> Result<Arc<DocumentCollection>> {
        self.inner
            .remove(name)
            .map(|(_, c)| c)
            .ok_or_else(|| DbError::not_found(format!("collection '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl Default for Collections {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::document::Value;

    fn doc(id: &str, n: i64) -> Document {
        let mut data = BTreeMap::new();
        data.insert("n".to_string(), Value::Int(n));
        Document::new(id, data).unwrap()
    }

    #[test]
    fn test_insert_get_round_trip() {
        let col = DocumentCollection::new("c").unwrap();
        col.insert(doc("d1", 1)).unwrap();

        let got = col.get("d1").unwrap();
        assert_eq!(got.get("n").unwrap(), Some(&Value::Int(1)));
        assert_eq!(col.count(), 1);
    }

    #[test]
    fn test_insert_collision() {
        let col = DocumentCollection::new("c").unwrap();
        col.insert(doc("d1", 1)).unwrap();
        assert!(matches!(
            col.insert(doc("d1", 2)),
            Err(DbError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_update_absent_fails() {
        let col = DocumentCollection::new("c").unwrap();
        assert!(matches!(col.update(doc("d1", 1)), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_guarded_update_conflict() {
        let col = DocumentCollection::new("c").unwrap();
        col.insert(doc("d1", 1)).unwrap();

        let err = col.update_guarded(doc("d1", 2), 7).unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
        assert!(col.update_guarded(doc("d1", 2), 1).is_ok());
    }

    #[test]
    fn test_delete_and_clear() {
        let col = DocumentCollection::new("c").unwrap();
        col.insert(doc("d1", 1)).unwrap();
        col.insert(doc("d2", 2)).unwrap();

        let removed = col.delete("d1").unwrap();
        assert_eq!(removed.id, "d1");
        assert!(!col.exists("d1"));
        assert_eq!(col.clear(), 1);
        assert_eq!(col.count(), 0);
    }

    #[test]
    fn test_registry_create_and_drop() {
        let registry = Collections::new();
        registry.create("a").unwrap();
        assert!(matches!(
            registry.create("a"),
            Err(DbError::AlreadyExists { .. })
        ));

        registry.get("a").unwrap();
        registry.drop("a").unwrap();
        assert!(matches!(registry.get("a"), Err(DbError::NotFound(_))));
    }
}
