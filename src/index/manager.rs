// Index registry and document-mutation fan-out.
//
// One wrapper per index knows how to extract a key from a document (single
// field or compound tuple, dense or sparse) and owns the backing tree. The
// manager maps `(collection, field signature)` to wrappers and dispatches
// every document insert/update/delete to all indexes of that collection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::document::{path, Document};
use crate::error::{DbError, Result};

use super::btree::BTreeIndex;
use super::key::IndexKey;

/// Declarative description of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub collection: String,
    pub fields: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
}

impl IndexDefinition {
    pub fn new(collection: impl Into<String>, fields: Vec<String>) -> Self {
        IndexDefinition {
            collection: collection.into(),
            fields,
            unique: false,
            sparse: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Canonical field-list signature, the registry key.
    pub fn signature(&self) -> String {
        self.fields.join(",")
    }

    /// Qualified name used in diagnostics and duplicate-key errors.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.collection, self.signature())
    }

    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }

    fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(DbError::invalid_argument("index collection name is empty"));
        }
        if self.fields.is_empty() {
            return Err(DbError::invalid_argument("index field list is empty"));
        }
        for field in &self.fields {
            path::split_path(field)?;
        }
        Ok(())
    }
}

/// One index: definition plus backing tree.
pub struct ManagedIndex {
    def: IndexDefinition,
    tree: BTreeIndex,
}

impl ManagedIndex {
    fn new(def: IndexDefinition) -> Self {
        let tree = BTreeIndex::new(def.unique);
        ManagedIndex { def, tree }
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.def
    }

    pub fn tree(&self) -> &BTreeIndex {
        &self.tree
    }

    /// Key for `doc`, or None when the index is sparse and a field is
    /// absent.
    pub fn key_for(&self, doc: &Document) -> Option<IndexKey> {
        IndexKey::extract(doc, &self.def.fields, self.def.sparse)
    }

    fn insert_doc(&self, doc: &Document) -> Result<()> {
        let Some(key) = self.key_for(doc) else {
            return Ok(()); // sparse: silently excluded
        };
        self.tree
            .insert(key, doc.id.clone())
            .map_err(|e| self.name_duplicate(e))
    }

    fn remove_doc(&self, doc: &Document) {
        let Some(key) = self.key_for(doc) else {
            return;
        };
        if self.def.unique {
            self.tree.remove_key(&key);
        } else {
            self.tree.remove_value(&key, &doc.id);
        }
    }

    fn update_doc(&self, old: &Document, new: &Document) -> Result<()> {
        let old_key = self.key_for(old);
        let new_key = self.key_for(new);
        match (old_key, new_key) {
            (Some(a), Some(b)) if a == b => Ok(()),
            (old_key, new_key) => {
                if let Some(a) = &old_key {
                    if self.def.unique {
                        self.tree.remove_key(a);
                    } else {
                        self.tree.remove_value(a, &old.id);
                    }
                }
                if let Some(b) = new_key {
                    if let Err(e) = self.tree.insert(b, new.id.clone()) {
                        // Restore the old entry so a failed update is a no-op.
                        if let Some(a) = old_key {
                            let _ = self.tree.insert(a, old.id.clone());
                        }
                        return Err(self.name_duplicate(e));
                    }
                }
                Ok(())
            }
        }
    }

    /// Rewrites the anonymous duplicate-key error with this index's name.
    fn name_duplicate(&self, err: DbError) -> DbError {
        match err {
            DbError::AlreadyExists { key: Some(key), .. } => {
                DbError::duplicate_key(self.def.qualified_name(), key)
            }
            other => other,
        }
    }
}

/// Registry of all indexes, keyed by collection and field signature.
pub struct IndexManager {
    indexes: RwLock<HashMap<String, HashMap<String, Arc<ManagedIndex>>>>,
}

impl IndexManager {
    pub fn new() -> Self {
        IndexManager {
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Creates an index and backfills it from `existing`. Fails without
    /// registering anything when the definition is invalid, the signature is
    /// taken, or backfill hits a unique violation.
    pub fn create_index(
        &self,
        def: IndexDefinition,
        existing: &[Document],
    ) -> Result<Arc<ManagedIndex>> {
        def.validate()?;
        let index = Arc::new(ManagedIndex::new(def.clone()));
        for doc in existing {
            index.insert_doc(doc)?;
        }

        let mut registry = self.indexes.write();
        let per_collection = registry.entry(def.collection.clone()).or_default();
        if per_collection.contains_key(&def.signature()) {
            return Err(DbError::already_exists(format!(
                "index {}",
                def.qualified_name()
            )));
        }
        per_collection.insert(def.signature(), Arc::clone(&index));
        debug!(index = %def.qualified_name(), unique = def.unique, sparse = def.sparse, "index created");
        Ok(index)
    }

    pub fn drop_index(&self, collection: &str, fields: &[String]) -> Result<()> {
        let signature = fields.join(",");
        let mut registry = self.indexes.write();
        let removed = registry
            .get_mut(collection)
            .and_then(|per| per.remove(&signature));
        match removed {
            Some(_) => Ok(()),
            None => Err(DbError::not_found(format!(
                "index {collection}.{signature}"
            ))),
        }
    }

    /// Drops every index of a collection.
    pub fn drop_collection(&self, collection: &str) -> usize {
        self.indexes
            .write()
            .remove(collection)
            .map(|per| per.len())
            .unwrap_or(0)
    }

    pub fn get_index(&self, collection: &str, fields: &[String]) -> Option<Arc<ManagedIndex>> {
        let signature = fields.join(",");
        self.indexes
            .read()
            .get(collection)
            .and_then(|per| per.get(&signature))
            .map(Arc::clone)
    }

    pub fn list(&self, collection: &str) -> Vec<IndexDefinition> {
        self.indexes
            .read()
            .get(collection)
            .map(|per| per.values().map(|ix| ix.def.clone()).collect())
            .unwrap_or_default()
    }

    fn of_collection(&self, collection: &str) -> Vec<Arc<ManagedIndex>> {
        self.indexes
            .read()
            .get(collection)
            .map(|per| per.values().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    /// Indexes a freshly inserted document everywhere. On a unique
    /// violation the already-applied indexes are reverted, leaving every
    /// index as if the insert never happened.
    pub fn on_insert(&self, collection: &str, doc: &Document) -> Result<()> {
        let indexes = self.of_collection(collection);
        for (pos, index) in indexes.iter().enumerate() {
            if let Err(e) = index.insert_doc(doc) {
                for applied in &indexes[..pos] {
                    applied.remove_doc(doc);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Re-indexes an updated document everywhere, all-or-nothing.
    pub fn on_update(&self, collection: &str, old: &Document, new: &Document) -> Result<()> {
        let indexes = self.of_collection(collection);
        for (pos, index) in indexes.iter().enumerate() {
            if let Err(e) = index.update_doc(old, new) {
                for applied in &indexes[..pos] {
                    // Swap back; cannot collide since `old` was indexed.
                    let _ = applied.update_doc(new, old);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unindexes a deleted document everywhere.
    pub fn on_remove(&self, collection: &str, doc: &Document) {
        for index in self.of_collection(collection) {
            index.remove_doc(doc);
        }
    }

    /// Point lookup: document IDs matching `key` on the given index.
    pub fn lookup(&self, collection: &str, fields: &[String], key: &IndexKey) -> Vec<String> {
        self.get_index(collection, fields)
            .map(|ix| ix.tree.get_values(key))
            .unwrap_or_default()
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}
