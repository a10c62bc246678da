// Atomic field-path operators.
//
// Each operator reads a consistent snapshot of one document, mutates a
// staged clone, and writes the clone back, all under a short-term latch
// keyed `collection:id`. The latch is distinct from transactional locks:
// those serialise transactions, this serialises a single operator call
// against concurrent operator calls on the same document.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{DbError, Result};

use super::collection::DocumentCollection;
use super::value::Value;
use super::Document;

/// One mutation inside an atomic operator call.
#[derive(Debug, Clone)]
pub enum AtomicOp {
    /// Adds a numeric delta; absent targets count as 0.
    Increment { path: String, delta: Value },
    /// Appends one element to a sequence, creating it when absent.
    Push { path: String, value: Value },
    /// Appends several elements in argument order.
    PushMany { path: String, values: Vec<Value> },
    /// Removes every element deep-equal to the argument.
    Pull { path: String, value: Value },
    /// Removes every element deep-equal to any argument.
    PullMany { path: String, values: Vec<Value> },
    /// Writes a value, auto-creating intermediate objects.
    Set { path: String, value: Value },
    /// Removes a path; no-op when unresolved.
    Unset { path: String },
}

impl AtomicOp {
    pub fn name(&self) -> &'static str {
        match self {
            AtomicOp::Increment { .. } => "increment",
            AtomicOp::Push { .. } => "push",
            AtomicOp::PushMany { .. } => "push_many",
            AtomicOp::Pull { .. } => "pull",
            AtomicOp::PullMany { .. } => "pull_many",
            AtomicOp::Set { .. } => "set",
            AtomicOp::Unset { .. } => "unset",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            AtomicOp::Increment { path, .. }
            | AtomicOp::Push { path, .. }
            | AtomicOp::PushMany { path, .. }
            | AtomicOp::Pull { path, .. }
            | AtomicOp::PullMany { path, .. }
            | AtomicOp::Set { path, .. }
            | AtomicOp::Unset { path } => path,
        }
    }
}

/// Per-document latch table plus the operator implementations.
pub struct AtomicOperators {
    latches: DashMap<String, Arc<Mutex<()>>>,
}

impl AtomicOperators {
    pub fn new() -> Self {
        AtomicOperators {
            latches: DashMap::new(),
        }
    }

    fn latch(&self, collection: &str, id: &str) -> Arc<Mutex<()>> {
        let key = format!("{collection}:{id}");
        Arc::clone(
            self.latches
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Applies a sequence of operations to one document, all-or-nothing.
    ///
    /// Operations are staged on a clone in argument order; the first failure
    /// leaves the stored document untouched. Returns the post-image.
    pub fn apply(
        &self,
        collection: &DocumentCollection,
        id: &str,
        ops: &[AtomicOp],
    ) -> Result<Document> {
        let latch = self.latch(collection.name(), id);
        let _guard = latch.lock();

        let (before, after) = stage_ops(collection, id, ops)?;
        collection.update_guarded(after.clone(), before.version)?;
        Ok(after)
    }

    /// Computes the post-image for a sequence of operations without writing
    /// it back. Returns `(before, after)` so the caller can log both images
    /// and defer the write-back; [`DocumentCollection::update_guarded`]
    /// against `before.version` then rejects anything that slipped in
    /// between.
    pub fn stage(
        &self,
        collection: &DocumentCollection,
        id: &str,
        ops: &[AtomicOp],
    ) -> Result<(Document, Document)> {
        let latch = self.latch(collection.name(), id);
        let _guard = latch.lock();
        stage_ops(collection, id, ops)
    }

    /// Increments a numeric field, returning the new value.
    pub fn increment(
        &self,
        collection: &DocumentCollection,
        id: &str,
        path: &str,
        delta: Value,
    ) -> Result<Value> {
        let doc = self.apply(
            collection,
            id,
            &[AtomicOp::Increment {
                path: path.to_string(),
                delta,
            }],
        )?;
        Ok(doc.get(path)?.cloned().unwrap_or(Value::Null))
    }
}

impl Default for AtomicOperators {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared staging path; the caller holds the document's latch.
fn stage_ops(
    collection: &DocumentCollection,
    id: &str,
    ops: &[AtomicOp],
) -> Result<(Document, Document)> {
    if ops.is_empty() {
        return Err(DbError::invalid_argument("empty atomic operation list"));
    }
    let before = collection.get(id)?;
    let mut staged = before.clone();
    for op in ops {
        apply_one(collection.name(), id, &mut staged, op)?;
    }
    staged.touch();
    Ok((before, staged))
}

fn apply_one(collection: &str, id: &str, doc: &mut Document, op: &AtomicOp) -> Result<()> {
    let fail = |detail: String| {
        DbError::atomic_update(collection, id, op.path(), op.name(), detail)
    };

    match op {
        AtomicOp::Increment { path, delta } => {
            let delta_n = delta
                .as_number()
                .ok_or_else(|| fail(format!("delta of type {} is not numeric", delta.type_name())))?;
            let current = doc.get(path)?.cloned();
            let current_n = match &current {
                None | Some(Value::Null) => 0.0,
                Some(v) => v.as_number().ok_or_else(|| {
                    fail(format!("existing value of type {} is not numeric", v.type_name()))
                })?,
            };
            let int_result = matches!(current, None | Some(Value::Null) | Some(Value::Int(_)))
                && matches!(delta, Value::Int(_));
            let next = if int_result {
                Value::Int(current_n as i64 + int_delta(delta))
            } else {
                Value::Float(current_n + delta_n)
            };
            doc.set(path, next)?;
        }
        AtomicOp::Push { path, value } => {
            push_values(doc, path, std::slice::from_ref(value), &fail)?;
        }
        AtomicOp::PushMany { path, values } => {
            push_values(doc, path, values, &fail)?;
        }
        AtomicOp::Pull { path, value } => {
            pull_values(doc, path, std::slice::from_ref(value), &fail)?;
        }
        AtomicOp::PullMany { path, values } => {
            pull_values(doc, path, values, &fail)?;
        }
        AtomicOp::Set { path, value } => {
            doc.set(path, value.clone())?;
        }
        AtomicOp::Unset { path } => {
            doc.unset(path)?;
        }
    }
    Ok(())
}

fn int_delta(delta: &Value) -> i64 {
    match delta {
        Value::Int(i) => *i,
        _ => 0,
    }
}

fn push_values(
    doc: &mut Document,
    path: &str,
    values: &[Value],
    fail: &dyn Fn(String) -> DbError,
) -> Result<()> {
    let mut seq = match doc.get(path)? {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(fail(format!(
                "existing value of type {} is not a sequence",
                other.type_name()
            )))
        }
    };
    seq.extend(values.iter().cloned());
    doc.set(path, Value::Array(seq))
}

fn pull_values(
    doc: &mut Document,
    path: &str,
    values: &[Value],
    fail: &dyn Fn(String) -> DbError,
) -> Result<()> {
    let mut seq = match doc.get(path)? {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(fail(format!(
                "existing value of type {} is not a sequence",
                other.type_name()
            )))
        }
    };
    seq.retain(|item| !values.iter().any(|v| item.deep_eq(v)));
    doc.set(path, Value::Array(seq))
}
