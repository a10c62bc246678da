// Index key model with a total order.
//
// Ordering rules: MinKey sorts before everything and MaxKey after
// everything (range sentinels, never stored); null sorts before every
// non-null value; numbers compare numerically across Int/Float with Int
// winning exact ties so the order stays total; compound keys compare
// field-by-field with the shorter tuple first on a prefix tie.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::document::{Document, Value};

/// A comparable key extracted from a document field (or fields).
#[derive(Debug, Clone)]
pub enum IndexKey {
    /// Lower range sentinel; never stored in an index.
    MinKey,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Time(DateTime<Utc>),
    Compound(Vec<IndexKey>),
    /// Upper range sentinel; never stored in an index.
    MaxKey,
}

impl IndexKey {
    /// Rank of the variant in the total order.
    fn rank(&self) -> u8 {
        match self {
            IndexKey::MinKey => 0,
            IndexKey::Null => 1,
            IndexKey::Bool(_) => 2,
            IndexKey::Int(_) | IndexKey::Float(_) => 3,
            IndexKey::Str(_) => 4,
            IndexKey::Time(_) => 5,
            IndexKey::Compound(_) => 6,
            IndexKey::MaxKey => 7,
        }
    }

    /// Converts one field value. Arrays and objects index by their JSON
    /// rendering, which keeps them comparable and deterministic.
    pub fn from_value(value: &Value) -> IndexKey {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Int(i) => IndexKey::Int(*i),
            Value::Float(f) => IndexKey::Float(*f),
            Value::String(s) => IndexKey::Str(s.clone()),
            Value::Timestamp(ts) => IndexKey::Time(*ts),
            composite => IndexKey::Str(composite.render()),
        }
    }

    /// Extracts a key for `fields` from a document.
    ///
    /// Sparse semantics: `None` when any indexed field is absent. Dense
    /// semantics: absent fields become `Null` components.
    pub fn extract(doc: &Document, fields: &[String], sparse: bool) -> Option<IndexKey> {
        let mut parts = Vec::with_capacity(fields.len());
        for field in fields {
            match doc.get(field).ok().flatten() {
                Some(v) => parts.push(IndexKey::from_value(v)),
                None if sparse => return None,
                None => parts.push(IndexKey::Null),
            }
        }
        Some(if parts.len() == 1 {
            parts.pop().expect("one part present")
        } else {
            IndexKey::Compound(parts)
        })
    }

    /// Inclusive bounds covering every compound key starting with `prefix`.
    /// Enables prefix range queries over compound indexes.
    pub fn prefix_bounds(prefix: &[IndexKey]) -> (IndexKey, IndexKey) {
        let mut low = prefix.to_vec();
        low.push(IndexKey::MinKey);
        let mut high = prefix.to_vec();
        high.push(IndexKey::MaxKey);
        (IndexKey::Compound(low), IndexKey::Compound(high))
    }

    /// Rendering used in duplicate-key errors and diagnostics.
    pub fn render(&self) -> String {
        match self {
            IndexKey::MinKey => "<min>".to_string(),
            IndexKey::Null => "null".to_string(),
            IndexKey::Bool(b) => b.to_string(),
            IndexKey::Int(i) => i.to_string(),
            IndexKey::Float(f) => f.to_string(),
            IndexKey::Str(s) => format!("\"{s}\""),
            IndexKey::Time(ts) => ts.to_rfc3339(),
            IndexKey::Compound(parts) => {
                let inner: Vec<String> = parts.iter().map(IndexKey::render).collect();
                format!("({})", inner.join(", "))
            }
            IndexKey::MaxKey => "<max>".to_string(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use IndexKey::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            // Mixed numerics: numeric order first, Int before Float on an
            // exact tie to keep the relation antisymmetric.
            (Int(a), Float(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (Compound(a), Compound(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}
